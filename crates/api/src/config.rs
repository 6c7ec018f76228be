use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::messenger::MessengerConfig;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind: String,
    pub database_url: Option<String>,
    pub catalog_path: Option<PathBuf>,
    pub api_key: String,
    pub allowed_origins: Vec<String>,
    pub rate_limit_window: Duration,
    pub rate_limit_max: usize,
    pub messenger: MessengerConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            database_url: None,
            catalog_path: None,
            api_key: "dev-teleassist-key".to_string(),
            allowed_origins: vec!["http://localhost:5500".to_string()],
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max: 120,
            messenger: MessengerConfig::default(),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let allowed_origins = non_empty_var("TELEASSIST_ALLOWED_ORIGINS")
            .map(|value| {
                value
                    .split(',')
                    .map(|origin| origin.trim().trim_end_matches('/').to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or(defaults.allowed_origins);

        Self {
            bind: non_empty_var("TELEASSIST_BIND").unwrap_or(defaults.bind),
            database_url: non_empty_var("TELEASSIST_DATABASE_URL"),
            catalog_path: non_empty_var("TELEASSIST_CATALOG_PATH").map(PathBuf::from),
            api_key: non_empty_var("TELEASSIST_API_KEY").unwrap_or(defaults.api_key),
            allowed_origins,
            rate_limit_window: non_empty_var("TELEASSIST_RATE_LIMIT_WINDOW_SECONDS")
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit_window),
            rate_limit_max: non_empty_var("TELEASSIST_RATE_LIMIT_MAX")
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(defaults.rate_limit_max),
            messenger: MessengerConfig {
                verify_token: non_empty_var("MESSENGER_VERIFY_TOKEN")
                    .unwrap_or(defaults.messenger.verify_token),
                app_secret: non_empty_var("MESSENGER_APP_SECRET"),
                page_access_token: non_empty_var("MESSENGER_PAGE_ACCESS_TOKEN"),
                graph_base: non_empty_var("MESSENGER_GRAPH_BASE")
                    .unwrap_or(defaults.messenger.graph_base),
            },
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
