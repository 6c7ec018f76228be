use anyhow::Result;
use teleassist_api::{build_app, ApiConfig};
use teleassist_observability::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("teleassist_api");

    let config = ApiConfig::from_env();
    let bind = config.bind.clone();
    let app = build_app(config).await?;

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(bind = %bind, "teleassist api started");

    axum::serve(listener, app).await?;
    Ok(())
}
