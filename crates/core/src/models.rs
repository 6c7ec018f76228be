use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const UNKNOWN_INTENT: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Ar,
    Fr,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Ar, Language::Fr];

    pub fn from_optional_str(value: Option<&str>) -> Option<Self> {
        match value.map(|v| v.trim().to_lowercase()) {
            Some(v) if v == "ar" || v.starts_with("ar-") || v == "arabic" => Some(Self::Ar),
            Some(v) if v == "fr" || v.starts_with("fr-") || v == "french" => Some(Self::Fr),
            _ => None,
        }
    }

    pub fn as_code(self) -> &'static str {
        match self {
            Self::Ar => "ar",
            Self::Fr => "fr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Balance,
    Recharge,
    Plans,
    Support,
    General,
}

impl Category {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "balance" => Some(Self::Balance),
            "recharge" => Some(Self::Recharge),
            "plans" => Some(Self::Plans),
            "support" => Some(Self::Support),
            "general" => Some(Self::General),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Balance => "balance",
            Self::Recharge => "recharge",
            Self::Plans => "plans",
            Self::Support => "support",
            Self::General => "general",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentCatalogEntry {
    pub intent: String,
    pub keywords: Vec<String>,
    pub category: Category,
    pub responses: BTreeMap<Language, String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl IntentCatalogEntry {
    pub fn new(intent: impl Into<String>, category: Category) -> Self {
        Self {
            intent: intent.into(),
            keywords: Vec::new(),
            category,
            responses: BTreeMap::new(),
            active: true,
        }
    }

    pub fn with_keywords<I, K>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_response(mut self, language: Language, text: impl Into<String>) -> Self {
        self.responses.insert(language, text.into());
        self
    }

    pub fn reply_for(&self, language: Language) -> Option<&str> {
        self.responses
            .get(&language)
            .map(String::as_str)
            .filter(|text| !text.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceIntent {
    pub intent: String,
    pub confidence: f64,
    pub category: Category,
}

impl ServiceIntent {
    pub fn unknown() -> Self {
        Self {
            intent: UNKNOWN_INTENT.to_string(),
            confidence: 0.0,
            category: Category::General,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.intent == UNKNOWN_INTENT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Web,
    Messenger,
}

impl Channel {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "web" => Some(Self::Web),
            "messenger" => Some(Self::Messenger),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Messenger => "messenger",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    Closed,
}

impl ConversationStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Bot,
}

impl Sender {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "user" => Some(Self::User),
            "bot" => Some(Self::Bot),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Bot => "bot",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub channel: Channel,
    pub external_user_id: Option<String>,
    pub language: Language,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub sender: Sender,
    pub text: String,
    pub intent: Option<String>,
    pub confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageInput {
    pub conversation_id: Option<String>,
    pub channel: Channel,
    pub external_user_id: Option<String>,
    pub text: String,
    pub language: Option<Language>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    pub conversation_id: String,
    pub language: Language,
    pub intent: ServiceIntent,
    pub user_message: ChatMessage,
    pub bot_message: Option<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationPreview {
    pub language: Language,
    pub intent: ServiceIntent,
    pub reply: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTranscript {
    pub conversation: Conversation,
    pub messages: Vec<ChatMessage>,
}
