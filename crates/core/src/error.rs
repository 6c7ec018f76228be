use thiserror::Error;

use crate::models::Language;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no catalog entry for intent `{intent}`")]
    NotFound { intent: String },
    #[error("catalog entry `{intent}` has no `{}` reply", .language.as_code())]
    MissingReply { intent: String, language: Language },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("catalog entry #{position} has a blank intent id")]
    BlankIntent { position: usize },
    #[error("intent `{intent}` appears more than once in the active catalog")]
    DuplicateIntent { intent: String },
    #[error("intent `{intent}` is missing its `{}` reply", .language.as_code())]
    MissingReply { intent: String, language: Language },
}

#[derive(Debug, Error)]
pub enum SupportError {
    #[error("conversation `{0}` not found")]
    ConversationNotFound(String),
    #[error("conversation `{0}` is closed")]
    ConversationClosed(String),
    #[error("intent `{0}` not found in catalog")]
    IntentNotFound(String),
    #[error("invalid catalog entry: {0}")]
    InvalidCatalog(#[from] CatalogError),
}
