use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use teleassist_core::{
    classify, detect_language, resolve_reply, validate_catalog, CatalogReport, Channel, ChatMessage,
    ChatReply, ClassificationPreview, Conversation, ConversationStatus, ConversationTranscript,
    IntentCatalogEntry, Language, MessageInput, Sender, ServiceIntent, SupportError,
};
use teleassist_observability::AppMetrics;
use teleassist_storage::{CatalogRepository, ConversationRepository};
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct SupportAgent<S>
where
    S: ConversationRepository + CatalogRepository,
{
    store: Arc<S>,
    metrics: Arc<AppMetrics>,
}

impl<S> SupportAgent<S>
where
    S: ConversationRepository + CatalogRepository,
{
    pub fn new(store: Arc<S>, metrics: Arc<AppMetrics>) -> Self {
        Self { store, metrics }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn start_conversation(
        &self,
        channel: Channel,
        external_user_id: Option<String>,
        language: Language,
    ) -> Result<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            conversation_id: Uuid::new_v4().to_string(),
            channel,
            external_user_id,
            language,
            status: ConversationStatus::Open,
            created_at: now,
            updated_at: now,
        };

        self.store.create_conversation(&conversation).await?;
        info!(
            conversation_id = %conversation.conversation_id,
            channel = channel.as_str(),
            "conversation started"
        );
        Ok(conversation)
    }

    #[instrument(skip(self, input), fields(channel = input.channel.as_str()))]
    pub async fn handle_message(&self, input: MessageInput) -> Result<ChatReply> {
        let started = Instant::now();
        self.metrics.inc_message();

        let mut conversation = self.resolve_conversation(&input).await?;
        let language = detect_language(input.language, &input.text);

        let catalog = self.store.active_catalog().await?;
        let intent = classify(&input.text, &catalog);
        self.metrics.record_classification(intent.is_unknown());

        let user_message = new_message(&conversation, Sender::User, input.text.clone(), &intent);
        self.store.append_message(&user_message).await?;

        let bot_message = match resolve_reply(&intent, language, &catalog) {
            Ok(reply_text) => {
                let message = new_message(&conversation, Sender::Bot, reply_text, &intent);
                self.store.append_message(&message).await?;
                Some(message)
            }
            Err(err) => {
                self.metrics.inc_missing_reply();
                warn!(
                    conversation_id = %conversation.conversation_id,
                    error = %err,
                    "no bot reply generated"
                );
                None
            }
        };

        conversation.language = language;
        conversation.updated_at = Utc::now();
        self.store.update_conversation(&conversation).await?;

        self.metrics.observe_latency(started.elapsed());
        info!(
            conversation_id = %conversation.conversation_id,
            language = language.as_code(),
            intent = %intent.intent,
            confidence = intent.confidence,
            replied = bot_message.is_some(),
            "message handled"
        );

        Ok(ChatReply {
            conversation_id: conversation.conversation_id,
            language,
            intent,
            user_message,
            bot_message,
        })
    }

    pub async fn classify_text(
        &self,
        text: &str,
        language: Option<Language>,
    ) -> Result<ClassificationPreview> {
        let language = detect_language(language, text);
        let catalog = self.store.active_catalog().await?;
        let intent = classify(text, &catalog);
        let reply = match resolve_reply(&intent, language, &catalog) {
            Ok(reply) => Some(reply),
            Err(err) => {
                warn!(error = %err, "classification preview has no reply");
                None
            }
        };

        Ok(ClassificationPreview {
            language,
            intent,
            reply,
        })
    }

    pub async fn conversation(&self, conversation_id: &str) -> Result<ConversationTranscript> {
        let conversation = self.load_conversation(conversation_id).await?;
        let messages = self.store.list_messages(conversation_id).await?;
        Ok(ConversationTranscript {
            conversation,
            messages,
        })
    }

    pub async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>> {
        self.store.list_conversations(limit).await
    }

    pub async fn close_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        let mut conversation = self.load_conversation(conversation_id).await?;
        if conversation.status != ConversationStatus::Closed {
            conversation.status = ConversationStatus::Closed;
            conversation.updated_at = Utc::now();
            self.store.update_conversation(&conversation).await?;
            info!(conversation_id = %conversation_id, "conversation closed");
        }
        Ok(conversation)
    }

    pub async fn catalog(&self) -> Result<Vec<IntentCatalogEntry>> {
        self.store.list_catalog().await
    }

    pub async fn upsert_catalog_entry(&self, entry: IntentCatalogEntry) -> Result<CatalogReport> {
        let mut candidate = self.store.list_catalog().await?;
        match candidate
            .iter_mut()
            .find(|existing| existing.intent == entry.intent)
        {
            Some(existing) => *existing = entry.clone(),
            None => candidate.push(entry.clone()),
        }

        let report = validate_catalog(&candidate).map_err(SupportError::from)?;
        for warning in &report.warnings {
            warn!(intent = %entry.intent, "{warning}");
        }

        self.store.upsert_entry(&entry).await?;
        info!(intent = %entry.intent, active = entry.active, "catalog entry saved");
        Ok(report)
    }

    pub async fn set_catalog_entry_active(&self, intent: &str, active: bool) -> Result<()> {
        if !self.store.set_entry_active(intent, active).await? {
            return Err(SupportError::IntentNotFound(intent.to_string()).into());
        }
        info!(intent = %intent, active, "catalog entry toggled");
        Ok(())
    }

    async fn load_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.store
            .load_conversation(conversation_id)
            .await?
            .ok_or_else(|| SupportError::ConversationNotFound(conversation_id.to_string()).into())
    }

    async fn resolve_conversation(&self, input: &MessageInput) -> Result<Conversation> {
        if let Some(conversation_id) = input.conversation_id.as_deref() {
            let conversation = self.load_conversation(conversation_id).await?;
            if conversation.status == ConversationStatus::Closed {
                return Err(SupportError::ConversationClosed(conversation_id.to_string()).into());
            }
            return Ok(conversation);
        }

        if let Some(external_user_id) = input.external_user_id.as_deref() {
            if let Some(conversation) = self
                .store
                .find_conversation_by_external(input.channel, external_user_id)
                .await?
            {
                return Ok(conversation);
            }
        }

        self.start_conversation(
            input.channel,
            input.external_user_id.clone(),
            detect_language(input.language, &input.text),
        )
        .await
    }
}

fn new_message(
    conversation: &Conversation,
    sender: Sender,
    text: String,
    intent: &ServiceIntent,
) -> ChatMessage {
    ChatMessage {
        message_id: Uuid::new_v4().to_string(),
        conversation_id: conversation.conversation_id.clone(),
        sender,
        text,
        intent: Some(intent.intent.clone()),
        confidence: Some(intent.confidence),
        created_at: Utc::now(),
    }
}
