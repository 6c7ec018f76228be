use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use teleassist_core::{
    Category, Channel, ChatMessage, Conversation, ConversationStatus, IntentCatalogEntry, Language,
    Sender,
};

pub trait ConversationRepository: Send + Sync {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<()>;
    async fn load_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>>;
    async fn find_conversation_by_external(
        &self,
        channel: Channel,
        external_user_id: &str,
    ) -> Result<Option<Conversation>>;
    async fn update_conversation(&self, conversation: &Conversation) -> Result<()>;
    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>>;
    async fn append_message(&self, message: &ChatMessage) -> Result<()>;
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>>;
}

pub trait CatalogRepository: Send + Sync {
    async fn active_catalog(&self) -> Result<Vec<IntentCatalogEntry>>;
    async fn list_catalog(&self) -> Result<Vec<IntentCatalogEntry>>;
    async fn upsert_entry(&self, entry: &IntentCatalogEntry) -> Result<()>;
    async fn set_entry_active(&self, intent: &str, active: bool) -> Result<bool>;
}

pub async fn seed_catalog_if_empty<S: CatalogRepository>(
    store: &S,
    entries: &[IntentCatalogEntry],
) -> Result<usize> {
    if !store.list_catalog().await?.is_empty() {
        return Ok(0);
    }

    for entry in entries {
        store.upsert_entry(entry).await?;
    }
    tracing::info!(entries = entries.len(), "seeded intent catalog");
    Ok(entries.len())
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    conversations: Arc<RwLock<HashMap<String, Conversation>>>,
    messages: Arc<RwLock<HashMap<String, Vec<ChatMessage>>>>,
    catalog: Arc<RwLock<Vec<IntentCatalogEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationRepository for MemoryStore {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.conversations
            .write()
            .insert(conversation.conversation_id.clone(), conversation.clone());
        Ok(())
    }

    async fn load_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        Ok(self.conversations.read().get(conversation_id).cloned())
    }

    async fn find_conversation_by_external(
        &self,
        channel: Channel,
        external_user_id: &str,
    ) -> Result<Option<Conversation>> {
        let found = self
            .conversations
            .read()
            .values()
            .filter(|conversation| {
                conversation.channel == channel
                    && conversation.status == ConversationStatus::Open
                    && conversation.external_user_id.as_deref() == Some(external_user_id)
            })
            .max_by_key(|conversation| conversation.updated_at)
            .cloned();
        Ok(found)
    }

    async fn update_conversation(&self, conversation: &Conversation) -> Result<()> {
        let mut guard = self.conversations.write();
        let Some(existing) = guard.get_mut(&conversation.conversation_id) else {
            return Err(anyhow!(
                "conversation {} does not exist",
                conversation.conversation_id
            ));
        };
        *existing = conversation.clone();
        Ok(())
    }

    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>> {
        let mut conversations = self
            .conversations
            .read()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        conversations.truncate(limit);
        Ok(conversations)
    }

    async fn append_message(&self, message: &ChatMessage) -> Result<()> {
        if let Some(conversation) = self
            .conversations
            .write()
            .get_mut(&message.conversation_id)
        {
            conversation.updated_at = message.created_at;
        }

        self.messages
            .write()
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        Ok(self
            .messages
            .read()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}

impl CatalogRepository for MemoryStore {
    async fn active_catalog(&self) -> Result<Vec<IntentCatalogEntry>> {
        Ok(self
            .catalog
            .read()
            .iter()
            .filter(|entry| entry.active)
            .cloned()
            .collect())
    }

    async fn list_catalog(&self) -> Result<Vec<IntentCatalogEntry>> {
        Ok(self.catalog.read().clone())
    }

    async fn upsert_entry(&self, entry: &IntentCatalogEntry) -> Result<()> {
        let mut guard = self.catalog.write();
        match guard.iter_mut().find(|existing| existing.intent == entry.intent) {
            Some(existing) => *existing = entry.clone(),
            None => guard.push(entry.clone()),
        }
        Ok(())
    }

    async fn set_entry_active(&self, intent: &str, active: bool) -> Result<bool> {
        let mut guard = self.catalog.write();
        let Some(entry) = guard.iter_mut().find(|entry| entry.intent == intent) else {
            return Ok(false);
        };
        entry.active = active;
        Ok(true)
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url {}", database_url))?
            .create_if_missing(true);
        // Every connection to `:memory:` opens its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed connecting to sqlite at {}", database_url))?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
              conversation_id TEXT PRIMARY KEY,
              channel TEXT NOT NULL,
              external_user_id TEXT,
              language TEXT NOT NULL,
              status TEXT NOT NULL,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
              message_id TEXT PRIMARY KEY,
              conversation_id TEXT NOT NULL,
              sender TEXT NOT NULL,
              text TEXT NOT NULL,
              intent TEXT,
              confidence REAL,
              created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages (conversation_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS intent_catalog (
              intent TEXT PRIMARY KEY,
              position INTEGER NOT NULL,
              keywords_json TEXT NOT NULL,
              category TEXT NOT NULL,
              responses_json TEXT NOT NULL,
              active INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid timestamp {}", value))?
        .with_timezone(&Utc))
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let channel: String = row.get("channel");
    let language: String = row.get("language");
    let status: String = row.get("status");

    Ok(Conversation {
        conversation_id: row.get("conversation_id"),
        channel: Channel::parse(&channel).ok_or_else(|| anyhow!("unknown channel {}", channel))?,
        external_user_id: row.get("external_user_id"),
        language: Language::from_optional_str(Some(&language))
            .ok_or_else(|| anyhow!("unknown language {}", language))?,
        status: ConversationStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown status {}", status))?,
        created_at: parse_timestamp(row.get::<String, _>("created_at").as_str())?,
        updated_at: parse_timestamp(row.get::<String, _>("updated_at").as_str())?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage> {
    let sender: String = row.get("sender");

    Ok(ChatMessage {
        message_id: row.get("message_id"),
        conversation_id: row.get("conversation_id"),
        sender: Sender::parse(&sender).ok_or_else(|| anyhow!("unknown sender {}", sender))?,
        text: row.get("text"),
        intent: row.get("intent"),
        confidence: row.get("confidence"),
        created_at: parse_timestamp(row.get::<String, _>("created_at").as_str())?,
    })
}

fn catalog_entry_from_row(row: &SqliteRow) -> Result<IntentCatalogEntry> {
    let intent: String = row.get("intent");
    let category: String = row.get("category");
    let keywords_json: String = row.get("keywords_json");
    let responses_json: String = row.get("responses_json");

    Ok(IntentCatalogEntry {
        keywords: serde_json::from_str(&keywords_json)
            .with_context(|| format!("corrupt keywords for intent {}", intent))?,
        responses: serde_json::from_str(&responses_json)
            .with_context(|| format!("corrupt responses for intent {}", intent))?,
        category: Category::parse(&category)
            .ok_or_else(|| anyhow!("unknown category {}", category))?,
        active: row.get("active"),
        intent,
    })
}

const CONVERSATION_COLUMNS: &str =
    "conversation_id, channel, external_user_id, language, status, created_at, updated_at";

impl ConversationRepository for SqliteStore {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversations
              (conversation_id, channel, external_user_id, language, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&conversation.conversation_id)
        .bind(conversation.channel.as_str())
        .bind(&conversation.external_user_id)
        .bind(conversation.language.as_code())
        .bind(conversation.status.as_str())
        .bind(timestamp(conversation.created_at))
        .bind(timestamp(conversation.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE conversation_id = ?1"
        ))
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn find_conversation_by_external(
        &self,
        channel: Channel,
        external_user_id: &str,
    ) -> Result<Option<Conversation>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS} FROM conversations
            WHERE channel = ?1 AND external_user_id = ?2 AND status = 'open'
            ORDER BY updated_at DESC
            LIMIT 1
            "#
        ))
        .bind(channel.as_str())
        .bind(external_user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn update_conversation(&self, conversation: &Conversation) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE conversations
            SET external_user_id = ?2, language = ?3, status = ?4, updated_at = ?5
            WHERE conversation_id = ?1
            "#,
        )
        .bind(&conversation.conversation_id)
        .bind(&conversation.external_user_id)
        .bind(conversation.language.as_code())
        .bind(conversation.status.as_str())
        .bind(timestamp(conversation.updated_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!(
                "conversation {} does not exist",
                conversation.conversation_id
            ));
        }
        Ok(())
    }

    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations ORDER BY updated_at DESC LIMIT ?1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(conversation_from_row).collect()
    }

    async fn append_message(&self, message: &ChatMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages
              (message_id, conversation_id, sender, text, intent, confidence, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&message.message_id)
        .bind(&message.conversation_id)
        .bind(message.sender.as_str())
        .bind(&message.text)
        .bind(&message.intent)
        .bind(message.confidence)
        .bind(timestamp(message.created_at))
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE conversations SET updated_at = ?2 WHERE conversation_id = ?1")
            .bind(&message.conversation_id)
            .bind(timestamp(message.created_at))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, conversation_id, sender, text, intent, confidence, created_at
            FROM messages
            WHERE conversation_id = ?1
            ORDER BY rowid
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }
}

const CATALOG_COLUMNS: &str = "intent, keywords_json, category, responses_json, active";

impl CatalogRepository for SqliteStore {
    async fn active_catalog(&self) -> Result<Vec<IntentCatalogEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {CATALOG_COLUMNS} FROM intent_catalog WHERE active = 1 ORDER BY position"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(catalog_entry_from_row).collect()
    }

    async fn list_catalog(&self) -> Result<Vec<IntentCatalogEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {CATALOG_COLUMNS} FROM intent_catalog ORDER BY position"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(catalog_entry_from_row).collect()
    }

    async fn upsert_entry(&self, entry: &IntentCatalogEntry) -> Result<()> {
        let keywords_json = serde_json::to_string(&entry.keywords)?;
        let responses_json = serde_json::to_string(&entry.responses)?;

        sqlx::query(
            r#"
            INSERT INTO intent_catalog (intent, position, keywords_json, category, responses_json, active)
            VALUES (?1, (SELECT COALESCE(MAX(position), 0) + 1 FROM intent_catalog), ?2, ?3, ?4, ?5)
            ON CONFLICT(intent) DO UPDATE SET
              keywords_json=excluded.keywords_json,
              category=excluded.category,
              responses_json=excluded.responses_json,
              active=excluded.active
            "#,
        )
        .bind(&entry.intent)
        .bind(keywords_json)
        .bind(entry.category.as_str())
        .bind(responses_json)
        .bind(entry.active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_entry_active(&self, intent: &str, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE intent_catalog SET active = ?2 WHERE intent = ?1")
            .bind(intent)
            .bind(active)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[derive(Clone)]
pub enum Store {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl Store {
    pub fn memory() -> Self {
        Self::Memory(MemoryStore::new())
    }

    pub async fn sqlite(database_url: &str) -> Result<Self> {
        let sqlite = SqliteStore::connect(database_url).await?;
        Ok(Self::Sqlite(sqlite))
    }

    pub async fn from_optional_url(database_url: Option<&str>) -> Result<Self> {
        match database_url {
            Some(url) => Self::sqlite(url).await,
            None => Ok(Self::memory()),
        }
    }

    pub fn backend(&self) -> &'static str {
        match self {
            Store::Memory(_) => "memory",
            Store::Sqlite(_) => "sqlite",
        }
    }
}

impl ConversationRepository for Store {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<()> {
        match self {
            Store::Memory(store) => store.create_conversation(conversation).await,
            Store::Sqlite(store) => store.create_conversation(conversation).await,
        }
    }

    async fn load_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        match self {
            Store::Memory(store) => store.load_conversation(conversation_id).await,
            Store::Sqlite(store) => store.load_conversation(conversation_id).await,
        }
    }

    async fn find_conversation_by_external(
        &self,
        channel: Channel,
        external_user_id: &str,
    ) -> Result<Option<Conversation>> {
        match self {
            Store::Memory(store) => {
                store
                    .find_conversation_by_external(channel, external_user_id)
                    .await
            }
            Store::Sqlite(store) => {
                store
                    .find_conversation_by_external(channel, external_user_id)
                    .await
            }
        }
    }

    async fn update_conversation(&self, conversation: &Conversation) -> Result<()> {
        match self {
            Store::Memory(store) => store.update_conversation(conversation).await,
            Store::Sqlite(store) => store.update_conversation(conversation).await,
        }
    }

    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>> {
        match self {
            Store::Memory(store) => store.list_conversations(limit).await,
            Store::Sqlite(store) => store.list_conversations(limit).await,
        }
    }

    async fn append_message(&self, message: &ChatMessage) -> Result<()> {
        match self {
            Store::Memory(store) => store.append_message(message).await,
            Store::Sqlite(store) => store.append_message(message).await,
        }
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        match self {
            Store::Memory(store) => store.list_messages(conversation_id).await,
            Store::Sqlite(store) => store.list_messages(conversation_id).await,
        }
    }
}

impl CatalogRepository for Store {
    async fn active_catalog(&self) -> Result<Vec<IntentCatalogEntry>> {
        match self {
            Store::Memory(store) => store.active_catalog().await,
            Store::Sqlite(store) => store.active_catalog().await,
        }
    }

    async fn list_catalog(&self) -> Result<Vec<IntentCatalogEntry>> {
        match self {
            Store::Memory(store) => store.list_catalog().await,
            Store::Sqlite(store) => store.list_catalog().await,
        }
    }

    async fn upsert_entry(&self, entry: &IntentCatalogEntry) -> Result<()> {
        match self {
            Store::Memory(store) => store.upsert_entry(entry).await,
            Store::Sqlite(store) => store.upsert_entry(entry).await,
        }
    }

    async fn set_entry_active(&self, intent: &str, active: bool) -> Result<bool> {
        match self {
            Store::Memory(store) => store.set_entry_active(intent, active).await,
            Store::Sqlite(store) => store.set_entry_active(intent, active).await,
        }
    }
}
