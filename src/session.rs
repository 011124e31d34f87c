use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::agents::{MasterAgent, TurnOutcome, TurnRequest};
use crate::auth::Principal;
use crate::cli::SessionBackend;
use crate::config::RuntimeConfig;
use crate::llm::{ChatMessage, Role};
use crate::streaming::{EventSink, ServerEvent, send_event};

pub const DEFAULT_CHAT_TITLE: &str = "New Chat";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub id: i64,
    pub unique_id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub chat_id: i64,
    pub role: Role,
    pub content: String,
    pub reason: Option<String>,
    pub image_url: Option<String>,
    pub time_stamp: DateTime<Utc>,
}

impl StoredMessage {
    /// The form kept in conversation history. Images are flattened to text.
    pub fn to_chat_message(&self) -> ChatMessage {
        match self.image_url.as_deref() {
            Some(url) => ChatMessage::user_with_image(self.content.clone(), url).flattened(),
            None => ChatMessage::new(self.role, self.content.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatSummary {
    pub id: i64,
    pub title: String,
    pub unique_id: String,
    #[serde(rename = "lastMessage")]
    pub last_message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "messageCount")]
    pub message_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub reason: Option<String>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            reason: None,
        }
    }

    pub fn assistant(content: impl Into<String>, reason: Option<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            reason,
        }
    }
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_chat(&self, user_id: &str, title: &str) -> Result<Chat>;
    async fn find_chat(&self, unique_id: &str) -> Result<Option<Chat>>;
    /// Most recently active first.
    async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatSummary>>;
    async fn add_message(&self, chat_id: i64, message: NewMessage) -> Result<i64>;
    async fn attach_image(&self, message_id: i64, image_url: &str) -> Result<()>;
    async fn list_messages(&self, chat_id: i64) -> Result<Vec<StoredMessage>>;
    async fn update_title(&self, chat_id: i64, title: &str) -> Result<()>;
    /// Removes the chat with its messages and images. `false` if it did not exist.
    async fn delete_chat(&self, chat_id: i64) -> Result<bool>;
}

/// Looks up a chat and hides it unless `user_id` owns it.
pub async fn find_owned_chat(
    store: &dyn ChatStore,
    user_id: &str,
    unique_id: &str,
) -> Result<Option<Chat>> {
    Ok(store
        .find_chat(unique_id)
        .await?
        .filter(|chat| chat.user_id == user_id))
}

fn sort_summaries(summaries: &mut [ChatSummary]) {
    summaries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
}

#[derive(Debug, Default)]
struct MemoryState {
    next_chat_id: i64,
    next_message_id: i64,
    chats: HashMap<i64, Chat>,
    messages: Vec<StoredMessage>,
}

#[derive(Debug, Default)]
pub struct InMemoryChatStore {
    state: RwLock<MemoryState>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn create_chat(&self, user_id: &str, title: &str) -> Result<Chat> {
        let mut state = self.state.write().await;
        state.next_chat_id += 1;
        let chat = Chat {
            id: state.next_chat_id,
            unique_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            created_at: Utc::now(),
        };
        state.chats.insert(chat.id, chat.clone());
        Ok(chat)
    }

    async fn find_chat(&self, unique_id: &str) -> Result<Option<Chat>> {
        let state = self.state.read().await;
        Ok(state
            .chats
            .values()
            .find(|chat| chat.unique_id == unique_id)
            .cloned())
    }

    async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatSummary>> {
        let state = self.state.read().await;
        let mut summaries = state
            .chats
            .values()
            .filter(|chat| chat.user_id == user_id)
            .map(|chat| {
                let messages = state
                    .messages
                    .iter()
                    .filter(|message| message.chat_id == chat.id)
                    .collect::<Vec<_>>();
                let last = messages.last();
                ChatSummary {
                    id: chat.id,
                    title: chat.title.clone(),
                    unique_id: chat.unique_id.clone(),
                    last_message: last.map(|m| m.content.clone()).unwrap_or_default(),
                    timestamp: last.map(|m| m.time_stamp).unwrap_or(chat.created_at),
                    message_count: messages.len() as i64,
                }
            })
            .collect::<Vec<_>>();
        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    async fn add_message(&self, chat_id: i64, message: NewMessage) -> Result<i64> {
        let mut state = self.state.write().await;
        if !state.chats.contains_key(&chat_id) {
            bail!("chat store: chat {chat_id} does not exist");
        }
        state.next_message_id += 1;
        let id = state.next_message_id;
        state.messages.push(StoredMessage {
            id,
            chat_id,
            role: message.role,
            content: message.content,
            reason: message.reason,
            image_url: None,
            time_stamp: Utc::now(),
        });
        Ok(id)
    }

    async fn attach_image(&self, message_id: i64, image_url: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let Some(message) = state
            .messages
            .iter_mut()
            .find(|message| message.id == message_id)
        else {
            bail!("chat store: message {message_id} does not exist");
        };
        message.image_url = Some(image_url.to_string());
        Ok(())
    }

    async fn list_messages(&self, chat_id: i64) -> Result<Vec<StoredMessage>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .iter()
            .filter(|message| message.chat_id == chat_id)
            .cloned()
            .collect())
    }

    async fn update_title(&self, chat_id: i64, title: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(chat) = state.chats.get_mut(&chat_id) {
            chat.title = title.to_string();
        }
        Ok(())
    }

    async fn delete_chat(&self, chat_id: i64) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.chats.remove(&chat_id).is_none() {
            return Ok(false);
        }
        state.messages.retain(|message| message.chat_id != chat_id);
        Ok(true)
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS chats (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        unique_id TEXT NOT NULL UNIQUE,
        user_id TEXT NOT NULL,
        title TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_chats_user_id ON chats(user_id)",
    "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        chat_id INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        reason TEXT,
        time_stamp TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_chat_id ON messages(chat_id)",
    "CREATE TABLE IF NOT EXISTS message_images (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
        image_url TEXT NOT NULL
    )",
];

/// Chat persistence on sqlite. Timestamps are stored as RFC 3339 text.
#[derive(Debug, Clone)]
pub struct SqliteChatStore {
    pool: SqlitePool,
}

impl SqliteChatStore {
    pub async fn connect(db_url: &str) -> Result<Self> {
        ensure_parent_dir_for_sqlite_url(db_url)?;
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| {
                format!(
                    "invalid chat store sqlite url '{}'",
                    crate::error::redact_sqlite_url_value(db_url)
                )
            })?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to open chat store sqlite database")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to migrate chat store schema")?;
        }
        Ok(())
    }

    pub async fn chat_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM chats")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("count")?)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("chat store holds an invalid timestamp '{raw}'"))?
        .with_timezone(&Utc))
}

fn chat_from_row(row: &SqliteRow) -> Result<Chat> {
    Ok(Chat {
        id: row.try_get("id")?,
        unique_id: row.try_get("unique_id")?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<StoredMessage> {
    let role: String = row.try_get("role")?;
    Ok(StoredMessage {
        id: row.try_get("id")?,
        chat_id: row.try_get("chat_id")?,
        role: Role::parse(&role)
            .with_context(|| format!("chat store holds an unknown role '{role}'"))?,
        content: row.try_get("content")?,
        reason: row.try_get("reason")?,
        image_url: row.try_get("image_url")?,
        time_stamp: parse_timestamp(&row.try_get::<String, _>("time_stamp")?)?,
    })
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn create_chat(&self, user_id: &str, title: &str) -> Result<Chat> {
        let unique_id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO chats (unique_id, user_id, title, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&unique_id)
        .bind(user_id)
        .bind(title)
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("chat store: failed to create chat")?;
        Ok(Chat {
            id: result.last_insert_rowid(),
            unique_id,
            user_id: user_id.to_string(),
            title: title.to_string(),
            created_at,
        })
    }

    async fn find_chat(&self, unique_id: &str) -> Result<Option<Chat>> {
        let row = sqlx::query(
            "SELECT id, unique_id, user_id, title, created_at FROM chats WHERE unique_id = ?",
        )
        .bind(unique_id)
        .fetch_optional(&self.pool)
        .await
        .context("chat store: failed to load chat")?;
        row.as_ref().map(chat_from_row).transpose()
    }

    async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatSummary>> {
        let rows = sqlx::query(
            "SELECT c.id, c.unique_id, c.title, c.created_at,
                (SELECT m.content FROM messages m WHERE m.chat_id = c.id ORDER BY m.id DESC LIMIT 1) AS last_message,
                (SELECT m.time_stamp FROM messages m WHERE m.chat_id = c.id ORDER BY m.id DESC LIMIT 1) AS last_time,
                (SELECT COUNT(*) FROM messages m WHERE m.chat_id = c.id) AS message_count
             FROM chats c WHERE c.user_id = ?",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("chat store: failed to list chats")?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let created_at: String = row.try_get("created_at")?;
            let last_time: Option<String> = row.try_get("last_time")?;
            summaries.push(ChatSummary {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                unique_id: row.try_get("unique_id")?,
                last_message: row
                    .try_get::<Option<String>, _>("last_message")?
                    .unwrap_or_default(),
                timestamp: parse_timestamp(last_time.as_deref().unwrap_or(&created_at))?,
                message_count: row.try_get("message_count")?,
            });
        }
        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    async fn add_message(&self, chat_id: i64, message: NewMessage) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO messages (chat_id, role, content, reason, time_stamp) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(chat_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.reason.as_deref())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("chat store: failed to add message to chat {chat_id}"))?;
        Ok(result.last_insert_rowid())
    }

    async fn attach_image(&self, message_id: i64, image_url: &str) -> Result<()> {
        sqlx::query("INSERT INTO message_images (message_id, image_url) VALUES (?, ?)")
            .bind(message_id)
            .bind(image_url)
            .execute(&self.pool)
            .await
            .with_context(|| format!("chat store: failed to attach image to message {message_id}"))?;
        Ok(())
    }

    async fn list_messages(&self, chat_id: i64) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT m.id, m.chat_id, m.role, m.content, m.reason, m.time_stamp,
                (SELECT i.image_url FROM message_images i WHERE i.message_id = m.id ORDER BY i.id LIMIT 1) AS image_url
             FROM messages m WHERE m.chat_id = ? ORDER BY m.id",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await
        .context("chat store: failed to list messages")?;
        rows.iter().map(message_from_row).collect()
    }

    async fn update_title(&self, chat_id: i64, title: &str) -> Result<()> {
        sqlx::query("UPDATE chats SET title = ? WHERE id = ?")
            .bind(title)
            .bind(chat_id)
            .execute(&self.pool)
            .await
            .context("chat store: failed to update title")?;
        Ok(())
    }

    async fn delete_chat(&self, chat_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(chat_id)
            .execute(&self.pool)
            .await
            .context("chat store: failed to delete chat")?;
        Ok(result.rows_affected() > 0)
    }
}

pub async fn build_chat_store(cfg: &RuntimeConfig) -> Result<Arc<dyn ChatStore>> {
    match cfg.session_backend {
        SessionBackend::Memory => Ok(Arc::new(InMemoryChatStore::new())),
        SessionBackend::Sqlite => {
            let store = SqliteChatStore::connect(&cfg.session_db_url).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}

pub fn ensure_parent_dir_for_sqlite_url(db_url: &str) -> Result<()> {
    let Some(db_path) = sqlite_path_from_url(db_url) else {
        return Ok(());
    };

    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create directory for sqlite database: {}",
                parent.display()
            )
        })?;
    }

    Ok(())
}

pub fn sqlite_path_from_url(db_url: &str) -> Option<PathBuf> {
    if !db_url.starts_with("sqlite://") {
        return None;
    }

    let path_with_params = db_url.trim_start_matches("sqlite://");
    let path_without_params = path_with_params
        .split_once('?')
        .map(|(path, _)| path)
        .unwrap_or(path_with_params);

    if path_without_params.is_empty() || path_without_params == ":memory:" {
        return None;
    }

    Some(Path::new(path_without_params).to_path_buf())
}

/// Where the current turn's messages go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveChat {
    /// No token and no chat id: answered, never stored.
    Anonymous,
    Stored(Chat),
}

impl ActiveChat {
    pub fn chat(&self) -> Option<&Chat> {
        match self {
            ActiveChat::Anonymous => None,
            ActiveChat::Stored(chat) => Some(chat),
        }
    }
}

/// State owned by one client connection. Dropped on disconnect.
pub struct ConversationSession {
    store: Arc<dyn ChatStore>,
    system_messages: Vec<ChatMessage>,
    principal: Option<Principal>,
    histories: HashMap<String, Vec<ChatMessage>>,
}

impl ConversationSession {
    pub fn new(store: Arc<dyn ChatStore>, system_messages: Vec<ChatMessage>) -> Self {
        Self {
            store,
            system_messages,
            principal: None,
            histories: HashMap::new(),
        }
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// A different caller on the same connection gets a fresh history cache.
    pub fn set_principal(&mut self, principal: Option<Principal>) {
        if self.principal != principal {
            self.histories.clear();
        }
        self.principal = principal;
    }

    /// Resolves the chat for a turn, creating one (and announcing it) when an
    /// authenticated caller sends no chat id.
    pub async fn open_chat(&mut self, chat_id: Option<&str>, sink: &EventSink) -> Result<ActiveChat> {
        let chat_id = chat_id.map(str::trim).filter(|id| !id.is_empty());
        match (&self.principal, chat_id) {
            (None, None) => Ok(ActiveChat::Anonymous),
            (None, Some(_)) => bail!("invalid value: a token is required to continue a chat"),
            (Some(principal), None) => {
                let chat = self
                    .store
                    .create_chat(&principal.user_id, DEFAULT_CHAT_TITLE)
                    .await?;
                tracing::info!(chat_id = %chat.unique_id, user = %principal.user_id, "Chat created");
                send_event(
                    sink,
                    ServerEvent::NewChat {
                        id: chat.id,
                        unique_id: chat.unique_id.clone(),
                        title: chat.title.clone(),
                    },
                );
                self.histories
                    .insert(chat.unique_id.clone(), self.system_messages.clone());
                Ok(ActiveChat::Stored(chat))
            }
            (Some(principal), Some(chat_id)) => {
                match find_owned_chat(self.store.as_ref(), &principal.user_id, chat_id).await? {
                    Some(chat) => Ok(ActiveChat::Stored(chat)),
                    None => bail!("invalid value: chat '{chat_id}' not found"),
                }
            }
        }
    }

    /// System messages followed by the chat's prior turns.
    pub async fn history(&mut self, chat: &ActiveChat) -> Result<Vec<ChatMessage>> {
        let Some(chat) = chat.chat() else {
            return Ok(self.system_messages.clone());
        };
        if let Some(history) = self.histories.get(&chat.unique_id) {
            return Ok(history.clone());
        }
        let mut history = self.system_messages.clone();
        history.extend(
            self.store
                .list_messages(chat.id)
                .await?
                .iter()
                .map(StoredMessage::to_chat_message),
        );
        self.histories
            .insert(chat.unique_id.clone(), history.clone());
        Ok(history)
    }

    pub async fn handle_turn(
        &mut self,
        agent: &MasterAgent,
        turn: &TurnRequest,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let chat = self.open_chat(turn.chat_id.as_deref(), sink).await?;
        let history = self.history(&chat).await?;
        let outcome = agent.respond(turn, &history, sink, cancel).await?;

        let user_message = match turn.image_url.as_deref() {
            Some(url) => ChatMessage::user_with_image(turn.query.clone(), url).flattened(),
            None => ChatMessage::user(turn.query.clone()),
        };
        let Some(stored) = chat.chat() else {
            return Ok(outcome);
        };

        let message_id = self
            .store
            .add_message(stored.id, NewMessage::user(turn.query.clone()))
            .await?;
        if let Some(url) = turn.image_url.as_deref() {
            self.store.attach_image(message_id, url).await?;
        }
        self.store
            .add_message(
                stored.id,
                NewMessage::assistant(outcome.answer.answer.clone(), outcome.answer.reason.clone()),
            )
            .await?;

        let mut conversation = history
            .into_iter()
            .filter(|message| message.role != Role::System)
            .collect::<Vec<_>>();
        conversation.push(user_message.clone());
        if let Some(title) = agent.title_for(&conversation).await {
            self.store.update_title(stored.id, &title).await?;
            send_event(
                sink,
                ServerEvent::Title {
                    title,
                    chat_id: stored.unique_id.clone(),
                },
            );
        }

        let cached = self
            .histories
            .entry(stored.unique_id.clone())
            .or_insert_with(|| self.system_messages.clone());
        cached.push(user_message);
        cached.push(ChatMessage::assistant(outcome.answer.answer.clone()));
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn principal(user: &str) -> Option<Principal> {
        Some(Principal {
            user_id: user.to_string(),
        })
    }

    async fn exercise_store(store: &dyn ChatStore) {
        let first = store.create_chat("alice", DEFAULT_CHAT_TITLE).await.expect("create chat");
        let second = store.create_chat("alice", DEFAULT_CHAT_TITLE).await.expect("create chat");
        store.create_chat("bob", DEFAULT_CHAT_TITLE).await.expect("create chat");

        let question = store
            .add_message(first.id, NewMessage::user("what is T1059?"))
            .await
            .expect("add user message");
        store
            .attach_image(question, "https://img.example/1.png")
            .await
            .expect("attach image");
        store
            .add_message(
                first.id,
                NewMessage::assistant("Command and Scripting Interpreter", Some("lookup".into())),
            )
            .await
            .expect("add assistant message");
        store.update_title(first.id, "ATT&CK lookup").await.expect("update title");

        let messages = store.list_messages(first.id).await.expect("list messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].image_url.as_deref(), Some("https://img.example/1.png"));
        assert_eq!(messages[1].reason.as_deref(), Some("lookup"));

        let summaries = store.list_chats("alice").await.expect("list chats");
        assert_eq!(summaries.len(), 2);
        let summary = summaries
            .iter()
            .find(|summary| summary.id == first.id)
            .expect("first chat listed");
        assert_eq!(summary.title, "ATT&CK lookup");
        assert_eq!(summary.message_count, 2);
        assert_eq!(summary.last_message, "Command and Scripting Interpreter");

        assert!(
            find_owned_chat(store, "bob", &first.unique_id)
                .await
                .expect("lookup")
                .is_none()
        );
        assert!(store.delete_chat(first.id).await.expect("delete chat"));
        assert!(!store.delete_chat(first.id).await.expect("second delete"));
        assert!(store.list_messages(first.id).await.expect("list").is_empty());
        assert_eq!(store.list_chats("alice").await.expect("list chats")[0].id, second.id);
    }

    #[tokio::test]
    async fn in_memory_store_round_trips_chats() {
        exercise_store(&InMemoryChatStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_chats() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let db_url = format!("sqlite://{}", dir.path().join("nested/chats.db").display());
        let store = SqliteChatStore::connect(&db_url).await.expect("sqlite store opens");
        store.migrate().await.expect("migrations apply");
        store.migrate().await.expect("migrations are idempotent");
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn anonymous_callers_cannot_reopen_chats() {
        let store: Arc<dyn ChatStore> = Arc::new(InMemoryChatStore::new());
        let mut session = ConversationSession::new(store.clone(), vec![ChatMessage::system("sys")]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert_eq!(
            session.open_chat(None, &tx).await.expect("anonymous turn"),
            ActiveChat::Anonymous
        );
        assert!(session.open_chat(Some("abc"), &tx).await.is_err());

        session.set_principal(principal("alice"));
        let chat = session.open_chat(None, &tx).await.expect("new chat");
        let ActiveChat::Stored(chat) = chat else {
            panic!("authenticated turn should create a chat");
        };
        match rx.try_recv().expect("new_chat event") {
            ServerEvent::NewChat { unique_id, title, .. } => {
                assert_eq!(unique_id, chat.unique_id);
                assert_eq!(title, DEFAULT_CHAT_TITLE);
            }
            other => panic!("unexpected event {other:?}"),
        }

        session.set_principal(principal("mallory"));
        let err = session
            .open_chat(Some(&chat.unique_id), &tx)
            .await
            .expect_err("foreign chat is rejected");
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn history_is_loaded_from_the_store_once() {
        let store: Arc<dyn ChatStore> = Arc::new(InMemoryChatStore::new());
        let chat = store.create_chat("alice", DEFAULT_CHAT_TITLE).await.expect("create chat");
        let id = store
            .add_message(chat.id, NewMessage::user("look at this"))
            .await
            .expect("add message");
        store
            .attach_image(id, "https://img.example/x.png")
            .await
            .expect("attach image");

        let mut session = ConversationSession::new(store.clone(), vec![ChatMessage::system("sys")]);
        session.set_principal(principal("alice"));
        let active = ActiveChat::Stored(chat.clone());
        let history = session.history(&active).await.expect("history loads");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].text(), "look at this\n[image: https://img.example/x.png]");

        store
            .add_message(chat.id, NewMessage::user("later"))
            .await
            .expect("add message");
        assert_eq!(session.history(&active).await.expect("cached").len(), 2);
    }

    #[test]
    fn sqlite_url_paths() {
        assert_eq!(
            sqlite_path_from_url("sqlite://.threatdesk/chats.db?mode=rwc"),
            Some(PathBuf::from(".threatdesk/chats.db"))
        );
        assert_eq!(sqlite_path_from_url("sqlite://:memory:"), None);
        assert_eq!(sqlite_path_from_url("postgres://x"), None);
    }
}
