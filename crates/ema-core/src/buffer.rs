//! The conversation buffer — a typed, append-only log of user inputs and
//! structured replies, used both as persisted transcript and as prompt
//! context via `{MEMORY_BUFFER}` injection.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{EmaError, Result};
use crate::types::{contents_to_text, ActorId, Content, EmaReply};

/// What a buffer entry records: a user input batch or a structured reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BufferPayload {
    User { contents: Vec<Content> },
    Ema { reply: EmaReply },
}

impl BufferPayload {
    /// Role label used in the rendered buffer line.
    pub fn role(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::Ema { .. } => "ema",
        }
    }

    /// Display text of the entry.
    pub fn text(&self) -> String {
        match self {
            Self::User { contents } => contents_to_text(contents),
            Self::Ema { reply } => reply.response.clone(),
        }
    }
}

/// One persisted buffer record. `id` is the per-actor sequence number
/// assigned by the store; ordering is preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferMessage {
    pub id: i64,
    pub name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
    pub payload: BufferPayload,
}

impl BufferMessage {
    /// Render one line for prompt injection:
    /// `- [YYYY-MM-DD HH:MM:SS][role:X][id:N][name:…] <text>`
    pub fn format_line(&self) -> String {
        format!(
            "- [{}][role:{}][id:{}][name:{}] {}",
            self.time.format("%Y-%m-%d %H:%M:%S"),
            self.payload.role(),
            self.id,
            self.name,
            self.payload.text()
        )
    }
}

/// Render a buffer slice for `{MEMORY_BUFFER}` expansion. An empty buffer
/// renders as `"None."`.
pub fn render_buffer(messages: &[BufferMessage]) -> String {
    if messages.is_empty() {
        return "None.".into();
    }
    messages
        .iter()
        .map(BufferMessage::format_line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Append-only buffer persistence, keyed by actor identity and sequence.
#[async_trait]
pub trait BufferStore: Send + Sync {
    /// Append a record, assigning the next sequence id for the actor.
    async fn append(
        &self,
        actor: ActorId,
        name: &str,
        payload: BufferPayload,
    ) -> Result<BufferMessage>;

    /// The last `limit` records in append order.
    async fn recent(&self, actor: ActorId, limit: usize) -> Result<Vec<BufferMessage>>;

    /// All records in append order.
    async fn list(&self, actor: ActorId) -> Result<Vec<BufferMessage>>;
}

/// In-memory buffer store. Used by tests and as the default when no data
/// directory is configured.
#[derive(Default)]
pub struct InMemoryBufferStore {
    entries: Mutex<HashMap<ActorId, Vec<BufferMessage>>>,
}

impl InMemoryBufferStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BufferStore for InMemoryBufferStore {
    async fn append(
        &self,
        actor: ActorId,
        name: &str,
        payload: BufferPayload,
    ) -> Result<BufferMessage> {
        let mut entries = self.entries.lock().await;
        let log = entries.entry(actor).or_default();
        let message = BufferMessage {
            id: log.len() as i64 + 1,
            name: name.to_string(),
            time: Utc::now(),
            payload,
        };
        log.push(message.clone());
        Ok(message)
    }

    async fn recent(&self, actor: ActorId, limit: usize) -> Result<Vec<BufferMessage>> {
        let entries = self.entries.lock().await;
        let log = entries.get(&actor).map(Vec::as_slice).unwrap_or(&[]);
        let start = log.len().saturating_sub(limit);
        Ok(log[start..].to_vec())
    }

    async fn list(&self, actor: ActorId) -> Result<Vec<BufferMessage>> {
        let entries = self.entries.lock().await;
        Ok(entries.get(&actor).cloned().unwrap_or_default())
    }
}

/// File-based buffer store using JSONL.
///
/// Layout: `<base>/<user>-<actor>.jsonl` — one record per line, append-only.
pub struct JsonlBufferStore {
    base: PathBuf,
    next_ids: Mutex<HashMap<ActorId, i64>>,
}

impl JsonlBufferStore {
    pub fn new(base: PathBuf) -> Self {
        Self {
            base,
            next_ids: Mutex::new(HashMap::new()),
        }
    }

    fn path(&self, actor: ActorId) -> PathBuf {
        self.base.join(format!("{}.jsonl", actor.key()))
    }

    async fn load(&self, actor: ActorId) -> Result<Vec<BufferMessage>> {
        let path = self.path(actor);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let mut records = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let record: BufferMessage = serde_json::from_str(line)
                .map_err(|e| EmaError::Actor(format!("corrupt buffer line: {e}")))?;
            records.push(record);
        }
        Ok(records)
    }
}

#[async_trait]
impl BufferStore for JsonlBufferStore {
    async fn append(
        &self,
        actor: ActorId,
        name: &str,
        payload: BufferPayload,
    ) -> Result<BufferMessage> {
        let mut next_ids = self.next_ids.lock().await;
        let next_id = match next_ids.get(&actor) {
            Some(id) => *id,
            None => self.load(actor).await?.last().map(|m| m.id).unwrap_or(0) + 1,
        };

        let message = BufferMessage {
            id: next_id,
            name: name.to_string(),
            time: Utc::now(),
            payload,
        };

        tokio::fs::create_dir_all(&self.base).await?;
        let line = serde_json::to_string(&message)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(actor))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        next_ids.insert(actor, next_id + 1);
        debug!(actor = %actor.key(), id = next_id, "Appended buffer record");
        Ok(message)
    }

    async fn recent(&self, actor: ActorId, limit: usize) -> Result<Vec<BufferMessage>> {
        let mut records = self.load(actor).await?;
        let start = records.len().saturating_sub(limit);
        Ok(records.split_off(start))
    }

    async fn list(&self, actor: ActorId) -> Result<Vec<BufferMessage>> {
        self.load(actor).await
    }
}
