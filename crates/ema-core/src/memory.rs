//! Memory store contracts — short-term notes and keyword-indexed long-term
//! memories. Vector indexes and document databases stay behind these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShortTermMemory {
    pub actor_id: i64,
    pub content: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongTermMemory {
    pub actor_id: i64,
    pub keywords: Vec<String>,
    pub content: String,
    pub time: DateTime<Utc>,
}

/// CRUD/search contract the actor needs from its memory backend.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Long-term memories for the actor matching any of the keywords.
    async fn search(&self, actor_id: i64, keywords: &[String]) -> Result<Vec<LongTermMemory>>;

    async fn add_short_term(&self, memory: ShortTermMemory) -> Result<()>;

    async fn add_long_term(&self, memory: LongTermMemory) -> Result<()>;
}

/// In-memory store with substring keyword matching.
#[derive(Default)]
pub struct InMemoryMemoryStore {
    short_term: Mutex<Vec<ShortTermMemory>>,
    long_term: Mutex<Vec<LongTermMemory>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn search(&self, actor_id: i64, keywords: &[String]) -> Result<Vec<LongTermMemory>> {
        let needles: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
        let long_term = self.long_term.lock().await;
        Ok(long_term
            .iter()
            .filter(|m| m.actor_id == actor_id)
            .filter(|m| {
                needles.iter().any(|needle| {
                    m.keywords.iter().any(|k| k.to_lowercase().contains(needle))
                        || m.content.to_lowercase().contains(needle)
                })
            })
            .cloned()
            .collect())
    }

    async fn add_short_term(&self, memory: ShortTermMemory) -> Result<()> {
        self.short_term.lock().await.push(memory);
        Ok(())
    }

    async fn add_long_term(&self, memory: LongTermMemory) -> Result<()> {
        self.long_term.lock().await.push(memory);
        Ok(())
    }
}
