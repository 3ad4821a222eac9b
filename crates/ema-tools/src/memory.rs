//! Memory tools — expose the long-term memory store to the LLM.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use ema_core::memory::{LongTermMemory, MemoryStore};
use ema_core::types::ToolResult;

use crate::Tool;

/// Search long-term memories by keywords.
pub struct MemorySearchTool {
    store: Arc<dyn MemoryStore>,
    actor_id: i64,
}

impl MemorySearchTool {
    pub fn new(store: Arc<dyn MemoryStore>, actor_id: i64) -> Self {
        Self { store, actor_id }
    }
}

#[derive(Deserialize)]
struct SearchParams {
    keywords: Vec<String>,
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search long-term memories about the user by keywords."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "keywords": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Keywords to search for"
                }
            },
            "required": ["keywords"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> anyhow::Result<ToolResult> {
        let params: SearchParams = serde_json::from_value(args)?;
        debug!(actor_id = self.actor_id, keywords = ?params.keywords, "memory_search");

        let items = self.store.search(self.actor_id, &params.keywords).await?;
        if items.is_empty() {
            return Ok(ToolResult::ok("No matching memories."));
        }

        let lines: Vec<String> = items
            .iter()
            .map(|m| format!("- [{}] {}", m.time.format("%Y-%m-%d"), m.content))
            .collect();
        Ok(ToolResult::ok(format!(
            "Found {} memories:\n{}",
            items.len(),
            lines.join("\n")
        )))
    }
}

/// Store a long-term memory about the user.
pub struct MemoryAddTool {
    store: Arc<dyn MemoryStore>,
    actor_id: i64,
}

impl MemoryAddTool {
    pub fn new(store: Arc<dyn MemoryStore>, actor_id: i64) -> Self {
        Self { store, actor_id }
    }
}

#[derive(Deserialize)]
struct AddParams {
    keywords: Vec<String>,
    content: String,
}

#[async_trait]
impl Tool for MemoryAddTool {
    fn name(&self) -> &str {
        "memory_add"
    }

    fn description(&self) -> &str {
        "Store a long-term memory about the user, indexed by keywords."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "keywords": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Keywords to index the memory under"
                },
                "content": {
                    "type": "string",
                    "description": "The fact to remember"
                }
            },
            "required": ["keywords", "content"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> anyhow::Result<ToolResult> {
        let params: AddParams = serde_json::from_value(args)?;
        debug!(actor_id = self.actor_id, "memory_add");

        self.store
            .add_long_term(LongTermMemory {
                actor_id: self.actor_id,
                keywords: params.keywords,
                content: params.content,
                time: Utc::now(),
            })
            .await?;
        Ok(ToolResult::ok("Memory stored."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ema_core::memory::InMemoryMemoryStore;

    #[tokio::test]
    async fn add_then_search_roundtrip() {
        let store = Arc::new(InMemoryMemoryStore::new());
        let add = MemoryAddTool::new(store.clone(), 7);
        let search = MemorySearchTool::new(store, 7);

        let result = add
            .execute(serde_json::json!({
                "keywords": ["coffee"],
                "content": "Prefers espresso in the morning."
            }))
            .await
            .unwrap();
        assert!(result.success);

        let result = search
            .execute(serde_json::json!({"keywords": ["coffee"]}))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.content.unwrap().contains("espresso"));
    }

    #[tokio::test]
    async fn search_reports_no_matches() {
        let store = Arc::new(InMemoryMemoryStore::new());
        let search = MemorySearchTool::new(store, 7);
        let result = search
            .execute(serde_json::json!({"keywords": ["nothing"]}))
            .await
            .unwrap();
        assert_eq!(result.content.as_deref(), Some("No matching memories."));
    }
}
