//! Tool contract and registry.
//!
//! Tools are capabilities exposed to the LLM during agent runs. Each tool
//! implements the [`Tool`] trait. Tools are free to block; they do not
//! receive cancellation.

use std::sync::Arc;

use async_trait::async_trait;

use ema_core::types::ToolResult;

pub mod memory;
pub mod reply;

pub use reply::{EmaReplyTool, STRUCTURED_REPLY_TOOL};

/// The core tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the LLM (e.g. "ema_reply", "memory_search").
    fn name(&self) -> &str;

    /// Human-readable description for the LLM.
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with a keyed argument map. An `Err` here is converted
    /// by the agent into a failed [`ToolResult`]; the run continues either way.
    async fn execute(&self, args: serde_json::Value) -> anyhow::Result<ToolResult>;
}

/// Registry of available tools, looked up by name during the agent loop.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
