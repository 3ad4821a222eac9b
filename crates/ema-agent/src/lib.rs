//! Agent runtime — drives one cancellable run of the LLM + tool loop.
//!
//! The agent takes an [`AgentState`] (system prompt, history, tool set),
//! alternates LLM calls and tool invocations up to a step bound, and emits
//! typed [`AgentEvent`]s for the actor to fan out. Cancellation is
//! cooperative: [`agent::Agent::abort`] signals a token that is polled at the
//! loop checkpoints and raced against in-flight LLM calls.

use serde::{Deserialize, Serialize};

use ema_core::types::EmaReply;

pub mod agent;
pub mod context;
pub mod events;

pub use agent::{Agent, AgentConfig, AgentState, RunLauncher};
pub use context::ContextManager;
pub use events::EventBus;

/// Error kind strings carried by [`AgentEvent::RunFinished`].
pub mod error_kind {
    pub const ABORTED: &str = "Aborted";
    pub const RETRY_EXHAUSTED: &str = "RetryExhausted";
    pub const ADAPTER_ERROR: &str = "AdapterError";
    pub const MAX_STEPS: &str = "MaxSteps";
}

/// Events emitted by the agent during a run.
///
/// Exactly one `RunFinished` is emitted per run, and nothing follows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "camelCase")]
pub enum AgentEvent {
    /// Terminal event of a run.
    RunFinished {
        ok: bool,
        msg: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The privileged structured-reply tool succeeded.
    EmaReplyReceived { reply: EmaReply },

    /// Diagnostic: a main-loop step began.
    StepStarted { step: u32, max_steps: u32 },

    /// Diagnostic: an LLM response arrived.
    LlmResponseReceived {
        finish_reason: String,
        tool_calls: usize,
        total_tokens: u64,
    },

    /// Diagnostic: a tool call is being executed.
    ToolCallStarted { id: String, name: String },

    /// Diagnostic: a tool call completed.
    ToolCallFinished {
        id: String,
        name: String,
        success: bool,
    },

    /// Diagnostic: history summarisation triggered.
    SummarizeMessagesStarted {
        estimated_tokens: u64,
        token_limit: u64,
    },

    /// Diagnostic: history summarisation completed. `fallbacks` counts rounds
    /// that fell back to a raw textual join; `summary_chars` surfaces how much
    /// text the summaries kept.
    SummarizeMessagesFinished {
        rounds: usize,
        fallbacks: usize,
        summary_chars: usize,
    },

    /// Diagnostic: the BPE tokeniser was unavailable and a character-count
    /// estimate was used instead.
    TokenEstimationFallbacked { estimated_tokens: u64 },
}

impl AgentEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinished { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_camel_case_tags() {
        let event = AgentEvent::RunFinished {
            ok: true,
            msg: "stop".into(),
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "runFinished");
        assert_eq!(json["content"]["ok"], true);
        assert_eq!(json["content"]["msg"], "stop");
        assert!(json["content"].get("error").is_none());
    }

    #[test]
    fn aborted_event_shape() {
        let event = AgentEvent::RunFinished {
            ok: false,
            msg: "Aborted".into(),
            error: Some(error_kind::ABORTED.into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["content"]["error"], "Aborted");
    }
}
