//! The actor worker — the per-actor facade over the agent runtime.
//!
//! One worker exists per actor identity. It queues incoming input batches,
//! serialises runs, preempts the active run when new input arrives, persists
//! the conversation buffer, and fans `{status, events}` snapshots out to
//! subscribers.

use serde::{Deserialize, Serialize};

use ema_agent::AgentEvent;
use ema_core::types::EmaReply;

pub mod worker;

pub use worker::{ActorConfig, ActorWorker, SearchResult, Snapshot, SubscriberId};

/// Lifecycle status of an actor worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorStatus {
    Idle,
    Preparing,
    Running,
}

/// Events delivered to actor subscribers: the agent-side set re-exported
/// under the same tags, plus plain `message` notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "camelCase")]
pub enum ActorEvent {
    Message(String),
    RunFinished {
        ok: bool,
        msg: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    EmaReplyReceived {
        reply: EmaReply,
    },
    StepStarted {
        step: u32,
        max_steps: u32,
    },
    LlmResponseReceived {
        finish_reason: String,
        tool_calls: usize,
        total_tokens: u64,
    },
    ToolCallStarted {
        id: String,
        name: String,
    },
    ToolCallFinished {
        id: String,
        name: String,
        success: bool,
    },
    SummarizeMessagesStarted {
        estimated_tokens: u64,
        token_limit: u64,
    },
    SummarizeMessagesFinished {
        rounds: usize,
        fallbacks: usize,
        summary_chars: usize,
    },
    TokenEstimationFallbacked {
        estimated_tokens: u64,
    },
}

impl From<AgentEvent> for ActorEvent {
    fn from(event: AgentEvent) -> Self {
        match event {
            AgentEvent::RunFinished { ok, msg, error } => Self::RunFinished { ok, msg, error },
            AgentEvent::EmaReplyReceived { reply } => Self::EmaReplyReceived { reply },
            AgentEvent::StepStarted { step, max_steps } => Self::StepStarted { step, max_steps },
            AgentEvent::LlmResponseReceived {
                finish_reason,
                tool_calls,
                total_tokens,
            } => Self::LlmResponseReceived {
                finish_reason,
                tool_calls,
                total_tokens,
            },
            AgentEvent::ToolCallStarted { id, name } => Self::ToolCallStarted { id, name },
            AgentEvent::ToolCallFinished { id, name, success } => {
                Self::ToolCallFinished { id, name, success }
            }
            AgentEvent::SummarizeMessagesStarted {
                estimated_tokens,
                token_limit,
            } => Self::SummarizeMessagesStarted {
                estimated_tokens,
                token_limit,
            },
            AgentEvent::SummarizeMessagesFinished {
                rounds,
                fallbacks,
                summary_chars,
            } => Self::SummarizeMessagesFinished {
                rounds,
                fallbacks,
                summary_chars,
            },
            AgentEvent::TokenEstimationFallbacked { estimated_tokens } => {
                Self::TokenEstimationFallbacked { estimated_tokens }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_event_wire_shape() {
        let event = ActorEvent::Message("hello".into());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["content"], "hello");
    }

    #[test]
    fn agent_events_keep_their_tags() {
        let event = ActorEvent::from(AgentEvent::RunFinished {
            ok: false,
            msg: "Aborted".into(),
            error: Some("Aborted".into()),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "runFinished");
        assert_eq!(json["content"]["ok"], false);
        assert_eq!(json["content"]["error"], "Aborted");
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(ActorStatus::Preparing).unwrap(),
            "preparing"
        );
    }
}
