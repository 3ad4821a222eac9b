//! The privileged structured-reply tool.
//!
//! One invocation terminates a turn: the agent intercepts the result, emits
//! the parsed reply as an event, and blanks the content before it lands in
//! history so the user-visible payload is never repeated to the LLM.

use async_trait::async_trait;
use tracing::debug;

use ema_core::types::{EmaReply, ToolResult};

use crate::Tool;

/// Fixed name the agent loop intercepts.
pub const STRUCTURED_REPLY_TOOL: &str = "ema_reply";

#[derive(Default)]
pub struct EmaReplyTool;

impl EmaReplyTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for EmaReplyTool {
    fn name(&self) -> &str {
        STRUCTURED_REPLY_TOOL
    }

    fn description(&self) -> &str {
        "Deliver your reply to the user. This is the only way the user sees \
         your answer; call it exactly once when you are ready to respond."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "think": {
                    "type": "string",
                    "description": "Your private reasoning behind this reply"
                },
                "expression": {
                    "type": "string",
                    "enum": ["neutral", "smile", "serious", "confused", "surprised", "sad"],
                    "description": "Facial expression to show"
                },
                "action": {
                    "type": "string",
                    "enum": ["none", "nod", "shake", "wave", "jump", "point"],
                    "description": "Body action to perform"
                },
                "response": {
                    "type": "string",
                    "description": "The reply text shown to the user"
                }
            },
            "required": ["think", "expression", "action", "response"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> anyhow::Result<ToolResult> {
        let reply: EmaReply = match serde_json::from_value(args) {
            Ok(reply) => reply,
            Err(e) => return Ok(ToolResult::err(format!("invalid reply payload: {e}"))),
        };
        if let Err(e) = reply.validate() {
            return Ok(ToolResult::err(format!("invalid reply payload: {e}")));
        }

        debug!(expression = ?reply.expression, action = ?reply.action, "Structured reply produced");
        Ok(ToolResult::ok(serde_json::to_string(&reply)?))
    }
}
