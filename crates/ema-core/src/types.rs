//! The message model the agent loop runs on.

use serde::{Deserialize, Serialize};

/// A single content item inside a message. Currently text-only; the tagged
/// representation leaves room for other kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text { text: String },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
        }
    }
}

/// Join the text parts of a content list into one string.
pub fn contents_to_text(contents: &[Content]) -> String {
    contents
        .iter()
        .filter_map(Content::as_text)
        .collect::<Vec<_>>()
        .join("\n")
}

/// A tool invocation requested by the model. `id` is unique within one LLM
/// turn; `args` conforms to the named tool's JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// Outcome of a tool execution.
///
/// Invariant: `success == true` implies `content` is present and `error` is
/// absent, and vice versa. The constructors uphold it; the one sanctioned
/// exception is the structured-reply interception, which blanks `content`
/// after the reply has been delivered as an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: Some(content.into()),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: None,
            error: Some(error.into()),
        }
    }

    /// Drop the content while keeping the success flag. Used when the payload
    /// has already been delivered out-of-band and must not repeat in history.
    pub fn without_content(mut self) -> Self {
        self.content = None;
        self
    }
}

/// One entry in the conversation history.
///
/// The system prompt is never a `Message`: it lives on the agent state and is
/// handed to the LLM adapter as a separate field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        contents: Vec<Content>,
    },
    Model {
        contents: Vec<Content>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        result: ToolResult,
    },
}

impl Message {
    pub fn user(contents: Vec<Content>) -> Self {
        Self::User { contents }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::User {
            contents: vec![Content::text(text)],
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Self::User { .. })
    }
}

/// A complete (non-streamed) response from the LLM adapter.
///
/// `total_tokens` is the running cumulative count the provider reports for
/// the conversation; the context manager uses it to drive summarisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub contents: Vec<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
    pub total_tokens: u64,
}

impl LlmResponse {
    /// The model message to append to history for this response.
    pub fn to_message(&self) -> Message {
        Message::Model {
            contents: self.contents.clone(),
            tool_calls: self.tool_calls.clone(),
        }
    }
}

/// Facial expression of a structured reply. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expression {
    Neutral,
    Smile,
    Serious,
    Confused,
    Surprised,
    Sad,
}

/// Body action of a structured reply. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    None,
    Nod,
    Shake,
    Wave,
    Jump,
    Point,
}

/// The only sanctioned terminal output shape of a run: the payload of the
/// privileged `ema_reply` tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmaReply {
    pub think: String,
    pub expression: Expression,
    pub action: Action,
    pub response: String,
}

impl EmaReply {
    /// `think` and `response` must be non-empty after trimming; the enums are
    /// closed by construction.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.think.trim().is_empty() {
            return Err("'think' must not be empty".into());
        }
        if self.response.trim().is_empty() {
            return Err("'response' must not be empty".into());
        }
        Ok(())
    }
}

/// Identity of one actor. One worker instance exists per identity, and all
/// runs for that identity are serialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorId {
    pub user_id: i64,
    pub actor_id: i64,
}

impl ActorId {
    pub fn new(user_id: i64, actor_id: i64) -> Self {
        Self { user_id, actor_id }
    }

    /// Stable string form used as a storage key.
    pub fn key(&self) -> String {
        format!("{}-{}", self.user_id, self.actor_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_result_constructors_uphold_invariant() {
        let ok = ToolResult::ok("5");
        assert!(ok.success);
        assert_eq!(ok.content.as_deref(), Some("5"));
        assert!(ok.error.is_none());

        let err = ToolResult::err("boom");
        assert!(!err.success);
        assert!(err.content.is_none());
        assert_eq!(err.error.as_deref(), Some("boom"));
    }

    #[test]
    fn message_roles_serialize_with_role_tag() {
        let msg = Message::user_text("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["contents"][0]["type"], "text");
        assert_eq!(json["contents"][0]["text"], "hi");

        let tool = Message::Tool {
            id: Some("c1".into()),
            name: "add".into(),
            result: ToolResult::ok("5"),
        };
        let json = serde_json::to_value(&tool).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["result"]["success"], true);
    }

    #[test]
    fn ema_reply_roundtrip_and_validation() {
        let reply = EmaReply {
            think: "user greeted me".into(),
            expression: Expression::Smile,
            action: Action::Wave,
            response: "Hello!".into(),
        };
        assert!(reply.validate().is_ok());

        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains(r#""expression":"smile""#));
        assert!(json.contains(r#""action":"wave""#));
        let back: EmaReply = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reply);

        let empty = EmaReply {
            think: "  ".into(),
            ..reply
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn ema_reply_rejects_unknown_enum_values() {
        let raw = r#"{"think":"t","expression":"grin","action":"none","response":"r"}"#;
        assert!(serde_json::from_str::<EmaReply>(raw).is_err());
    }

    #[test]
    fn contents_to_text_joins_parts() {
        let contents = vec![Content::text("a"), Content::text("b")];
        assert_eq!(contents_to_text(&contents), "a\nb");
    }
}
