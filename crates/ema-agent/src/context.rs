//! Conversation context for one agent run — history, token accounting, and
//! history summarisation.

use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ema_core::types::{Content, LlmResponse, Message, ToolResult};
use ema_providers::{LlmClient, ProviderError};

use crate::events::EventBus;
use crate::AgentEvent;

/// Per-message metadata overhead, in tokens.
const MESSAGE_OVERHEAD_TOKENS: u64 = 4;

/// Prefix of the synthetic user message a summarised round collapses into.
const SUMMARY_PREFIX: &str = "[Assistant Execution Summary]";

fn encoder() -> Option<&'static CoreBPE> {
    static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();
    ENCODER
        .get_or_init(|| tiktoken_rs::cl100k_base().ok())
        .as_ref()
}

/// Result of a token estimate. `fallback` is set when the BPE encoder was
/// unavailable and the `chars / 2.5` heuristic was used instead.
#[derive(Debug, Clone, Copy)]
pub struct TokenEstimate {
    pub tokens: u64,
    pub fallback: bool,
}

/// Holds the mutable conversation state for one agent run.
///
/// The system prompt is not part of the history; it lives on the agent state
/// and is supplied to the LLM adapter separately.
#[derive(Debug, Default)]
pub struct ContextManager {
    messages: Vec<Message>,
    last_total_tokens: u64,
    skip_summarize_once: bool,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn add_user(&mut self, contents: Vec<Content>) {
        self.messages.push(Message::User { contents });
    }

    pub fn add_model(&mut self, response: &LlmResponse) {
        self.messages.push(response.to_message());
    }

    pub fn add_tool(&mut self, result: ToolResult, name: &str, call_id: Option<String>) {
        self.messages.push(Message::Tool {
            id: call_id,
            name: name.to_string(),
            result,
        });
    }

    pub fn history(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    /// Record the cumulative token count the adapter reported for the latest
    /// call. A fresh observation also re-enables summarisation after a
    /// skip-once.
    pub fn note_total_tokens(&mut self, total_tokens: u64) {
        self.last_total_tokens = total_tokens;
        self.skip_summarize_once = false;
    }

    /// Local token estimate: BPE over the text of every message plus
    /// serialized tool calls and results, with a per-message overhead.
    pub fn estimate_tokens(&self) -> TokenEstimate {
        let texts: Vec<String> = self.messages.iter().flat_map(message_texts).collect();

        match encoder() {
            Some(bpe) => {
                let tokens: u64 = texts
                    .iter()
                    .map(|t| bpe.encode_ordinary(t).len() as u64)
                    .sum::<u64>()
                    + self.messages.len() as u64 * MESSAGE_OVERHEAD_TOKENS;
                TokenEstimate {
                    tokens,
                    fallback: false,
                }
            }
            None => {
                let chars: usize = texts.iter().map(String::len).sum();
                TokenEstimate {
                    tokens: (chars as f64 / 2.5) as u64,
                    fallback: true,
                }
            }
        }
    }

    /// Summarise the history when it exceeds `token_limit` (by local estimate
    /// or by the adapter-reported total).
    ///
    /// Every user message is preserved; the execution round between
    /// consecutive user messages collapses into one synthetic user message.
    /// A failed summariser call falls back to a raw textual join of the round
    /// — execution history is never dropped silently. Only cancellation
    /// propagates as an error.
    pub async fn summarize(
        &mut self,
        llm: &dyn LlmClient,
        token_limit: u64,
        cancel: &CancellationToken,
        events: &EventBus<AgentEvent>,
    ) -> Result<(), ProviderError> {
        if self.skip_summarize_once {
            return Ok(());
        }

        let estimate = self.estimate_tokens();
        if estimate.fallback {
            events.emit(AgentEvent::TokenEstimationFallbacked {
                estimated_tokens: estimate.tokens,
            });
        }
        if estimate.tokens <= token_limit && self.last_total_tokens <= token_limit {
            return Ok(());
        }

        let user_indices: Vec<usize> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_user())
            .map(|(i, _)| i)
            .collect();
        if user_indices.is_empty() {
            warn!("History over token limit but holds no user message; skipping summarisation");
            return Ok(());
        }

        info!(
            estimated_tokens = estimate.tokens,
            reported_tokens = self.last_total_tokens,
            token_limit,
            "History exceeds token limit, summarising"
        );
        events.emit(AgentEvent::SummarizeMessagesStarted {
            estimated_tokens: estimate.tokens,
            token_limit,
        });

        let mut new_messages: Vec<Message> = Vec::new();
        let mut rounds = 0;
        let mut fallbacks = 0;
        let mut summary_chars = 0;

        for (i, &user_idx) in user_indices.iter().enumerate() {
            new_messages.push(self.messages[user_idx].clone());

            let end = user_indices
                .get(i + 1)
                .copied()
                .unwrap_or(self.messages.len());
            let round = &self.messages[user_idx + 1..end];
            if round.is_empty() {
                continue;
            }
            rounds += 1;

            let raw = format_round(round);
            let summary = match summarize_round(llm, &raw, cancel).await {
                Ok(text) if !text.trim().is_empty() => text,
                Ok(_) => {
                    warn!(round = rounds, "Summariser returned empty text, using raw join");
                    fallbacks += 1;
                    raw
                }
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                Err(e) => {
                    warn!(round = rounds, %e, "Round summarisation failed, using raw join");
                    fallbacks += 1;
                    raw
                }
            };
            summary_chars += summary.len();
            new_messages.push(Message::user_text(format!("{SUMMARY_PREFIX}\n\n{summary}")));
        }

        self.messages = new_messages;
        self.skip_summarize_once = true;

        let after = self.estimate_tokens();
        debug!(
            before = estimate.tokens,
            after = after.tokens,
            rounds,
            fallbacks,
            "Summarisation complete"
        );
        events.emit(AgentEvent::SummarizeMessagesFinished {
            rounds,
            fallbacks,
            summary_chars,
        });
        Ok(())
    }
}

/// Text pieces of a message that count toward the token estimate.
fn message_texts(message: &Message) -> Vec<String> {
    match message {
        Message::User { contents } => contents
            .iter()
            .filter_map(|c| c.as_text().map(str::to_string))
            .collect(),
        Message::Model {
            contents,
            tool_calls,
        } => {
            let mut texts: Vec<String> = contents
                .iter()
                .filter_map(|c| c.as_text().map(str::to_string))
                .collect();
            if !tool_calls.is_empty() {
                texts.push(serde_json::to_string(tool_calls).unwrap_or_default());
            }
            texts
        }
        Message::Tool { result, .. } => {
            vec![serde_json::to_string(result).unwrap_or_default()]
        }
    }
}

/// Readable rendering of an execution round, used both as summariser input
/// and as the fallback summary.
fn format_round(round: &[Message]) -> String {
    let mut parts = Vec::new();
    for message in round {
        match message {
            Message::User { contents } => {
                parts.push(format!("User: {}", ema_core::types::contents_to_text(contents)));
            }
            Message::Model {
                contents,
                tool_calls,
            } => {
                let text = ema_core::types::contents_to_text(contents);
                if !text.is_empty() {
                    parts.push(format!("Assistant: {}", truncate(&text, 200)));
                }
                for call in tool_calls {
                    parts.push(format!("  -> tool call: {}({})", call.name, call.args));
                }
            }
            Message::Tool { name, result, .. } => {
                let status = if result.success { "ok" } else { "error" };
                let body = result
                    .content
                    .as_deref()
                    .or(result.error.as_deref())
                    .unwrap_or("");
                parts.push(format!(
                    "  <- tool result ({name}, {status}): {}",
                    truncate(body, 100)
                ));
            }
        }
    }
    parts.join("\n")
}

async fn summarize_round(
    llm: &dyn LlmClient,
    round_text: &str,
    cancel: &CancellationToken,
) -> Result<String, ProviderError> {
    let prompt = format!(
        "Summarize the following agent execution round concisely.\n\n\
         {round_text}\n\n\
         Requirements:\n\
         1. Focus on what was done and which tools were called.\n\
         2. Preserve key results and important findings.\n\
         3. Keep it under 1000 words.\n\
         4. Answer in the same language the round is written in."
    );
    let response = llm
        .generate(
            &[Message::user_text(prompt)],
            &[],
            Some("You are an assistant that summarizes agent execution traces."),
            cancel,
        )
        .await?;
    Ok(ema_core::types::contents_to_text(&response.contents))
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ema_core::types::ToolCall;

    fn model_with_call(text: &str, call_name: &str) -> LlmResponse {
        LlmResponse {
            contents: vec![Content::text(text)],
            tool_calls: vec![ToolCall {
                id: "c1".into(),
                name: call_name.into(),
                args: serde_json::json!({}),
            }],
            finish_reason: "tool_calls".into(),
            total_tokens: 0,
        }
    }

    #[test]
    fn history_appends_in_order() {
        let mut ctx = ContextManager::new();
        ctx.add_user(vec![Content::text("hi")]);
        ctx.add_model(&model_with_call("working", "add"));
        ctx.add_tool(ToolResult::ok("5"), "add", Some("c1".into()));

        let history = ctx.history();
        assert_eq!(history.len(), 3);
        assert!(history[0].is_user());
        assert!(matches!(&history[1], Message::Model { tool_calls, .. } if tool_calls.len() == 1));
        assert!(matches!(&history[2], Message::Tool { id: Some(id), .. } if id == "c1"));
    }

    #[test]
    fn estimate_counts_tool_traffic_and_overhead() {
        let mut ctx = ContextManager::new();
        let empty = ctx.estimate_tokens();
        assert_eq!(empty.tokens, 0);

        ctx.add_user(vec![Content::text("hello world, how are you today?")]);
        ctx.add_model(&model_with_call("let me check", "add"));
        ctx.add_tool(ToolResult::ok("5"), "add", Some("c1".into()));

        let estimate = ctx.estimate_tokens();
        // Three messages of overhead at minimum, plus actual text.
        assert!(estimate.tokens > 3 * MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn format_round_is_readable() {
        let round = vec![
            Message::Model {
                contents: vec![Content::text("checking the math")],
                tool_calls: vec![ToolCall {
                    id: "c1".into(),
                    name: "add".into(),
                    args: serde_json::json!({"a": 2, "b": 3}),
                }],
            },
            Message::Tool {
                id: Some("c1".into()),
                name: "add".into(),
                result: ToolResult::ok("5"),
            },
        ];
        let text = format_round(&round);
        assert!(text.contains("Assistant: checking the math"));
        assert!(text.contains("tool call: add"));
        assert!(text.contains("tool result (add, ok)"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 4), "abcd...");
    }
}
