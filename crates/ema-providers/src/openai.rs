//! OpenAI-style chat completions adapter.
//!
//! Translates the internal message model to the `/chat/completions` wire
//! format and back. Also serves OpenAI-compatible backends (LM Studio,
//! OpenRouter, local servers) via `base_url`.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ema_core::types::{Content, LlmResponse, Message, ToolCall};

use crate::retry::{retry_async, RetryConfig};
use crate::{LlmClient, ProviderError, ToolSchema};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: Option<f64>,
    retry: RetryConfig,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: OPENAI_BASE_URL.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 4096,
            temperature: None,
            retry: RetryConfig::default(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn build_payload(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        system_prompt: Option<&str>,
    ) -> Value {
        let mut wire_messages: Vec<Value> = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system_prompt {
            wire_messages.push(json!({ "role": "system", "content": system }));
        }
        wire_messages.extend(messages.iter().map(message_to_wire));

        let mut payload = json!({
            "model": self.model,
            "messages": wire_messages,
            "max_tokens": self.max_tokens,
        });
        if let Some(temperature) = self.temperature {
            payload["temperature"] = json!(temperature);
        }
        if !tools.is_empty() {
            payload["tools"] = Value::Array(tools.iter().map(tool_to_wire).collect());
            payload["tool_choice"] = json!("auto");
        }
        payload
    }

    async fn request(&self, payload: &Value) -> Result<Value, ProviderError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        if !status.is_success() {
            return Err(ProviderError::Api(format!(
                "HTTP {status}: {}",
                extract_error_message(&body)
            )));
        }

        // Some backends report failures inside a 2xx body.
        if body.get("error").is_some() {
            return Err(ProviderError::Api(extract_error_message(&body)));
        }

        Ok(body)
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn id(&self) -> &str {
        "openai"
    }

    async fn generate(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        system_prompt: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<LlmResponse, ProviderError> {
        let payload = self.build_payload(messages, tools, system_prompt);
        debug!(model = %self.model, messages = messages.len(), tools = tools.len(), "LLM request");

        let body = retry_async(&self.retry, || async {
            tokio::select! {
                _ = cancel.cancelled() => Err(ProviderError::Cancelled),
                result = self.request(&payload) => result,
            }
        })
        .await?;

        parse_response(&body)
    }
}

fn extract_error_message(body: &Value) -> String {
    body.get("error")
        .and_then(|e| {
            e.get("message")
                .or_else(|| e.get("type"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| e.as_str().map(str::to_string))
        })
        .or_else(|| body.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

/// Internal → wire translation.
fn message_to_wire(message: &Message) -> Value {
    match message {
        Message::User { contents } => json!({
            "role": "user",
            "content": contents_to_wire(contents),
        }),
        Message::Model {
            contents,
            tool_calls,
        } => {
            let mut entry = json!({
                "role": "assistant",
                "content": contents_to_wire(contents),
            });
            if !tool_calls.is_empty() {
                entry["tool_calls"] = Value::Array(
                    tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": call.args.to_string(),
                                },
                            })
                        })
                        .collect(),
                );
            }
            entry
        }
        Message::Tool { id, name, result } => {
            let mut entry = json!({
                "role": "tool",
                "name": name,
                "content": serde_json::to_string(result).unwrap_or_default(),
            });
            if let Some(id) = id {
                entry["tool_call_id"] = json!(id);
            }
            entry
        }
    }
}

fn contents_to_wire(contents: &[Content]) -> Value {
    Value::Array(
        contents
            .iter()
            .map(|c| match c {
                Content::Text { text } => json!({ "type": "text", "text": text }),
            })
            .collect(),
    )
}

fn tool_to_wire(tool: &ToolSchema) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        },
    })
}

/// Wire → internal translation.
fn parse_response(body: &Value) -> Result<LlmResponse, ProviderError> {
    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| ProviderError::MalformedResponse("response missing 'choices'".into()))?;
    let message = choice
        .get("message")
        .ok_or_else(|| ProviderError::MalformedResponse("choice missing 'message'".into()))?;

    let mut contents = Vec::new();
    match message.get("content") {
        Some(Value::String(text)) if !text.is_empty() => contents.push(Content::text(text)),
        Some(Value::Array(parts)) => {
            for part in parts {
                if part.get("type").and_then(Value::as_str) == Some("text") {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        contents.push(Content::text(text));
                    }
                }
            }
        }
        _ => {}
    }

    let mut tool_calls = Vec::new();
    if let Some(raw_calls) = message.get("tool_calls").and_then(Value::as_array) {
        for raw in raw_calls {
            let id = raw
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let function = raw.get("function").cloned().unwrap_or_default();
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let args = match function.get("arguments") {
                Some(Value::String(raw_args)) => {
                    serde_json::from_str(raw_args).unwrap_or_else(|e| {
                        warn!(tool = %name, %e, "Unparseable tool arguments, using empty object");
                        json!({})
                    })
                }
                Some(value @ Value::Object(_)) => value.clone(),
                _ => json!({}),
            };
            tool_calls.push(ToolCall { id, name, args });
        }
    }

    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .unwrap_or("stop")
        .to_string();
    let total_tokens = body
        .get("usage")
        .and_then(|u| u.get("total_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Ok(LlmResponse {
        contents,
        tool_calls,
        finish_reason,
        total_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ema_core::types::ToolResult;

    #[test]
    fn user_message_to_wire() {
        let wire = message_to_wire(&Message::user_text("Hi"));
        assert_eq!(wire["role"], "user");
        assert_eq!(wire["content"][0]["type"], "text");
        assert_eq!(wire["content"][0]["text"], "Hi");
    }

    #[test]
    fn model_message_carries_tool_calls_with_string_arguments() {
        let wire = message_to_wire(&Message::Model {
            contents: vec![Content::text("thinking")],
            tool_calls: vec![ToolCall {
                id: "c1".into(),
                name: "add".into(),
                args: json!({"a": 2, "b": 3}),
            }],
        });
        assert_eq!(wire["role"], "assistant");
        assert_eq!(wire["tool_calls"][0]["id"], "c1");
        assert_eq!(wire["tool_calls"][0]["type"], "function");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "add");
        // Arguments must be a JSON string, not an object.
        let args = wire["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .unwrap();
        let parsed: Value = serde_json::from_str(args).unwrap();
        assert_eq!(parsed["a"], 2);
    }

    #[test]
    fn tool_message_serialises_result_as_json_content() {
        let wire = message_to_wire(&Message::Tool {
            id: Some("c1".into()),
            name: "add".into(),
            result: ToolResult::ok("5"),
        });
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "c1");
        let content: Value = serde_json::from_str(wire["content"].as_str().unwrap()).unwrap();
        assert_eq!(content["success"], true);
        assert_eq!(content["content"], "5");
    }

    #[test]
    fn parse_plain_text_response() {
        let body = json!({
            "choices": [{
                "message": { "role": "assistant", "content": "Hello." },
                "finish_reason": "stop",
            }],
            "usage": { "total_tokens": 10 },
        });
        let response = parse_response(&body).unwrap();
        assert_eq!(response.contents, vec![Content::text("Hello.")]);
        assert!(response.tool_calls.is_empty());
        assert_eq!(response.finish_reason, "stop");
        assert_eq!(response.total_tokens, 10);
    }

    #[test]
    fn parse_tool_call_response() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "c1",
                        "type": "function",
                        "function": { "name": "add", "arguments": "{\"a\":2,\"b\":3}" },
                    }],
                },
                "finish_reason": "tool_calls",
            }],
            "usage": { "total_tokens": 42 },
        });
        let response = parse_response(&body).unwrap();
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "add");
        assert_eq!(response.tool_calls[0].args["b"], 3);
        assert_eq!(response.finish_reason, "tool_calls");
    }

    #[test]
    fn unparseable_arguments_become_empty_object() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "tool_calls": [{
                        "id": "c1",
                        "function": { "name": "add", "arguments": "not json" },
                    }],
                },
                "finish_reason": "tool_calls",
            }],
        });
        let response = parse_response(&body).unwrap();
        assert_eq!(response.tool_calls[0].args, json!({}));
    }

    #[test]
    fn missing_choices_is_malformed() {
        assert!(matches!(
            parse_response(&json!({})),
            Err(ProviderError::MalformedResponse(_))
        ));
    }

    #[test]
    fn error_envelope_message_extraction() {
        let body = json!({ "error": { "type": "rate_limit", "message": "slow down" } });
        assert_eq!(extract_error_message(&body), "slow down");

        let body = json!({ "message": "top level" });
        assert_eq!(extract_error_message(&body), "top level");
    }
}
