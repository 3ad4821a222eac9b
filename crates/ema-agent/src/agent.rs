//! The agent main loop — LLM call, tool calls, repeat, with abort
//! checkpoints and exactly one terminal event per run.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ema_core::types::{EmaReply, Message, ToolCall, ToolResult};
use ema_core::EmaError;
use ema_providers::{LlmClient, ProviderError, ToolSchema};
use ema_tools::{ToolRegistry, STRUCTURED_REPLY_TOOL};

use crate::context::ContextManager;
use crate::events::EventBus;
use crate::{error_kind, AgentEvent};

#[derive(Debug, Clone, Copy)]
pub struct AgentConfig {
    /// Main-loop step bound.
    pub max_steps: u32,
    /// Token count above which history summarisation triggers.
    pub token_limit: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 50,
            token_limit: 80_000,
        }
    }
}

/// Everything one run needs: prompt, history, tool set.
///
/// Exclusively owned by the running agent; returned when the run terminates
/// so the actor can cache it for resume across preemption.
#[derive(Clone)]
pub struct AgentState {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: ToolRegistry,
}

impl AgentState {
    pub fn new(system_prompt: impl Into<String>, messages: Vec<Message>, tools: ToolRegistry) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages,
            tools,
        }
    }
}

/// Single-use continuation handed to [`Agent::run`]. Launching twice is a
/// state-usage error; never launching keeps the state change and runs
/// nothing.
#[derive(Default)]
pub struct RunLauncher {
    slot: Mutex<Option<AgentState>>,
    launched: AtomicBool,
}

impl RunLauncher {
    pub fn launch(&self, state: AgentState) -> ema_core::Result<()> {
        if self.launched.swap(true, Ordering::SeqCst) {
            return Err(EmaError::State(
                "run launcher may only be invoked once per run".into(),
            ));
        }
        *self.slot.lock().unwrap() = Some(state);
        Ok(())
    }
}

/// Drives one cancellable run against a given [`AgentState`].
pub struct Agent {
    llm: Arc<dyn LlmClient>,
    config: AgentConfig,
    events: EventBus<AgentEvent>,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl Agent {
    pub fn new(llm: Arc<dyn LlmClient>, config: AgentConfig) -> Self {
        Self {
            llm,
            config,
            events: EventBus::new(),
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn events(&self) -> &EventBus<AgentEvent> {
        &self.events
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Request cancellation of the active run. Idempotent; returns once the
    /// request has been delivered, not necessarily observed. The run notices
    /// at the next checkpoint, and an in-flight LLM call observes the token
    /// directly. With no run active this is a no-op: each run arms a fresh
    /// token at start.
    pub fn abort(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    /// Run via a single-use continuation. The state handed to
    /// [`RunLauncher::launch`] becomes the active state; if `launch` is never
    /// called, no work runs and `None` is returned.
    pub async fn run<F>(&self, f: F) -> Option<AgentState>
    where
        F: FnOnce(&RunLauncher),
    {
        let launcher = RunLauncher::default();
        f(&launcher);
        let state = launcher.slot.lock().unwrap().take();
        match state {
            Some(state) => Some(self.run_with_state(state).await),
            None => None,
        }
    }

    /// Run the main loop to its terminal event and return the final state.
    pub async fn run_with_state(&self, state: AgentState) -> AgentState {
        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap() = cancel.clone();
        self.running.store(true, Ordering::SeqCst);

        let final_state = self.main_loop(state, cancel).await;

        self.running.store(false, Ordering::SeqCst);
        final_state
    }

    async fn main_loop(&self, state: AgentState, cancel: CancellationToken) -> AgentState {
        let AgentState {
            system_prompt,
            messages,
            tools,
        } = state;
        let mut ctx = ContextManager::from_messages(messages);
        let schemas: Vec<ToolSchema> = tools
            .tools()
            .iter()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();

        let max_steps = self.config.max_steps;
        let mut finished = false;

        'run: for step in 1..=max_steps {
            self.events.emit(AgentEvent::StepStarted { step, max_steps });
            debug!(step, max_steps, "Agent loop step");

            if cancel.is_cancelled() {
                self.finish_aborted();
                finished = true;
                break 'run;
            }

            // Context-length defence; a no-op while under the limit.
            if let Err(ProviderError::Cancelled) = ctx
                .summarize(
                    self.llm.as_ref(),
                    self.config.token_limit,
                    &cancel,
                    &self.events,
                )
                .await
            {
                self.finish_aborted();
                finished = true;
                break 'run;
            }

            let response = match self
                .llm
                .generate(ctx.history(), &schemas, Some(&system_prompt), &cancel)
                .await
            {
                Ok(response) => response,
                Err(ProviderError::Cancelled) => {
                    self.finish_aborted();
                    finished = true;
                    break 'run;
                }
                Err(e @ ProviderError::RetryExhausted { .. }) => {
                    error!(%e, "LLM retries exhausted");
                    self.finish(false, e.to_string(), Some(error_kind::RETRY_EXHAUSTED));
                    finished = true;
                    break 'run;
                }
                Err(e) => {
                    error!(%e, "LLM call failed");
                    self.finish(
                        false,
                        format!("LLM call failed: {e}"),
                        Some(error_kind::ADAPTER_ERROR),
                    );
                    finished = true;
                    break 'run;
                }
            };

            ctx.note_total_tokens(response.total_tokens);
            self.events.emit(AgentEvent::LlmResponseReceived {
                finish_reason: response.finish_reason.clone(),
                tool_calls: response.tool_calls.len(),
                total_tokens: response.total_tokens,
            });

            let tool_calls = response.tool_calls.clone();
            ctx.add_model(&response);

            // No tool calls is the success terminal.
            if tool_calls.is_empty() {
                info!(finish_reason = %response.finish_reason, "Run complete");
                self.finish(true, response.finish_reason, None);
                finished = true;
                break 'run;
            }

            for call in &tool_calls {
                if cancel.is_cancelled() {
                    self.finish_aborted();
                    finished = true;
                    break 'run;
                }

                self.events.emit(AgentEvent::ToolCallStarted {
                    id: call.id.clone(),
                    name: call.name.clone(),
                });

                let result = self.execute_tool(&tools, call).await;
                let result = self.intercept_structured_reply(call, result);

                self.events.emit(AgentEvent::ToolCallFinished {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    success: result.success,
                });
                ctx.add_tool(result, &call.name, Some(call.id.clone()));
            }
        }

        if !finished {
            warn!(max_steps, "Step bound exhausted");
            self.finish(
                false,
                format!("Task couldn't be completed after {max_steps} steps"),
                Some(error_kind::MAX_STEPS),
            );
        }

        AgentState {
            system_prompt,
            messages: ctx.into_messages(),
            tools,
        }
    }

    async fn execute_tool(&self, tools: &ToolRegistry, call: &ToolCall) -> ToolResult {
        let Some(tool) = tools.get(&call.name) else {
            warn!(tool = %call.name, "Unknown tool requested by model");
            return ToolResult::err(format!("Unknown tool: {}", call.name));
        };

        match AssertUnwindSafe(tool.execute(call.args.clone()))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(tool = %call.name, error = %e, "Tool execution failed");
                ToolResult::err(format!("{}: {e:#}", call.name))
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "tool panicked".into());
                error!(tool = %call.name, %message, "Tool panicked");
                ToolResult::err(format!("{}: {message}", call.name))
            }
        }
    }

    /// On a successful `ema_reply` call: parse the JSON payload, deliver it
    /// as an event, and blank the result content so the user-visible payload
    /// is not repeated into history.
    fn intercept_structured_reply(&self, call: &ToolCall, result: ToolResult) -> ToolResult {
        if call.name != STRUCTURED_REPLY_TOOL || !result.success {
            return result;
        }
        let parsed = result
            .content
            .as_deref()
            .map(serde_json::from_str::<EmaReply>);
        match parsed {
            Some(Ok(reply)) => {
                self.events.emit(AgentEvent::EmaReplyReceived { reply });
                result.without_content()
            }
            _ => {
                warn!("Structured reply content was not a valid reply payload");
                result
            }
        }
    }

    fn finish(&self, ok: bool, msg: impl Into<String>, error: Option<&str>) {
        self.events.emit(AgentEvent::RunFinished {
            ok,
            msg: msg.into(),
            error: error.map(str::to_string),
        });
    }

    fn finish_aborted(&self) {
        info!("Run aborted");
        self.finish(false, "Aborted", Some(error_kind::ABORTED));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_launcher_rejects_second_launch() {
        let launcher = RunLauncher::default();
        let state = AgentState::new("sp", vec![], ToolRegistry::new());
        assert!(launcher.launch(state.clone()).is_ok());
        assert!(matches!(
            launcher.launch(state),
            Err(EmaError::State(_))
        ));
    }
}
