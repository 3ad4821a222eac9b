//! Agent-task mode: bind work (optionally on a timed schedule) to an agent,
//! with idle-wait semantics.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::{error, info};

use ema_agent::Agent;

use crate::timed::{TimedTab, TimedTask, TimedTaskScheduler};

/// The work an agent task performs, given its agent and the scheduler for
/// chaining further tasks.
pub type AgentTaskWork =
    Box<dyn FnOnce(Arc<Agent>, Arc<AgentTaskScheduler>) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// A unit of agent-bound work. With no `agent` the scheduler binds a freshly
/// created one.
pub struct AgentTask {
    pub name: String,
    pub agent: Option<Arc<Agent>>,
    pub work: AgentTaskWork,
}

/// Runs [`AgentTask`]s, binding them to agents.
pub struct AgentTaskScheduler {
    timed: TimedTaskScheduler,
    agent_factory: Box<dyn Fn() -> Arc<Agent> + Send + Sync>,
}

impl AgentTaskScheduler {
    pub fn new<F>(agent_factory: F) -> Arc<Self>
    where
        F: Fn() -> Arc<Agent> + Send + Sync + 'static,
    {
        Arc::new(Self {
            timed: TimedTaskScheduler::new(),
            agent_factory: Box::new(agent_factory),
        })
    }

    pub fn timed(&self) -> &TimedTaskScheduler {
        &self.timed
    }

    /// Invoke the task's work on its bound agent, or on a freshly created one.
    pub async fn run(self: &Arc<Self>, task: AgentTask) -> anyhow::Result<()> {
        let agent = task
            .agent
            .unwrap_or_else(|| (self.agent_factory)());
        info!(task = %task.name, "Running agent task");
        (task.work)(agent, self.clone()).await
    }

    /// Bind a timed schedule to agent tasks: each fire builds a task and runs
    /// it on its own tokio task.
    pub fn bind<F>(self: &Arc<Self>, timed: TimedTask, make_task: F) -> ema_core::Result<TimedTab>
    where
        F: Fn(DateTime<Utc>) -> AgentTask + Send + 'static,
    {
        let scheduler = self.clone();
        self.timed.schedule(timed, move |date, _tab| {
            let task = make_task(date);
            let name = task.name.clone();
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                if let Err(e) = scheduler.run(task).await {
                    error!(task = %name, %e, "Agent task failed");
                }
            });
        })
    }

    /// Resolve when the agent's `is_running` transitions to false, or when
    /// the timeout elapses. Holds no lock while waiting; returns `false` on
    /// timeout.
    pub async fn wait_for_idle(&self, agent: &Agent, timeout: Option<Duration>) -> bool {
        let wait = async {
            while agent.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use ema_agent::{AgentConfig, AgentState};
    use ema_core::types::{Content, LlmResponse, Message};
    use ema_providers::{LlmClient, ProviderError, ToolSchema};
    use ema_tools::ToolRegistry;

    struct ScriptedLlm {
        script: Mutex<VecDeque<LlmResponse>>,
    }

    impl ScriptedLlm {
        fn slow_text(texts: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(
                    texts
                        .iter()
                        .map(|t| LlmResponse {
                            contents: vec![Content::text(*t)],
                            tool_calls: vec![],
                            finish_reason: "stop".into(),
                            total_tokens: 0,
                        })
                        .collect(),
                ),
            })
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn generate(
            &self,
            _messages: &[Message],
            _tools: &[ToolSchema],
            _system_prompt: Option<&str>,
            _cancel: &CancellationToken,
        ) -> Result<LlmResponse, ProviderError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("LLM script exhausted"))
        }
    }

    fn scheduler_with_script(texts: &'static [&'static str]) -> Arc<AgentTaskScheduler> {
        AgentTaskScheduler::new(move || {
            Arc::new(ema_agent::Agent::new(
                ScriptedLlm::slow_text(texts),
                AgentConfig::default(),
            ))
        })
    }

    fn run_once_task(name: &str) -> AgentTask {
        AgentTask {
            name: name.into(),
            agent: None,
            work: Box::new(|agent, _scheduler| {
                Box::pin(async move {
                    agent
                        .run_with_state(AgentState::new(
                            "sp",
                            vec![Message::user_text("go")],
                            ToolRegistry::new(),
                        ))
                        .await;
                    Ok(())
                })
            }),
        }
    }

    #[tokio::test]
    async fn runs_work_on_a_fresh_agent_when_unbound() {
        let scheduler = scheduler_with_script(&["done"]);
        scheduler.run(run_once_task("one-shot")).await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_idle_resolves_when_run_ends() {
        let scheduler = scheduler_with_script(&["done"]);
        let agent = Arc::new(ema_agent::Agent::new(
            ScriptedLlm::slow_text(&["done"]),
            AgentConfig::default(),
        ));

        let runner = agent.clone();
        let handle = tokio::spawn(async move {
            runner
                .run_with_state(AgentState::new(
                    "sp",
                    vec![Message::user_text("go")],
                    ToolRegistry::new(),
                ))
                .await
        });

        // Give the run a moment to start, then wait for idle.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let idle = scheduler
            .wait_for_idle(&agent, Some(Duration::from_secs(2)))
            .await;
        assert!(idle);
        assert!(!agent.is_running());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_idle_times_out_on_long_run() {
        let scheduler = scheduler_with_script(&[]);
        let agent = Arc::new(ema_agent::Agent::new(
            ScriptedLlm::slow_text(&["slow"]),
            AgentConfig::default(),
        ));

        let runner = agent.clone();
        let handle = tokio::spawn(async move {
            runner
                .run_with_state(AgentState::new(
                    "sp",
                    vec![Message::user_text("go")],
                    ToolRegistry::new(),
                ))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let idle = scheduler
            .wait_for_idle(&agent, Some(Duration::from_millis(10)))
            .await;
        assert!(!idle, "run is still in its slow LLM call");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn bind_runs_tasks_on_each_fire() {
        let scheduler = scheduler_with_script(&["done", "done", "done", "done", "done"]);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        let tab = scheduler
            .bind(TimedTask::tick(Duration::from_millis(30)), move |_date| {
                let counter = counter.clone();
                AgentTask {
                    name: "tick-task".into(),
                    agent: None,
                    work: Box::new(move |_agent, _scheduler| {
                        Box::pin(async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                    }),
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        tab.cancel();
        assert!(count.load(Ordering::SeqCst) >= 2);
    }
}
