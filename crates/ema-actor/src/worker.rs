//! The per-actor worker: queueing, preemption, buffer writes, fan-out.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use ema_agent::{Agent, AgentConfig, AgentEvent, AgentState};
use ema_core::buffer::{render_buffer, BufferPayload, BufferStore};
use ema_core::config::{Config, DEFAULT_SYSTEM_PROMPT};
use ema_core::memory::{LongTermMemory, MemoryStore, ShortTermMemory};
use ema_core::types::{ActorId, Content, Message};
use ema_core::{EmaError, Result};
use ema_providers::LlmClient;
use ema_tools::ToolRegistry;

use crate::{ActorEvent, ActorStatus};

/// Placeholder in the system prompt expanded with recent buffer lines.
const MEMORY_BUFFER_PLACEHOLDER: &str = "{MEMORY_BUFFER}";

pub type SubscriberId = u64;

type SubscriberCallback = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// What a subscriber receives on every broadcast: the current status plus
/// the events emitted since the previous broadcast. The subscribe-time
/// delivery replays all past events.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Snapshot {
    pub status: ActorStatus,
    pub events: Vec<ActorEvent>,
}

/// Result of a long-term memory search.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchResult {
    pub items: Vec<LongTermMemory>,
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct ActorConfig {
    /// Name the actor signs its own buffer records with.
    pub name: String,
    /// Name user inputs are recorded under.
    pub user_name: String,
    /// System prompt template; `{MEMORY_BUFFER}` placeholders are expanded
    /// before every fresh run.
    pub system_prompt: String,
    /// How many buffer records the placeholder expands to.
    pub buffer_inject_count: usize,
    pub agent: AgentConfig,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            name: "Ema".into(),
            user_name: "User".into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            buffer_inject_count: 10,
            agent: AgentConfig::default(),
        }
    }
}

impl ActorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            name: config.actor_name(),
            system_prompt: config.system_prompt(),
            buffer_inject_count: config.buffer_inject_count(),
            agent: AgentConfig {
                max_steps: config.max_steps(),
                token_limit: config.token_limit(),
            },
            ..Self::default()
        }
    }
}

struct WorkerState {
    status: ActorStatus,
    queue: VecDeque<Vec<Content>>,
    events: Vec<ActorEvent>,
    subscribers: Vec<(SubscriberId, SubscriberCallback)>,
    next_subscriber_id: SubscriberId,
    /// A queue-processor task is alive (preparing or running).
    processing: bool,
    /// State cached across preemption for resume.
    cached_state: Option<AgentState>,
    resume_requested: bool,
    has_reply_in_run: bool,
}

struct Inner {
    id: ActorId,
    config: ActorConfig,
    agent: Agent,
    tools: ToolRegistry,
    buffer: Arc<dyn BufferStore>,
    memory: Arc<dyn MemoryStore>,
    state: Mutex<WorkerState>,
    buffer_tx: mpsc::UnboundedSender<(String, BufferPayload)>,
}

/// Per-actor facade. Cheap to clone; all clones share the same worker.
#[derive(Clone)]
pub struct ActorWorker {
    inner: Arc<Inner>,
}

impl ActorWorker {
    pub fn new(
        id: ActorId,
        config: ActorConfig,
        llm: Arc<dyn LlmClient>,
        tools: ToolRegistry,
        buffer: Arc<dyn BufferStore>,
        memory: Arc<dyn MemoryStore>,
    ) -> Self {
        let (buffer_tx, buffer_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            id,
            agent: Agent::new(llm, config.agent),
            config,
            tools,
            buffer: buffer.clone(),
            memory,
            state: Mutex::new(WorkerState {
                status: ActorStatus::Idle,
                queue: VecDeque::new(),
                events: Vec::new(),
                subscribers: Vec::new(),
                next_subscriber_id: 1,
                processing: false,
                cached_state: None,
                resume_requested: false,
                has_reply_in_run: false,
            }),
            buffer_tx,
        });

        // Dedicated writer consuming the buffer channel: writes land in
        // arrival order, and a failed write never blocks the next one.
        tokio::spawn(buffer_writer(id, buffer, buffer_rx));

        // Bridge agent events into the actor stream.
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        inner.agent.events().subscribe(move |event: &AgentEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_agent_event(event);
            }
        });

        Self { inner }
    }

    pub fn id(&self) -> ActorId {
        self.inner.id
    }

    pub fn status(&self) -> ActorStatus {
        self.inner.state.lock().unwrap().status
    }

    pub fn agent(&self) -> &Agent {
        &self.inner.agent
    }

    /// Queue an input batch for processing.
    ///
    /// Appends a buffer record for the user, then either kicks the queue
    /// processor or preempts the active run: the run is aborted, and it will
    /// be resumed with the new inputs unless it has already produced a
    /// structured reply.
    pub fn work(&self, inputs: Vec<Content>) -> Result<()> {
        if inputs.is_empty() {
            return Err(EmaError::Precondition("inputs must not be empty".into()));
        }
        if inputs.iter().any(|c| c.as_text().is_none()) {
            return Err(EmaError::Precondition(
                "only text content is supported".into(),
            ));
        }

        let text = ema_core::types::contents_to_text(&inputs);
        let _ = self.inner.buffer_tx.send((
            self.inner.config.user_name.clone(),
            BufferPayload::User {
                contents: inputs.clone(),
            },
        ));
        self.inner.broadcast_event(ActorEvent::Message(text));

        let (preempt, spawn_processor) = {
            let mut state = self.inner.state.lock().unwrap();
            state.queue.push_back(inputs);
            if state.status == ActorStatus::Running && self.inner.agent.is_running() {
                if !state.has_reply_in_run {
                    state.resume_requested = true;
                }
                (true, false)
            } else if !state.processing {
                state.processing = true;
                (false, true)
            } else {
                (false, false)
            }
        };

        if preempt {
            info!(actor = %self.inner.id.key(), "New input preempts active run");
            self.inner.agent.abort();
        }
        if spawn_processor {
            let inner = self.inner.clone();
            tokio::spawn(async move { process_queue(inner).await });
        }
        Ok(())
    }

    /// Register a subscriber. It immediately receives a snapshot carrying the
    /// current status and all past events, then incremental deltas.
    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let callback: SubscriberCallback = Arc::new(callback);
        let (id, replay) = {
            let mut state = self.inner.state.lock().unwrap();
            let id = state.next_subscriber_id;
            state.next_subscriber_id += 1;
            state.subscribers.push((id, callback.clone()));
            (
                id,
                Snapshot {
                    status: state.status,
                    events: state.events.clone(),
                },
            )
        };
        dispatch(&callback, &replay);
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut state = self.inner.state.lock().unwrap();
        state.subscribers.retain(|(sid, _)| *sid != id);
    }

    /// Search long-term memories, scoped to this actor.
    pub async fn search(&self, keywords: &[String]) -> Result<SearchResult> {
        let items = self
            .inner
            .memory
            .search(self.inner.id.actor_id, keywords)
            .await?;
        Ok(SearchResult { items })
    }

    pub async fn add_short_term_memory(&self, content: impl Into<String>) -> Result<()> {
        self.inner
            .memory
            .add_short_term(ShortTermMemory {
                actor_id: self.inner.id.actor_id,
                content: content.into(),
                time: Utc::now(),
            })
            .await
    }

    pub async fn add_long_term_memory(
        &self,
        keywords: Vec<String>,
        content: impl Into<String>,
    ) -> Result<()> {
        self.inner
            .memory
            .add_long_term(LongTermMemory {
                actor_id: self.inner.id.actor_id,
                keywords,
                content: content.into(),
                time: Utc::now(),
            })
            .await
    }

    /// Actor state storage is not implemented; the signatures are stable.
    pub fn get_state(&self) -> Result<serde_json::Value> {
        Err(EmaError::Unimplemented("actor state storage"))
    }

    pub fn update_state(&self, _state: serde_json::Value) -> Result<()> {
        Err(EmaError::Unimplemented("actor state storage"))
    }
}

impl Inner {
    fn on_agent_event(&self, event: &AgentEvent) {
        if let AgentEvent::EmaReplyReceived { reply } = event {
            self.state.lock().unwrap().has_reply_in_run = true;
            let _ = self.buffer_tx.send((
                self.config.name.clone(),
                BufferPayload::Ema {
                    reply: reply.clone(),
                },
            ));
        }
        self.broadcast_event(ActorEvent::from(event.clone()));
    }

    /// Append an event and broadcast it as a single-event delta.
    fn broadcast_event(&self, event: ActorEvent) {
        let (snapshot, subscribers) = {
            let mut state = self.state.lock().unwrap();
            state.events.push(event.clone());
            (
                Snapshot {
                    status: state.status,
                    events: vec![event],
                },
                snapshot_subscribers(&state),
            )
        };
        for callback in &subscribers {
            dispatch(callback, &snapshot);
        }
    }

    /// Change status and broadcast an event-less snapshot.
    fn set_status(&self, status: ActorStatus) {
        let (snapshot, subscribers) = {
            let mut state = self.state.lock().unwrap();
            state.status = status;
            (
                Snapshot {
                    status,
                    events: Vec::new(),
                },
                snapshot_subscribers(&state),
            )
        };
        debug!(status = ?snapshot.status, "Actor status changed");
        for callback in &subscribers {
            dispatch(callback, &snapshot);
        }
    }

    /// Expand `{MEMORY_BUFFER}` placeholders with the recent buffer tail.
    async fn build_system_prompt(&self) -> String {
        if !self.config.system_prompt.contains(MEMORY_BUFFER_PLACEHOLDER) {
            return self.config.system_prompt.clone();
        }
        let recent = match self
            .buffer
            .recent(self.id, self.config.buffer_inject_count)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!(%e, "Failed to read buffer for prompt injection");
                Vec::new()
            }
        };
        self.config
            .system_prompt
            .replace(MEMORY_BUFFER_PLACEHOLDER, &render_buffer(&recent))
    }
}

fn snapshot_subscribers(state: &WorkerState) -> Vec<SubscriberCallback> {
    state.subscribers.iter().map(|(_, cb)| cb.clone()).collect()
}

fn dispatch(callback: &SubscriberCallback, snapshot: &Snapshot) {
    if catch_unwind(AssertUnwindSafe(|| callback(snapshot))).is_err() {
        error!("Actor subscriber panicked; continuing with remaining subscribers");
    }
}

/// Serial consumer of the input queue. One instance is alive at a time.
async fn process_queue(inner: Arc<Inner>) {
    loop {
        // The idle transition happens in the same critical section as the
        // queue check, so `work` either sees an alive processor or an idle
        // worker; a batch can never fall between the two.
        let batch = {
            let mut state = inner.state.lock().unwrap();
            match state.queue.pop_front() {
                Some(batch) => batch,
                None => {
                    state.processing = false;
                    state.status = ActorStatus::Idle;
                    state.cached_state = None;
                    let snapshot = Snapshot {
                        status: ActorStatus::Idle,
                        events: Vec::new(),
                    };
                    let subscribers = snapshot_subscribers(&state);
                    drop(state);
                    debug!("Actor idle");
                    for callback in &subscribers {
                        dispatch(callback, &snapshot);
                    }
                    return;
                }
            }
        };

        inner.set_status(ActorStatus::Preparing);

        let resume_state = {
            let mut state = inner.state.lock().unwrap();
            if state.resume_requested {
                state.cached_state.take()
            } else {
                None
            }
        };

        let run_state = match resume_state {
            Some(mut cached) => {
                debug!(actor = %inner.id.key(), "Resuming cached state with new inputs");
                cached.messages.push(Message::user(batch));
                cached
            }
            None => {
                let system_prompt = inner.build_system_prompt().await;
                AgentState::new(system_prompt, vec![Message::user(batch)], inner.tools.clone())
            }
        };

        {
            let mut state = inner.state.lock().unwrap();
            state.has_reply_in_run = false;
            state.resume_requested = false;
        }
        inner.set_status(ActorStatus::Running);

        let final_state = inner.agent.run_with_state(run_state).await;

        // Keep the final state around; the next pickup decides between
        // resume and fresh, and the idle transition drops it.
        inner.state.lock().unwrap().cached_state = Some(final_state);
    }
}

async fn buffer_writer(
    id: ActorId,
    buffer: Arc<dyn BufferStore>,
    mut rx: mpsc::UnboundedReceiver<(String, BufferPayload)>,
) {
    while let Some((name, payload)) = rx.recv().await {
        if let Err(e) = buffer.append(id, &name, payload).await {
            error!(actor = %id.key(), %e, "Buffer write failed");
        }
    }
}
