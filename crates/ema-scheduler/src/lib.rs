//! Timed task dispatch and agent-task binding.
//!
//! [`timed::TimedTaskScheduler`] fires callbacks on cron or tick schedules
//! and exposes a lazy stream of fire times. [`agent_task::AgentTaskScheduler`]
//! binds work to agents and offers idle-waiting.

pub mod agent_task;
pub mod timed;

pub use agent_task::{AgentTask, AgentTaskScheduler};
pub use timed::{TimedStream, TimedTab, TimedTask, TimedTaskScheduler};
