//! Cron/tick scheduling with cancellable handles and a fire-time stream.
//!
//! Uses `croner` for cron expression parsing and a background tokio task per
//! schedule that sleeps until the next instant.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ema_core::{EmaError, Result};

/// A timed task: fire on a 5-field cron expression or at a fixed tick
/// period. `once` stops the schedule after the first fire.
#[derive(Debug, Clone)]
pub enum TimedTask {
    Cron { expr: String, once: bool },
    Tick { period: Duration, once: bool },
}

impl TimedTask {
    pub fn cron(expr: impl Into<String>) -> Self {
        Self::Cron {
            expr: expr.into(),
            once: false,
        }
    }

    pub fn cron_once(expr: impl Into<String>) -> Self {
        Self::Cron {
            expr: expr.into(),
            once: true,
        }
    }

    pub fn tick(period: Duration) -> Self {
        Self::Tick {
            period,
            once: false,
        }
    }

    pub fn tick_once(period: Duration) -> Self {
        Self::Tick { period, once: true }
    }

    fn once(&self) -> bool {
        match self {
            Self::Cron { once, .. } | Self::Tick { once, .. } => *once,
        }
    }
}

/// Handle to a running schedule. `cancel` is idempotent.
#[derive(Clone)]
pub struct TimedTab {
    cancel: CancellationToken,
}

impl TimedTab {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Schedules timed tasks onto background tokio tasks.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimedTaskScheduler;

impl TimedTaskScheduler {
    pub fn new() -> Self {
        Self
    }

    /// Start a schedule, invoking `callback(fire_time, tab)` at each
    /// scheduled instant until cancelled (or after the first fire for `once`
    /// tasks). Invalid cron expressions are rejected up front.
    pub fn schedule<F>(&self, task: TimedTask, mut callback: F) -> Result<TimedTab>
    where
        F: FnMut(DateTime<Utc>, &TimedTab) + Send + 'static,
    {
        let cron = match &task {
            TimedTask::Cron { expr, .. } => Some(
                Cron::new(expr)
                    .parse()
                    .map_err(|e| EmaError::Scheduler(format!("invalid cron expression: {e}")))?,
            ),
            TimedTask::Tick { .. } => None,
        };

        let tab = TimedTab {
            cancel: CancellationToken::new(),
        };
        let handle = tab.clone();
        tokio::spawn(async move {
            debug!(?task, "Schedule started");
            loop {
                let next = match (&task, &cron) {
                    (TimedTask::Tick { period, .. }, _) => {
                        match chrono::Duration::from_std(*period) {
                            Ok(period) => Utc::now() + period,
                            Err(e) => {
                                warn!(%e, "Tick period out of range, stopping schedule");
                                break;
                            }
                        }
                    }
                    (TimedTask::Cron { .. }, Some(cron)) => {
                        match cron.iter_after(Utc::now()).next() {
                            Some(next) => next,
                            None => {
                                info!("Cron schedule has no further occurrences");
                                break;
                            }
                        }
                    }
                    (TimedTask::Cron { .. }, None) => unreachable!("cron parsed above"),
                };

                let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = handle.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if handle.is_cancelled() {
                    break;
                }

                callback(next, &handle);

                if task.once() {
                    handle.cancel();
                    break;
                }
            }
            debug!("Schedule stopped");
        });
        Ok(tab)
    }

    /// Lazy, possibly-infinite stream of fire times.
    ///
    /// Fires queue up when the consumer is slower than the schedule and are
    /// delivered in order; a waiting consumer is resolved directly by the
    /// next fire. Dropping (or cancelling) the stream cancels the schedule;
    /// calling `iterate` again starts a fresh one.
    pub fn iterate(&self, task: TimedTask) -> Result<TimedStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let tab = self.schedule(task, move |date, _tab| {
            let _ = tx.send(date);
        })?;
        Ok(TimedStream { rx, tab })
    }
}

/// Stream of fire times backing `iterate`.
pub struct TimedStream {
    rx: mpsc::UnboundedReceiver<DateTime<Utc>>,
    tab: TimedTab,
}

impl TimedStream {
    /// Stop the underlying schedule. Queued fires remain consumable; the
    /// stream ends after they drain.
    pub fn cancel(&self) {
        self.tab.cancel();
    }
}

impl Stream for TimedStream {
    type Item = DateTime<Utc>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for TimedStream {
    fn drop(&mut self) {
        self.tab.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn tick_fires_repeatedly_until_cancelled() {
        let scheduler = TimedTaskScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let tab = scheduler
            .schedule(TimedTask::tick(Duration::from_millis(20)), move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(110)).await;
        tab.cancel();
        tab.cancel(); // idempotent
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 3, "expected several fires, got {fired}");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), fired, "no fires after cancel");
        assert!(tab.is_cancelled());
    }

    #[tokio::test]
    async fn once_task_fires_a_single_time() {
        let scheduler = TimedTaskScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let tab = scheduler
            .schedule(
                TimedTask::tick_once(Duration::from_millis(10)),
                move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(tab.is_cancelled(), "once tasks cancel themselves");
    }

    #[tokio::test]
    async fn callback_can_cancel_via_handle() {
        let scheduler = TimedTaskScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        scheduler
            .schedule(TimedTask::tick(Duration::from_millis(10)), move |_, tab| {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 >= 2 {
                    tab.cancel();
                }
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected_up_front() {
        let scheduler = TimedTaskScheduler::new();
        let result = scheduler.schedule(TimedTask::cron("not a cron"), |_, _| {});
        assert!(matches!(result, Err(EmaError::Scheduler(_))));
    }

    #[tokio::test]
    async fn cron_expression_parses() {
        // Every-minute cron; we only verify the schedule starts and can be
        // cancelled without firing.
        let scheduler = TimedTaskScheduler::new();
        let tab = scheduler
            .schedule(TimedTask::cron("* * * * *"), |_, _| {})
            .unwrap();
        tab.cancel();
    }

    #[tokio::test]
    async fn iterator_queues_fires_and_delivers_in_order() {
        let scheduler = TimedTaskScheduler::new();
        let mut stream = scheduler
            .iterate(TimedTask::tick(Duration::from_millis(15)))
            .unwrap();

        // Let several fires queue up before consuming.
        tokio::time::sleep(Duration::from_millis(80)).await;

        let mut consumed = Vec::new();
        for _ in 0..3 {
            let date = stream.next().await.expect("stream yields fire times");
            consumed.push(date);
        }

        // Strictly increasing fire times, delivered in order.
        assert!(consumed.windows(2).all(|w| w[0] < w[1]));

        stream.cancel();
    }

    #[tokio::test]
    async fn dropping_iterator_cancels_schedule_and_restart_works() {
        let scheduler = TimedTaskScheduler::new();
        {
            let _stream = scheduler
                .iterate(TimedTask::tick(Duration::from_millis(10)))
                .unwrap();
            // dropped immediately
        }

        // Restartable: a new iteration creates a fresh schedule.
        let mut stream = scheduler
            .iterate(TimedTask::tick(Duration::from_millis(10)))
            .unwrap();
        assert!(stream.next().await.is_some());
    }
}
