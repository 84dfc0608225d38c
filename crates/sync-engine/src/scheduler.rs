//! Periodic task scheduling
//!
//! The connectivity probe runs on whatever [`Scheduler`] the engine was built
//! with. Production uses [`TokioScheduler`]; tests use [`ManualScheduler`] and
//! decide exactly when each period elapses.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A repeatable unit of work
pub type Task = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs tasks at a fixed interval
pub trait Scheduler: Send + Sync {
    /// Run `task` every `interval`, first after one full interval
    fn schedule(&self, interval: Duration, task: Task) -> ScheduledTask;
}

/// Handle to a scheduled task; dropping it cancels the task
#[must_use = "the task is cancelled when the handle is dropped"]
pub struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
    abort: Option<tokio::task::AbortHandle>,
}

impl ScheduledTask {
    fn new(cancelled: Arc<AtomicBool>, abort: Option<tokio::task::AbortHandle>) -> Self {
        Self { cancelled, abort }
    }

    /// Stop the task
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    /// Whether the task has been stopped
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Scheduler backed by tokio intervals
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, interval: Duration, task: Task) -> ScheduledTask {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                task().await;
            }
        });

        ScheduledTask::new(cancelled, Some(handle.abort_handle()))
    }
}

struct ManualEntry {
    interval: Duration,
    task: Task,
    cancelled: Arc<AtomicBool>,
}

/// Scheduler that only runs tasks when told to
#[derive(Clone, Default)]
pub struct ManualScheduler {
    entries: Arc<Mutex<Vec<ManualEntry>>>,
}

impl ManualScheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every live task once, in registration order
    pub async fn tick(&self) {
        let tasks: Vec<Task> = {
            let mut entries = self.entries.lock();
            entries.retain(|entry| !entry.cancelled.load(Ordering::SeqCst));
            entries.iter().map(|entry| entry.task.clone()).collect()
        };
        for task in tasks {
            task().await;
        }
    }

    /// Number of live tasks
    pub fn task_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| !entry.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Intervals of the live tasks
    pub fn intervals(&self) -> Vec<Duration> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| !entry.cancelled.load(Ordering::SeqCst))
            .map(|entry| entry.interval)
            .collect()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, interval: Duration, task: Task) -> ScheduledTask {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.entries.lock().push(ManualEntry { interval, task, cancelled: cancelled.clone() });
        ScheduledTask::new(cancelled, None)
    }
}
