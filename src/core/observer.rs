//! Scheduler events and the observers that consume them.
//!
//! The scheduler never renders anything itself. It queues a `SchedulerEvent`
//! for every state change, in the order the changes happened, and a dispatcher
//! task hands them to one `SchedulerObserver`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::batch::BatchKey;
use super::models::{Job, JobId, JobStatus};
use crate::logging::LogThrottle;

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    JobCreated(Job),
    JobStateChanged { job: Job, previous: JobStatus },
    /// Non-terminal progress update for a processing job.
    JobProgress(Job),
    BatchAggregateChanged {
        key: BatchKey,
        completed: usize,
        total: usize,
    },
    PausedChanged(bool),
}

impl SchedulerEvent {
    /// Invoke the observer method matching this event.
    pub fn dispatch(&self, observer: &dyn SchedulerObserver) {
        match self {
            SchedulerEvent::JobCreated(job) => observer.on_job_created(job),
            SchedulerEvent::JobStateChanged { job, previous } => {
                observer.on_job_state_changed(job, *previous)
            }
            SchedulerEvent::JobProgress(job) => observer.on_job_progress(job),
            SchedulerEvent::BatchAggregateChanged {
                key,
                completed,
                total,
            } => observer.on_batch_aggregate_changed(key, *completed, *total),
            SchedulerEvent::PausedChanged(paused) => observer.on_paused_changed(*paused),
        }
    }
}

/// Receives scheduler state changes. Every method defaults to a no-op.
///
/// Methods run on the dispatcher task, outside the scheduler's lock, so an
/// observer may call back into the scheduler. They should not block.
pub trait SchedulerObserver: Send + Sync {
    fn on_job_created(&self, _job: &Job) {}

    fn on_job_state_changed(&self, _job: &Job, _previous: JobStatus) {}

    fn on_job_progress(&self, _job: &Job) {}

    fn on_batch_aggregate_changed(&self, _key: &BatchKey, _completed: usize, _total: usize) {}

    fn on_paused_changed(&self, _paused: bool) {}
}

pub struct NoopObserver;

impl SchedulerObserver for NoopObserver {}

/// Logs every event through `tracing`. Progress lines are throttled per job.
pub struct TracingObserver {
    progress_interval: Duration,
    throttles: Mutex<HashMap<JobId, LogThrottle>>,
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl TracingObserver {
    pub fn new(progress_interval: Duration) -> Self {
        Self {
            progress_interval,
            throttles: Mutex::new(HashMap::new()),
        }
    }
}

impl SchedulerObserver for TracingObserver {
    fn on_job_created(&self, job: &Job) {
        debug!(job_id = %job.id, label = %job.label, batch = %job.batch_key, "Job queued");
    }

    fn on_job_state_changed(&self, job: &Job, previous: JobStatus) {
        match job.status {
            JobStatus::Processing => {
                info!(job_id = %job.id, label = %job.label, "Job started")
            }
            JobStatus::Complete => {
                info!(job_id = %job.id, label = %job.label, "Job complete")
            }
            JobStatus::Error => warn!(
                job_id = %job.id,
                label = %job.label,
                error = job.error.as_deref().unwrap_or("unknown error"),
                "Job failed"
            ),
            JobStatus::Cancelled => {
                info!(job_id = %job.id, label = %job.label, from = %previous, "Job cancelled")
            }
            JobStatus::Pending => {}
        }

        if job.is_terminal() {
            if let Ok(mut throttles) = self.throttles.lock() {
                throttles.remove(&job.id);
            }
        }
    }

    fn on_job_progress(&self, job: &Job) {
        let Ok(mut throttles) = self.throttles.lock() else {
            return;
        };
        let throttle = throttles
            .entry(job.id.clone())
            .or_insert_with(|| LogThrottle::new(self.progress_interval));
        if throttle.should_log() {
            debug!(
                job_id = %job.id,
                percent = job.progress.percent,
                message = %job.progress.message,
                "Job progress"
            );
        }
    }

    fn on_batch_aggregate_changed(&self, key: &BatchKey, completed: usize, total: usize) {
        debug!(batch = %key, completed, total, "Batch progress");
    }

    fn on_paused_changed(&self, paused: bool) {
        if paused {
            info!("Queue paused");
        } else {
            info!("Queue resumed");
        }
    }
}

/// Forwards every event into an mpsc channel. Events are dropped once the
/// receiver is gone.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SchedulerEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SchedulerEvent) {
        let _ = self.tx.send(event);
    }
}

impl SchedulerObserver for ChannelObserver {
    fn on_job_created(&self, job: &Job) {
        self.forward(SchedulerEvent::JobCreated(job.clone()));
    }

    fn on_job_state_changed(&self, job: &Job, previous: JobStatus) {
        self.forward(SchedulerEvent::JobStateChanged {
            job: job.clone(),
            previous,
        });
    }

    fn on_job_progress(&self, job: &Job) {
        self.forward(SchedulerEvent::JobProgress(job.clone()));
    }

    fn on_batch_aggregate_changed(&self, key: &BatchKey, completed: usize, total: usize) {
        self.forward(SchedulerEvent::BatchAggregateChanged {
            key: key.clone(),
            completed,
            total,
        });
    }

    fn on_paused_changed(&self, paused: bool) {
        self.forward(SchedulerEvent::PausedChanged(paused));
    }
}

/// Delivers each event to several observers, in registration order.
#[derive(Default)]
pub struct Fanout {
    observers: Vec<Arc<dyn SchedulerObserver>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn SchedulerObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl SchedulerObserver for Fanout {
    fn on_job_created(&self, job: &Job) {
        self.observers.iter().for_each(|o| o.on_job_created(job));
    }

    fn on_job_state_changed(&self, job: &Job, previous: JobStatus) {
        self.observers
            .iter()
            .for_each(|o| o.on_job_state_changed(job, previous));
    }

    fn on_job_progress(&self, job: &Job) {
        self.observers.iter().for_each(|o| o.on_job_progress(job));
    }

    fn on_batch_aggregate_changed(&self, key: &BatchKey, completed: usize, total: usize) {
        self.observers
            .iter()
            .for_each(|o| o.on_batch_aggregate_changed(key, completed, total));
    }

    fn on_paused_changed(&self, paused: bool) {
        self.observers.iter().for_each(|o| o.on_paused_changed(paused));
    }
}
