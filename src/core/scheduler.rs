//! Bounded-concurrency job scheduler.
//!
//! All scheduler state lives behind one mutex. Admission, settlement and
//! cancellation each run as a single critical section, so claiming a pending
//! job and bumping the active count can never interleave with another pass.
//! Execution tasks only touch the state through those sections; they never
//! hold the lock across an await.

mod execute;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Local;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProcessingOptions;

use super::batch::{BatchAggregate, BatchExport, BatchKey};
use super::limit::ConcurrencyLimit;
use super::models::{Job, JobId, JobPayload, JobResult, JobStatus, Progress, TaskId};
use super::observer::{SchedulerEvent, SchedulerObserver};
use super::transport::{SubmitRequest, TransportClient, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("scheduler is busy: {pending} pending, {processing} processing")]
    Busy { pending: usize, processing: usize },
    #[error("no batch has been submitted")]
    NoBatch,
    #[error("batch {0} has no finished jobs yet")]
    ExportNotReady(BatchKey),
    #[error("batch export failed: {0}")]
    Export(#[from] TransportError),
}

/// Job counts per status over the whole session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub complete: usize,
    pub error: usize,
    pub cancelled: usize,
    pub total: usize,
}

impl QueueStats {
    /// Jobs in any terminal state.
    pub fn finished(&self) -> usize {
        self.complete + self.error + self.cancelled
    }

    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}

/// How an execution ended.
#[derive(Debug)]
pub(crate) enum Outcome {
    Complete { result: JobResult, progress: Progress },
    Failed(String),
    Cancelled,
}

struct JobEntry {
    job: Job,
    /// Present while pending; moved into the submit request at launch.
    payload: Option<JobPayload>,
    options: ProcessingOptions,
    /// Present while processing.
    cancel: Option<CancellationToken>,
}

#[derive(Default)]
struct SchedulerState {
    jobs: Vec<JobEntry>,
    index: HashMap<JobId, usize>,
    /// Jobs before this position are never pending again.
    pending_cursor: usize,
    active: usize,
    paused: bool,
    latest_batch: Option<BatchKey>,
}

impl SchedulerState {
    fn entry_mut(&mut self, id: &JobId) -> Option<&mut JobEntry> {
        let idx = *self.index.get(id)?;
        self.jobs.get_mut(idx)
    }

    /// Earliest-submitted pending job.
    fn next_pending(&mut self) -> Option<usize> {
        while let Some(entry) = self.jobs.get(self.pending_cursor) {
            if entry.job.status == JobStatus::Pending {
                return Some(self.pending_cursor);
            }
            self.pending_cursor += 1;
        }
        None
    }

    fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total: self.jobs.len(),
            ..Default::default()
        };
        for entry in &self.jobs {
            match entry.job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Complete => stats.complete += 1,
                JobStatus::Error => stats.error += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    fn aggregate(&self, key: &BatchKey) -> BatchAggregate {
        BatchAggregate::compute(key, self.jobs.iter().map(|e| &e.job))
    }
}

struct Inner {
    state: Mutex<SchedulerState>,
    transport: Arc<dyn TransportClient>,
    limit: ConcurrencyLimit,
    job_timeout: Option<Duration>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    idle: Notify,
    runtime: Handle,
}

/// Owns the session's jobs and runs at most `limit` of them at once.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler bound to the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(
        transport: Arc<dyn TransportClient>,
        limit: ConcurrencyLimit,
        observer: Arc<dyn SchedulerObserver>,
        job_timeout: Option<Duration>,
    ) -> Self {
        let runtime = Handle::current();
        let (events, mut rx) = mpsc::unbounded_channel::<SchedulerEvent>();

        runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                event.dispatch(observer.as_ref());
            }
        });

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState::default()),
                transport,
                limit,
                job_timeout,
                events,
                idle: Notify::new(),
                runtime,
            }),
        }
    }

    /// Queue one job. A single file goes to the shared `single` batch; a
    /// paired job gets its own `combine_` batch.
    pub fn submit(&self, payload: JobPayload, options: ProcessingOptions) -> Job {
        let key = BatchKey::derive(payload.kind(), 1, Local::now());
        let mut jobs = self.inner.enqueue(key, vec![payload], options);
        // enqueue returns one job per payload
        jobs.remove(0)
    }

    /// Queue a set of jobs under one freshly derived batch key, which becomes
    /// the latest batch. The key follows the kind of the first payload. An
    /// empty set creates nothing.
    pub fn submit_batch(&self, payloads: Vec<JobPayload>, options: ProcessingOptions) -> Vec<Job> {
        let Some(first) = payloads.first() else {
            return Vec::new();
        };
        let key = BatchKey::derive(first.kind(), payloads.len(), Local::now());
        self.inner.enqueue(key, payloads, options)
    }

    /// Stop admitting new jobs. Running jobs are left alone.
    pub fn pause(&self) {
        let mut state = self.inner.lock();
        if !state.paused {
            state.paused = true;
            self.inner.emit(SchedulerEvent::PausedChanged(true));
        }
    }

    pub fn resume(&self) {
        let mut state = self.inner.lock();
        if state.paused {
            state.paused = false;
            self.inner.emit(SchedulerEvent::PausedChanged(false));
        }
        self.inner.admit(&mut state);
    }

    /// Cancel every pending and processing job. Returns how many were
    /// cancelled.
    pub fn stop(&self) -> usize {
        let mut state = self.inner.lock();
        let ids: Vec<JobId> = state
            .jobs
            .iter()
            .filter(|e| !e.job.is_terminal())
            .map(|e| e.job.id.clone())
            .collect();

        let mut touched = Vec::new();
        for id in &ids {
            if let Some(key) = self.inner.cancel_locked(&mut state, id) {
                if !touched.contains(&key) {
                    touched.push(key);
                }
            }
        }
        for key in &touched {
            self.inner.emit_aggregate(&state, key);
        }
        self.inner.notify_if_idle(&state);
        debug!(cancelled = ids.len(), "Queue stopped");
        ids.len()
    }

    /// Cancel one job. Terminal jobs are left as they are; their status is
    /// returned unchanged.
    pub fn cancel_job(&self, id: &JobId) -> Result<JobStatus, SchedulerError> {
        let mut state = self.inner.lock();
        let status = state
            .entry_mut(id)
            .map(|e| e.job.status)
            .ok_or_else(|| SchedulerError::JobNotFound(id.clone()))?;
        if status.is_terminal() {
            return Ok(status);
        }

        if let Some(key) = self.inner.cancel_locked(&mut state, id) {
            self.inner.emit_aggregate(&state, &key);
        }
        self.inner.admit(&mut state);
        self.inner.notify_if_idle(&state);
        Ok(JobStatus::Cancelled)
    }

    /// Change the ceiling and run an admission pass. Lowering it never
    /// preempts running jobs. Returns the previous value.
    pub fn set_concurrency_limit(&self, max: usize) -> usize {
        let previous = self.inner.limit.set(max);
        let mut state = self.inner.lock();
        self.inner.admit(&mut state);
        previous
    }

    pub fn concurrency_limit(&self) -> &ConcurrencyLimit {
        &self.inner.limit
    }

    /// Snapshot of every job in submission order.
    pub fn jobs(&self) -> Vec<Job> {
        self.inner.lock().jobs.iter().map(|e| e.job.clone()).collect()
    }

    pub fn job(&self, id: &JobId) -> Option<Job> {
        self.inner.lock().entry_mut(id).map(|e| e.job.clone())
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.lock().stats()
    }

    pub fn latest_batch(&self) -> Option<BatchKey> {
        self.inner.lock().latest_batch.clone()
    }

    pub fn latest_batch_aggregate(&self) -> Option<BatchAggregate> {
        let state = self.inner.lock();
        let key = state.latest_batch.as_ref()?;
        Some(state.aggregate(key))
    }

    /// Counts for any batch, latest or not.
    pub fn aggregate_for(&self, key: &BatchKey) -> BatchAggregate {
        self.inner.lock().aggregate(key)
    }

    /// True once any job of the latest batch reached a terminal state.
    pub fn export_ready(&self) -> bool {
        self.latest_batch_aggregate()
            .is_some_and(|agg| agg.export_ready())
    }

    /// Ask the server to build the latest batch's combined artifact.
    pub async fn export_latest_batch(&self) -> Result<BatchExport, SchedulerError> {
        let aggregate = self
            .latest_batch_aggregate()
            .ok_or(SchedulerError::NoBatch)?;
        if !aggregate.export_ready() {
            return Err(SchedulerError::ExportNotReady(aggregate.key));
        }
        debug!(
            batch = %aggregate.key,
            completed = aggregate.completed,
            total = aggregate.total,
            "Requesting batch export"
        );
        Ok(self.inner.transport.request_batch_export(&aggregate.key).await?)
    }

    /// Resolve once nothing is pending or processing. While paused with
    /// pending jobs this waits until `resume` or `stop`.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let idle = self.inner.lock().stats().is_idle();
            if idle {
                return;
            }
            notified.await;
        }
    }

    /// Forget every job and the latest batch pointer. Refused while work is
    /// still pending or processing.
    pub fn reset(&self) -> Result<(), SchedulerError> {
        let mut state = self.inner.lock();
        let stats = state.stats();
        if !stats.is_idle() {
            return Err(SchedulerError::Busy {
                pending: stats.pending,
                processing: stats.processing,
            });
        }
        let paused = state.paused;
        *state = SchedulerState {
            paused,
            ..Default::default()
        };
        debug!(cleared = stats.total, "Session reset");
        Ok(())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SchedulerEvent) {
        // Only fails once the dispatcher is gone, i.e. during shutdown.
        let _ = self.events.send(event);
    }

    fn emit_aggregate(&self, state: &SchedulerState, key: &BatchKey) {
        let agg = state.aggregate(key);
        self.emit(SchedulerEvent::BatchAggregateChanged {
            key: agg.key,
            completed: agg.completed,
            total: agg.total,
        });
    }

    fn notify_if_idle(&self, state: &SchedulerState) {
        if state.active == 0 && state.stats().pending == 0 {
            self.idle.notify_waiters();
        }
    }

    fn enqueue(
        self: &Arc<Self>,
        key: BatchKey,
        payloads: Vec<JobPayload>,
        options: ProcessingOptions,
    ) -> Vec<Job> {
        let mut state = self.lock();
        let mut positions = Vec::with_capacity(payloads.len());

        for payload in payloads {
            let job = Job::new(&payload, key.clone());
            let idx = state.jobs.len();
            state.index.insert(job.id.clone(), idx);
            self.emit(SchedulerEvent::JobCreated(job.clone()));
            state.jobs.push(JobEntry {
                job,
                payload: Some(payload),
                options: options.clone(),
                cancel: None,
            });
            positions.push(idx);
        }

        state.latest_batch = Some(key.clone());
        self.emit_aggregate(&state, &key);
        self.admit(&mut state);

        positions
            .into_iter()
            .map(|idx| state.jobs[idx].job.clone())
            .collect()
    }

    /// Launch pending jobs in submission order until the ceiling is reached.
    /// The ceiling is re-read on every pass.
    fn admit(self: &Arc<Self>, state: &mut SchedulerState) {
        if state.paused {
            return;
        }

        while self.limit.available(state.active) > 0 {
            let Some(idx) = state.next_pending() else {
                break;
            };
            let entry = &mut state.jobs[idx];
            let Some(payload) = entry.payload.take() else {
                warn!(job_id = %entry.job.id, "Dropping pending job without a payload");
                if let Ok(previous) = entry.job.transition(JobStatus::Cancelled) {
                    let job = entry.job.clone();
                    let key = job.batch_key.clone();
                    self.emit(SchedulerEvent::JobStateChanged { job, previous });
                    self.emit_aggregate(state, &key);
                }
                continue;
            };
            let previous = match entry.job.transition(JobStatus::Processing) {
                Ok(previous) => previous,
                Err(e) => {
                    warn!(job_id = %entry.job.id, error = %e, "Skipping job at admission");
                    entry.payload = Some(payload);
                    break;
                }
            };
            let token = CancellationToken::new();
            entry.cancel = Some(token.clone());
            entry.job.progress = Progress::new(0, "Submitting");

            let request = SubmitRequest {
                job_id: entry.job.id.clone(),
                batch_key: entry.job.batch_key.clone(),
                payload,
                options: entry.options.clone(),
                max_concurrent: self.limit.get(),
            };
            self.emit(SchedulerEvent::JobStateChanged {
                job: entry.job.clone(),
                previous,
            });
            state.active += 1;

            debug!(job_id = %request.job_id, active = state.active, "Admitted job");
            self.runtime
                .spawn(execute::run(Arc::clone(self), request, token));
        }
    }

    /// Cancel one non-terminal job inside the critical section. Returns the
    /// job's batch key when it changed state.
    fn cancel_locked(&self, state: &mut SchedulerState, id: &JobId) -> Option<BatchKey> {
        let entry = state.entry_mut(id)?;
        let previous = entry.job.transition(JobStatus::Cancelled).ok()?;

        entry.payload = None;
        entry.job.progress.message = "Cancelled".to_string();
        let key = entry.job.batch_key.clone();
        let remote = entry.job.remote_task_id.clone();
        let token = entry.cancel.take();
        self.emit(SchedulerEvent::JobStateChanged {
            job: entry.job.clone(),
            previous,
        });

        if previous == JobStatus::Processing {
            if let Some(token) = token {
                token.cancel();
            }
            state.active -= 1;
            self.cancel_remote(id.clone(), remote);
        }
        Some(key)
    }

    /// Fire-and-forget cancel request. Failures are logged only; the job is
    /// already cancelled locally.
    fn cancel_remote(&self, job_id: JobId, task_id: Option<TaskId>) {
        let transport = Arc::clone(&self.transport);
        self.runtime.spawn(async move {
            if let Err(e) = transport.cancel(&job_id, task_id.as_ref()).await {
                warn!(job_id = %job_id, error = %e, "Cancel request failed");
            }
        });
    }

    /// Record the remote task id of an accepted job. False when the job is no
    /// longer processing.
    fn record_task_id(&self, id: &JobId, task_id: &TaskId) -> bool {
        let mut state = self.lock();
        match state.entry_mut(id) {
            Some(entry) if entry.job.status == JobStatus::Processing => {
                entry.job.remote_task_id = Some(task_id.clone());
                true
            }
            _ => false,
        }
    }

    fn record_progress(&self, id: &JobId, progress: Progress) {
        let mut state = self.lock();
        if let Some(entry) = state.entry_mut(id) {
            if entry.job.status == JobStatus::Processing {
                entry.job.progress = progress;
                self.emit(SchedulerEvent::JobProgress(entry.job.clone()));
            }
        }
    }

    /// Apply an execution outcome. Only a processing job settles; anything
    /// arriving after the job went terminal (e.g. cancelled locally) is
    /// dropped. Each settlement frees exactly one slot.
    fn settle(self: &Arc<Self>, id: &JobId, outcome: Outcome) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.entry_mut(id) else {
            return false;
        };
        if entry.job.status != JobStatus::Processing {
            debug!(job_id = %id, status = %entry.job.status, "Ignoring late outcome");
            return false;
        }

        let next = match &outcome {
            Outcome::Complete { .. } => JobStatus::Complete,
            Outcome::Failed(_) => JobStatus::Error,
            Outcome::Cancelled => JobStatus::Cancelled,
        };
        let previous = match entry.job.transition(next) {
            Ok(previous) => previous,
            Err(e) => {
                warn!(job_id = %id, error = %e, "Rejected settlement");
                return false;
            }
        };

        match outcome {
            Outcome::Complete { result, progress } => {
                entry.job.progress = progress;
                entry.job.result = Some(result);
            }
            Outcome::Failed(message) => {
                entry.job.progress.message = message.clone();
                entry.job.error = Some(message);
            }
            Outcome::Cancelled => {
                entry.job.progress.message = "Cancelled".to_string();
            }
        }
        entry.cancel = None;
        let key = entry.job.batch_key.clone();
        self.emit(SchedulerEvent::JobStateChanged {
            job: entry.job.clone(),
            previous,
        });

        state.active -= 1;
        self.emit_aggregate(&state, &key);
        self.admit(&mut state);
        self.notify_if_idle(&state);
        true
    }

    /// Force a job that overran the timeout to `error` and ask the server to
    /// drop it.
    fn expire(self: &Arc<Self>, id: &JobId, after: Duration) {
        let remote = {
            let mut state = self.lock();
            state
                .entry_mut(id)
                .and_then(|e| e.job.remote_task_id.clone())
        };
        let message = format!("timed out after {:?}", after);
        if self.settle(id, Outcome::Failed(message)) {
            self.cancel_remote(id.clone(), remote);
        }
    }
}
