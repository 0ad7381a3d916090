use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tracing::debug;
use uuid::Uuid;

use super::{SubmitOutcome, SubmitRequest, TransportClient, TransportError};
use crate::core::batch::{BatchExport, BatchKey};
use crate::core::models::{JobId, JobPayload, JobResult, Operation, TaskId};
use crate::core::progress::{ChannelEventSource, ProgressChannel};

const STEPS: &[(u8, &str)] = &[
    (10, "[1/4] Analyzing layout"),
    (30, "[2/4] Refining layout"),
    (60, "[3/4] Removing text and restoring background"),
    (80, "[4/4] Generating HTML"),
];

struct SimTask {
    batch: BatchKey,
    label: String,
    streaming: bool,
    cancelled: bool,
}

/// Live tasks only; an entry is dropped when its progress stream ends.
#[derive(Default)]
struct SimState {
    tasks: HashMap<TaskId, SimTask>,
}

type SharedState = Arc<Mutex<SimState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-process stand-in for the processing server. Reconstruct and combine jobs
/// are accepted asynchronously and walk through four progress steps; the other
/// operations answer immediately.
pub struct SimulatedTransport {
    step_delay: Duration,
    state: SharedState,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

impl SimulatedTransport {
    pub fn new(step_delay: Duration) -> Self {
        Self {
            step_delay,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }
}

fn output_path(batch: &BatchKey, label: &str, suffix: &str) -> String {
    let stem = label.rsplit_once('.').map(|(s, _)| s).unwrap_or(label);
    format!("/output/{}/{}{}", batch, stem, suffix)
}

fn immediate(result: JobResult) -> Result<SubmitOutcome, TransportError> {
    Ok(SubmitOutcome::Immediate(result))
}

/// Emit the scripted steps, then the terminal event. Stops early with a
/// `cancelled` event once the task is cancelled, or when the reader is gone.
async fn stream_steps(
    state: &SharedState,
    task_id: &TaskId,
    batch: &BatchKey,
    label: &str,
    delay: Duration,
    tx: mpsc::Sender<String>,
) {
    let is_cancelled = || lock(state).tasks.get(task_id).is_some_and(|t| t.cancelled);

    for (percent, message) in STEPS {
        if is_cancelled() {
            let cancelled = json!({
                "status": "cancelled",
                "message": "Cancelled by user",
                "percent": 0,
            });
            let _ = tx.send(cancelled.to_string()).await;
            return;
        }
        let update = json!({"status": "processing", "message": message, "percent": percent});
        if tx.send(update.to_string()).await.is_err() {
            return;
        }
        sleep(delay).await;
    }

    let data = JobResult {
        html_url: Some(output_path(batch, label, ".html")),
        bg_url: Some(output_path(batch, label, "_bg.png")),
        pptx_url: Some(output_path(batch, label, ".pptx")),
        ..Default::default()
    };
    let done = json!({"status": "complete", "message": "Done", "percent": 100, "data": data});
    let _ = tx.send(done.to_string()).await;
}

#[async_trait]
impl TransportClient for SimulatedTransport {
    async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, TransportError> {
        sleep(self.step_delay / 4).await;

        let label = request.payload.label();
        let batch = request.batch_key.clone();

        match &request.payload {
            JobPayload::Single {
                operation: Operation::RemoveText | Operation::RemoveTextAi,
                ..
            } => immediate(JobResult {
                bg_url: Some(output_path(&batch, &label, "_bg_only.png")),
                ..Default::default()
            }),
            JobPayload::Single {
                operation: Operation::ExtractText,
                ..
            } => immediate(JobResult {
                text: Some(format!("(simulated text of {})", label)),
                ..Default::default()
            }),
            JobPayload::Single {
                operation: Operation::Reconstruct,
                ..
            }
            | JobPayload::Paired { .. } => {
                let task_id = TaskId::new(Uuid::now_v7().to_string());
                let task = SimTask {
                    batch,
                    label,
                    streaming: false,
                    cancelled: false,
                };
                self.state().tasks.insert(task_id.clone(), task);
                Ok(SubmitOutcome::Accepted(task_id))
            }
        }
    }

    async fn open_progress_channel(
        &self,
        task_id: &TaskId,
    ) -> Result<ProgressChannel, TransportError> {
        let (batch, label) = {
            let mut state = self.state();
            let task = state
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| TransportError::Rejected(format!("unknown task {}", task_id)))?;
            task.streaming = true;
            (task.batch.clone(), task.label.clone())
        };

        let (tx, rx) = mpsc::channel(8);
        let state = Arc::clone(&self.state);
        let delay = self.step_delay;
        let task_id = task_id.clone();

        tokio::spawn(async move {
            stream_steps(&state, &task_id, &batch, &label, delay, tx).await;
            lock(&state).tasks.remove(&task_id);
        });

        Ok(ProgressChannel::new(ChannelEventSource::new(rx)))
    }

    async fn cancel(
        &self,
        job_id: &JobId,
        task_id: Option<&TaskId>,
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        let Some(task_id) = task_id.filter(|t| state.tasks.contains_key(*t)) else {
            debug!(job_id = %job_id, "Cancel for a job with no live task");
            return Ok(());
        };
        let streaming = match state.tasks.get_mut(task_id) {
            Some(task) if task.streaming => {
                task.cancelled = true;
                true
            }
            _ => false,
        };
        // A task nobody is streaming yet can simply be forgotten.
        if !streaming {
            state.tasks.remove(task_id);
        }
        Ok(())
    }

    async fn request_batch_export(&self, batch: &BatchKey) -> Result<BatchExport, TransportError> {
        let filename = format!("batch_presentation_{}.pptx", batch);
        Ok(BatchExport {
            download_url: format!("/output/{}/{}", batch, filename),
            filename,
        })
    }
}
