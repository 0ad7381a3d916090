//! One admitted job, from submission to its outcome.

use std::sync::Arc;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Inner, Outcome};
use crate::core::models::Progress;
use crate::core::progress::{ProgressError, ProgressStatus};
use crate::core::transport::{SubmitOutcome, SubmitRequest};

/// Run a job until it settles, is cancelled locally, or times out.
///
/// A local cancel has already settled the job; dropping the in-flight work
/// here also closes its progress channel.
pub(super) async fn run(inner: Arc<Inner>, request: SubmitRequest, token: CancellationToken) {
    let job_id = request.job_id.clone();
    let job_timeout = inner.job_timeout;
    let work = drive(&inner, request);

    let timed = async move {
        match job_timeout {
            Some(limit) => time::timeout(limit, work).await.map_err(|_| limit),
            None => Ok(work.await),
        }
    };

    tokio::select! {
        biased;
        _ = token.cancelled() => {
            debug!(job_id = %job_id, "Execution dropped after cancel");
        }
        result = timed => match result {
            Ok(outcome) => {
                inner.settle(&job_id, outcome);
            }
            Err(limit) => inner.expire(&job_id, limit),
        },
    }
}

async fn drive(inner: &Inner, request: SubmitRequest) -> Outcome {
    let job_id = request.job_id.clone();

    let task_id = match inner.transport.submit(request).await {
        Ok(SubmitOutcome::Immediate(result)) => {
            return Outcome::Complete {
                result,
                progress: Progress::new(100, "Complete"),
            };
        }
        Ok(SubmitOutcome::Accepted(task_id)) => task_id,
        Err(e) => return Outcome::Failed(e.to_string()),
    };

    if !inner.record_task_id(&job_id, &task_id) {
        // Settled while the submission was in flight; nothing left to track.
        return Outcome::Cancelled;
    }
    debug!(job_id = %job_id, task_id = %task_id, "Job accepted, following progress");

    let mut channel = match inner.transport.open_progress_channel(&task_id).await {
        Ok(channel) => channel,
        Err(e) => return Outcome::Failed(ProgressError::Transport(e).to_string()),
    };

    while let Some(update) = channel.next().await {
        let event = match update {
            Ok(event) => event,
            Err(e) => return Outcome::Failed(e.to_string()),
        };
        let progress = event.progress();
        match event.status {
            ProgressStatus::Processing => inner.record_progress(&job_id, progress),
            ProgressStatus::Complete(result) => return Outcome::Complete { result, progress },
            ProgressStatus::Error if event.message.is_empty() => {
                return Outcome::Failed("processing failed on the server".to_string());
            }
            ProgressStatus::Error => return Outcome::Failed(event.message),
            ProgressStatus::Cancelled => return Outcome::Cancelled,
        }
    }

    Outcome::Failed(ProgressError::Disconnected.to_string())
}
