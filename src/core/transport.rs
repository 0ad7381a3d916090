//! Contract between the scheduler and the processing server.

mod http;
mod simulated;
pub mod sse;

use async_trait::async_trait;

use crate::config::ProcessingOptions;

use super::batch::{BatchExport, BatchKey};
use super::models::{JobId, JobPayload, JobResult, Operation, SourceFile, TaskId};
use super::progress::ProgressChannel;

pub use http::HttpTransport;
pub use simulated::SimulatedTransport;

/// Failure talking to the processing server.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server error ({status}): {message}")]
    Status { status: u16, message: String },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("{0}")]
    Rejected(String),
}

/// What the server did with a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Finished within the request.
    Immediate(JobResult),
    /// Queued server-side; progress is available under the task id.
    Accepted(TaskId),
}

/// One job's submission: its payload plus the options resolved by the caller.
/// The payload variant decides the endpoint and the form fields.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub job_id: JobId,
    pub batch_key: BatchKey,
    pub payload: JobPayload,
    pub options: ProcessingOptions,
    /// Scheduler ceiling at launch time, passed through for the server's own
    /// worker pool.
    pub max_concurrent: usize,
}

impl SubmitRequest {
    pub fn endpoint(&self) -> &'static str {
        match &self.payload {
            JobPayload::Single { operation, .. } => match operation {
                Operation::Reconstruct => "/upload",
                Operation::RemoveText => "/remove-text",
                Operation::RemoveTextAi => "/remove-text-ai",
                Operation::ExtractText => "/extract-text",
            },
            JobPayload::Paired { .. } => "/combine-upload",
        }
    }

    /// Text form fields, in submission order.
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        let opts = &self.options;
        let mut fields = vec![
            ("vision_model", opts.vision_model.clone()),
            ("batch_folder", self.batch_key.to_string()),
            ("font_family", opts.font_family.clone()),
            ("refine_layout", opts.refine_layout.to_string()),
            ("output_format", opts.output_format.as_str().to_string()),
            ("max_concurrent", self.max_concurrent.to_string()),
        ];
        if let Some(exclude) = &opts.exclude_text {
            fields.push(("exclude_text", exclude.clone()));
        }

        match &self.payload {
            JobPayload::Single { operation, .. } => match operation {
                Operation::Reconstruct => {
                    fields.push(("inpainting_model", opts.inpainting_model.clone()));
                    fields.push(("codegen_model", opts.codegen_model.clone()));
                }
                Operation::RemoveText => {
                    fields.push(("inpainting_model", opts.inpainting_model.clone()));
                }
                Operation::RemoveTextAi | Operation::ExtractText => {}
            },
            JobPayload::Paired { .. } => {
                fields.push(("codegen_model", opts.codegen_model.clone()));
            }
        }
        fields
    }

    /// File parts keyed by form field name. Consumes the payload.
    pub fn into_file_parts(self) -> Vec<(&'static str, SourceFile)> {
        match self.payload {
            JobPayload::Single { file, .. } => vec![("file", file)],
            JobPayload::Paired { source, background } => {
                vec![("source_file", source), ("background_file", background)]
            }
        }
    }
}

#[async_trait]
pub trait TransportClient: Send + Sync {
    async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, TransportError>;

    async fn open_progress_channel(
        &self,
        task_id: &TaskId,
    ) -> Result<ProgressChannel, TransportError>;

    /// Ask the server to stop a job. Fire-and-forget from the scheduler's view.
    /// `task_id` is the remote id when the server already accepted the job.
    async fn cancel(&self, job_id: &JobId, task_id: Option<&TaskId>)
    -> Result<(), TransportError>;

    async fn request_batch_export(&self, batch: &BatchKey) -> Result<BatchExport, TransportError>;
}
