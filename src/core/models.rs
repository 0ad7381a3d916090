use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::batch::BatchKey;

/// Opaque job identifier, generated at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(format!("job-{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier handed back by the processing server when it accepts a job
/// asynchronously.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a job.
///
/// `Pending → Processing → {Complete | Error | Cancelled}`, plus
/// `Pending → Cancelled` for jobs dropped before they started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Complete,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Error | JobStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Processing) => true,
            (JobStatus::Pending, JobStatus::Cancelled) => true,
            (JobStatus::Processing, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state-machine move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid job transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Submission shape of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    SingleFile,
    PairedFile,
}

/// Server-side operation applied to a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Full slide reconstruction (layout analysis, background repair, codegen).
    #[default]
    Reconstruct,
    RemoveText,
    RemoveTextAi,
    ExtractText,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Reconstruct => "reconstruct",
            Operation::RemoveText => "remove-text",
            Operation::RemoveTextAi => "remove-text-ai",
            Operation::ExtractText => "extract-text",
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reconstruct" => Ok(Operation::Reconstruct),
            "remove-text" => Ok(Operation::RemoveText),
            "remove-text-ai" => Ok(Operation::RemoveTextAi),
            "extract-text" => Ok(Operation::ExtractText),
            other => Err(format!("unknown operation: {}", other)),
        }
    }
}

/// An input file held in memory until the job is submitted.
#[derive(Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub file_name: String,
    pub data: Vec<u8>,
}

impl fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceFile")
            .field("file_name", &self.file_name)
            .field("len", &self.data.len())
            .finish()
    }
}

impl SourceFile {
    pub fn new(file_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            data,
        }
    }

    /// Read a file from disk, keeping only its final path component as the name.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { file_name, data })
    }

    /// MIME type guessed from the file extension.
    pub fn mime_type(&self) -> &'static str {
        let ext = Path::new(&self.file_name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "webp" => "image/webp",
            "gif" => "image/gif",
            "bmp" => "image/bmp",
            _ => "application/octet-stream",
        }
    }

    pub fn is_image(&self) -> bool {
        self.mime_type().starts_with("image/")
    }
}

/// The input file(s) of one job, one variant per submission shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPayload {
    Single {
        operation: Operation,
        file: SourceFile,
    },
    /// "Combine": text layout from `source`, rendered over `background`.
    Paired {
        source: SourceFile,
        background: SourceFile,
    },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Single { .. } => JobKind::SingleFile,
            JobPayload::Paired { .. } => JobKind::PairedFile,
        }
    }

    /// Human-readable label shown next to the job.
    pub fn label(&self) -> String {
        match self {
            JobPayload::Single { file, .. } => file.file_name.clone(),
            JobPayload::Paired { source, .. } => format!("[combine] {}", source.file_name),
        }
    }
}

/// Last known progress of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub percent: u8,
    pub message: String,
}

impl Progress {
    pub fn new(percent: u8, message: impl Into<String>) -> Self {
        Self {
            percent: percent.min(100),
            message: message.into(),
        }
    }
}

/// Result returned by the processing server. Opaque to the scheduler; the
/// well-known fields are exposed for callers that render them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bg_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pptx_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Snapshot of one job as seen by callers and observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub kind: JobKind,
    pub label: String,
    pub batch_key: BatchKey,
    pub progress: Progress,
    pub remote_task_id: Option<TaskId>,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(payload: &JobPayload, batch_key: BatchKey) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            status: JobStatus::Pending,
            kind: payload.kind(),
            label: payload.label(),
            batch_key,
            progress: Progress::new(0, "Queued"),
            remote_task_id: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, returning the previous status.
    pub fn transition(&mut self, next: JobStatus) -> Result<JobStatus, InvalidTransition> {
        let from = self.status;
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(from)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(name: &str) -> JobPayload {
        JobPayload::Single {
            operation: Operation::Reconstruct,
            file: SourceFile::new(name, vec![1, 2, 3]),
        }
    }

    #[test]
    fn terminal_states_never_move() {
        for terminal in [JobStatus::Complete, JobStatus::Error, JobStatus::Cancelled] {
            for next in [
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::Complete,
                JobStatus::Error,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn pending_cannot_skip_to_complete() {
        let mut job = Job::new(&single("a.png"), BatchKey::single());
        let err = job.transition(JobStatus::Complete).unwrap_err();
        assert_eq!(err.from, JobStatus::Pending);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn pending_job_can_be_cancelled_directly() {
        let mut job = Job::new(&single("a.png"), BatchKey::single());
        assert_eq!(job.transition(JobStatus::Cancelled), Ok(JobStatus::Pending));
        assert!(job.is_terminal());
        assert!(job.transition(JobStatus::Processing).is_err());
    }

    #[test]
    fn processing_settles_once() {
        let mut job = Job::new(&single("a.png"), BatchKey::single());
        job.transition(JobStatus::Processing).unwrap();
        assert_eq!(job.transition(JobStatus::Error), Ok(JobStatus::Processing));
        assert!(job.transition(JobStatus::Complete).is_err());
        assert_eq!(job.status, JobStatus::Error);
    }

    #[test]
    fn payload_kind_and_label() {
        let paired = JobPayload::Paired {
            source: SourceFile::new("slide1.png", vec![]),
            background: SourceFile::new("slide1_bg.png", vec![]),
        };
        assert_eq!(paired.kind(), JobKind::PairedFile);
        assert_eq!(paired.label(), "[combine] slide1.png");
        assert_eq!(single("x.jpg").kind(), JobKind::SingleFile);
    }

    #[test]
    fn mime_type_from_extension() {
        assert_eq!(SourceFile::new("a.PNG", vec![]).mime_type(), "image/png");
        assert_eq!(SourceFile::new("a.jpeg", vec![]).mime_type(), "image/jpeg");
        assert!(!SourceFile::new("notes.txt", vec![]).is_image());
    }

    #[test]
    fn job_result_keeps_unknown_fields() {
        let json = r#"{"html_url":"/output/single/a.html","layout_url":"/x.json"}"#;
        let result: JobResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.html_url.as_deref(), Some("/output/single/a.html"));
        assert!(result.extra.contains_key("layout_url"));
    }

    #[test]
    fn progress_percent_is_clamped() {
        assert_eq!(Progress::new(250, "x").percent, 100);
    }
}
