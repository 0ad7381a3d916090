#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use slideq::config::ProcessingOptions;
use slideq::core::observer::NoopObserver;
use slideq::core::progress::{ChannelEventSource, ProgressChannel};
use slideq::core::transport::{SubmitOutcome, SubmitRequest};
use slideq::core::{
    BatchExport, BatchKey, ConcurrencyLimit, JobId, JobPayload, JobResult, Operation,
    Scheduler, SchedulerObserver, SourceFile, TaskId, TransportClient, TransportError,
};
use tokio::sync::mpsc;

#[derive(Default)]
struct Script {
    /// Labels in the order the transport saw them.
    submitted: Vec<String>,
    streams: HashMap<String, mpsc::Sender<String>>,
    receivers: HashMap<TaskId, mpsc::Receiver<String>>,
    cancels: Vec<(JobId, Option<TaskId>)>,
    rejected: HashSet<String>,
    immediate: HashSet<String>,
    exports: Vec<BatchKey>,
}

/// Transport driven by the test: every accepted job gets a progress stream
/// the test feeds by label.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Submissions for `label` fail with a rejection.
    pub fn reject(&self, label: &str) {
        self.script.lock().unwrap().rejected.insert(label.to_string());
    }

    /// Submissions for `label` finish within the request.
    pub fn respond_immediately(&self, label: &str) {
        self.script.lock().unwrap().immediate.insert(label.to_string());
    }

    pub fn submitted(&self) -> Vec<String> {
        self.script.lock().unwrap().submitted.clone()
    }

    pub fn cancels(&self) -> Vec<(JobId, Option<TaskId>)> {
        self.script.lock().unwrap().cancels.clone()
    }

    pub fn exports(&self) -> Vec<BatchKey> {
        self.script.lock().unwrap().exports.clone()
    }

    /// Push a raw progress payload to the job labelled `label`, waiting for
    /// its submission if it has not reached the transport yet. Dropped when
    /// the scheduler already closed the channel.
    pub async fn send(&self, label: &str, payload: &str) {
        let stream = || self.script.lock().unwrap().streams.get(label).cloned();
        until(&format!("stream for {}", label), || stream().is_some()).await;
        if let Some(tx) = stream() {
            let _ = tx.send(payload.to_string()).await;
        }
    }

    pub async fn progress(&self, label: &str, percent: u8, message: &str) {
        let payload = format!(
            r#"{{"status":"processing","message":"{}","percent":{}}}"#,
            message, percent
        );
        self.send(label, &payload).await;
    }

    pub async fn complete(&self, label: &str) {
        let payload = format!(
            r#"{{"status":"complete","message":"Done","percent":100,"data":{{"pptx_url":"/output/{}.pptx"}}}}"#,
            label
        );
        self.send(label, &payload).await;
    }

    pub async fn fail(&self, label: &str, message: &str) {
        let payload = format!(
            r#"{{"status":"error","message":"{}","percent":0}}"#,
            message
        );
        self.send(label, &payload).await;
    }

    /// The server reports the task as cancelled on its side.
    pub async fn cancelled_remotely(&self, label: &str) {
        let payload = r#"{"status":"cancelled","message":"Cancelled by user","percent":0}"#;
        self.send(label, payload).await;
    }

    /// End the stream for `label` without a terminal status.
    pub fn disconnect(&self, label: &str) {
        self.script.lock().unwrap().streams.remove(label);
    }
}

#[async_trait]
impl TransportClient for ScriptedTransport {
    async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, TransportError> {
        let label = request.payload.label();
        let mut script = self.script.lock().unwrap();
        script.submitted.push(label.clone());

        if script.rejected.contains(&label) {
            return Err(TransportError::Rejected(format!("{} was rejected", label)));
        }
        if script.immediate.contains(&label) {
            return Ok(SubmitOutcome::Immediate(JobResult {
                text: Some(format!("text of {}", label)),
                ..Default::default()
            }));
        }

        let task_id = TaskId::new(format!("task-{}", label));
        let (tx, rx) = mpsc::channel(16);
        script.streams.insert(label, tx);
        script.receivers.insert(task_id.clone(), rx);
        Ok(SubmitOutcome::Accepted(task_id))
    }

    async fn open_progress_channel(
        &self,
        task_id: &TaskId,
    ) -> Result<ProgressChannel, TransportError> {
        let rx = self
            .script
            .lock()
            .unwrap()
            .receivers
            .remove(task_id)
            .ok_or_else(|| TransportError::Rejected(format!("no stream for {}", task_id)))?;
        Ok(ProgressChannel::new(ChannelEventSource::new(rx)))
    }

    async fn cancel(&self, job_id: &JobId, task_id: Option<&TaskId>) -> Result<(), TransportError> {
        self.script
            .lock()
            .unwrap()
            .cancels
            .push((job_id.clone(), task_id.cloned()));
        Ok(())
    }

    async fn request_batch_export(&self, batch: &BatchKey) -> Result<BatchExport, TransportError> {
        self.script.lock().unwrap().exports.push(batch.clone());
        Ok(BatchExport {
            download_url: format!("/output/{}/batch.pptx", batch),
            filename: "batch.pptx".to_string(),
        })
    }
}

pub fn image(name: &str) -> JobPayload {
    JobPayload::Single {
        operation: Operation::Reconstruct,
        file: SourceFile::new(name, vec![0x89, 0x50, 0x4e, 0x47]),
    }
}

pub fn images(names: &[&str]) -> Vec<JobPayload> {
    names.iter().map(|n| image(n)).collect()
}

pub fn scheduler(transport: Arc<ScriptedTransport>, limit: usize) -> Scheduler {
    scheduler_with(transport, limit, Arc::new(NoopObserver), None)
}

pub fn scheduler_with(
    transport: Arc<ScriptedTransport>,
    limit: usize,
    observer: Arc<dyn SchedulerObserver>,
    job_timeout: Option<Duration>,
) -> Scheduler {
    Scheduler::new(transport, ConcurrencyLimit::new(limit), observer, job_timeout)
}

pub fn options() -> ProcessingOptions {
    ProcessingOptions::default()
}

/// Poll `condition` until it holds, failing the test after a second.
pub async fn until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timeout waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
