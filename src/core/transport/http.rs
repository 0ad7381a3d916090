use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, header, multipart};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::sse::SseDecoder;
use super::{SubmitOutcome, SubmitRequest, TransportClient, TransportError};
use crate::core::batch::{BatchExport, BatchKey};
use crate::core::models::{JobId, JobResult, TaskId};
use crate::core::progress::{EventSource, ProgressChannel};

/// Talks to the processing server over HTTP (multipart submissions, SSE progress).
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl TransportClient for HttpTransport {
    async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, TransportError> {
        let url = self.url(request.endpoint());
        debug!(job_id = %request.job_id, url = %url, "Submitting job");

        let mut form = multipart::Form::new();
        for (name, value) in request.form_fields() {
            form = form.text(name, value);
        }
        for (name, file) in request.into_file_parts() {
            let mime = file.mime_type();
            let part = multipart::Part::bytes(file.data)
                .file_name(file.file_name)
                .mime_str(mime)?;
            form = form.part(name, part);
        }

        let response = self.client.post(url).multipart(form).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        decode_submit_response(&body)
    }

    async fn open_progress_channel(
        &self,
        task_id: &TaskId,
    ) -> Result<ProgressChannel, TransportError> {
        let url = self.url(&format!("/progress/{}", task_id));
        debug!(task_id = %task_id, "Opening progress stream");

        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        Ok(ProgressChannel::new(HttpEventSource {
            response,
            decoder: SseDecoder::new(),
            done: false,
        }))
    }

    async fn cancel(
        &self,
        job_id: &JobId,
        task_id: Option<&TaskId>,
    ) -> Result<(), TransportError> {
        let target = task_id.map(TaskId::as_str).unwrap_or(job_id.as_str());
        let response = self
            .client
            .post(self.url(&format!("/cancel/{}", target)))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        Ok(())
    }

    async fn request_batch_export(&self, batch: &BatchKey) -> Result<BatchExport, TransportError> {
        let response = self
            .client
            .post(self.url(&format!("/generate-pptx-batch/{}", batch)))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        decode_export_response(&body)
    }
}

struct HttpEventSource {
    response: reqwest::Response,
    decoder: SseDecoder,
    done: bool,
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn next_event(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            if let Some(event) = self.decoder.next_event() {
                return Ok(Some(event));
            }
            if self.done {
                return Ok(None);
            }
            match self.response.chunk().await? {
                Some(bytes) => self.decoder.push(&bytes),
                None => {
                    self.done = true;
                    return Ok(self.decoder.finish());
                }
            }
        }
    }
}

/// Build an error from a non-2xx response, preferring the server's own message.
fn status_error(status: StatusCode, body: &str) -> TransportError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            ["message", "detail"]
                .iter()
                .find_map(|k| v.get(*k).and_then(Value::as_str).map(str::to_string))
        })
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unknown status")
                .to_string()
        });
    TransportError::Status {
        status: status.as_u16(),
        message,
    }
}

fn decode_submit_response(body: &str) -> Result<SubmitOutcome, TransportError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| TransportError::Decode(e.to_string()))?;

    match value.get("status").and_then(Value::as_str) {
        Some("processing") => {
            let task_id = value
                .get("task_id")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    TransportError::Decode("processing response without task_id".into())
                })?;
            return Ok(SubmitOutcome::Accepted(TaskId::new(task_id)));
        }
        Some("error") => {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("server reported an error");
            return Err(TransportError::Rejected(message.to_string()));
        }
        _ => {}
    }

    let data = value.get("data").cloned().unwrap_or(value);
    let result: JobResult =
        serde_json::from_value(data).map_err(|e| TransportError::Decode(e.to_string()))?;
    Ok(SubmitOutcome::Immediate(result))
}

#[derive(Deserialize)]
struct ExportResponse {
    status: Option<String>,
    message: Option<String>,
    download_url: Option<String>,
    filename: Option<String>,
}

fn decode_export_response(body: &str) -> Result<BatchExport, TransportError> {
    let resp: ExportResponse =
        serde_json::from_str(body).map_err(|e| TransportError::Decode(e.to_string()))?;

    match (resp.status.as_deref(), resp.download_url, resp.filename) {
        (Some("success"), Some(download_url), Some(filename)) => Ok(BatchExport {
            download_url,
            filename,
        }),
        _ => Err(TransportError::Rejected(
            resp.message
                .unwrap_or_else(|| "batch export failed".to_string()),
        )),
    }
}
