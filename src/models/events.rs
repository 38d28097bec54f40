//! Message schema between the kiosk host, the transformation service and its
//! worker.
//!
//! Commands flow host -> worker over the worker's mailbox. Events flow back
//! from the worker and are relayed, unmodified, to the UI alongside the
//! memorial-card events raised by the orchestration layer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::job::{Job, WorkerStatus};

/// Requests accepted by the transformation worker.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Upload a photo ahead of job submission. Answered by
    /// [`PipelineEvent::PreUploadCompleted`] carrying the same `datetime`.
    PreUpload { image_base64: String, datetime: String },
    AddJob(Job),
    CancelJob { datetime: String },
    GetStatus { reply: oneshot::Sender<WorkerStatus> },
    HealthCheck { reply: oneshot::Sender<bool> },
    Shutdown,
}

/// Failure details attached to error events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Lifecycle notifications pushed toward the UI. Fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PipelineEvent {
    WorkerReady,
    PreUploadCompleted {
        datetime: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    JobQueued {
        job_id: Uuid,
        datetime: String,
        position: usize,
    },
    JobStarted {
        job_id: Uuid,
        datetime: String,
        prompt_id: String,
    },
    JobProcessing {
        job_id: Uuid,
        datetime: String,
    },
    JobQueueUpdate {
        datetime: String,
        /// 0 while the remote server is executing the job.
        position: usize,
    },
    JobCompleted {
        job_id: Uuid,
        datetime: String,
        output_path: PathBuf,
        duration_ms: u64,
    },
    JobError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<Uuid>,
        datetime: String,
        error: ErrorPayload,
    },
    JobCanceled {
        /// The queued or active job that was dropped; absent when the worker
        /// held nothing for the session.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<Uuid>,
        datetime: String,
    },
    WorkerError {
        message: String,
    },
    WorkerExited,
    MemorialCardGenerated {
        datetime: String,
        output_path: PathBuf,
        duration_ms: u64,
    },
    MemorialCardError {
        datetime: String,
        error: ErrorPayload,
    },
}

impl PipelineEvent {
    /// Session key the event refers to, if any.
    pub fn datetime(&self) -> Option<&str> {
        match self {
            PipelineEvent::PreUploadCompleted { datetime, .. }
            | PipelineEvent::JobQueued { datetime, .. }
            | PipelineEvent::JobStarted { datetime, .. }
            | PipelineEvent::JobProcessing { datetime, .. }
            | PipelineEvent::JobQueueUpdate { datetime, .. }
            | PipelineEvent::JobCompleted { datetime, .. }
            | PipelineEvent::JobError { datetime, .. }
            | PipelineEvent::JobCanceled { datetime, .. }
            | PipelineEvent::MemorialCardGenerated { datetime, .. }
            | PipelineEvent::MemorialCardError { datetime, .. } => Some(datetime),
            PipelineEvent::WorkerReady
            | PipelineEvent::WorkerError { .. }
            | PipelineEvent::WorkerExited => None,
        }
    }

    /// Wire name of the event, as used in the `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::WorkerReady => "worker-ready",
            PipelineEvent::PreUploadCompleted { .. } => "pre-upload-completed",
            PipelineEvent::JobQueued { .. } => "job-queued",
            PipelineEvent::JobStarted { .. } => "job-started",
            PipelineEvent::JobProcessing { .. } => "job-processing",
            PipelineEvent::JobQueueUpdate { .. } => "job-queue-update",
            PipelineEvent::JobCompleted { .. } => "job-completed",
            PipelineEvent::JobError { .. } => "job-error",
            PipelineEvent::JobCanceled { .. } => "job-canceled",
            PipelineEvent::WorkerError { .. } => "worker-error",
            PipelineEvent::WorkerExited => "worker-exited",
            PipelineEvent::MemorialCardGenerated { .. } => "memorial-card-generated",
            PipelineEvent::MemorialCardError { .. } => "memorial-card-error",
        }
    }
}
