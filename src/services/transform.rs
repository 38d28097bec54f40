//! Host-side façade over the transformation worker.
//!
//! Starts the worker, waits for its readiness handshake, and keeps a mirror of
//! job statuses keyed by session datetime so callers can query without a
//! round trip. The mirror is never authoritative; it follows worker events.
//! It is also the first line of defense against generating two images for one
//! session: a datetime already in the mirror is rejected.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TransformConfig;
use crate::models::events::{ErrorPayload, PipelineEvent, WorkerCommand};
use crate::models::job::{Job, JobStatus, JobSummary, WorkerStatus};
use crate::services::worker::{self, WorkerHandle};

/// How long the worker has to report ready.
pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

const EVENT_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum TransformServiceError {
    #[error("Failed to start transformation worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Transformation worker not ready after {0:?}")]
    NotReady(Duration),

    #[error("Transformation worker failed to start: {0}")]
    Startup(String),

    #[error("Job already exists for {0}")]
    Duplicate(String),

    #[error("Invalid transform request: {0}")]
    InvalidRequest(String),

    #[error("Transformation worker is not running")]
    WorkerUnavailable,

    #[error("Pre-upload failed: {}", .0.message)]
    PreUpload(ErrorPayload),
}

#[derive(Debug, Clone)]
pub struct TransformRequest {
    pub datetime: String,
    /// Base64 photo; may be omitted when a pre-upload for the session succeeded.
    pub image_base64: Option<String>,
    pub result_dir: PathBuf,
}

/// Called when a job finishes with a stylized image on disk.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    async fn on_job_completed(&self, datetime: &str, output_path: &Path);
}

type UploadWaiter = oneshot::Sender<Result<String, ErrorPayload>>;

/// State shared with the event pump.
struct Shared {
    jobs: Mutex<HashMap<String, JobSummary>>,
    pre_uploads: Mutex<HashMap<String, String>>,
    upload_waiters: Mutex<HashMap<String, Vec<UploadWaiter>>>,
    completion: Mutex<Option<Arc<dyn CompletionHandler>>>,
    events: broadcast::Sender<PipelineEvent>,
    running: AtomicBool,
    stopping: AtomicBool,
}

impl Shared {
    /// Update the mirror from a worker event.
    fn apply(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::JobStarted { datetime, job_id, prompt_id } => {
                if let Some(entry) = self.jobs.lock().get_mut(datetime) {
                    if entry.job_id == *job_id {
                        entry.status = JobStatus::Processing;
                        entry.prompt_id = Some(prompt_id.clone());
                    }
                }
            }
            PipelineEvent::JobProcessing { datetime, job_id } => {
                if let Some(entry) = self.jobs.lock().get_mut(datetime) {
                    if entry.job_id == *job_id {
                        entry.status = JobStatus::Processing;
                    }
                }
            }
            PipelineEvent::JobCompleted { datetime, job_id, .. } => {
                self.remove_job(datetime, Some(*job_id));
            }
            PipelineEvent::JobError { datetime, job_id, .. } => {
                self.remove_job(datetime, *job_id);
            }
            PipelineEvent::JobCanceled { datetime, job_id } => {
                self.remove_job(datetime, *job_id);
            }
            PipelineEvent::PreUploadCompleted { datetime, filename, error } => {
                let result = match (filename, error) {
                    (Some(filename), _) => {
                        self.pre_uploads.lock().insert(datetime.clone(), filename.clone());
                        Ok(filename.clone())
                    }
                    (None, Some(error)) => Err(error.clone()),
                    (None, None) => Err(ErrorPayload {
                        kind: "upload-failure".to_string(),
                        message: "Pre-upload returned no filename".to_string(),
                        details: None,
                    }),
                };
                let waiters = self.upload_waiters.lock().remove(datetime).unwrap_or_default();
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            }
            _ => {}
        }
    }

    /// Drop a mirror entry once its job is resolved. Only the entry for
    /// `job_id` is removed, so a late event for a canceled job never drops a
    /// newer job for the same session. Without an id there is nothing to match.
    fn remove_job(&self, datetime: &str, job_id: Option<Uuid>) {
        let Some(job_id) = job_id else {
            return;
        };
        let mut jobs = self.jobs.lock();
        if jobs.get(datetime).is_some_and(|entry| entry.job_id == job_id) {
            jobs.remove(datetime);
        }
    }

    fn fail_waiters(&self, message: &str) {
        let waiters: Vec<UploadWaiter> = self
            .upload_waiters
            .lock()
            .drain()
            .flat_map(|(_, waiters)| waiters)
            .collect();
        for waiter in waiters {
            let _ = waiter.send(Err(ErrorPayload {
                kind: "upload-failure".to_string(),
                message: message.to_string(),
                details: None,
            }));
        }
    }
}

/// Handle to a running transformation worker.
pub struct TransformationService {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    shared: Arc<Shared>,
    pump: JoinHandle<()>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl TransformationService {
    /// Spawn the worker and wait for it to report ready.
    pub async fn start(config: TransformConfig) -> Result<Self, TransformServiceError> {
        let WorkerHandle { commands, mut events, thread } = worker::spawn(config)?;

        match tokio::time::timeout(READY_TIMEOUT, events.recv()).await {
            Ok(Some(PipelineEvent::WorkerReady)) => {}
            Ok(Some(PipelineEvent::WorkerError { message })) => {
                return Err(TransformServiceError::Startup(message));
            }
            Ok(Some(other)) => {
                let _ = commands.send(WorkerCommand::Shutdown);
                return Err(TransformServiceError::Startup(format!(
                    "unexpected {} before worker-ready",
                    other.name()
                )));
            }
            Ok(None) => {
                return Err(TransformServiceError::Startup("worker exited".to_string()));
            }
            Err(_) => {
                let _ = commands.send(WorkerCommand::Shutdown);
                return Err(TransformServiceError::NotReady(READY_TIMEOUT));
            }
        }

        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let shared = Arc::new(Shared {
            jobs: Mutex::new(HashMap::new()),
            pre_uploads: Mutex::new(HashMap::new()),
            upload_waiters: Mutex::new(HashMap::new()),
            completion: Mutex::new(None),
            events: events_tx,
            running: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
        });
        let pump = tokio::spawn(pump_events(shared.clone(), events));
        info!("Transformation service started");

        Ok(Self {
            commands,
            shared,
            pump,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Register the handler invoked for every `job-completed` event.
    pub fn set_completion_handler(&self, handler: Arc<dyn CompletionHandler>) {
        *self.shared.completion.lock() = Some(handler);
    }

    /// Events from the worker plus anything published by collaborators.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.shared.events.subscribe()
    }

    /// Sender for collaborators publishing on the same stream (memorial card events).
    pub fn event_sender(&self) -> broadcast::Sender<PipelineEvent> {
        self.shared.events.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Queue a job for `request.datetime`. Rejected if one is already tracked.
    pub fn transform(&self, request: TransformRequest) -> Result<Uuid, TransformServiceError> {
        if !self.is_running() {
            return Err(TransformServiceError::WorkerUnavailable);
        }

        let job = {
            let mut jobs = self.shared.jobs.lock();
            if jobs.contains_key(&request.datetime) {
                warn!(datetime = %request.datetime, "Rejecting duplicate transform request");
                return Err(TransformServiceError::Duplicate(request.datetime));
            }

            let pre_uploaded = self.shared.pre_uploads.lock().remove(&request.datetime);
            if pre_uploaded.is_none() && request.image_base64.is_none() {
                return Err(TransformServiceError::InvalidRequest(format!(
                    "no image data or pre-uploaded image for {}",
                    request.datetime
                )));
            }

            let mut job = Job::new(request.datetime.clone(), request.result_dir)
                .with_pre_uploaded(pre_uploaded);
            if let Some(image_base64) = request.image_base64 {
                job = job.with_image_data(image_base64);
            }
            jobs.insert(
                request.datetime.clone(),
                JobSummary {
                    job_id: job.id,
                    datetime: request.datetime.clone(),
                    status: JobStatus::Queued,
                    prompt_id: None,
                },
            );
            job
        };

        let job_id = job.id;
        if self.commands.send(WorkerCommand::AddJob(job)).is_err() {
            self.shared.remove_job(&request.datetime, Some(job_id));
            return Err(TransformServiceError::WorkerUnavailable);
        }
        debug!(datetime = %request.datetime, job_id = %job_id, "Transform request sent to worker");
        Ok(job_id)
    }

    /// Upload a photo ahead of time; the filename is reused by the next
    /// `transform` for the same session.
    pub async fn pre_upload(&self, image_base64: String, datetime: &str) -> Result<String, TransformServiceError> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .upload_waiters
            .lock()
            .entry(datetime.to_string())
            .or_default()
            .push(tx);

        let command = WorkerCommand::PreUpload {
            image_base64,
            datetime: datetime.to_string(),
        };
        if self.commands.send(command).is_err() {
            self.shared.upload_waiters.lock().remove(datetime);
            return Err(TransformServiceError::WorkerUnavailable);
        }

        match rx.await {
            Ok(Ok(filename)) => Ok(filename),
            Ok(Err(error)) => Err(TransformServiceError::PreUpload(error)),
            Err(_) => Err(TransformServiceError::WorkerUnavailable),
        }
    }

    /// Forget the session's job locally and ask the worker to cancel it.
    /// Returns whether a job was tracked for `datetime`.
    pub fn cancel_job(&self, datetime: &str) -> bool {
        let tracked = self.shared.jobs.lock().remove(datetime).is_some();
        self.shared.pre_uploads.lock().remove(datetime);

        let command = WorkerCommand::CancelJob {
            datetime: datetime.to_string(),
        };
        if self.commands.send(command).is_err() {
            warn!(datetime = %datetime, "Worker gone, cancel applied locally only");
        }
        tracked
    }

    /// Whether the mirror holds an unresolved job for `datetime`.
    pub fn is_tracked(&self, datetime: &str) -> bool {
        self.shared.jobs.lock().contains_key(datetime)
    }

    /// Unresolved jobs known to the mirror.
    pub fn get_active_jobs(&self) -> Vec<JobSummary> {
        let mut jobs: Vec<JobSummary> = self.shared.jobs.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.datetime.cmp(&b.datetime));
        jobs
    }

    pub fn has_active_jobs(&self) -> bool {
        !self.shared.jobs.lock().is_empty()
    }

    pub async fn get_status(&self) -> Result<WorkerStatus, TransformServiceError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(WorkerCommand::GetStatus { reply })
            .map_err(|_| TransformServiceError::WorkerUnavailable)?;
        rx.await.map_err(|_| TransformServiceError::WorkerUnavailable)
    }

    /// Whether the remote server answers its status endpoint.
    pub async fn health_check(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(WorkerCommand::HealthCheck { reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Stop the worker and drop all in-memory job and pre-upload state.
    /// Jobs still in flight are lost.
    pub async fn destroy(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.commands.send(WorkerCommand::Shutdown);

        let dropped = {
            let mut jobs = self.shared.jobs.lock();
            let count = jobs.len();
            jobs.clear();
            count
        };
        self.shared.pre_uploads.lock().clear();
        self.shared.fail_waiters("transformation service stopped");

        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if let Ok(Err(_)) = tokio::task::spawn_blocking(move || thread.join()).await {
                warn!("Transformation worker thread panicked");
            }
        }
        self.pump.abort();
        info!(dropped_jobs = dropped, "Transformation service stopped");
    }
}

async fn pump_events(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<PipelineEvent>) {
    while let Some(event) = events.recv().await {
        shared.apply(&event);

        let completed = match &event {
            PipelineEvent::JobCompleted { datetime, output_path, .. } => {
                Some((datetime.clone(), output_path.clone()))
            }
            _ => None,
        };

        // No subscribers is fine.
        let _ = shared.events.send(event);

        if let Some((datetime, output_path)) = completed {
            let handler = shared.completion.lock().clone();
            if let Some(handler) = handler {
                tokio::spawn(async move { handler.on_job_completed(&datetime, &output_path).await });
            }
        }
    }

    shared.running.store(false, Ordering::SeqCst);
    shared.fail_waiters("transformation worker exited");
    if !shared.stopping.load(Ordering::SeqCst) {
        warn!("Transformation worker exited unexpectedly");
        let _ = shared.events.send(PipelineEvent::WorkerExited);
    }
}
