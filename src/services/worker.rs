//! Transformation worker.
//!
//! An actor running on its own OS thread with a current-thread tokio runtime,
//! so remote-server latency never reaches the kiosk's render loop. The host
//! talks to it only through the [`WorkerCommand`] mailbox and listens to the
//! [`PipelineEvent`] stream; no state is shared.
//!
//! Inside the actor, queued jobs live in a FIFO and at most
//! `max_concurrent_jobs` of them are active at once. Each active job runs as
//! its own task (upload, submit, poll on its own timer, download) and reports
//! back when it finishes; the actor is the only place where job status
//! changes are emitted for queued, completed, error and canceled jobs.

use base64::Engine;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::TransformConfig;
use crate::models::events::{ErrorPayload, PipelineEvent, WorkerCommand};
use crate::models::job::{Job, JobStatus, JobSummary, WorkerStatus};
use crate::services::comfy::{ComfyClient, ComfyError, HistoryEntry, HistoryLookup, UploadedImage, HEALTH_CHECK_TIMEOUT};

/// Per-session node graph written by the orchestration layer.
pub const WORKFLOW_FILENAME: &str = "image_generate.json";

/// Delay before re-draining when jobs are left waiting for a free slot.
const DRAIN_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransformError {
    #[error("Image upload failed: {0}")]
    Upload(String),

    #[error("Prompt submission failed: {0}")]
    Submit(String),

    #[error("Polling failed: {0}")]
    Poll(String),

    #[error("Remote operation timed out after {0}ms")]
    RemoteTimeout(u64),

    #[error("Invalid job input: {0}")]
    Validation(String),

    #[error("No output image for prompt {0}")]
    OutputMissing(String),

    #[error("Failed to store output image: {0}")]
    Storage(String),
}

impl TransformError {
    pub fn kind(&self) -> &'static str {
        match self {
            TransformError::Upload(_) => "upload-failure",
            TransformError::Submit(_) => "submit-failure",
            TransformError::Poll(_) => "poll-failure",
            TransformError::RemoteTimeout(_) => "remote-timeout",
            TransformError::Validation(_) => "validation-failure",
            TransformError::OutputMissing(_) => "output-missing",
            TransformError::Storage(_) => "storage-failure",
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind().to_string(),
            message: self.to_string(),
            details: None,
        }
    }

    fn remote(err: ComfyError, timeout: Duration, wrap: fn(String) -> TransformError) -> Self {
        if err.is_timeout() {
            TransformError::RemoteTimeout(timeout.as_millis() as u64)
        } else {
            wrap(err.to_string())
        }
    }
}

/// Host-side ends of a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    pub commands: mpsc::UnboundedSender<WorkerCommand>,
    pub events: mpsc::UnboundedReceiver<PipelineEvent>,
    pub thread: std::thread::JoinHandle<()>,
}

/// Start a worker on a dedicated thread. The first event it emits is
/// [`PipelineEvent::WorkerReady`].
pub fn spawn(config: TransformConfig) -> std::io::Result<WorkerHandle> {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let thread = std::thread::Builder::new()
        .name("transform-worker".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = event_tx.send(PipelineEvent::WorkerError {
                        message: format!("Failed to start worker runtime: {err}"),
                    });
                    return;
                }
            };

            runtime.block_on(async move {
                let client = match ComfyClient::new(&config.base_url) {
                    Ok(client) => client,
                    Err(err) => {
                        let _ = event_tx.send(PipelineEvent::WorkerError {
                            message: format!("Failed to create image server client: {err}"),
                        });
                        return;
                    }
                };
                TransformationWorker::new(config, client, event_tx)
                    .run(command_rx)
                    .await;
            });
        })?;

    Ok(WorkerHandle {
        commands: command_tx,
        events: event_rx,
        thread,
    })
}

/// Correlates a local job with the remote server's prompt id.
#[derive(Debug, Clone)]
struct ActiveRemoteOperation {
    prompt_id: String,
}

#[derive(Debug)]
struct ActiveJob {
    job_id: Uuid,
    status: JobStatus,
    remote: Option<ActiveRemoteOperation>,
    abort: AbortHandle,
}

/// Messages job tasks send back to the actor.
#[derive(Debug)]
enum Internal {
    Submitted {
        datetime: String,
        job_id: Uuid,
        prompt_id: String,
    },
    Drain,
}

#[derive(Debug)]
struct JobOutcome {
    job_id: Uuid,
    datetime: String,
    duration_ms: u64,
    result: Result<PathBuf, TransformError>,
}

/// What a job task needs; cheap to clone per task.
#[derive(Clone)]
struct JobContext {
    client: ComfyClient,
    config: Arc<TransformConfig>,
    events: mpsc::UnboundedSender<PipelineEvent>,
    internal: mpsc::UnboundedSender<Internal>,
}

impl JobContext {
    fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }
}

struct TransformationWorker {
    ctx: JobContext,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    queue: VecDeque<Job>,
    active: HashMap<String, ActiveJob>,
    tasks: JoinSet<JobOutcome>,
    drain_scheduled: bool,
}

impl TransformationWorker {
    fn new(
        config: TransformConfig,
        client: ComfyClient,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        // With no slot at all the queue would never drain.
        let config = TransformConfig {
            max_concurrent_jobs: config.max_concurrent_jobs.max(1),
            ..config
        };
        Self {
            ctx: JobContext {
                client,
                config: Arc::new(config),
                events,
                internal: internal_tx,
            },
            internal_rx,
            queue: VecDeque::new(),
            active: HashMap::new(),
            tasks: JoinSet::new(),
            drain_scheduled: false,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
        info!(
            base_url = %self.ctx.client.base_url(),
            max_concurrent_jobs = self.ctx.config.max_concurrent_jobs,
            "Transformation worker ready"
        );
        self.ctx.emit(PipelineEvent::WorkerReady);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(WorkerCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => match joined {
                    Ok(outcome) => self.finish_job(outcome),
                    Err(err) if err.is_cancelled() => {}
                    Err(err) => {
                        // A panicking job task leaves the actor's bookkeeping suspect.
                        error!(error = %err, "Job task panicked, stopping worker");
                        self.ctx.emit(PipelineEvent::WorkerError {
                            message: format!("Job task panicked: {err}"),
                        });
                        break;
                    }
                },
            }
        }

        self.tasks.abort_all();
        info!(
            dropped_queued = self.queue.len(),
            dropped_active = self.active.len(),
            "Transformation worker stopped"
        );
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::PreUpload { image_base64, datetime } => {
                let ctx = self.ctx.clone();
                tokio::spawn(async move { pre_upload(ctx, image_base64, datetime).await });
            }
            WorkerCommand::AddJob(job) => self.add_job(job),
            WorkerCommand::CancelJob { datetime } => self.cancel_job(&datetime),
            WorkerCommand::GetStatus { reply } => {
                let _ = reply.send(self.status());
            }
            WorkerCommand::HealthCheck { reply } => {
                let client = self.ctx.client.clone();
                tokio::spawn(async move {
                    let _ = reply.send(client.system_stats(HEALTH_CHECK_TIMEOUT).await);
                });
            }
            // Handled by the run loop.
            WorkerCommand::Shutdown => {}
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Submitted { datetime, job_id, prompt_id } => {
                match self.active.get_mut(&datetime) {
                    Some(active) if active.job_id == job_id => {
                        active.status = JobStatus::Processing;
                        active.remote = Some(ActiveRemoteOperation { prompt_id });
                    }
                    _ => {
                        // Canceled while the prompt was being submitted.
                        let client = self.ctx.client.clone();
                        tokio::spawn(async move { cancel_remote(client, datetime, prompt_id).await });
                    }
                }
            }
            Internal::Drain => {
                self.drain_scheduled = false;
                self.drain();
            }
        }
    }

    fn add_job(&mut self, job: Job) {
        let datetime = job.datetime.clone();
        let duplicate = self.active.contains_key(&datetime)
            || self.queue.iter().any(|queued| queued.datetime == datetime);
        if duplicate {
            warn!(datetime = %datetime, job_id = %job.id, "Rejecting duplicate job");
            self.ctx.emit(PipelineEvent::JobError {
                job_id: Some(job.id),
                datetime: datetime.clone(),
                error: TransformError::Validation(format!("A job for {datetime} is already in progress"))
                    .payload(),
            });
            return;
        }

        let job_id = job.id;
        self.queue.push_back(job);
        let position = self.queue.len();
        info!(datetime = %datetime, job_id = %job_id, position, "Job queued");
        metrics::counter!("transform_jobs_total").increment(1);
        self.ctx.emit(PipelineEvent::JobQueued { job_id, datetime, position });

        self.drain();
    }

    /// Start queued jobs while there is a free slot.
    fn drain(&mut self) {
        while self.active.len() < self.ctx.config.max_concurrent_jobs {
            let Some(job) = self.queue.pop_front() else {
                break;
            };
            self.start_job(job);
        }

        if !self.queue.is_empty() && !self.drain_scheduled {
            self.drain_scheduled = true;
            let internal = self.ctx.internal.clone();
            tokio::spawn(async move {
                tokio::time::sleep(DRAIN_BACKOFF).await;
                let _ = internal.send(Internal::Drain);
            });
        }
    }

    fn start_job(&mut self, job: Job) {
        let datetime = job.datetime.clone();
        let job_id = job.id;
        debug!(datetime = %datetime, job_id = %job_id, "Starting job");

        let ctx = self.ctx.clone();
        let abort = self.tasks.spawn(process_job(ctx, job));
        self.active.insert(
            datetime,
            ActiveJob {
                job_id,
                status: JobStatus::Queued,
                remote: None,
                abort,
            },
        );
    }

    fn finish_job(&mut self, outcome: JobOutcome) {
        match self.active.get(&outcome.datetime) {
            Some(active) if active.job_id == outcome.job_id => {
                self.active.remove(&outcome.datetime);
            }
            // Canceled after the task had already finished.
            _ => return,
        }

        match outcome.result {
            Ok(output_path) => {
                info!(
                    datetime = %outcome.datetime,
                    job_id = %outcome.job_id,
                    output = %output_path.display(),
                    duration_ms = outcome.duration_ms,
                    "Job completed"
                );
                metrics::counter!("transform_jobs_completed").increment(1);
                self.ctx.emit(PipelineEvent::JobCompleted {
                    job_id: outcome.job_id,
                    datetime: outcome.datetime,
                    output_path,
                    duration_ms: outcome.duration_ms,
                });
            }
            Err(err) => {
                error!(
                    datetime = %outcome.datetime,
                    job_id = %outcome.job_id,
                    kind = err.kind(),
                    error = %err,
                    "Job failed"
                );
                metrics::counter!("transform_jobs_failed").increment(1);
                self.ctx.emit(PipelineEvent::JobError {
                    job_id: Some(outcome.job_id),
                    datetime: outcome.datetime,
                    error: err.payload(),
                });
            }
        }

        self.drain();
    }

    /// Drop local state for `datetime` at once; remote cancellation is best effort.
    fn cancel_job(&mut self, datetime: &str) {
        let mut canceled = None;
        if let Some(index) = self.queue.iter().position(|job| job.datetime == datetime) {
            canceled = self.queue.remove(index).map(|job| job.id);
            info!(datetime = %datetime, "Removed queued job");
        } else if let Some(active) = self.active.remove(datetime) {
            canceled = Some(active.job_id);
            active.abort.abort();
            match active.remote {
                Some(remote) => {
                    // The server may keep running the prompt; nothing waits for it.
                    info!(
                        datetime = %datetime,
                        prompt_id = %remote.prompt_id,
                        "Canceled active job, requesting remote cancellation"
                    );
                    let client = self.ctx.client.clone();
                    let datetime = datetime.to_string();
                    tokio::spawn(async move { cancel_remote(client, datetime, remote.prompt_id).await });
                }
                None => info!(datetime = %datetime, "Canceled job before submission"),
            }
        } else {
            debug!(datetime = %datetime, "Cancel requested for unknown job");
        }

        metrics::counter!("transform_jobs_canceled").increment(1);
        self.ctx.emit(PipelineEvent::JobCanceled {
            job_id: canceled,
            datetime: datetime.to_string(),
        });
        self.drain();
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            queue_length: self.queue.len(),
            queued: self
                .queue
                .iter()
                .map(|job| JobSummary {
                    job_id: job.id,
                    datetime: job.datetime.clone(),
                    status: job.status,
                    prompt_id: None,
                })
                .collect(),
            active: self
                .active
                .iter()
                .map(|(datetime, active)| JobSummary {
                    job_id: active.job_id,
                    datetime: datetime.clone(),
                    status: active.status,
                    prompt_id: active.remote.as_ref().map(|r| r.prompt_id.clone()),
                })
                .collect(),
            max_concurrent_jobs: self.ctx.config.max_concurrent_jobs,
            is_processing: !self.active.is_empty(),
        }
    }
}

async fn process_job(ctx: JobContext, mut job: Job) -> JobOutcome {
    let result = run_job(&ctx, &mut job).await;
    JobOutcome {
        job_id: job.id,
        datetime: job.datetime.clone(),
        duration_ms: job.elapsed_ms(),
        result,
    }
}

async fn run_job(ctx: &JobContext, job: &mut Job) -> Result<PathBuf, TransformError> {
    let input_name = match job.pre_uploaded_filename.take() {
        Some(filename) => {
            debug!(datetime = %job.datetime, filename = %filename, "Using pre-uploaded image");
            filename
        }
        None => {
            let image_base64 = job.image_data.take().ok_or_else(|| {
                TransformError::Validation("job has neither image data nor a pre-uploaded image".to_string())
            })?;
            upload_image(ctx, &image_base64, &job.datetime).await?.name
        }
    };

    let workflow = load_workflow(&job.result_dir).await?;
    let prompt_id = ctx
        .client
        .submit_prompt(&workflow, ctx.config.processing_timeout)
        .await
        .map_err(|err| TransformError::remote(err, ctx.config.processing_timeout, TransformError::Submit))?;

    info!(
        datetime = %job.datetime,
        job_id = %job.id,
        prompt_id = %prompt_id,
        input = %input_name,
        "Prompt submitted"
    );
    let _ = ctx.internal.send(Internal::Submitted {
        datetime: job.datetime.clone(),
        job_id: job.id,
        prompt_id: prompt_id.clone(),
    });
    job.status = JobStatus::Processing;
    ctx.emit(PipelineEvent::JobStarted {
        job_id: job.id,
        datetime: job.datetime.clone(),
        prompt_id: prompt_id.clone(),
    });
    ctx.emit(PipelineEvent::JobProcessing {
        job_id: job.id,
        datetime: job.datetime.clone(),
    });

    let job_timeout = ctx.config.job_timeout;
    let entry = tokio::time::timeout(job_timeout, monitor_job(ctx, &job.datetime, &prompt_id))
        .await
        .map_err(|_| TransformError::RemoteTimeout(job_timeout.as_millis() as u64))??;

    save_output(ctx, &job.result_dir, &prompt_id, &entry).await
}

/// Poll the remote queue, then history, until the prompt finishes.
async fn monitor_job(ctx: &JobContext, datetime: &str, prompt_id: &str) -> Result<HistoryEntry, TransformError> {
    let poll_error = |err: ComfyError| TransformError::Poll(err.to_string());

    loop {
        let queue = ctx.client.queue().await.map_err(poll_error)?;
        match queue.position(prompt_id) {
            Some(position) => {
                debug!(datetime = %datetime, prompt_id = %prompt_id, position, "Prompt still queued");
                ctx.emit(PipelineEvent::JobQueueUpdate {
                    datetime: datetime.to_string(),
                    position,
                });
            }
            None => match ctx.client.history(prompt_id).await.map_err(poll_error)? {
                HistoryLookup::Complete(entry) if entry.failed() => {
                    return Err(TransformError::Poll(format!(
                        "remote execution of prompt {prompt_id} failed"
                    )));
                }
                HistoryLookup::Complete(entry) => return Ok(entry),
                HistoryLookup::Pending => {
                    debug!(datetime = %datetime, prompt_id = %prompt_id, "Prompt not in queue or history yet");
                }
            },
        }

        tokio::time::sleep(ctx.config.polling_interval).await;
    }
}

async fn save_output(
    ctx: &JobContext,
    result_dir: &Path,
    prompt_id: &str,
    entry: &HistoryEntry,
) -> Result<PathBuf, TransformError> {
    let image = entry
        .select_image(&ctx.config.final_save_node_id)
        .ok_or_else(|| TransformError::OutputMissing(prompt_id.to_string()))?;

    // Only the final component; the server controls this string.
    let filename = Path::new(&image.filename)
        .file_name()
        .ok_or_else(|| TransformError::OutputMissing(prompt_id.to_string()))?;

    let bytes = ctx
        .client
        .view(image)
        .await
        .map_err(|err| TransformError::Poll(err.to_string()))?;

    let output_path = result_dir.join(filename);
    tokio::fs::write(&output_path, bytes)
        .await
        .map_err(|err| TransformError::Storage(format!("{}: {}", output_path.display(), err)))?;
    Ok(output_path)
}

async fn load_workflow(result_dir: &Path) -> Result<Value, TransformError> {
    let path = result_dir.join(WORKFLOW_FILENAME);
    let raw = tokio::fs::read_to_string(&path)
        .await
        .map_err(|err| TransformError::Validation(format!("cannot read {}: {}", path.display(), err)))?;
    serde_json::from_str(&raw)
        .map_err(|err| TransformError::Validation(format!("cannot parse {}: {}", path.display(), err)))
}

async fn pre_upload(ctx: JobContext, image_base64: String, datetime: String) {
    let event = match upload_image(&ctx, &image_base64, &datetime).await {
        Ok(uploaded) => {
            info!(datetime = %datetime, filename = %uploaded.name, "Pre-upload completed");
            PipelineEvent::PreUploadCompleted {
                datetime,
                filename: Some(uploaded.name),
                error: None,
            }
        }
        Err(err) => {
            warn!(datetime = %datetime, error = %err, "Pre-upload failed");
            PipelineEvent::PreUploadCompleted {
                datetime,
                filename: None,
                error: Some(err.payload()),
            }
        }
    };
    ctx.emit(event);
}

async fn upload_image(ctx: &JobContext, image_base64: &str, datetime: &str) -> Result<UploadedImage, TransformError> {
    let bytes = decode_image(image_base64)?;
    let (filename, mime) = upload_name(datetime, &bytes);
    let timeout = ctx.config.upload_timeout;

    ctx.client
        .upload_image(bytes, &filename, mime, timeout)
        .await
        .map_err(|err| TransformError::remote(err, timeout, TransformError::Upload))
}

/// Name and mime type a captured photo is uploaded under.
pub fn upload_name(datetime: &str, bytes: &[u8]) -> (String, &'static str) {
    let (extension, mime) = match image::guess_format(bytes) {
        Ok(image::ImageFormat::Jpeg) => ("jpg", "image/jpeg"),
        Ok(image::ImageFormat::WebP) => ("webp", "image/webp"),
        _ => ("png", "image/png"),
    };
    (format!("photo_{datetime}.{extension}"), mime)
}

/// Decode base64 photo data, accepting an optional `data:` URL prefix.
pub fn decode_image(image_base64: &str) -> Result<Vec<u8>, TransformError> {
    let payload = match image_base64.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => image_base64,
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|err| TransformError::Validation(format!("invalid base64 image data: {err}")))?;
    if bytes.is_empty() {
        return Err(TransformError::Validation("empty image data".to_string()));
    }
    Ok(bytes)
}

async fn cancel_remote(client: ComfyClient, datetime: String, prompt_id: String) {
    let running = match client.queue().await {
        Ok(queue) => queue.is_running(&prompt_id),
        Err(err) => {
            warn!(datetime = %datetime, prompt_id = %prompt_id, error = %err, "Could not read remote queue during cancel");
            false
        }
    };

    if let Err(err) = client.delete_from_queue(&prompt_id).await {
        warn!(datetime = %datetime, prompt_id = %prompt_id, error = %err, "Remote queue delete failed");
    }
    if running {
        if let Err(err) = client.interrupt().await {
            warn!(datetime = %datetime, prompt_id = %prompt_id, error = %err, "Remote interrupt failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn unreachable_config() -> TransformConfig {
        TransformConfig {
            // Discard port; connections are refused.
            base_url: "http://127.0.0.1:9".to_string(),
            polling_interval: Duration::from_millis(50),
            ..TransformConfig::default()
        }
    }

    async fn next_event(handle: &mut WorkerHandle) -> PipelineEvent {
        tokio::time::timeout(Duration::from_secs(10), handle.events.recv())
            .await
            .expect("timed out waiting for worker event")
            .expect("worker event channel closed")
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(TransformError::Upload("x".into()).kind(), "upload-failure");
        assert_eq!(TransformError::RemoteTimeout(10).kind(), "remote-timeout");
        let payload = TransformError::OutputMissing("p1".into()).payload();
        assert_eq!(payload.kind, "output-missing");
        assert_eq!(payload.message, "No output image for prompt p1");
    }

    #[test]
    fn test_decode_image_accepts_data_url() {
        assert_eq!(decode_image("aGVsbG8=").unwrap(), b"hello");
        assert_eq!(decode_image("data:image/png;base64,aGVsbG8=").unwrap(), b"hello");
        assert!(matches!(decode_image("***"), Err(TransformError::Validation(_))));
        assert!(matches!(decode_image(""), Err(TransformError::Validation(_))));
    }

    #[test]
    fn test_upload_name_follows_image_format() {
        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        assert_eq!(
            upload_name("20250816_172354", &jpeg),
            ("photo_20250816_172354.jpg".to_string(), "image/jpeg")
        );
        assert_eq!(upload_name("20250816_172354", b"??").0, "photo_20250816_172354.png");
    }

    #[tokio::test]
    async fn test_ready_then_health_check_false_when_unreachable() {
        let mut handle = spawn(unreachable_config()).unwrap();
        assert_eq!(next_event(&mut handle).await, PipelineEvent::WorkerReady);

        let (reply, rx) = oneshot::channel();
        handle.commands.send(WorkerCommand::HealthCheck { reply }).unwrap();
        assert!(!rx.await.unwrap());

        handle.commands.send(WorkerCommand::Shutdown).unwrap();
        assert!(handle.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pre_upload_failure_is_an_event() {
        let mut handle = spawn(unreachable_config()).unwrap();
        next_event(&mut handle).await;

        handle
            .commands
            .send(WorkerCommand::PreUpload {
                image_base64: "aGVsbG8=".to_string(),
                datetime: "20250816_172354".to_string(),
            })
            .unwrap();

        match next_event(&mut handle).await {
            PipelineEvent::PreUploadCompleted { datetime, filename, error } => {
                assert_eq!(datetime, "20250816_172354");
                assert!(filename.is_none());
                assert_eq!(error.unwrap().kind, "upload-failure");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_job_without_image_fails_validation() {
        let mut handle = spawn(unreachable_config()).unwrap();
        next_event(&mut handle).await;

        let dir = tempfile::tempdir().unwrap();
        let job = Job::new("20250816_172354", dir.path());
        let job_id = job.id;
        handle.commands.send(WorkerCommand::AddJob(job)).unwrap();

        assert_eq!(
            next_event(&mut handle).await,
            PipelineEvent::JobQueued {
                job_id,
                datetime: "20250816_172354".to_string(),
                position: 1,
            }
        );
        match next_event(&mut handle).await {
            PipelineEvent::JobError { job_id: Some(id), error, .. } => {
                assert_eq!(id, job_id);
                assert_eq!(error.kind, "validation-failure");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let (reply, rx) = oneshot::channel();
        handle.commands.send(WorkerCommand::GetStatus { reply }).unwrap();
        let status = rx.await.unwrap();
        assert_eq!(status.queue_length, 0);
        assert!(status.active.is_empty());
        assert!(!status.is_processing);
    }

    #[tokio::test]
    async fn test_zero_job_slots_still_runs_one_job() {
        let mut handle = spawn(TransformConfig {
            max_concurrent_jobs: 0,
            ..unreachable_config()
        })
        .unwrap();
        next_event(&mut handle).await;

        let dir = tempfile::tempdir().unwrap();
        let job = Job::new("20250816_172354", dir.path());
        let job_id = job.id;
        handle.commands.send(WorkerCommand::AddJob(job)).unwrap();

        assert!(matches!(next_event(&mut handle).await, PipelineEvent::JobQueued { .. }));
        assert!(matches!(
            next_event(&mut handle).await,
            PipelineEvent::JobError { job_id: Some(id), .. } if id == job_id
        ));

        let (reply, rx) = oneshot::channel();
        handle.commands.send(WorkerCommand::GetStatus { reply }).unwrap();
        assert_eq!(rx.await.unwrap().max_concurrent_jobs, 1);
    }
}
