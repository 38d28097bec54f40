//! Session orchestration: capture -> stylization -> memorial card.
//!
//! The orchestrator prepares each session directory, hands the photo to the
//! transformation service and, when a stylized image comes back (or the dummy
//! photo fallback is used instead), runs the memorial card pipeline behind a
//! per-session generation guard.

use async_trait::async_trait;
use garde::Validate;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{MemorialCardConfig, WorkflowConfig};
use crate::models::events::{ErrorPayload, PipelineEvent};
use crate::models::game_result::GameResult;
use crate::models::job::is_datetime_key;
use crate::services::memorial_card::{CardOutcome, MemorialCardService, RESULT_FILENAME};
use crate::services::transform::{
    CompletionHandler, TransformRequest, TransformServiceError, TransformationService,
};
use crate::services::worker::{self, TransformError, WORKFLOW_FILENAME};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Invalid session key: {0}")]
    InvalidSession(String),

    #[error("Invalid game result: {0}")]
    InvalidResult(#[from] garde::Report),

    #[error("Invalid photo: {0}")]
    InvalidPhoto(#[from] TransformError),

    #[error(transparent)]
    Transform(#[from] TransformServiceError),

    #[error("Workflow template error: {0}")]
    Workflow(String),

    #[error("Memorial card generation is disabled")]
    CardsDisabled,

    #[error("Session file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Session keys claimed by an in-flight operation.
#[derive(Debug, Default)]
pub struct GenerationGuard {
    in_flight: Mutex<HashSet<String>>,
}

impl GenerationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `datetime`; `false` if already claimed.
    pub fn try_acquire(&self, datetime: &str) -> bool {
        self.in_flight.lock().insert(datetime.to_string())
    }

    pub fn release(&self, datetime: &str) {
        self.in_flight.lock().remove(datetime);
    }

    pub fn contains(&self, datetime: &str) -> bool {
        self.in_flight.lock().contains(datetime)
    }
}

/// Set the input filename and output prefix in a node-graph template.
///
/// Every `LoadImage` node reads `input_filename`; every `SaveImage` node
/// writes under `<output_prefix>_<datetime>`. Other nodes are untouched.
pub fn render_workflow(template: &Value, input_filename: &str, output_prefix: &str, datetime: &str) -> Value {
    let mut workflow = template.clone();
    let Some(nodes) = workflow.as_object_mut() else {
        return workflow;
    };

    for node in nodes.values_mut() {
        let class_type = node.get("class_type").and_then(Value::as_str).map(str::to_string);
        let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
            continue;
        };
        match class_type.as_deref() {
            Some("LoadImage") => {
                inputs.insert("image".to_string(), Value::from(input_filename));
            }
            Some("SaveImage") => {
                inputs.insert(
                    "filename_prefix".to_string(),
                    Value::from(format!("{output_prefix}_{datetime}")),
                );
            }
            _ => {}
        }
    }
    workflow
}

/// Memorial card generation shared by the transformation and dummy-photo paths.
///
/// A session is claimed before generation and released only on failure, so a
/// session whose card was generated is never generated again in this process.
pub struct CardGenerator {
    cards: MemorialCardService,
    guard: GenerationGuard,
    events: broadcast::Sender<PipelineEvent>,
    results_dir: PathBuf,
    config: MemorialCardConfig,
}

impl CardGenerator {
    pub fn new(
        cards: MemorialCardService,
        config: MemorialCardConfig,
        results_dir: impl Into<PathBuf>,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        Self {
            cards,
            guard: GenerationGuard::new(),
            events,
            results_dir: results_dir.into(),
            config,
        }
    }

    pub fn guard(&self) -> &GenerationGuard {
        &self.guard
    }

    /// Card from a finished transformation. `None` when the session already
    /// has a card generated or in progress.
    pub async fn from_transformation(&self, datetime: &str, stylized: &Path) -> Option<CardOutcome> {
        let result_dir = self.results_dir.join(datetime);
        self.generate_guarded(datetime, self.cards.generate_from_transformation(&result_dir, stylized))
            .await
    }

    /// Card from the configured dummy photo. `None` as for [`Self::from_transformation`].
    pub async fn from_dummy_photo(&self, datetime: &str) -> Option<CardOutcome> {
        let result_dir = self.results_dir.join(datetime);
        self.generate_guarded(
            datetime,
            self.cards.generate_from_dummy_photo(&result_dir, &self.config.dummy_photo_path),
        )
        .await
    }

    async fn generate_guarded<F>(&self, datetime: &str, generation: F) -> Option<CardOutcome>
    where
        F: Future<Output = CardOutcome>,
    {
        if !self.guard.try_acquire(datetime) {
            info!(datetime = %datetime, "Memorial card already generated or in progress, skipping");
            return None;
        }

        let outcome = generation.await;
        let event = match (&outcome.output_path, &outcome.error) {
            (Some(output_path), _) if outcome.success => PipelineEvent::MemorialCardGenerated {
                datetime: datetime.to_string(),
                output_path: output_path.clone(),
                duration_ms: outcome.duration_ms,
            },
            (_, error) => {
                self.guard.release(datetime);
                PipelineEvent::MemorialCardError {
                    datetime: datetime.to_string(),
                    error: error.as_ref().map(|e| e.payload()).unwrap_or_else(|| ErrorPayload {
                        kind: "unknown".to_string(),
                        message: "Memorial card generation failed".to_string(),
                        details: None,
                    }),
                }
            }
        };
        let _ = self.events.send(event);
        Some(outcome)
    }
}

#[async_trait]
impl CompletionHandler for CardGenerator {
    async fn on_job_completed(&self, datetime: &str, output_path: &Path) {
        if !self.config.enabled {
            debug!(datetime = %datetime, "Memorial cards disabled, ignoring completed job");
            return;
        }
        self.from_transformation(datetime, output_path).await;
    }
}

/// Releases a capture claim when submission ends, including when the
/// submitting future is dropped.
struct CaptureClaim<'a> {
    guard: &'a GenerationGuard,
    datetime: &'a str,
}

impl Drop for CaptureClaim<'_> {
    fn drop(&mut self) {
        self.guard.release(self.datetime);
    }
}

/// Entry point for the kiosk: one call per session step.
pub struct Orchestrator {
    results_dir: PathBuf,
    workflow: WorkflowConfig,
    transform: Arc<TransformationService>,
    cards: Arc<CardGenerator>,
    captures: GenerationGuard,
}

impl Orchestrator {
    /// Wire the card generator into `transform` as its completion handler.
    pub fn new(
        results_dir: impl Into<PathBuf>,
        workflow: WorkflowConfig,
        card_config: MemorialCardConfig,
        transform: Arc<TransformationService>,
    ) -> Self {
        let cards = MemorialCardService::from_config(&card_config);
        Self::with_card_service(results_dir, workflow, card_config, cards, transform)
    }

    pub fn with_card_service(
        results_dir: impl Into<PathBuf>,
        workflow: WorkflowConfig,
        card_config: MemorialCardConfig,
        card_service: MemorialCardService,
        transform: Arc<TransformationService>,
    ) -> Self {
        let results_dir = results_dir.into();
        let cards = Arc::new(CardGenerator::new(
            card_service,
            card_config,
            results_dir.clone(),
            transform.event_sender(),
        ));
        transform.set_completion_handler(cards.clone());

        Self {
            results_dir,
            workflow,
            transform,
            cards,
            captures: GenerationGuard::new(),
        }
    }

    pub fn transform(&self) -> &Arc<TransformationService> {
        &self.transform
    }

    pub fn cards(&self) -> &Arc<CardGenerator> {
        &self.cards
    }

    fn session_dir(&self, datetime: &str) -> Result<PathBuf, OrchestratorError> {
        if !is_datetime_key(datetime) {
            return Err(OrchestratorError::InvalidSession(datetime.to_string()));
        }
        Ok(self.results_dir.join(datetime))
    }

    /// Store the captured photo, render the session workflow and queue the
    /// stylization job. A failed pre-upload is not fatal; the worker uploads
    /// the photo itself.
    ///
    /// A session with a job already tracked, or another capture still being
    /// submitted, is rejected before any session file is touched.
    pub async fn submit_capture(&self, datetime: &str, photo_base64: String) -> Result<Uuid, OrchestratorError> {
        let result_dir = self.session_dir(datetime)?;
        let photo = worker::decode_image(&photo_base64)?;

        if !self.captures.try_acquire(datetime) {
            warn!(datetime = %datetime, "Capture already being submitted, rejecting");
            return Err(TransformServiceError::Duplicate(datetime.to_string()).into());
        }
        let _claim = CaptureClaim {
            guard: &self.captures,
            datetime,
        };
        if self.transform.is_tracked(datetime) {
            warn!(datetime = %datetime, "Capture for a session with a tracked job, rejecting");
            return Err(TransformServiceError::Duplicate(datetime.to_string()).into());
        }

        tokio::fs::create_dir_all(&result_dir).await?;
        tokio::fs::write(result_dir.join(format!("photo_{datetime}.png")), &photo).await?;

        let input_filename = match self.transform.pre_upload(photo_base64.clone(), datetime).await {
            Ok(filename) => filename,
            Err(err) => {
                warn!(datetime = %datetime, error = %err, "Pre-upload failed, worker will upload");
                worker::upload_name(datetime, &photo).0
            }
        };

        self.write_workflow(&result_dir, &input_filename, datetime).await?;

        let job_id = self.transform.transform(TransformRequest {
            datetime: datetime.to_string(),
            image_base64: Some(photo_base64),
            result_dir,
        })?;
        info!(datetime = %datetime, job_id = %job_id, input = %input_filename, "Capture submitted");
        Ok(job_id)
    }

    async fn write_workflow(&self, result_dir: &Path, input_filename: &str, datetime: &str) -> Result<PathBuf, OrchestratorError> {
        let raw = tokio::fs::read_to_string(&self.workflow.template_path)
            .await
            .map_err(|err| {
                OrchestratorError::Workflow(format!(
                    "cannot read {}: {}",
                    self.workflow.template_path.display(),
                    err
                ))
            })?;
        let template: Value = serde_json::from_str(&raw).map_err(|err| {
            OrchestratorError::Workflow(format!(
                "cannot parse {}: {}",
                self.workflow.template_path.display(),
                err
            ))
        })?;

        let workflow = render_workflow(&template, input_filename, &self.workflow.output_prefix, datetime);
        let path = result_dir.join(WORKFLOW_FILENAME);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&workflow)?).await?;
        Ok(path)
    }

    /// Validate and write `result.json` for the session.
    pub async fn record_result(&self, datetime: &str, result: &GameResult) -> Result<PathBuf, OrchestratorError> {
        let result_dir = self.session_dir(datetime)?;
        result.validate()?;

        tokio::fs::create_dir_all(&result_dir).await?;
        let path = result_dir.join(RESULT_FILENAME);
        tokio::fs::write(&path, serde_json::to_vec_pretty(result)?).await?;
        debug!(datetime = %datetime, path = %path.display(), "Game result recorded");
        Ok(path)
    }

    /// Generate the card from the dummy photo when stylization is unavailable.
    /// `Ok(None)` means a card for the session was already generated or is in progress.
    pub async fn generate_with_dummy_photo(&self, datetime: &str) -> Result<Option<CardOutcome>, OrchestratorError> {
        self.session_dir(datetime)?;
        if !self.cards.config.enabled {
            return Err(OrchestratorError::CardsDisabled);
        }
        Ok(self.cards.from_dummy_photo(datetime).await)
    }
}
