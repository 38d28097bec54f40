//! Memorial card generation for one session directory.
//!
//! A single linear pipeline: load `result.json`, find the stylized photo, lay
//! out the card, write and check the raster tool script, run the tool, then
//! verify the card actually landed on disk. The first failing step ends the
//! run and is reported in the returned [`CardOutcome`].

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use strum::Display;
use tracing::{error, info};

use crate::config::MemorialCardConfig;
use crate::models::events::ErrorPayload;
use crate::models::game_result::GameResult;
use crate::services::composition::CompositionBuilder;
use crate::services::executor::{classify_error, CommandExecutor, ToolErrorKind};
use crate::services::script;

pub const RESULT_FILENAME: &str = "result.json";

/// Prefix of stylized photos produced by the transformation pipeline.
pub const STYLIZED_PREFIX: &str = "photo_anime_";

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CardErrorKind {
    ValidationFailure,
    ToolTimeout,
    ToolInvocationFailure,
    OutputMissing,
}

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct CardError {
    pub kind: CardErrorKind,
    /// Classification of raster tool stderr, for tool failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_error: Option<ToolErrorKind>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CardError {
    fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: CardErrorKind::ValidationFailure,
            tool_error: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: match self.tool_error {
                Some(tool) => tool.to_string(),
                None => self.kind.to_string(),
            },
            message: self.message.clone(),
            details: self.details.clone(),
        }
    }
}

/// Outcome of one generation run.
#[derive(Debug, Clone, Serialize)]
pub struct CardOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CardError>,
    pub duration_ms: u64,
}

/// Composes memorial cards with the external raster tool.
#[derive(Debug, Clone)]
pub struct MemorialCardService {
    builder: CompositionBuilder,
    executor: CommandExecutor,
}

impl MemorialCardService {
    pub fn new(builder: CompositionBuilder, executor: CommandExecutor) -> Self {
        Self { builder, executor }
    }

    pub fn from_config(config: &MemorialCardConfig) -> Self {
        Self::new(
            CompositionBuilder::new(&config.backgrounds_dir, &config.font_path),
            CommandExecutor::new(&config.magick_binary, config.tool_timeout),
        )
    }

    /// Generate the card for the session stored in `result_dir`.
    pub async fn generate(&self, result_dir: &Path) -> CardOutcome {
        let start = Instant::now();
        let outcome = self.run_pipeline(result_dir).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        metrics::histogram!("memorial_card_duration_seconds").record(start.elapsed().as_secs_f64());

        match outcome {
            Ok(output_path) => {
                metrics::counter!("memorial_cards_generated").increment(1);
                info!(
                    result_dir = %result_dir.display(),
                    output = %output_path.display(),
                    duration_ms,
                    "Memorial card generated"
                );
                CardOutcome {
                    success: true,
                    output_path: Some(output_path),
                    error: None,
                    duration_ms,
                }
            }
            Err(err) => {
                metrics::counter!("memorial_cards_failed").increment(1);
                error!(
                    result_dir = %result_dir.display(),
                    kind = %err.kind,
                    error = %err.message,
                    duration_ms,
                    "Memorial card generation failed"
                );
                CardOutcome {
                    success: false,
                    output_path: None,
                    error: Some(err),
                    duration_ms,
                }
            }
        }
    }

    /// Entry for the fallback path: the dummy photo stands in for the stylized one.
    pub async fn generate_from_dummy_photo(&self, result_dir: &Path, dummy_photo: &Path) -> CardOutcome {
        if let Err(err) = self.place_stylized_photo(result_dir, dummy_photo).await {
            return failed_before_start(err);
        }
        self.generate(result_dir).await
    }

    /// Entry for a finished transformation job whose output is at `stylized`.
    pub async fn generate_from_transformation(&self, result_dir: &Path, stylized: &Path) -> CardOutcome {
        if stylized.parent() != Some(result_dir) {
            if let Err(err) = self.place_stylized_photo(result_dir, stylized).await {
                return failed_before_start(err);
            }
        }
        self.generate(result_dir).await
    }

    /// Copy `source` into `result_dir` under the stylized photo name.
    async fn place_stylized_photo(&self, result_dir: &Path, source: &Path) -> Result<PathBuf, CardError> {
        let datetime = session_key(result_dir)?;
        let target = result_dir.join(format!("{STYLIZED_PREFIX}{datetime}.png"));
        tokio::fs::copy(source, &target).await.map_err(|err| {
            CardError::validation(format!(
                "Failed to copy {} into session: {}",
                source.display(),
                err
            ))
        })?;
        Ok(target)
    }

    async fn run_pipeline(&self, result_dir: &Path) -> Result<PathBuf, CardError> {
        let datetime = session_key(result_dir)?;
        let result = load_result(result_dir).await?;

        let photo = find_stylized_photo(result_dir, &datetime)
            .await
            .ok_or_else(|| {
                CardError::validation(format!(
                    "No stylized photo ({STYLIZED_PREFIX}*) found in {}",
                    result_dir.display()
                ))
            })?;

        let config = self.builder.build(&result, &datetime);
        let validation = self.builder.validate(&config).await;
        if !validation.valid {
            return Err(CardError::validation(format!(
                "Composition resources missing: {}",
                validation.errors.join("; ")
            )));
        }

        let script_file = script::generate(&config, &photo, result_dir)
            .await
            .map_err(|err| CardError::validation(err.to_string()))?;
        let script_check = script::validate(&script_file).await;
        if !script_check.valid {
            return Err(CardError::validation(
                script_check
                    .error
                    .unwrap_or_else(|| "Generated script is invalid".to_string()),
            ));
        }

        let execution = self.executor.run(&script_file).await;
        if !execution.success {
            let classified = classify_error(&execution.stderr);
            let kind = if execution.timed_out {
                CardErrorKind::ToolTimeout
            } else {
                CardErrorKind::ToolInvocationFailure
            };
            return Err(CardError {
                kind,
                tool_error: Some(classified.kind),
                message: format!(
                    "{} (exit code {}): {}",
                    classified.message,
                    execution.exit_code,
                    execution.stderr.trim()
                ),
                details: Some(classified.details),
            });
        }

        let output_path = result_dir.join(&config.output_filename);
        match tokio::fs::metadata(&output_path).await {
            Ok(metadata) if metadata.is_file() && metadata.len() > 0 => Ok(output_path),
            _ => Err(CardError {
                kind: CardErrorKind::OutputMissing,
                tool_error: None,
                message: format!(
                    "Raster tool reported success but {} is missing or empty",
                    output_path.display()
                ),
                details: (!execution.stderr.is_empty()).then(|| execution.stderr.clone()),
            }),
        }
    }
}

fn failed_before_start(err: CardError) -> CardOutcome {
    metrics::counter!("memorial_cards_failed").increment(1);
    error!(kind = %err.kind, error = %err.message, "Memorial card generation failed");
    CardOutcome {
        success: false,
        output_path: None,
        error: Some(err),
        duration_ms: 0,
    }
}

/// Session key of a result directory (its final path component).
fn session_key(result_dir: &Path) -> Result<String, CardError> {
    result_dir
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            CardError::validation(format!(
                "Result directory {} has no session name",
                result_dir.display()
            ))
        })
}

async fn load_result(result_dir: &Path) -> Result<GameResult, CardError> {
    let path = result_dir.join(RESULT_FILENAME);
    let raw = tokio::fs::read_to_string(&path).await.map_err(|err| {
        CardError::validation(format!("Failed to read {}: {}", path.display(), err))
    })?;
    serde_json::from_str(&raw).map_err(|err| {
        CardError::validation(format!("Failed to parse {}: {}", path.display(), err))
    })
}

/// Find the stylized photo for a session, preferring `photo_anime_<datetime>.png`
/// over other `photo_anime_*` images (e.g. server-numbered outputs).
pub async fn find_stylized_photo(result_dir: &Path, datetime: &str) -> Option<PathBuf> {
    let exact = result_dir.join(format!("{STYLIZED_PREFIX}{datetime}.png"));
    if tokio::fs::metadata(&exact).await.is_ok_and(|m| m.is_file()) {
        return Some(exact);
    }

    let mut entries = tokio::fs::read_dir(result_dir).await.ok()?;
    let mut candidates = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
        if name.starts_with(STYLIZED_PREFIX) && is_image && is_file {
            candidates.push(path);
        }
    }
    candidates.sort();
    candidates.into_iter().next()
}
