//! Regenerate memorial cards missing from earlier sessions.
//!
//! A session needs recovery when its directory holds `result.json` but no
//! `memorial_card_<datetime>.png`. Cards are regenerated one at a time
//! through the regular [`MemorialCardService::generate`] pipeline.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::models::job::is_datetime_key;
use crate::services::composition::output_filename;
use crate::services::memorial_card::{MemorialCardService, RESULT_FILENAME};

/// A session directory without a card.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingCard {
    pub datetime: String,
    pub result_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryFailure {
    pub datetime: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub missing: usize,
    pub generated: Vec<String>,
    pub failed: Vec<RecoveryFailure>,
    pub dry_run: bool,
}

/// List sessions under `results_dir` that have a result but no card, oldest first.
pub async fn find_missing_cards(results_dir: &Path) -> std::io::Result<Vec<MissingCard>> {
    let mut entries = tokio::fs::read_dir(results_dir).await?;
    let mut missing = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let Some(datetime) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !is_datetime_key(&datetime) {
            continue;
        }

        let result_dir = entry.path();
        let has_result = tokio::fs::try_exists(result_dir.join(RESULT_FILENAME)).await?;
        let has_card = tokio::fs::try_exists(result_dir.join(output_filename(&datetime))).await?;
        if has_result && !has_card {
            missing.push(MissingCard { datetime, result_dir });
        }
    }

    missing.sort_by(|a, b| a.datetime.cmp(&b.datetime));
    Ok(missing)
}

/// Regenerate every missing card; with `dry_run` only report what is missing.
pub async fn recover_missing_cards(
    service: &MemorialCardService,
    results_dir: &Path,
    dry_run: bool,
) -> std::io::Result<RecoveryReport> {
    let missing = find_missing_cards(results_dir).await?;
    let mut report = RecoveryReport {
        missing: missing.len(),
        dry_run,
        ..RecoveryReport::default()
    };
    info!(results_dir = %results_dir.display(), missing = missing.len(), dry_run, "Scanned for missing memorial cards");

    if dry_run {
        return Ok(report);
    }

    for session in missing {
        let outcome = service.generate(&session.result_dir).await;
        match outcome.error {
            None if outcome.success => report.generated.push(session.datetime),
            error => {
                let error = error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "unknown failure".to_string());
                warn!(datetime = %session.datetime, error = %error, "Card recovery failed");
                report.failed.push(RecoveryFailure {
                    datetime: session.datetime,
                    error,
                });
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_finds_sessions_with_result_but_no_card() {
        let root = tempfile::tempdir().unwrap();
        let session = |name: &str| {
            let dir = root.path().join(name);
            std::fs::create_dir_all(&dir).unwrap();
            dir
        };

        let needs_card = session("20250816_172354");
        std::fs::write(needs_card.join("result.json"), "{}").unwrap();

        let done = session("20250816_120000");
        std::fs::write(done.join("result.json"), "{}").unwrap();
        std::fs::write(done.join("memorial_card_20250816_120000.png"), b"png").unwrap();

        session("20250816_130000");
        let stray = session("not_a_session");
        std::fs::write(stray.join("result.json"), "{}").unwrap();
        std::fs::write(root.path().join("20250816_140000"), b"file, not dir").unwrap();

        let missing = find_missing_cards(root.path()).await.unwrap();
        assert_eq!(
            missing,
            vec![MissingCard {
                datetime: "20250816_172354".to_string(),
                result_dir: needs_card,
            }]
        );
    }

    #[tokio::test]
    async fn test_dry_run_generates_nothing() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("20250816_172354");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("result.json"), "{}").unwrap();

        let service = MemorialCardService::from_config(&crate::config::MemorialCardConfig {
            enabled: true,
            magick_binary: "/nonexistent/magick".to_string(),
            tool_timeout: std::time::Duration::from_secs(1),
            backgrounds_dir: root.path().to_path_buf(),
            font_path: root.path().join("font.ttf"),
            dummy_photo_path: root.path().join("dummy.png"),
        });

        let report = recover_missing_cards(&service, root.path(), true).await.unwrap();
        assert_eq!(report.missing, 1);
        assert!(report.generated.is_empty() && report.failed.is_empty());

        let report = recover_missing_cards(&service, root.path(), false).await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].datetime, "20250816_172354");
    }
}
