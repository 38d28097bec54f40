//! Memorial card layout: background by rank, photo placement and the fixed
//! text template.

use std::path::{Path, PathBuf};

use crate::models::composition::{CompositionConfig, Placement, Stroke, TextElement};
use crate::models::game_result::GameResult;

/// Background image per rank label, lowest tier first.
const RANK_BACKGROUNDS: [(&str, &str); 8] = [
    ("初心者", "card_01_beginner.png"),
    ("見習い", "card_02_apprentice.png"),
    ("一人前", "card_03_competent.png"),
    ("熟練者", "card_04_skilled.png"),
    ("達人", "card_05_expert.png"),
    ("名人", "card_06_master.png"),
    ("伝説", "card_07_legend.png"),
    ("神", "card_08_god.png"),
];

const PHOTO_PLACEMENT: Placement = Placement { x: 120, y: 180, width: 720, height: 720 };

const TEXT_X: i32 = 900;

/// Background file name for `rank`; unknown ranks get the lowest tier.
pub fn background_for_rank(rank: &str) -> &'static str {
    RANK_BACKGROUNDS
        .iter()
        .find(|(label, _)| *label == rank.trim())
        .map(|(_, file)| *file)
        .unwrap_or(RANK_BACKGROUNDS[0].1)
}

/// Truncate `YYYY-MM-DD HH:MM:SS` to minute precision; anything else passes through.
///
/// Only the shape is checked, not the calendar, so the seconds are dropped
/// from whatever the game recorded.
pub fn format_timestamp(timestamp: &str) -> String {
    const SHAPE: &[u8; 19] = b"0000-00-00 00:00:00";

    let trimmed = timestamp.trim();
    let matches_shape = trimmed.len() == SHAPE.len()
        && trimmed.bytes().zip(SHAPE.iter()).all(|(byte, expected)| match expected {
            b'0' => byte.is_ascii_digit(),
            separator => byte == *separator,
        });
    if matches_shape {
        trimmed[..16].to_string()
    } else {
        timestamp.to_string()
    }
}

/// Output file name of the card for a session.
pub fn output_filename(datetime: &str) -> String {
    format!("memorial_card_{datetime}.png")
}

/// Result of checking a composition against the filesystem.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositionValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Builds [`CompositionConfig`]s from game results.
#[derive(Debug, Clone)]
pub struct CompositionBuilder {
    backgrounds_dir: PathBuf,
    font_path: PathBuf,
}

impl CompositionBuilder {
    pub fn new(backgrounds_dir: impl Into<PathBuf>, font_path: impl Into<PathBuf>) -> Self {
        Self {
            backgrounds_dir: backgrounds_dir.into(),
            font_path: font_path.into(),
        }
    }

    pub fn build(&self, result: &GameResult, datetime: &str) -> CompositionConfig {
        let outline = Some(Stroke { color: "#000000".to_string(), width: 4 });

        let texts = vec![
            TextElement {
                text: result.nickname.clone(),
                x: TEXT_X,
                y: 200,
                size: 96,
                color: "#FFFFFF".to_string(),
                bold: true,
                stroke: outline.clone(),
            },
            TextElement {
                text: result.rank.clone(),
                x: TEXT_X,
                y: 360,
                size: 72,
                color: "#FFD700".to_string(),
                bold: true,
                stroke: outline,
            },
            TextElement {
                text: format!("SCORE {}", result.score),
                x: TEXT_X,
                y: 500,
                size: 64,
                color: "#FFFFFF".to_string(),
                bold: false,
                stroke: None,
            },
            TextElement {
                text: format_timestamp(&result.timestamp_jst),
                x: TEXT_X,
                y: 820,
                size: 40,
                color: "#CCCCCC".to_string(),
                bold: false,
                stroke: None,
            },
        ];

        CompositionConfig {
            datetime: datetime.to_string(),
            background_path: self.backgrounds_dir.join(background_for_rank(&result.rank)),
            font_path: self.font_path.clone(),
            foreground: PHOTO_PLACEMENT,
            texts,
            output_filename: output_filename(datetime),
        }
    }

    /// Check the resources `config` refers to. Hits the filesystem every call.
    pub async fn validate(&self, config: &CompositionConfig) -> CompositionValidation {
        let mut errors = Vec::new();

        if !is_file(&config.background_path).await {
            errors.push(format!(
                "Background image not found: {}",
                config.background_path.display()
            ));
        }
        if !is_file(&config.font_path).await {
            errors.push(format!("Font not found: {}", config.font_path.display()));
        }
        if config.texts.is_empty() {
            errors.push("No text elements to draw".to_string());
        }

        CompositionValidation {
            valid: errors.is_empty(),
            errors,
        }
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
