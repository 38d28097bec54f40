//! Test fixtures: session data, card assets and a node-graph template

#![allow(dead_code)]

use arcade_memorial::models::game_result::GameResult;
use serde_json::{json, Value};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const SESSION: &str = "20250816_172354";
pub const NEXT_SESSION: &str = "20250816_173010";

pub fn sample_result() -> GameResult {
    GameResult {
        nickname: "Taro".to_string(),
        rank: "初心者".to_string(),
        level: None,
        score: 120,
        timestamp_jst: "2025-08-16 17:23:54".to_string(),
        photo: None,
    }
}

/// A small valid PNG.
pub fn tiny_png() -> Vec<u8> {
    png_of(4, [200, 120, 40])
}

/// A different, slightly larger PNG.
pub fn other_png() -> Vec<u8> {
    png_of(16, [20, 60, 220])
}

fn png_of(side: u32, color: [u8; 3]) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(side, side, image::Rgb(color));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .expect("encode png");
    bytes
}

pub fn tiny_png_base64() -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(tiny_png())
}

pub fn other_png_base64() -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(other_png())
}

/// Minimal stylization graph: load, sample, save on node 9.
pub fn workflow_template() -> Value {
    json!({
        "3": {"class_type": "KSampler", "inputs": {"seed": 1, "steps": 20}},
        "9": {"class_type": "SaveImage", "inputs": {"filename_prefix": "template", "images": ["8", 0]}},
        "10": {"class_type": "LoadImage", "inputs": {"image": "template.png"}}
    })
}

/// Backgrounds, font, dummy photo and a results directory in one temp tree.
pub struct CardAssets {
    pub root: TempDir,
    pub results_dir: PathBuf,
    pub backgrounds_dir: PathBuf,
    pub font_path: PathBuf,
    pub dummy_photo: PathBuf,
    pub workflow_template: PathBuf,
}

impl CardAssets {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("temp dir");
        let results_dir = root.path().join("results");
        let backgrounds_dir = root.path().join("memorial_cards");
        std::fs::create_dir_all(&results_dir).unwrap();
        std::fs::create_dir_all(&backgrounds_dir).unwrap();

        for name in [
            "card_01_beginner.png",
            "card_02_apprentice.png",
            "card_05_expert.png",
            "card_08_god.png",
        ] {
            std::fs::write(backgrounds_dir.join(name), tiny_png()).unwrap();
        }

        let font_path = root.path().join("font.ttf");
        std::fs::write(&font_path, b"not really a font").unwrap();

        let dummy_photo = root.path().join("dummy_photo.png");
        std::fs::write(&dummy_photo, tiny_png()).unwrap();

        let template_path = root.path().join("image_generate.json");
        std::fs::write(
            &template_path,
            serde_json::to_vec_pretty(&workflow_template()).unwrap(),
        )
        .unwrap();

        Self {
            root,
            results_dir,
            backgrounds_dir,
            font_path,
            dummy_photo,
            workflow_template: template_path,
        }
    }

    /// Create a session directory with `result.json`, optionally with the
    /// stylized photo already in place.
    pub fn session(&self, datetime: &str, with_stylized_photo: bool) -> PathBuf {
        let dir = self.results_dir.join(datetime);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("result.json"),
            serde_json::to_vec(&sample_result()).unwrap(),
        )
        .unwrap();
        if with_stylized_photo {
            std::fs::write(dir.join(format!("photo_anime_{datetime}.png")), tiny_png()).unwrap();
        }
        dir
    }
}

pub fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
