//! Raster tool script generation.
//!
//! Produces the plain-text `-script` file the raster tool executes to compose a
//! memorial card: background, stylized photo, then one block of directives per
//! text element, ending with a write of the output image.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::models::composition::{CompositionConfig, TextElement};

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Failed to write script {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of checking a generated script on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptValidation {
    pub valid: bool,
    pub error: Option<String>,
}

impl ScriptValidation {
    fn ok() -> Self {
        Self { valid: true, error: None }
    }

    fn invalid(error: String) -> Self {
        Self { valid: false, error: Some(error) }
    }
}

/// File name of the script for a session.
pub fn script_filename(datetime: &str) -> String {
    format!("magick_script_{datetime}.txt")
}

/// Escape text for a single-quoted `-draw` string nested in double quotes.
///
/// Backslash goes first so the escapes added for quotes are not doubled.
pub fn escape_text(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('"', "\\\"")
}

/// Absolute, forward-slash form of a path as embedded in scripts.
pub fn script_path(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    absolute.to_string_lossy().replace('\\', "/")
}

fn quoted_path(path: &Path) -> String {
    format!("\"{}\"", script_path(path).replace('"', "\\\""))
}

/// Render the script text for `config`.
pub fn render(config: &CompositionConfig, foreground: &Path, output_path: &Path) -> String {
    let mut script = String::new();

    let _ = writeln!(script, "{}", quoted_path(&config.background_path));
    let _ = writeln!(
        script,
        "{} -geometry {} -composite",
        quoted_path(foreground),
        config.foreground.geometry()
    );
    let _ = writeln!(script, "-font {}", quoted_path(&config.font_path));

    for element in &config.texts {
        render_text(&mut script, element);
    }

    let _ = writeln!(script, "-write {}", quoted_path(output_path));
    let _ = writeln!(script, "-exit");
    script
}

fn render_text(script: &mut String, element: &TextElement) {
    let _ = writeln!(script, "-pointsize {}", element.size);
    let _ = writeln!(script, "-fill \"{}\"", element.color);
    match &element.stroke {
        Some(stroke) => {
            let _ = writeln!(script, "-stroke \"{}\"", stroke.color);
            let _ = writeln!(script, "-strokewidth {}", stroke.width);
        }
        None => {
            let _ = writeln!(script, "-stroke none");
        }
    }
    let _ = writeln!(script, "-weight {}", if element.bold { "Bold" } else { "Normal" });
    let _ = writeln!(script, "-gravity NorthWest");
    let _ = writeln!(
        script,
        "-draw \"text {},{} '{}'\"",
        element.x,
        element.y,
        escape_text(&element.text)
    );
}

/// Write the script for `config` into `output_dir` and return its path.
///
/// The card itself is written by the tool to `output_dir/<output_filename>`.
pub async fn generate(
    config: &CompositionConfig,
    foreground: &Path,
    output_dir: &Path,
) -> Result<PathBuf, ScriptError> {
    let script_file = output_dir.join(script_filename(&config.datetime));
    let output_path = output_dir.join(&config.output_filename);
    let contents = render(config, foreground, &output_path);

    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|source| ScriptError::Write {
            path: output_dir.to_path_buf(),
            source,
        })?;
    tokio::fs::write(&script_file, contents)
        .await
        .map_err(|source| ScriptError::Write {
            path: script_file.clone(),
            source,
        })?;

    tracing::debug!(
        datetime = %config.datetime,
        script = %script_file.display(),
        "Generated compositing script"
    );
    Ok(script_file)
}

/// Check that the script exists, is a regular file and is non-empty.
pub async fn validate(script_file: &Path) -> ScriptValidation {
    let metadata = match tokio::fs::metadata(script_file).await {
        Ok(metadata) => metadata,
        Err(err) => {
            return ScriptValidation::invalid(format!(
                "Script file {} is not readable: {}",
                script_file.display(),
                err
            ))
        }
    };

    if !metadata.is_file() {
        return ScriptValidation::invalid(format!(
            "Script path {} is not a regular file",
            script_file.display()
        ));
    }
    if metadata.len() == 0 {
        return ScriptValidation::invalid(format!(
            "Script file {} is empty",
            script_file.display()
        ));
    }
    ScriptValidation::ok()
}
