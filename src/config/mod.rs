use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Kiosk HTTP surface bind address (e.g., "127.0.0.1:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Parent directory of the per-session `YYYYMMDD_HHMMSS` result directories.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    /// Base URL of the remote image-generation server
    #[serde(default = "default_comfy_base_url")]
    pub comfy_base_url: String,

    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    #[serde(default = "default_upload_timeout_ms")]
    pub upload_timeout_ms: u64,

    /// Timeout for prompt submission.
    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,

    /// Overall per-job polling timeout.
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,

    /// Carried for compatibility with existing deployments; no automatic retry reads it.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Node-graph template rendered into each session's `image_generate.json`.
    #[serde(default = "default_workflow_template_path")]
    pub workflow_template_path: PathBuf,

    #[serde(default = "default_workflow_output_prefix")]
    pub workflow_output_prefix: String,

    /// Output node checked first when picking the generated image.
    #[serde(default = "default_final_save_node_id")]
    pub final_save_node_id: String,

    #[serde(default = "default_true")]
    pub memorial_card_enabled: bool,

    /// Raster tool executable (ImageMagick 7 `magick`).
    #[serde(default = "default_magick_binary")]
    pub magick_binary: String,

    #[serde(default = "default_magick_timeout_ms")]
    pub magick_timeout_ms: u64,

    #[serde(default = "default_card_backgrounds_dir")]
    pub card_backgrounds_dir: PathBuf,

    #[serde(default = "default_card_font_path")]
    pub card_font_path: PathBuf,

    /// Stand-in stylized photo used when the transformation pipeline is unavailable.
    #[serde(default = "default_dummy_photo_path")]
    pub dummy_photo_path: PathBuf,
}

/// Settings consumed by the transformation worker and its host façade.
#[derive(Debug, Clone)]
pub struct TransformConfig {
    pub base_url: String,
    pub polling_interval: Duration,
    pub max_concurrent_jobs: usize,
    pub upload_timeout: Duration,
    pub processing_timeout: Duration,
    pub job_timeout: Duration,
    pub retry: RetryConfig,
    pub final_save_node_id: String,
}

/// Retry shape accepted from configuration. Remote-call failures surface
/// immediately; re-submission is left to the orchestration layer.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub template_path: PathBuf,
    pub output_prefix: String,
}

#[derive(Debug, Clone)]
pub struct MemorialCardConfig {
    pub enabled: bool,
    pub magick_binary: String,
    pub tool_timeout: Duration,
    pub backgrounds_dir: PathBuf,
    pub font_path: PathBuf,
    pub dummy_photo_path: PathBuf,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            base_url: default_comfy_base_url(),
            polling_interval: Duration::from_millis(default_polling_interval_ms()),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            upload_timeout: Duration::from_millis(default_upload_timeout_ms()),
            processing_timeout: Duration::from_millis(default_processing_timeout_ms()),
            job_timeout: Duration::from_millis(default_job_timeout_ms()),
            retry: RetryConfig {
                max_attempts: default_retry_max_attempts(),
                delay: Duration::from_millis(default_retry_delay_ms()),
            },
            final_save_node_id: default_final_save_node_id(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_comfy_base_url() -> String {
    "http://127.0.0.1:8188".to_string()
}

fn default_polling_interval_ms() -> u64 {
    1000
}

fn default_max_concurrent_jobs() -> usize {
    1
}

fn default_upload_timeout_ms() -> u64 {
    30_000
}

fn default_processing_timeout_ms() -> u64 {
    60_000
}

fn default_job_timeout_ms() -> u64 {
    300_000
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_workflow_template_path() -> PathBuf {
    PathBuf::from("assets/workflows/image_generate.json")
}

fn default_workflow_output_prefix() -> String {
    "photo_anime".to_string()
}

fn default_final_save_node_id() -> String {
    "9".to_string()
}

fn default_true() -> bool {
    true
}

fn default_magick_binary() -> String {
    "magick".to_string()
}

fn default_magick_timeout_ms() -> u64 {
    30_000
}

fn default_card_backgrounds_dir() -> PathBuf {
    PathBuf::from("assets/memorial_cards")
}

fn default_card_font_path() -> PathBuf {
    PathBuf::from("assets/fonts/NotoSansJP-Bold.ttf")
}

fn default_dummy_photo_path() -> PathBuf {
    PathBuf::from("assets/dummy_photo.png")
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn transform(&self) -> TransformConfig {
        TransformConfig {
            base_url: self.comfy_base_url.trim_end_matches('/').to_string(),
            polling_interval: Duration::from_millis(self.polling_interval_ms),
            max_concurrent_jobs: self.max_concurrent_jobs.max(1),
            upload_timeout: Duration::from_millis(self.upload_timeout_ms),
            processing_timeout: Duration::from_millis(self.processing_timeout_ms),
            job_timeout: Duration::from_millis(self.job_timeout_ms),
            retry: RetryConfig {
                max_attempts: self.retry_max_attempts,
                delay: Duration::from_millis(self.retry_delay_ms),
            },
            final_save_node_id: self.final_save_node_id.clone(),
        }
    }

    pub fn workflow(&self) -> WorkflowConfig {
        WorkflowConfig {
            template_path: self.workflow_template_path.clone(),
            output_prefix: self.workflow_output_prefix.clone(),
        }
    }

    pub fn memorial_card(&self) -> MemorialCardConfig {
        MemorialCardConfig {
            enabled: self.memorial_card_enabled,
            magick_binary: self.magick_binary.clone(),
            tool_timeout: Duration::from_millis(self.magick_timeout_ms),
            backgrounds_dir: self.card_backgrounds_dir.clone(),
            font_path: self.card_font_path.clone(),
            dummy_photo_path: self.dummy_photo_path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_every_field() {
        let config: AppConfig = envy::from_iter(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:3000");
        assert_eq!(config.max_concurrent_jobs, 1);
        assert!(config.memorial_card_enabled);

        let transform = config.transform();
        assert_eq!(transform.polling_interval, Duration::from_secs(1));
        assert_eq!(transform.job_timeout, Duration::from_secs(300));
        assert_eq!(transform.final_save_node_id, "9");
    }

    #[test]
    fn test_env_overrides() {
        let vars = vec![
            ("COMFY_BASE_URL".to_string(), "http://gpu-box:8188/".to_string()),
            ("MAX_CONCURRENT_JOBS".to_string(), "0".to_string()),
            ("MEMORIAL_CARD_ENABLED".to_string(), "false".to_string()),
            ("MAGICK_TIMEOUT_MS".to_string(), "1500".to_string()),
        ];
        let config: AppConfig = envy::from_iter(vars).unwrap();

        let transform = config.transform();
        assert_eq!(transform.base_url, "http://gpu-box:8188");
        // zero would stall the queue forever
        assert_eq!(transform.max_concurrent_jobs, 1);

        let card = config.memorial_card();
        assert!(!card.enabled);
        assert_eq!(card.tool_timeout, Duration::from_millis(1500));
    }
}
