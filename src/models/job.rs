use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum::Display;
use uuid::Uuid;

/// Format of a session datetime key, e.g. `20250816_172354`.
pub const DATETIME_KEY_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Lifecycle status of a transformation job.
///
/// Transitions run `Queued -> Processing -> {Completed | Error}` and are only
/// originated by the worker; the host façade mirrors them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

/// One request to stylize a captured photo via the remote service.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    /// Session key; also the name of the session's result directory.
    pub datetime: String,
    /// Base64 photo, taken by the worker at upload time.
    pub image_data: Option<String>,
    pub result_dir: PathBuf,
    /// Name assigned by the remote server to an earlier pre-upload.
    pub pre_uploaded_filename: Option<String>,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
}

impl Job {
    pub fn new(datetime: impl Into<String>, result_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            datetime: datetime.into(),
            image_data: None,
            result_dir: result_dir.into(),
            pre_uploaded_filename: None,
            status: JobStatus::Queued,
            start_time: Utc::now(),
        }
    }

    pub fn with_image_data(mut self, image_base64: impl Into<String>) -> Self {
        self.image_data = Some(image_base64.into());
        self
    }

    pub fn with_pre_uploaded(mut self, filename: Option<String>) -> Self {
        self.pre_uploaded_filename = filename;
        self
    }

    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.start_time).num_milliseconds().max(0) as u64
    }
}

/// Read-only view of a job for status queries (no image payload).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub datetime: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
}

/// Snapshot returned by the worker's status query.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerStatus {
    pub queue_length: usize,
    pub queued: Vec<JobSummary>,
    pub active: Vec<JobSummary>,
    pub max_concurrent_jobs: usize,
    pub is_processing: bool,
}

/// Whether `key` is a well-formed `YYYYMMDD_HHMMSS` session key.
pub fn is_datetime_key(key: &str) -> bool {
    key.len() == 15 && NaiveDateTime::parse_from_str(key, DATETIME_KEY_FORMAT).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datetime_key_validation() {
        assert!(is_datetime_key("20250816_172354"));
        assert!(!is_datetime_key("2025-08-16 17:23:54"));
        assert!(!is_datetime_key("20251316_172354"));
        assert!(!is_datetime_key("../etc"));
        assert!(!is_datetime_key(""));
    }

    #[test]
    fn test_new_job_starts_queued() {
        let job = Job::new("20250816_172354", "/tmp/results/20250816_172354")
            .with_image_data("aGVsbG8=");
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.image_data.is_some());
        assert!(job.pre_uploaded_filename.is_none());
        assert!(!job.status.is_terminal());
    }

    #[test]
    fn test_status_display_matches_serde() {
        assert_eq!(JobStatus::Processing.to_string(), "processing");
        assert_eq!(
            serde_json::to_string(&JobStatus::Completed).unwrap(),
            "\"completed\""
        );
    }
}
