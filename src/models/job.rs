use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Status of a generation job. Persisted as an integer code; transitions are
/// unidirectional except the explicit requeue path (Failed/Running -> Queued)
/// used for retry and quota-exhaustion recovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn code(self) -> i64 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Completed => 2,
            JobStatus::Failed => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(JobStatus::Queued),
            1 => Some(JobStatus::Running),
            2 => Some(JobStatus::Completed),
            3 => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Kind of generation job. Each kind has its own executor, output bound and
/// remote-operation timeout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Image,
    Video,
}

impl JobKind {
    /// Upper bound on recorded output locators for one job.
    pub fn max_outputs(self) -> usize {
        match self {
            JobKind::Image => 4,
            JobKind::Video => 1,
        }
    }
}

/// Failure classification, persisted as SCREAMING_SNAKE_CASE strings.
///
/// Only the transient classes are eligible for automatic retry; a remote-side
/// outcome (generation failed, quota) is surfaced for manual handling instead.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    WebInteractionFailed,
    TaskIdNotObtained,
    GenerationFailed,
    QuotaExhausted,
    OtherError,
}

impl FailureKind {
    /// Whether this class may be retried automatically.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::WebInteractionFailed | FailureKind::TaskIdNotObtained
        )
    }
}

/// Kind-specific generation parameters. Opaque to the orchestration core;
/// interpreted only by the UI action script.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobParams {
    /// Model name as shown in the remote UI (e.g. "Image 3.1").
    #[serde(default)]
    pub model: Option<String>,

    /// Aspect ratio (e.g. "16:9").
    #[serde(default)]
    pub ratio: Option<String>,

    /// Resolution / quality label (e.g. "1K", "1080p").
    #[serde(default)]
    pub resolution: Option<String>,

    /// Video duration (e.g. "5s", "10s"). Unused for image jobs.
    #[serde(default)]
    pub duration: Option<String>,
}

/// One generation request tracked through Queued -> Running -> Completed/Failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: i64,
    pub kind: JobKind,
    pub prompt: String,
    /// Reference-input locators (uploaded alongside the prompt), 0..N.
    pub input_refs: Vec<String>,
    pub params: JobParams,
    pub status: JobStatus,
    /// Assigned account. Null while Queued except during the claim that
    /// immediately precedes dispatch; set while Running.
    pub account_id: Option<i64>,
    /// Identifier assigned by the remote system once it acknowledges the
    /// submission. Absent before submission.
    pub remote_id: Option<String>,
    pub output_refs: Vec<String>,
    pub retry_count: i32,
    pub max_retry: i32,
    pub failure_kind: Option<FailureKind>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationJob {
    /// Whether this job is eligible for an automatic requeue: it must have
    /// failed with a transient class and still have retry budget left.
    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed
            && self.retry_count < self.max_retry
            && self.failure_kind.is_some_and(FailureKind::is_retryable)
    }
}

/// Fields supplied by the caller when enqueueing a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub prompt: String,
    pub input_refs: Vec<String>,
    pub params: JobParams,
    pub max_retry: i32,
}

impl NewJob {
    pub fn new(kind: JobKind, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            prompt: prompt.into(),
            input_refs: Vec::new(),
            params: JobParams::default(),
            max_retry: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_job(kind: FailureKind, retry_count: i32) -> GenerationJob {
        GenerationJob {
            id: 1,
            kind: JobKind::Image,
            prompt: "a lighthouse at dusk".to_string(),
            input_refs: vec![],
            params: JobParams::default(),
            status: JobStatus::Failed,
            account_id: None,
            remote_id: None,
            output_refs: vec![],
            retry_count,
            max_retry: 10,
            failure_kind: Some(kind),
            error_message: Some("boom".to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn status_codes_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(JobStatus::from_code(7), None);
    }

    #[test]
    fn failure_kind_persists_as_screaming_snake() {
        assert_eq!(
            FailureKind::WebInteractionFailed.to_string(),
            "WEB_INTERACTION_FAILED"
        );
        assert_eq!(
            "TASK_ID_NOT_OBTAINED".parse::<FailureKind>().ok(),
            Some(FailureKind::TaskIdNotObtained)
        );
    }

    #[test]
    fn transient_classes_are_retryable() {
        assert!(failed_job(FailureKind::WebInteractionFailed, 0).can_retry());
        assert!(failed_job(FailureKind::TaskIdNotObtained, 9).can_retry());
        assert!(!failed_job(FailureKind::GenerationFailed, 0).can_retry());
        assert!(!failed_job(FailureKind::QuotaExhausted, 0).can_retry());
        assert!(!failed_job(FailureKind::OtherError, 0).can_retry());
    }

    #[test]
    fn retry_budget_is_bounded() {
        assert!(!failed_job(FailureKind::WebInteractionFailed, 10).can_retry());

        let mut job = failed_job(FailureKind::WebInteractionFailed, 3);
        job.status = JobStatus::Running;
        assert!(!job.can_retry());
    }
}
