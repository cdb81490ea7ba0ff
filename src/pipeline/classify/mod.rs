//! Content classification through an external model, with retries.

pub mod coordinator;
pub mod prompt;
pub mod response;

pub use coordinator::*;
pub use prompt::*;
pub use response::*;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Category, ErrorKind, RecordError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassificationError {
    #[error("Classifier returned an empty response")]
    EmptyResponse,

    #[error("Classifier response does not end with a closing brace")]
    TruncatedJson,

    #[error("Classifier response is not valid JSON: {0}")]
    MalformedJson(String),

    #[error("Classifier call timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Classifier transport error: {0}")]
    Transport(String),
}

impl ClassificationError {
    pub fn trigger(&self) -> RetryTrigger {
        match self {
            Self::EmptyResponse => RetryTrigger::EmptyBody,
            Self::TruncatedJson => RetryTrigger::TruncatedJson,
            Self::MalformedJson(_) => RetryTrigger::ParseError,
            Self::Timeout { .. } => RetryTrigger::Timeout,
            Self::Transport(_) => RetryTrigger::Transport,
        }
    }
}

impl From<ClassificationError> for RecordError {
    fn from(e: ClassificationError) -> Self {
        RecordError::new(ErrorKind::Classification, e.to_string())
    }
}

/// Failure shapes that may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryTrigger {
    EmptyBody,
    TruncatedJson,
    ParseError,
    Timeout,
    Transport,
}

/// How often and on what a classification call is retried.
/// No delay between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_on: Vec<RetryTrigger>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_on: vec![
                RetryTrigger::EmptyBody,
                RetryTrigger::TruncatedJson,
                RetryTrigger::ParseError,
                RetryTrigger::Timeout,
                RetryTrigger::Transport,
            ],
        }
    }
}

impl RetryPolicy {
    /// Attempts actually made; zero is treated as one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether `error` after attempt number `attempt` (1-based) warrants another try.
    pub fn should_retry(&self, error: &ClassificationError, attempt: u32) -> bool {
        attempt < self.attempts() && self.retry_on.contains(&error.trigger())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationRequest {
    pub record_id: Uuid,
    pub file_name: String,
    /// Leading part of the record's content.
    pub sample_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassificationResult {
    pub record_id: Uuid,
    pub category: Category,
    pub exam_date: Option<NaiveDate>,
    pub note: Option<String>,
    /// Classifier calls made; zero when the record was never sent.
    pub attempts: u32,
}

impl ClassificationResult {
    pub fn catch_all(record_id: Uuid, note: impl Into<String>, attempts: u32) -> Self {
        Self {
            record_id,
            category: Category::Other,
            exam_date: None,
            note: Some(note.into()),
            attempts,
        }
    }
}

/// Content classification model. Returns the raw response body.
#[async_trait]
pub trait ClassifierBackend: Send + Sync {
    async fn classify(&self, request: &ClassificationRequest) -> Result<String, ClassificationError>;
}

// ── Mock for testing ──────────────────────────────────────

/// Replays scripted responses in order, then repeats the last one.
pub struct MockClassifier {
    script: Mutex<VecDeque<Result<String, ClassificationError>>>,
    last: Mutex<Option<Result<String, ClassificationError>>>,
    delay: Option<std::time::Duration>,
    calls: AtomicUsize,
}

impl MockClassifier {
    pub fn new(responses: Vec<Result<String, ClassificationError>>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            last: Mutex::new(None),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always answers `category` with no date.
    pub fn answering(category: Category) -> Self {
        Self::new(vec![Ok(format!(
            "{{\"category\": \"{}\", \"exam_date\": null, \"note\": \"\"}}",
            category.as_str()
        ))])
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassifierBackend for MockClassifier {
    async fn classify(&self, _request: &ClassificationRequest) -> Result<String, ClassificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();
        let mut last = self.last.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match next {
            Some(response) => {
                *last = Some(response.clone());
                response
            }
            None => last.clone().unwrap_or(Err(ClassificationError::EmptyResponse)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_retries_every_shape_three_times() {
        let policy = RetryPolicy::default();
        let err = ClassificationError::TruncatedJson;
        assert!(policy.should_retry(&err, 1));
        assert!(policy.should_retry(&err, 2));
        assert!(!policy.should_retry(&err, 3));
    }

    #[test]
    fn policy_honours_trigger_list() {
        let policy = RetryPolicy {
            max_attempts: 3,
            retry_on: vec![RetryTrigger::EmptyBody],
        };
        assert!(policy.should_retry(&ClassificationError::EmptyResponse, 1));
        assert!(!policy.should_retry(&ClassificationError::Timeout { secs: 5 }, 1));
    }

    #[test]
    fn zero_attempts_means_one() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(policy.attempts(), 1);
        assert!(!policy.should_retry(&ClassificationError::EmptyResponse, 1));
    }

    #[tokio::test]
    async fn mock_replays_then_repeats_last() {
        let mock = MockClassifier::new(vec![
            Err(ClassificationError::EmptyResponse),
            Ok("{}".into()),
        ]);
        let req = ClassificationRequest {
            record_id: Uuid::new_v4(),
            file_name: "a.txt".into(),
            sample_text: "x".into(),
        };
        assert!(mock.classify(&req).await.is_err());
        assert_eq!(mock.classify(&req).await.unwrap(), "{}");
        assert_eq!(mock.classify(&req).await.unwrap(), "{}");
        assert_eq!(mock.calls(), 3);
    }
}
