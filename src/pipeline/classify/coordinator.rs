use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::Instrument;

use super::{
    parse_response, ClassificationError, ClassificationRequest, ClassificationResult,
    ClassifierBackend, RetryPolicy,
};
use crate::config::{
    CLASSIFICATION_SAMPLE_CHARS, DEFAULT_CLASSIFICATION_TIMEOUT_SECS,
    DEFAULT_CLASSIFICATION_WORKERS,
};
use crate::models::{ExtractedRecord, RecordKind};
use crate::pipeline::stage::{ConcurrencyError, ConcurrentStageRunner};

/// Phrases left in content by an earlier failed processing step.
pub const PRIOR_FAILURE_INDICATORS: &[&str] = &[
    "处理失败",
    "无法处理",
    "不可用",
    "失败",
    "错误",
    "error",
    "failed",
    "unavailable",
    "图片URL无效",
    "文件不存在",
    "权限不足",
    "多模态API返回内容为空",
];

/// Indicators found in `text`, case-insensitively.
pub fn prior_failure_indicators(text: &str) -> Vec<&'static str> {
    let lower = text.to_lowercase();
    PRIOR_FAILURE_INDICATORS
        .iter()
        .copied()
        .filter(|indicator| lower.contains(&indicator.to_lowercase()))
        .collect()
}

/// Leading `CLASSIFICATION_SAMPLE_CHARS` characters.
pub fn content_sample(text: &str) -> String {
    text.chars().take(CLASSIFICATION_SAMPLE_CHARS).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationStats {
    /// Records sent to the classifier.
    pub requested: usize,
    /// Records that ended with a domain category.
    pub classified: usize,
    pub catch_all: usize,
    pub attempts: u32,
    pub peak_in_flight: usize,
    pub elapsed_ms: u64,
}

/// Runs the classifier over extracted records on its own bounded pool.
#[derive(Clone)]
pub struct ClassificationCoordinator {
    backend: Option<Arc<dyn ClassifierBackend>>,
    policy: RetryPolicy,
    concurrency: usize,
    attempt_timeout: Duration,
}

impl ClassificationCoordinator {
    pub fn new(
        backend: Option<Arc<dyn ClassifierBackend>>,
        concurrency: usize,
    ) -> Result<Self, ConcurrencyError> {
        if concurrency == 0 {
            return Err(ConcurrencyError {
                stage: "classification",
                value: concurrency,
            });
        }
        Ok(Self {
            backend,
            policy: RetryPolicy::default(),
            concurrency,
            attempt_timeout: Duration::from_secs(DEFAULT_CLASSIFICATION_TIMEOUT_SECS),
        })
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Upper bound for a single classifier call.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Set `category`, `exam_date` and `classification_note` on every record.
    ///
    /// Records that cannot carry a meaningful category (failed or empty
    /// extraction, archive summaries, prior-failure content) get the catch-all
    /// without a classifier call.
    pub async fn classify_records(&self, records: &mut [ExtractedRecord]) -> ClassificationStats {
        let start = Instant::now();
        let mut results: HashMap<uuid::Uuid, ClassificationResult> = HashMap::new();
        let mut requests = Vec::new();

        for record in records.iter() {
            match self.precheck(record) {
                Some(result) => {
                    results.insert(record.record_id, result);
                }
                None => requests.push(ClassificationRequest {
                    record_id: record.record_id,
                    file_name: record.display_name.clone(),
                    sample_text: content_sample(record.content_text.as_deref().unwrap_or_default()),
                }),
            }
        }

        let mut stats = ClassificationStats {
            requested: requests.len(),
            ..Default::default()
        };

        if !requests.is_empty() {
            let fallback_ids: Vec<_> = requests.iter().map(|r| r.record_id).collect();
            let runner = match ConcurrentStageRunner::new("classification", self.concurrency) {
                Ok(runner) => runner,
                Err(e) => {
                    tracing::error!(error = %e, "Classification pool unavailable");
                    for id in fallback_ids {
                        results.insert(id, ClassificationResult::catch_all(id, e.to_string(), 0));
                    }
                    return self.apply(records, results, stats, start);
                }
            };
            let this = self.clone();
            let outputs = runner
                .run(requests, move |_, request: ClassificationRequest| {
                    let this = this.clone();
                    async move { this.classify_one(request).await }
                })
                .await;
            stats.peak_in_flight = runner.peak_in_flight();

            for output in outputs {
                let result = match output.result {
                    Ok(result) => result,
                    Err(e) => {
                        let Some(id) = fallback_ids.get(output.index).copied() else {
                            continue;
                        };
                        tracing::error!(record_id = %id, error = %e, "Classification worker failed");
                        ClassificationResult::catch_all(id, format!("classification worker failed: {e}"), 0)
                    }
                };
                stats.attempts += result.attempts;
                results.insert(result.record_id, result);
            }
        }

        self.apply(records, results, stats, start)
    }

    fn apply(
        &self,
        records: &mut [ExtractedRecord],
        mut results: HashMap<uuid::Uuid, ClassificationResult>,
        mut stats: ClassificationStats,
        start: Instant,
    ) -> ClassificationStats {
        for record in records.iter_mut() {
            let result = results
                .remove(&record.record_id)
                .unwrap_or_else(|| ClassificationResult::catch_all(record.record_id, "not classified", 0));
            if result.category.is_catch_all() {
                stats.catch_all += 1;
            } else {
                stats.classified += 1;
            }
            record.category = Some(result.category);
            record.exam_date = result.exam_date;
            record.classification_note = result.note;
        }

        stats.elapsed_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            requested = stats.requested,
            classified = stats.classified,
            catch_all = stats.catch_all,
            attempts = stats.attempts,
            elapsed_ms = stats.elapsed_ms,
            "Classification stage complete"
        );
        stats
    }

    /// Catch-all result for records that are never sent to the classifier.
    fn precheck(&self, record: &ExtractedRecord) -> Option<ClassificationResult> {
        let id = record.record_id;
        if matches!(record.kind, RecordKind::ArchiveSummary | RecordKind::DuplicateArchive) {
            return Some(ClassificationResult::catch_all(id, "archive container", 0));
        }
        if !record.is_success() {
            return Some(ClassificationResult::catch_all(
                id,
                format!("extraction status is {}", record.extraction_status),
                0,
            ));
        }
        let content = record.content_text.as_deref().unwrap_or_default();
        if content.trim().is_empty() {
            return Some(ClassificationResult::catch_all(id, "no content", 0));
        }
        let indicators = prior_failure_indicators(content);
        if !indicators.is_empty() {
            tracing::warn!(
                file = %record.display_name,
                indicators = ?indicators,
                "Content reports an earlier processing failure"
            );
            return Some(ClassificationResult::catch_all(
                id,
                format!("content reports a processing failure: {}", indicators.join(", ")),
                0,
            ));
        }
        if self.backend.is_none() {
            return Some(ClassificationResult::catch_all(id, "no classifier configured", 0));
        }
        None
    }

    /// Classify one sample, retrying per policy. Always returns a result.
    pub async fn classify_one(&self, request: ClassificationRequest) -> ClassificationResult {
        let Some(backend) = self.backend.clone() else {
            return ClassificationResult::catch_all(request.record_id, "no classifier configured", 0);
        };
        let span = tracing::info_span!(
            "classify",
            file = %request.file_name,
            record_id = %request.record_id
        );
        self.attempt_loop(backend.as_ref(), &request).instrument(span).await
    }

    async fn attempt_loop(
        &self,
        backend: &dyn ClassifierBackend,
        request: &ClassificationRequest,
    ) -> ClassificationResult {
        let max_attempts = self.policy.attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            tracing::info!(attempt, max_attempts, "Classification attempt");
            let started = Instant::now();

            let outcome = match tokio::time::timeout(self.attempt_timeout, backend.classify(request)).await {
                Ok(Ok(raw)) => parse_response(&raw),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ClassificationError::Timeout {
                    secs: self.attempt_timeout.as_secs(),
                }),
            };

            match outcome {
                Ok(parsed) => {
                    tracing::info!(
                        attempt,
                        category = %parsed.category,
                        exam_date = ?parsed.exam_date,
                        elapsed_ms = %started.elapsed().as_millis(),
                        "Classified"
                    );
                    return ClassificationResult {
                        record_id: request.record_id,
                        category: parsed.category,
                        exam_date: parsed.exam_date,
                        note: parsed.note,
                        attempts: attempt,
                    };
                }
                Err(e) if self.policy.should_retry(&e, attempt) => {
                    tracing::warn!(attempt, max_attempts, error = %e, "Classification attempt failed, retrying");
                }
                Err(e) => {
                    tracing::error!(attempt, error = %e, "Classification gave up, using catch-all");
                    return ClassificationResult::catch_all(
                        request.record_id,
                        format!("classification failed after {attempt} attempt(s): {e}"),
                        attempt,
                    );
                }
            }
        }
    }
}

impl Default for ClassificationCoordinator {
    fn default() -> Self {
        Self {
            backend: None,
            policy: RetryPolicy::default(),
            concurrency: DEFAULT_CLASSIFICATION_WORKERS,
            attempt_timeout: Duration::from_secs(DEFAULT_CLASSIFICATION_TIMEOUT_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, ExtractionStatus, Lineage, Ordinal};
    use crate::pipeline::classify::{MockClassifier, RetryTrigger};

    fn record(name: &str, text: &str) -> ExtractedRecord {
        let mut r = ExtractedRecord::new(RecordKind::Document, name, "txt", Ordinal::root(0), Lineage::default());
        r.set_content(text.to_string());
        r
    }

    fn coordinator(mock: Arc<MockClassifier>) -> ClassificationCoordinator {
        ClassificationCoordinator::new(Some(mock), 4).unwrap()
    }

    #[test]
    fn zero_concurrency_rejected() {
        assert!(ClassificationCoordinator::new(None, 0).is_err());
    }

    #[test]
    fn indicators_match_case_insensitively() {
        assert_eq!(prior_failure_indicators("Upload FAILED"), vec!["failed"]);
        assert_eq!(prior_failure_indicators("图片处理失败"), vec!["处理失败", "失败"]);
        assert!(prior_failure_indicators("Hemoglobin 132 g/L").is_empty());
    }

    #[test]
    fn sample_is_char_bounded() {
        let text = "血".repeat(CLASSIFICATION_SAMPLE_CHARS + 10);
        assert_eq!(content_sample(&text).chars().count(), CLASSIFICATION_SAMPLE_CHARS);
    }

    #[tokio::test]
    async fn classifies_success_records() {
        let mock = Arc::new(MockClassifier::new(vec![Ok(
            r#"{"category": "lab_report", "exam_date": "2024-05-02", "note": ""}"#.into(),
        )]));
        let mut records = vec![record("cbc.txt", "WBC 6.1 x10^9/L")];

        let stats = coordinator(mock.clone()).classify_records(&mut records).await;
        assert_eq!(records[0].category, Some(Category::LabReport));
        assert_eq!(records[0].exam_date, chrono::NaiveDate::from_ymd_opt(2024, 5, 2));
        assert_eq!(stats.classified, 1);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn retries_shape_errors_then_succeeds() {
        let mock = Arc::new(MockClassifier::new(vec![
            Ok(String::new()),
            Ok(r#"{"category": "pathology_report""#.into()),
            Ok(r#"{"category": "pathology_report", "exam_date": null}"#.into()),
        ]));
        let mut records = vec![record("biopsy.txt", "Specimen: gastric mucosa")];

        let stats = coordinator(mock.clone()).classify_records(&mut records).await;
        assert_eq!(records[0].category, Some(Category::PathologyReport));
        assert_eq!(mock.calls(), 3);
        assert_eq!(stats.attempts, 3);
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts_with_catch_all() {
        let mock = Arc::new(MockClassifier::new(vec![Ok("not json".into())]));
        let mut records = vec![record("a.txt", "Some clinical text")];

        coordinator(mock.clone()).classify_records(&mut records).await;
        assert_eq!(mock.calls(), 3);
        assert_eq!(records[0].category, Some(Category::Other));
        assert!(records[0].exam_date.is_none());
        assert!(records[0].classification_note.as_deref().unwrap().contains("3 attempt"));
    }

    #[tokio::test]
    async fn unknown_category_does_not_retry() {
        let mock = Arc::new(MockClassifier::new(vec![Ok(r#"{"category": "invoice"}"#.into())]));
        let mut records = vec![record("bill.txt", "Total due 120")];

        coordinator(mock.clone()).classify_records(&mut records).await;
        assert_eq!(mock.calls(), 1);
        assert_eq!(records[0].category, Some(Category::Other));
    }

    #[tokio::test]
    async fn non_retryable_trigger_stops_immediately() {
        let mock = Arc::new(MockClassifier::new(vec![Err(ClassificationError::Transport(
            "connection refused".into(),
        ))]));
        let c = coordinator(mock.clone()).with_policy(RetryPolicy {
            max_attempts: 3,
            retry_on: vec![RetryTrigger::EmptyBody],
        });
        let mut records = vec![record("a.txt", "text")];
        c.classify_records(&mut records).await;
        assert_eq!(mock.calls(), 1);
        assert_eq!(records[0].category, Some(Category::Other));
    }

    #[tokio::test]
    async fn slow_backend_times_out_per_attempt() {
        let mock = Arc::new(
            MockClassifier::answering(Category::Prescription).with_delay(Duration::from_millis(200)),
        );
        let c = coordinator(mock.clone()).with_attempt_timeout(Duration::from_millis(10));
        let mut records = vec![record("rx.txt", "Amoxicillin 500mg")];

        c.classify_records(&mut records).await;
        assert_eq!(mock.calls(), 3);
        assert_eq!(records[0].category, Some(Category::Other));
        assert!(records[0].classification_note.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn skipped_records_still_get_catch_all() {
        let mock = Arc::new(MockClassifier::answering(Category::LabReport));
        let mut failed = record("broken.docx", "");
        failed.extraction_status = ExtractionStatus::Failed;
        let mut summary = record("case.zip", "Archive: case.zip");
        summary.kind = RecordKind::ArchiveSummary;
        let noisy = record("scan.png", "multimodal call failed");
        let mut records = vec![failed, summary, noisy, record("ok.txt", "Glucose 5.2")];

        let stats = coordinator(mock.clone()).classify_records(&mut records).await;
        assert_eq!(mock.calls(), 1);
        assert_eq!(stats.requested, 1);
        assert!(records.iter().all(|r| r.category.is_some()));
        assert_eq!(records[3].category, Some(Category::LabReport));
        assert_eq!(stats.catch_all, 3);
    }

    #[tokio::test]
    async fn missing_classifier_is_catch_all_with_note() {
        let mut records = vec![record("a.txt", "Blood pressure 120/80")];
        let stats = ClassificationCoordinator::default().classify_records(&mut records).await;
        assert_eq!(records[0].category, Some(Category::Other));
        assert_eq!(records[0].classification_note.as_deref(), Some("no classifier configured"));
        assert_eq!(stats.requested, 0);
    }

    #[tokio::test]
    async fn concurrency_ceiling_respected() {
        let mock = Arc::new(
            MockClassifier::answering(Category::NursingRecord).with_delay(Duration::from_millis(5)),
        );
        let c = ClassificationCoordinator::new(Some(mock), 3).unwrap();
        let mut records: Vec<_> = (0..12).map(|i| record(&format!("n{i}.txt"), "Vitals stable")).collect();

        let stats = c.classify_records(&mut records).await;
        assert!(stats.peak_in_flight <= 3);
        assert_eq!(stats.classified, 12);
    }
}
