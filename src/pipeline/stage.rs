//! Bounded-concurrency executor shared by the extraction, archive and
//! classification stages.
//!
//! Every stage invocation builds its own runner, so a worker may start a
//! nested runner (archive recursion) without competing for the outer permits.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid concurrency for stage '{stage}': {value} (must be at least 1)")]
pub struct ConcurrencyError {
    pub stage: &'static str,
    pub value: usize,
}

/// Failure of a single work item. Never aborts the stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("Worker for item {index} panicked: {message}")]
    Panicked { index: usize, message: String },
}

/// Result of one work item, tagged with its input position.
#[derive(Debug)]
pub struct StageOutput<T> {
    pub index: usize,
    pub result: Result<T, StageError>,
}

/// Runs at most `limit` workers at once and collects results in completion order.
#[derive(Debug)]
pub struct ConcurrentStageRunner {
    stage: &'static str,
    limit: usize,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrentStageRunner {
    pub fn new(stage: &'static str, limit: usize) -> Result<Self, ConcurrencyError> {
        if limit == 0 {
            return Err(ConcurrencyError { stage, value: limit });
        }
        Ok(Self {
            stage,
            limit,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Highest number of workers observed running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Run `worker` over every item. A panicking worker yields
    /// `StageError::Panicked` for its item; the others are unaffected.
    pub async fn run<I, T, F, Fut>(&self, items: Vec<I>, worker: F) -> Vec<StageOutput<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(usize, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let total = items.len();
        let start = std::time::Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.limit));
        let worker = Arc::new(worker);
        let mut set = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let worker = worker.clone();
            let in_flight = self.in_flight.clone();
            let peak = self.peak.clone();

            set.spawn(async move {
                let _permit = permit;
                let _guard = InFlightGuard::enter(in_flight, &peak);
                let outcome = AssertUnwindSafe(worker(index, item)).catch_unwind().await;
                (index, outcome.map_err(|payload| panic_message(payload.as_ref())))
            });
        }

        let mut outputs = Vec::with_capacity(total);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(value))) => outputs.push(StageOutput {
                    index,
                    result: Ok(value),
                }),
                Ok((index, Err(message))) => {
                    tracing::error!(stage = self.stage, index, error = %message, "Stage worker panicked");
                    outputs.push(StageOutput {
                        index,
                        result: Err(StageError::Panicked { index, message }),
                    });
                }
                Err(e) => {
                    tracing::error!(stage = self.stage, error = %e, "Stage task failed to join");
                }
            }
        }

        tracing::debug!(
            stage = self.stage,
            items = total,
            limit = self.limit,
            peak = self.peak_in_flight(),
            elapsed_ms = %start.elapsed().as_millis(),
            "Stage complete"
        );
        outputs
    }
}

struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl InFlightGuard {
    fn enter(counter: Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
