//! Batch orchestration: partitions entities into bounded chunks and runs them on the blocking pool.

use super::domain::EntityId;
use super::pivot::RowStatus;
use super::windows::Strictness;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub size: usize,
    pub workers: usize,
    /// Releases the worker slot of a batch running longer than this. The blocking thread
    /// itself cannot be interrupted and finishes in the background.
    pub timeout: Option<Duration>,
    pub strictness: Strictness,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            size: DEFAULT_BATCH_SIZE,
            workers: DEFAULT_WORKERS,
            timeout: None,
            strictness: Strictness::Lenient,
        }
    }
}

/// Cooperative cancellation, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchInput {
    pub index: usize,
    pub entities: Vec<EntityId>,
}

/// One unit of batch work. Implementations own everything a batch reads.
pub trait BatchProcessor: Send + Sync + 'static {
    type Output: Send + 'static;
    type Error: fmt::Display + Send + 'static;

    fn process(&self, batch: &BatchInput) -> Result<Self::Output, Self::Error>;

    /// Output standing in for a batch that did not complete.
    fn placeholder(&self, batch: &BatchInput, status: RowStatus) -> Self::Output;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum BatchFailureReason {
    Error(String),
    Panicked(String),
    TimedOut { ms: u64 },
}

impl fmt::Display for BatchFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchFailureReason::Error(message) => write!(f, "error: {message}"),
            BatchFailureReason::Panicked(message) => write!(f, "panicked: {message}"),
            BatchFailureReason::TimedOut { ms } => write!(f, "timed out after {ms}ms"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("batch {index} ({entities} entities) failed: {reason}")]
pub struct BatchFailure {
    pub index: usize,
    pub entities: usize,
    pub reason: BatchFailureReason,
}

/// Per-batch outputs in batch-index order, one per batch whatever its fate.
#[derive(Debug)]
pub struct BatchOutcome<O> {
    pub outputs: Vec<O>,
    pub failures: Vec<BatchFailure>,
    pub cancelled: Vec<usize>,
}

pub struct BatchOrchestrator {
    options: BatchOptions,
    cancel: CancelFlag,
}

impl BatchOrchestrator {
    pub fn new(options: BatchOptions, cancel: CancelFlag) -> Self {
        Self { options, cancel }
    }

    /// Contiguous chunks of the sorted, deduplicated entity universe.
    pub fn partition(&self, entities: &[EntityId]) -> Vec<BatchInput> {
        let mut universe = entities.to_vec();
        universe.sort();
        universe.dedup();

        universe
            .chunks(self.options.size.max(1))
            .enumerate()
            .map(|(index, chunk)| BatchInput {
                index,
                entities: chunk.to_vec(),
            })
            .collect()
    }

    pub async fn run<P: BatchProcessor>(
        &self,
        processor: Arc<P>,
        entities: &[EntityId],
    ) -> Result<BatchOutcome<P::Output>, BatchFailure> {
        let batches = self.partition(entities);
        let semaphore = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let halt = CancelFlag::default();
        let strict = self.options.strictness == Strictness::Strict;

        info!(
            batches = batches.len(),
            entities = batches.iter().map(|batch| batch.entities.len()).sum::<usize>(),
            workers = self.options.workers,
            "starting batch run"
        );

        let mut scheduled: Vec<Option<JoinHandle<Result<P::Output, BatchFailure>>>> =
            Vec::with_capacity(batches.len());
        for batch in &batches {
            if self.cancel.is_cancelled() || halt.is_cancelled() {
                scheduled.push(None);
                continue;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                scheduled.push(None);
                continue;
            };
            if self.cancel.is_cancelled() || halt.is_cancelled() {
                scheduled.push(None);
                continue;
            }

            let processor = Arc::clone(&processor);
            let batch = batch.clone();
            let timeout = self.options.timeout;
            let halt = halt.clone();
            scheduled.push(Some(tokio::spawn(async move {
                let _permit = permit;
                let result = execute(processor, batch, timeout).await;
                if result.is_err() && strict {
                    halt.cancel();
                }
                result
            })));
        }

        let mut outcome = BatchOutcome {
            outputs: Vec::with_capacity(batches.len()),
            failures: Vec::new(),
            cancelled: Vec::new(),
        };

        for (batch, handle) in batches.iter().zip(scheduled) {
            let Some(handle) = handle else {
                outcome.cancelled.push(batch.index);
                outcome
                    .outputs
                    .push(processor.placeholder(batch, RowStatus::Cancelled));
                continue;
            };

            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => Err(BatchFailure {
                    index: batch.index,
                    entities: batch.entities.len(),
                    reason: BatchFailureReason::Panicked(join_error.to_string()),
                }),
            };

            match result {
                Ok(output) => outcome.outputs.push(output),
                Err(failure) if strict => return Err(failure),
                Err(failure) => {
                    warn!(batch = batch.index, error = %failure, "skipping failed batch");
                    outcome
                        .outputs
                        .push(processor.placeholder(batch, RowStatus::BatchFailed));
                    outcome.failures.push(failure);
                }
            }
        }

        info!(
            completed = outcome.outputs.len() - outcome.failures.len() - outcome.cancelled.len(),
            failed = outcome.failures.len(),
            cancelled = outcome.cancelled.len(),
            "batch run finished"
        );

        Ok(outcome)
    }
}

async fn execute<P: BatchProcessor>(
    processor: Arc<P>,
    batch: BatchInput,
    timeout: Option<Duration>,
) -> Result<P::Output, BatchFailure> {
    let index = batch.index;
    let entities = batch.entities.len();
    let failure = |reason| BatchFailure {
        index,
        entities,
        reason,
    };

    debug!(batch = index, entities, "batch started");
    let handle = tokio::task::spawn_blocking(move || processor.process(&batch));

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, handle).await {
            Ok(joined) => joined,
            Err(_) => {
                return Err(failure(BatchFailureReason::TimedOut {
                    ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                }))
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(Ok(output)) => {
            debug!(batch = index, "batch completed");
            Ok(output)
        }
        Ok(Err(error)) => Err(failure(BatchFailureReason::Error(error.to_string()))),
        Err(join_error) if join_error.is_panic() => Err(failure(BatchFailureReason::Panicked(
            panic_message(join_error.into_panic()),
        ))),
        Err(join_error) => Err(failure(BatchFailureReason::Error(join_error.to_string()))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "batch panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting {
        panic_on: Option<usize>,
        fail_on: Option<usize>,
        sleep_on: Option<usize>,
    }

    impl Counting {
        fn healthy() -> Self {
            Self {
                panic_on: None,
                fail_on: None,
                sleep_on: None,
            }
        }
    }

    impl BatchProcessor for Counting {
        type Output = (usize, Vec<String>, RowStatus);
        type Error = String;

        fn process(&self, batch: &BatchInput) -> Result<Self::Output, Self::Error> {
            if self.panic_on == Some(batch.index) {
                panic!("boom in batch {}", batch.index);
            }
            if self.fail_on == Some(batch.index) {
                return Err("source unreadable".to_string());
            }
            if self.sleep_on == Some(batch.index) {
                std::thread::sleep(Duration::from_millis(300));
            }
            Ok((
                batch.index,
                batch.entities.iter().map(ToString::to_string).collect(),
                RowStatus::Complete,
            ))
        }

        fn placeholder(&self, batch: &BatchInput, status: RowStatus) -> Self::Output {
            (
                batch.index,
                batch.entities.iter().map(ToString::to_string).collect(),
                status,
            )
        }
    }

    fn entities(count: usize) -> Vec<EntityId> {
        (0..count)
            .map(|n| EntityId(format!("E{n:03}")))
            .collect()
    }

    fn orchestrator(size: usize, strictness: Strictness) -> BatchOrchestrator {
        BatchOrchestrator::new(
            BatchOptions {
                size,
                workers: 3,
                timeout: Some(Duration::from_millis(50)),
                strictness,
            },
            CancelFlag::default(),
        )
    }

    #[test]
    fn partition_sorts_and_dedups_the_universe() {
        let mut input = entities(5);
        input.reverse();
        input.push(EntityId::from("E000"));
        let batches = orchestrator(2, Strictness::Lenient).partition(&input);

        assert_eq!(batches.len(), 3);
        assert_eq!(
            batches[0].entities,
            vec![EntityId::from("E000"), EntityId::from("E001")]
        );
        assert_eq!(batches[2].entities, vec![EntityId::from("E004")]);
    }

    #[tokio::test]
    async fn outputs_are_concatenated_in_batch_order() {
        let outcome = orchestrator(3, Strictness::Lenient)
            .run(Arc::new(Counting::healthy()), &entities(10))
            .await
            .expect("run succeeds");

        let indices: Vec<_> = outcome.outputs.iter().map(|output| output.0).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        let flattened: Vec<_> = outcome
            .outputs
            .iter()
            .flat_map(|output| output.1.clone())
            .collect();
        assert_eq!(flattened.len(), 10);
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn panicking_batch_is_skipped_in_lenient_mode() {
        let processor = Counting {
            panic_on: Some(1),
            ..Counting::healthy()
        };
        let outcome = orchestrator(2, Strictness::Lenient)
            .run(Arc::new(processor), &entities(6))
            .await
            .expect("lenient run succeeds");

        assert_eq!(outcome.outputs.len(), 3);
        assert_eq!(outcome.outputs[1].2, RowStatus::BatchFailed);
        assert_eq!(outcome.failures.len(), 1);
        assert!(matches!(
            &outcome.failures[0].reason,
            BatchFailureReason::Panicked(message) if message.contains("boom in batch 1")
        ));
    }

    #[tokio::test]
    async fn strict_mode_propagates_batch_errors() {
        let processor = Counting {
            fail_on: Some(0),
            ..Counting::healthy()
        };
        let failure = orchestrator(2, Strictness::Strict)
            .run(Arc::new(processor), &entities(6))
            .await
            .expect_err("strict run fails");

        assert_eq!(failure.index, 0);
        assert_eq!(
            failure.reason,
            BatchFailureReason::Error("source unreadable".to_string())
        );
    }

    #[tokio::test]
    async fn slow_batches_time_out() {
        let processor = Counting {
            sleep_on: Some(0),
            ..Counting::healthy()
        };
        let outcome = orchestrator(4, Strictness::Lenient)
            .run(Arc::new(processor), &entities(8))
            .await
            .expect("lenient run succeeds");

        assert_eq!(outcome.outputs[0].2, RowStatus::BatchFailed);
        assert_eq!(outcome.outputs[1].2, RowStatus::Complete);
        assert_eq!(
            outcome.failures[0].reason,
            BatchFailureReason::TimedOut { ms: 50 }
        );
    }

    #[tokio::test]
    async fn cancelled_runs_report_unstarted_batches() {
        let cancel = CancelFlag::default();
        cancel.cancel();
        let orchestrator = BatchOrchestrator::new(
            BatchOptions {
                size: 2,
                ..BatchOptions::default()
            },
            cancel,
        );

        let outcome = orchestrator
            .run(Arc::new(Counting::healthy()), &entities(4))
            .await
            .expect("cancelled run still reports");

        assert_eq!(outcome.cancelled, vec![0, 1]);
        assert!(outcome
            .outputs
            .iter()
            .all(|output| output.2 == RowStatus::Cancelled));
    }
}
