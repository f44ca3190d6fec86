//! Batch coordinator: fans a set of entities out to the orchestrator in parallel.
//!
//! Per-entity results are independent. One failure never cancels or rolls back
//! its siblings, and progress is `completed / total` in arrival order.

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info};

use crate::error::SheetResult;
use crate::orchestrator::{view_inputs, DispatchOutcome, Orchestrator, Phase, Progress};
use crate::sheet::{EntityKey, EntityStore};

/// Kind of work requested for every entity in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOperation {
    Regenerate,
    Upscale,
}

impl BatchOperation {
    fn phase(&self) -> Phase {
        match self {
            BatchOperation::Regenerate => Phase::Regenerating,
            BatchOperation::Upscale => Phase::Upscaling,
        }
    }
}

/// Aggregated outcome of one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub requested: usize,
    pub dispatched: usize,
    /// Filtered out before dispatch: busy, unknown, or nothing to work on.
    pub skipped: Vec<EntityKey>,
    pub succeeded: Vec<EntityKey>,
    pub failed: Vec<(EntityKey, String)>,
    /// Parts cleared because no sources resolved.
    pub empty: Vec<EntityKey>,
    /// Results discarded in favor of a newer request.
    pub superseded: Vec<EntityKey>,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty() && self.superseded.is_empty()
    }

    fn record(&mut self, key: EntityKey, outcome: SheetResult<DispatchOutcome>) {
        match outcome {
            Ok(DispatchOutcome::Completed) => self.succeeded.push(key),
            Ok(DispatchOutcome::Failed(reason)) => self.failed.push((key, reason)),
            Ok(DispatchOutcome::Skipped) => self.skipped.push(key),
            Ok(DispatchOutcome::Superseded) => self.superseded.push(key),
            Ok(DispatchOutcome::NoSources) => self.empty.push(key),
            Err(e) => self.failed.push((key, e.to_string())),
        }
    }

    fn sort(&mut self) {
        self.skipped.sort();
        self.succeeded.sort();
        self.failed.sort_by(|a, b| a.0.cmp(&b.0));
        self.empty.sort();
        self.superseded.sort();
    }
}

/// Parallel dispatcher over an [`Orchestrator`].
pub struct BatchCoordinator {
    orchestrator: Orchestrator,
}

impl BatchCoordinator {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    /// Regenerates every idle view with a source and every idle known part.
    pub async fn batch_regenerate(&self, keys: Vec<EntityKey>) -> BatchReport {
        self.run(keys, BatchOperation::Regenerate, BatchOperation::Regenerate.phase())
            .await
    }

    /// Upscales every idle entity that has an image to upscale.
    pub async fn batch_upscale(&self, keys: Vec<EntityKey>) -> BatchReport {
        self.run(keys, BatchOperation::Upscale, BatchOperation::Upscale.phase())
            .await
    }

    pub(crate) async fn run(
        &self,
        keys: Vec<EntityKey>,
        operation: BatchOperation,
        phase: Phase,
    ) -> BatchReport {
        let mut report = BatchReport {
            requested: keys.len(),
            ..BatchReport::default()
        };

        let mut eligible = Vec::with_capacity(keys.len());
        self.orchestrator.read(|store| {
            for key in keys {
                if eligible.contains(&key) {
                    continue;
                }
                if is_eligible(store, &key, operation) {
                    eligible.push(key);
                } else {
                    debug!(entity = %key, ?operation, "filtered out of batch");
                    report.skipped.push(key);
                }
            }
        });

        let total = eligible.len();
        report.dispatched = total;
        info!(?operation, total, skipped = report.skipped.len(), "dispatching batch");
        self.orchestrator
            .report_progress(Progress::counted(phase, 0, total));

        let mut pending: FuturesUnordered<_> = eligible
            .into_iter()
            .map(|key| async move {
                let outcome = self.dispatch(&key, operation).await;
                (key, outcome)
            })
            .collect();

        let mut completed = 0;
        while let Some((key, outcome)) = pending.next().await {
            completed += 1;
            self.orchestrator
                .report_progress(Progress::counted(phase, completed, total));
            report.record(key, outcome);
        }

        self.orchestrator
            .report_progress(Progress::counted(Phase::Idle, total, total));
        report.sort();
        info!(
            ?operation,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "batch finished"
        );
        report
    }

    async fn dispatch(&self, key: &EntityKey, operation: BatchOperation) -> SheetResult<DispatchOutcome> {
        match (operation, key) {
            (BatchOperation::Regenerate, EntityKey::View(kind)) => {
                self.orchestrator.regenerate_view(*kind).await
            }
            (BatchOperation::Regenerate, EntityKey::Part(part)) => {
                self.orchestrator.generate_part(part).await
            }
            (BatchOperation::Upscale, EntityKey::View(kind)) => {
                self.orchestrator.upscale_view(*kind).await
            }
            (BatchOperation::Upscale, EntityKey::Part(part)) => {
                self.orchestrator.upscale_part(part).await
            }
        }
    }
}

fn is_eligible(store: &EntityStore, key: &EntityKey, operation: BatchOperation) -> bool {
    if !store.is_idle(key) {
        return false;
    }
    match (operation, key) {
        (BatchOperation::Regenerate, EntityKey::View(kind)) => view_inputs(store, *kind).is_some(),
        (BatchOperation::Regenerate, EntityKey::Part(part)) => store.part(part).is_some(),
        (BatchOperation::Upscale, EntityKey::View(kind)) => store.view(*kind).original_image.is_some(),
        (BatchOperation::Upscale, EntityKey::Part(part)) => {
            store.part(part).map_or(false, |sheet| sheet.img_url.is_some())
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
