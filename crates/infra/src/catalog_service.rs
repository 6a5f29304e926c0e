//! Catalog replacement and the propagation hand-off.
//!
//! The catalog write and the outbox job that carries its propagation plan
//! commit together. Applying the plan to product rows happens afterwards:
//! once right away (best-effort) and otherwise by a [`PropagationWorker`].
//! A propagation failure is logged and never undoes the catalog write.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use stockroom_catalog::{AmbiguousRename, ArchetypeInput, Catalog, Reconciliation, reconcile};
use stockroom_core::{ArchetypeId, DomainError};

use crate::error::EngineError;
use crate::jobs::{JobId, JobRunOutcome, JobStore, PropagationJob, PropagationWorker, WorkerConfig};
use crate::store::{Store, StoreTx};

/// Where the product-row cascade stands right after `replace_catalog`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PropagationStatus {
    /// The new catalog implies no product edits.
    NotNeeded,
    Applied { edits: usize },
    /// Left in the outbox for a worker to retry.
    Deferred { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogReplaced {
    pub version: u64,
    pub job_id: Option<JobId>,
    /// Removed/added pairings that were not treated as renames.
    pub ambiguous: Vec<AmbiguousRename>,
    pub removed: Vec<ArchetypeId>,
    pub propagation: PropagationStatus,
}

pub struct CatalogService<S> {
    store: Arc<S>,
    worker: PropagationWorker<S>,
}

impl<S: Store + JobStore> CatalogService<S> {
    pub fn new(store: Arc<S>, worker: PropagationWorker<S>) -> Self {
        Self { store, worker }
    }

    pub fn with_config(store: Arc<S>, config: WorkerConfig) -> Self {
        let worker = PropagationWorker::new(store.clone(), config);
        Self::new(store, worker)
    }

    pub fn worker(&self) -> &PropagationWorker<S> {
        &self.worker
    }

    #[instrument(skip(self), err)]
    pub async fn catalog(&self) -> Result<Catalog, EngineError> {
        let mut tx = self.store.begin().await?;
        tx.load_catalog().await
    }

    /// Replace the whole catalog and cascade the implied edits onto products.
    #[instrument(skip(self, archetypes), fields(entries = archetypes.len()), err)]
    pub async fn replace_catalog(
        &self,
        archetypes: Vec<ArchetypeInput>,
    ) -> Result<CatalogReplaced, EngineError> {
        let mut tx = self.store.begin().await?;
        let current = tx.load_catalog().await?;
        let Reconciliation {
            catalog,
            plan,
            ambiguous,
            removed,
        } = reconcile(&current, archetypes)?;

        for entry in &ambiguous {
            warn!(
                subcategory = %entry.subcategory,
                condition = %entry.condition,
                removed = ?entry.removed,
                added = ?entry.added,
                "ambiguous rename left unresolved, entries treated as new archetypes"
            );
        }

        tx.save_catalog(&catalog).await?;
        let job_id = if plan.is_empty() {
            None
        } else {
            let job = PropagationJob::new(plan);
            tx.enqueue_job(&job).await?;
            Some(job.id)
        };
        tx.commit().await?;

        info!(
            version = catalog.version,
            archetypes = catalog.len(),
            removed = removed.len(),
            job_id = ?job_id,
            "catalog replaced"
        );

        let propagation = match job_id {
            Some(job_id) => self.propagate(job_id).await,
            None => PropagationStatus::NotNeeded,
        };

        Ok(CatalogReplaced {
            version: catalog.version,
            job_id,
            ambiguous,
            removed,
            propagation,
        })
    }

    async fn propagate(&self, job_id: JobId) -> PropagationStatus {
        let reason = match self.worker.attempt(job_id).await {
            Ok(Some(JobRunOutcome::Completed { edits, .. })) => {
                return PropagationStatus::Applied { edits };
            }
            Ok(Some(JobRunOutcome::Retrying { error, .. }))
            | Ok(Some(JobRunOutcome::DeadLettered { error, .. })) => error,
            Ok(None) => "queued behind an earlier catalog version or leased by a worker".to_string(),
            Err(err) => DomainError::propagation(err.to_string()).to_string(),
        };

        error!(
            job_id = %job_id,
            error = %reason,
            "catalog propagation deferred; catalog write kept"
        );
        PropagationStatus::Deferred { reason }
    }
}
