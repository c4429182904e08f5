//! Set reconciliation between the live platform and the replica.
//!
//! Only presence is compared: an id missing from the replica is written, an
//! id missing from the live set is marked inactive. Attribute changes on ids
//! present on both sides are left to update events and full passes.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::concurrency::ShutdownSignal;
use crate::error::{Result, StoreError, SyncError};
use crate::metadata::SyncMetadataStore;
use crate::persistence::ReplicaStore;
use crate::types::{Entity, EntityId, EntityKind};

/// Result of comparing two id sets. Both lists are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileDiff {
    /// Live but not in the replica
    pub missing: Vec<EntityId>,
    /// In the replica but no longer live
    pub orphaned: Vec<EntityId>,
}

impl ReconcileDiff {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.orphaned.is_empty()
    }
}

/// Pure set difference of live ids against replica ids
pub fn diff(live_ids: &HashSet<EntityId>, replica_ids: &HashSet<EntityId>) -> ReconcileDiff {
    let mut missing: Vec<EntityId> = live_ids.difference(replica_ids).cloned().collect();
    let mut orphaned: Vec<EntityId> = replica_ids.difference(live_ids).cloned().collect();
    missing.sort();
    orphaned.sort();
    ReconcileDiff { missing, orphaned }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub kind: EntityKind,
    pub live: usize,
    pub diff: ReconcileDiff,
    pub upserted: usize,
    /// Already replicated entities rewritten because the plan asked for it
    pub refreshed: usize,
    pub deactivated: usize,
    /// Live ids left untouched this pass
    pub held: usize,
    pub failed: usize,
}

impl ReconcileReport {
    fn new(kind: EntityKind, live: usize, diff: ReconcileDiff) -> Self {
        Self {
            kind,
            live,
            diff,
            upserted: 0,
            refreshed: 0,
            deactivated: 0,
            held: 0,
            failed: 0,
        }
    }
}

/// What a reconciliation may write beyond the missing ids.
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    /// Rewrite every live entity, not only the missing ones
    pub rewrite_all: bool,
    /// Ids present on both sides that are rewritten anyway
    pub refresh: HashSet<EntityId>,
    /// Ids known to be live that must be neither written nor deactivated
    pub held: Vec<EntityId>,
}

impl ReconcilePlan {
    pub fn rewrite_all() -> Self {
        Self {
            rewrite_all: true,
            ..Self::default()
        }
    }
}

/// Applies reconciliation diffs in batches.
#[derive(Clone)]
pub struct EntityReconciler {
    store: Arc<dyn ReplicaStore>,
    metadata: SyncMetadataStore,
    batch_size: usize,
    batch_delay: Duration,
    shutdown: ShutdownSignal,
}

impl EntityReconciler {
    pub fn new(
        store: Arc<dyn ReplicaStore>,
        metadata: SyncMetadataStore,
        batch_size: usize,
        batch_delay: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            store,
            metadata,
            batch_size: batch_size.max(1),
            batch_delay,
            shutdown,
        }
    }

    /// Incremental reconciliation: write what is missing, deactivate orphans.
    pub async fn reconcile(
        &self,
        scope_id: &str,
        kind: EntityKind,
        live: Vec<Entity>,
    ) -> Result<ReconcileReport> {
        self.reconcile_with(scope_id, kind, live, ReconcilePlan::default())
            .await
    }

    /// Full-pass variant: every live entity is rewritten, orphans deactivated.
    pub async fn replace(
        &self,
        scope_id: &str,
        kind: EntityKind,
        live: Vec<Entity>,
    ) -> Result<ReconcileReport> {
        self.reconcile_with(scope_id, kind, live, ReconcilePlan::rewrite_all())
            .await
    }

    /// Reconcile `live` against the replica following `plan`.
    ///
    /// The kind is marked healthy only after every write has been attempted.
    /// Shutdown during the batches returns [`SyncError::ShuttingDown`] and
    /// leaves the metadata as it was.
    pub async fn reconcile_with(
        &self,
        scope_id: &str,
        kind: EntityKind,
        live: Vec<Entity>,
        plan: ReconcilePlan,
    ) -> Result<ReconcileReport> {
        let replica_ids = self.store.get_ids(scope_id, kind).await?;
        let mut live_ids: HashSet<EntityId> = live.iter().map(Entity::id).collect();
        live_ids.extend(plan.held.iter().cloned());
        let diff = diff(&live_ids, &replica_ids);
        let live_count = live_ids.len();

        let (to_write, to_refresh) = if plan.rewrite_all {
            (live, Vec::new())
        } else {
            let missing: HashSet<&EntityId> = diff.missing.iter().collect();
            let mut to_write = Vec::new();
            let mut to_refresh = Vec::new();
            for entity in live {
                let id = entity.id();
                if missing.contains(&id) {
                    to_write.push(entity);
                } else if plan.refresh.contains(&id) {
                    to_refresh.push(entity);
                }
            }
            (to_write, to_refresh)
        };
        let orphaned = diff.orphaned.clone();
        let mut report = ReconcileReport::new(kind, live_count, diff);
        report.held = plan.held.len();

        if to_write.is_empty() && to_refresh.is_empty() && orphaned.is_empty() && !plan.rewrite_all {
            debug!(scope_id, %kind, live = live_count, "Replica already matches live set");
        }

        let (written, write_failures) = self.write_batches(&to_write).await?;
        report.upserted = written;
        report.failed += write_failures;

        let (refreshed, refresh_failures) = self.write_batches(&to_refresh).await?;
        report.refreshed = refreshed;
        report.failed += refresh_failures;
        if refresh_failures > 0 {
            warn!(scope_id, %kind, failed = refresh_failures, "Some refreshed entities were not written");
        }

        let (deactivated, deactivate_failures) = self.deactivate_batches(kind, &orphaned).await?;
        report.deactivated = deactivated;
        report.failed += deactivate_failures;

        self.metadata
            .mark_healthy(scope_id, kind, live_count as u64, plan.rewrite_all)
            .await;

        if report.upserted > 0
            || report.refreshed > 0
            || report.deactivated > 0
            || report.held > 0
            || report.failed > 0
        {
            info!(
                scope_id,
                %kind,
                live = live_count,
                upserted = report.upserted,
                refreshed = report.refreshed,
                deactivated = report.deactivated,
                held = report.held,
                failed = report.failed,
                "Reconciled"
            );
        }
        Ok(report)
    }

    /// Pause between batches; `true` when shutdown means the loop must stop
    async fn interrupted(&self, index: usize) -> bool {
        if index > 0 && !self.shutdown.sleep(self.batch_delay).await {
            return true;
        }
        self.shutdown.is_shutting_down()
    }

    /// Bulk upsert in batches, falling back to single writes when a batch fails.
    /// Returns `(written, failed)`, or [`SyncError::ShuttingDown`] if shutdown
    /// stopped the loop before the last batch.
    pub async fn write_batches(&self, entities: &[Entity]) -> Result<(usize, usize)> {
        let mut written = 0;
        let mut failed = 0;

        for (index, batch) in entities.chunks(self.batch_size).enumerate() {
            if self.interrupted(index).await {
                debug!(written, remaining = entities.len() - index * self.batch_size, "Batch writes interrupted");
                return Err(SyncError::ShuttingDown);
            }

            match self.store.bulk_upsert(batch).await {
                Ok(count) => written += count,
                Err(StoreError::Closed) => return Err(StoreError::Closed.into()),
                Err(e) => {
                    warn!(size = batch.len(), error = %e, "Batch upsert failed, retrying one by one");
                    for entity in batch {
                        match self.store.upsert(entity).await {
                            Ok(()) => written += 1,
                            Err(StoreError::Closed) => return Err(StoreError::Closed.into()),
                            Err(e) => {
                                warn!(kind = %entity.kind(), id = %entity.id(), error = %e, "Upsert failed");
                                failed += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok((written, failed))
    }

    /// Mark ids inactive in batches, with the same single-write fallback and
    /// the same shutdown behaviour as [`Self::write_batches`].
    pub async fn deactivate_batches(
        &self,
        kind: EntityKind,
        ids: &[EntityId],
    ) -> Result<(usize, usize)> {
        let mut deactivated = 0;
        let mut failed = 0;

        for (index, batch) in ids.chunks(self.batch_size).enumerate() {
            if self.interrupted(index).await {
                debug!(%kind, deactivated, "Deactivation interrupted");
                return Err(SyncError::ShuttingDown);
            }

            match self.store.mark_inactive(kind, batch).await {
                Ok(count) => deactivated += count,
                Err(StoreError::Closed) => return Err(StoreError::Closed.into()),
                Err(e) => {
                    warn!(%kind, size = batch.len(), error = %e, "Batch deactivation failed, retrying one by one");
                    for id in batch {
                        match self.store.mark_inactive(kind, std::slice::from_ref(id)).await {
                            Ok(count) => deactivated += count,
                            Err(StoreError::Closed) => return Err(StoreError::Closed.into()),
                            Err(e) => {
                                warn!(%kind, id = %id, error = %e, "Deactivation failed");
                                failed += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok((deactivated, failed))
    }
}
