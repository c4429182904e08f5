//! Per-(scope, entity kind) sync health records.
//!
//! Metadata is a health signal, not a correctness ledger: writes are
//! fire-and-forget and a failure to record them never aborts the pass that
//! produced them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::persistence::ReplicaStore;
use crate::types::EntityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Healthy,
    Syncing,
    NeedsHealing,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Healthy => "healthy",
            SyncStatus::Syncing => "syncing",
            SyncStatus::NeedsHealing => "needs_healing",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(SyncStatus::Healthy),
            "syncing" => Ok(SyncStatus::Syncing),
            "needs_healing" => Ok(SyncStatus::NeedsHealing),
            other => Err(format!("unknown sync status: {}", other)),
        }
    }
}

/// Sync health of one entity kind within one scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub scope_id: String,
    pub kind: EntityKind,
    pub last_full_sync: Option<DateTime<Utc>>,
    pub last_check: DateTime<Utc>,
    pub entity_count: u64,
    pub status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update merged into an existing record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataUpdate {
    pub last_full_sync: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
    pub entity_count: Option<u64>,
    pub status: Option<SyncStatus>,
}

impl MetadataUpdate {
    pub fn status(status: SyncStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

impl SyncMetadata {
    /// Merge `update` into `existing` (or a fresh record), refreshing `updated_at`.
    pub fn merge(
        existing: Option<SyncMetadata>,
        scope_id: &str,
        kind: EntityKind,
        update: &MetadataUpdate,
        now: DateTime<Utc>,
    ) -> SyncMetadata {
        let mut record = existing.unwrap_or_else(|| SyncMetadata {
            scope_id: scope_id.to_string(),
            kind,
            last_full_sync: None,
            last_check: now,
            entity_count: 0,
            status: SyncStatus::Healthy,
            created_at: now,
            updated_at: now,
        });

        if let Some(at) = update.last_full_sync {
            record.last_full_sync = Some(at);
        }
        if let Some(at) = update.last_check {
            record.last_check = at;
        }
        if let Some(count) = update.entity_count {
            record.entity_count = count;
        }
        if let Some(status) = update.status {
            record.status = status;
        }
        record.updated_at = now;
        record
    }
}

/// Staleness limits used by [`needs_full_sync`]
#[derive(Debug, Clone, Copy)]
pub struct FullSyncPolicy {
    pub max_age: Duration,
    /// A `syncing` record untouched for this long is treated as wedged
    pub stale_syncing_after: Duration,
}

impl Default for FullSyncPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::days(7),
            stale_syncing_after: Duration::minutes(30),
        }
    }
}

/// Whether a scope/kind must be fully resynced rather than incrementally healed
pub fn needs_full_sync(
    metadata: Option<&SyncMetadata>,
    policy: &FullSyncPolicy,
    now: DateTime<Utc>,
) -> bool {
    let Some(metadata) = metadata else {
        return true;
    };

    match metadata.status {
        SyncStatus::NeedsHealing => return true,
        SyncStatus::Syncing if now - metadata.updated_at > policy.stale_syncing_after => {
            return true;
        }
        _ => {}
    }

    let reference = metadata.last_full_sync.unwrap_or(metadata.last_check);
    now - reference > policy.max_age
}

/// Read/merge/write access to sync metadata on top of a [`ReplicaStore`].
#[derive(Clone)]
pub struct SyncMetadataStore {
    store: Arc<dyn ReplicaStore>,
    policy: FullSyncPolicy,
}

impl SyncMetadataStore {
    pub fn new(store: Arc<dyn ReplicaStore>, policy: FullSyncPolicy) -> Self {
        Self { store, policy }
    }

    /// Current record, `None` if never synced or unreadable
    pub async fn get(&self, scope_id: &str, kind: EntityKind) -> Option<SyncMetadata> {
        match self.store.get_metadata(scope_id, kind).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(scope_id, %kind, error = %e, "Failed to read sync metadata");
                None
            }
        }
    }

    /// Merge `update` into the stored record. Failures are logged, not returned.
    pub async fn upsert(&self, scope_id: &str, kind: EntityKind, update: MetadataUpdate) {
        let now = Utc::now();
        let existing = match self.store.get_metadata(scope_id, kind).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(scope_id, %kind, error = %e, "Failed to read sync metadata before update");
                None
            }
        };
        let record = SyncMetadata::merge(existing, scope_id, kind, &update, now);
        match self.store.upsert_metadata(&record).await {
            Ok(()) => debug!(scope_id, %kind, status = %record.status, "Sync metadata updated"),
            Err(e) => warn!(scope_id, %kind, error = %e, "Failed to write sync metadata"),
        }
    }

    /// Whether any kind in `kinds` requires a full resync of the scope
    pub async fn needs_full_sync(&self, scope_id: &str, kinds: &[EntityKind]) -> bool {
        let now = Utc::now();
        for kind in kinds {
            let metadata = self.get(scope_id, *kind).await;
            if needs_full_sync(metadata.as_ref(), &self.policy, now) {
                debug!(scope_id, %kind, "Full sync required");
                return true;
            }
        }
        false
    }

    pub async fn mark_syncing(&self, scope_id: &str, kind: EntityKind) {
        self.upsert(scope_id, kind, MetadataUpdate::status(SyncStatus::Syncing))
            .await;
    }

    /// Close a pass: record the count and return to `healthy`
    pub async fn mark_healthy(&self, scope_id: &str, kind: EntityKind, entity_count: u64, full: bool) {
        let now = Utc::now();
        let update = MetadataUpdate {
            last_full_sync: full.then_some(now),
            last_check: Some(now),
            entity_count: Some(entity_count),
            status: Some(SyncStatus::Healthy),
        };
        self.upsert(scope_id, kind, update).await;
    }

    pub async fn mark_needs_healing(&self, scope_id: &str, kind: EntityKind) {
        self.upsert(scope_id, kind, MetadataUpdate::status(SyncStatus::NeedsHealing))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryStore;

    fn record(status: SyncStatus, last_full_sync: Option<DateTime<Utc>>, last_check: DateTime<Utc>) -> SyncMetadata {
        SyncMetadata {
            scope_id: "g1".to_string(),
            kind: EntityKind::Member,
            last_full_sync,
            last_check,
            entity_count: 0,
            status,
            created_at: last_check,
            updated_at: last_check,
        }
    }

    #[test]
    fn missing_metadata_needs_full_sync() {
        assert!(needs_full_sync(None, &FullSyncPolicy::default(), Utc::now()));
    }

    #[test]
    fn full_sync_older_than_a_week_needs_full_sync() {
        let now = Utc::now();
        let meta = record(SyncStatus::Healthy, Some(now - Duration::days(10)), now - Duration::hours(1));
        assert!(needs_full_sync(Some(&meta), &FullSyncPolicy::default(), now));
    }

    #[test]
    fn recent_check_without_full_sync_is_fine() {
        let now = Utc::now();
        let meta = record(SyncStatus::Healthy, None, now - Duration::hours(1));
        assert!(!needs_full_sync(Some(&meta), &FullSyncPolicy::default(), now));
    }

    #[test]
    fn needs_healing_forces_full_sync() {
        let now = Utc::now();
        let meta = record(SyncStatus::NeedsHealing, None, now);
        assert!(needs_full_sync(Some(&meta), &FullSyncPolicy::default(), now));
    }

    #[test]
    fn last_full_sync_takes_precedence_over_last_check() {
        let now = Utc::now();
        let meta = record(SyncStatus::Healthy, Some(now - Duration::days(2)), now - Duration::days(30));
        assert!(!needs_full_sync(Some(&meta), &FullSyncPolicy::default(), now));
    }

    #[test]
    fn wedged_syncing_status_needs_full_sync() {
        let now = Utc::now();
        let mut meta = record(SyncStatus::Syncing, Some(now - Duration::days(1)), now - Duration::hours(2));
        assert!(needs_full_sync(Some(&meta), &FullSyncPolicy::default(), now));

        meta.updated_at = now - Duration::minutes(5);
        assert!(!needs_full_sync(Some(&meta), &FullSyncPolicy::default(), now));
    }

    #[test]
    fn merge_sets_created_at_once_and_always_refreshes_updated_at() {
        let first = Utc::now() - Duration::hours(3);
        let created = SyncMetadata::merge(None, "g1", EntityKind::Role, &MetadataUpdate::status(SyncStatus::Syncing), first);
        assert_eq!(created.created_at, first);
        assert_eq!(created.status, SyncStatus::Syncing);

        let later = Utc::now();
        let update = MetadataUpdate {
            entity_count: Some(4),
            ..MetadataUpdate::default()
        };
        let merged = SyncMetadata::merge(Some(created), "g1", EntityKind::Role, &update, later);
        assert_eq!(merged.created_at, first);
        assert_eq!(merged.updated_at, later);
        assert_eq!(merged.entity_count, 4);
        assert_eq!(merged.status, SyncStatus::Syncing);
    }

    #[tokio::test]
    async fn status_transitions_through_syncing_back_to_healthy() {
        let store = Arc::new(MemoryStore::new());
        let metadata = SyncMetadataStore::new(store.clone(), FullSyncPolicy::default());

        metadata.mark_syncing("g1", EntityKind::Channel).await;
        assert_eq!(
            metadata.get("g1", EntityKind::Channel).await.unwrap().status,
            SyncStatus::Syncing
        );

        metadata.mark_healthy("g1", EntityKind::Channel, 12, true).await;
        let meta = metadata.get("g1", EntityKind::Channel).await.unwrap();
        assert_eq!(meta.status, SyncStatus::Healthy);
        assert_eq!(meta.entity_count, 12);
        assert!(meta.last_full_sync.is_some());
    }

    #[tokio::test]
    async fn failed_metadata_write_does_not_panic_or_propagate() {
        let store = Arc::new(MemoryStore::new());
        store.fail_metadata_writes(true);
        let metadata = SyncMetadataStore::new(store.clone(), FullSyncPolicy::default());

        metadata.mark_healthy("g1", EntityKind::Role, 3, false).await;
        assert!(metadata.get("g1", EntityKind::Role).await.is_none());
    }
}
