//! Persistence trait for the replica store.
//!
//! This module defines the trait that must be implemented by any storage backend
//! that wants to hold a replica driven by the sync engine.

use async_trait::async_trait;
use std::collections::HashSet;

use crate::error::StoreError;
use crate::metadata::SyncMetadata;
use crate::types::{Entity, EntityId, EntityKind};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Operations the sync engine needs from the replica store.
///
/// Every write is an idempotent upsert or mark-inactive keyed by
/// `(kind, id)`, so concurrent event handling and sync passes converge on the
/// last write without any locking.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    // ========== Entity Writes ==========

    /// Insert or replace a single entity.
    async fn upsert(&self, entity: &Entity) -> StoreResult<()>;

    /// Insert or replace many entities in one round trip. Returns the number written.
    async fn bulk_upsert(&self, entities: &[Entity]) -> StoreResult<usize>;

    /// Flip `active` to false for the given ids. Rows are never deleted.
    async fn mark_inactive(&self, kind: EntityKind, ids: &[EntityId]) -> StoreResult<usize>;

    // ========== Entity Reads ==========

    /// Ids of the active rows of `kind` within a scope.
    async fn get_ids(&self, scope_id: &str, kind: EntityKind) -> StoreResult<HashSet<EntityId>>;

    /// Whether a row exists for `(kind, id)`, active or not.
    async fn point_exists(&self, kind: EntityKind, id: &str) -> StoreResult<bool>;

    /// Point read of a single row, active or not.
    async fn get(&self, kind: EntityKind, id: &str) -> StoreResult<Option<Entity>>;

    /// Number of active rows of `kind` within a scope.
    async fn count_active(&self, scope_id: &str, kind: EntityKind) -> StoreResult<u64>;

    // ========== Sync Metadata ==========

    async fn get_metadata(
        &self,
        scope_id: &str,
        kind: EntityKind,
    ) -> StoreResult<Option<SyncMetadata>>;

    /// Write a complete metadata record. Merging is the caller's job.
    async fn upsert_metadata(&self, metadata: &SyncMetadata) -> StoreResult<()>;
}
