//! Implementation of `ReplicaStore` for `replica-sync-config::Persistence`.
//!
//! Entities are stored as their tagged JSON form. The `active` column is the
//! source of truth for liveness because deactivation only touches that
//! column, so it is written back onto the entity on every read.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;

use replica_sync_config::{EntityRow, Persistence, PersistenceClosed, SyncMetadataRow};
use replica_sync_engine::{
    Entity, EntityId, EntityKind, ReplicaStore, StoreError, StoreResult, SyncMetadata,
};

/// Wrapper around `Persistence` that implements `ReplicaStore`.
///
/// This wrapper is necessary due to Rust's orphan rules - we cannot implement
/// a foreign trait (`ReplicaStore`) for a foreign type (`Persistence`) directly.
#[derive(Debug, Clone)]
pub struct ReplicaStoreAdapter {
    persistence: Persistence,
}

impl ReplicaStoreAdapter {
    pub fn new(persistence: Persistence) -> Self {
        Self { persistence }
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }
}

fn store_error(error: anyhow::Error) -> StoreError {
    if error.downcast_ref::<PersistenceClosed>().is_some() {
        StoreError::Closed
    } else {
        StoreError::Backend(format!("{:#}", error))
    }
}

fn serialization_error(kind: &str, id: &str, error: impl std::fmt::Display) -> StoreError {
    StoreError::Serialization {
        kind: kind.to_string(),
        id: id.to_string(),
        reason: error.to_string(),
    }
}

pub(crate) fn entity_to_row(entity: &Entity) -> StoreResult<EntityRow> {
    let kind = entity.kind().as_str();
    let id = entity.id();
    let data = serde_json::to_value(entity).map_err(|e| serialization_error(kind, &id, e))?;
    Ok(EntityRow {
        kind: kind.to_string(),
        scope_id: entity.scope_id().to_string(),
        active: entity.is_active(),
        data,
        source_updated_at: entity.source_updated_at(),
        updated_at: Utc::now(),
        id,
    })
}

pub(crate) fn row_to_entity(row: EntityRow) -> StoreResult<Entity> {
    let mut entity: Entity = serde_json::from_value(row.data)
        .map_err(|e| serialization_error(&row.kind, &row.id, e))?;
    entity.set_active(row.active);
    Ok(entity)
}

fn metadata_to_row(metadata: &SyncMetadata) -> SyncMetadataRow {
    SyncMetadataRow {
        scope_id: metadata.scope_id.clone(),
        kind: metadata.kind.as_str().to_string(),
        last_full_sync: metadata.last_full_sync,
        last_check: metadata.last_check,
        entity_count: metadata.entity_count as i64,
        status: metadata.status.as_str().to_string(),
        created_at: metadata.created_at,
        updated_at: metadata.updated_at,
    }
}

fn row_to_metadata(row: SyncMetadataRow) -> StoreResult<SyncMetadata> {
    let label = format!("{}/{}", row.scope_id, row.kind);
    Ok(SyncMetadata {
        kind: row
            .kind
            .parse()
            .map_err(|e| serialization_error("sync_metadata", &label, e))?,
        status: row
            .status
            .parse()
            .map_err(|e| serialization_error("sync_metadata", &label, e))?,
        scope_id: row.scope_id,
        last_full_sync: row.last_full_sync,
        last_check: row.last_check,
        entity_count: row.entity_count.max(0) as u64,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

#[async_trait]
impl ReplicaStore for ReplicaStoreAdapter {
    async fn upsert(&self, entity: &Entity) -> StoreResult<()> {
        let row = entity_to_row(entity)?;
        self.persistence.entity_upsert(&row).map_err(store_error)
    }

    async fn bulk_upsert(&self, entities: &[Entity]) -> StoreResult<usize> {
        let rows = entities
            .iter()
            .map(entity_to_row)
            .collect::<StoreResult<Vec<_>>>()?;
        self.persistence
            .entity_upsert_many(&rows)
            .map_err(store_error)
    }

    async fn mark_inactive(&self, kind: EntityKind, ids: &[EntityId]) -> StoreResult<usize> {
        self.persistence
            .entity_mark_inactive(kind.as_str(), ids)
            .map_err(store_error)
    }

    async fn get_ids(&self, scope_id: &str, kind: EntityKind) -> StoreResult<HashSet<EntityId>> {
        let ids = self
            .persistence
            .entity_active_ids(scope_id, kind.as_str())
            .map_err(store_error)?;
        Ok(ids.into_iter().collect())
    }

    async fn point_exists(&self, kind: EntityKind, id: &str) -> StoreResult<bool> {
        self.persistence
            .entity_exists(kind.as_str(), id)
            .map_err(store_error)
    }

    async fn get(&self, kind: EntityKind, id: &str) -> StoreResult<Option<Entity>> {
        self.persistence
            .entity_get(kind.as_str(), id)
            .map_err(store_error)?
            .map(row_to_entity)
            .transpose()
    }

    async fn count_active(&self, scope_id: &str, kind: EntityKind) -> StoreResult<u64> {
        let count = self
            .persistence
            .entity_count_active(scope_id, kind.as_str())
            .map_err(store_error)?;
        Ok(count.max(0) as u64)
    }

    async fn get_metadata(
        &self,
        scope_id: &str,
        kind: EntityKind,
    ) -> StoreResult<Option<SyncMetadata>> {
        self.persistence
            .sync_metadata_get(scope_id, kind.as_str())
            .map_err(store_error)?
            .map(row_to_metadata)
            .transpose()
    }

    async fn upsert_metadata(&self, metadata: &SyncMetadata) -> StoreResult<()> {
        self.persistence
            .sync_metadata_upsert(&metadata_to_row(metadata))
            .map_err(store_error)
    }
}
