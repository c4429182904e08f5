//! Replica synchronization and reconciliation engine.
//!
//! This crate keeps a persistent replica of a live community platform (guilds,
//! channels, roles, members and messages) consistent with the live side.
//!
//! # Features
//!
//! - **Full or Incremental Passes**: Per-scope sync metadata decides whether a
//!   scope needs a complete resync or only a reconciliation pass.
//! - **Set Reconciliation**: Missing entities are written and orphaned ones are
//!   marked inactive; rows are never deleted.
//! - **Bounded Message Healing**: Activity heuristics pick the channels worth
//!   checking and message windows are processed in bounded batches.
//! - **Profile History**: Member identity changes are detected by content hash
//!   and kept as a capped history embedded in the member row.
//!
//! # Usage
//!
//! Implement [`LiveSource`] for the platform connection and [`ReplicaStore`]
//! for the storage backend, then drive a [`SyncOrchestrator`]:
//!
//! ```ignore
//! use replica_sync_engine::{EngineConfig, SyncOrchestrator};
//!
//! let orchestrator = SyncOrchestrator::new(source, store, EngineConfig::default());
//! orchestrator.sync_scope("guild-1").await?;
//! orchestrator.handle_event(event).await?;
//! ```

pub mod activity;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod healer;
pub mod metadata;
pub mod orchestrator;
pub mod persistence;
pub mod profile;
pub mod reconciler;
pub mod source;
pub mod test_utils;
pub mod types;

// Re-export main types for convenience
pub use activity::ActivityScopeFilter;
pub use concurrency::{BoundedExecutor, ShutdownSignal};
pub use config::EngineConfig;
pub use error::{ErrorClass, Result, SourceError, StoreError, SyncError};
pub use healer::{channel_batch_size, BackfillReport, HealReport, MessageHealer};
pub use metadata::{
    needs_full_sync, FullSyncPolicy, MetadataUpdate, SyncMetadata, SyncMetadataStore, SyncStatus,
};
pub use orchestrator::{
    DriftReport, KindDrift, PassMode, PassReport, ScopePhase, ScopePhases, SyncOrchestrator,
    SyncOutcome,
};
pub use persistence::{ReplicaStore, StoreResult};
pub use profile::{FieldChange, ProfileHistoryEntry, ProfileHistoryTracker, ProfileSnapshot};
pub use reconciler::{EntityReconciler, ReconcileDiff, ReconcilePlan, ReconcileReport};
pub use source::{LiveEvent, LiveSource, SourceResult};
pub use types::{
    Channel, ChannelKind, Entity, EntityId, EntityKind, Guild, Member, Message, Role, ScopeId,
};
