//! Keeps a queryable DuckDB replica of a live community platform in sync.
//!
//! The engine itself lives in `replica-sync-engine`; configuration and the
//! database layer live in `replica-sync-config`. This crate ties them
//! together.

pub mod service;
pub mod sync;
pub mod telemetry;

pub use replica_sync_config::{config, persistence, AppConfig, Persistence};
pub use replica_sync_engine as engine;
pub use service::{ReplicaSyncService, ServiceHandle};
pub use sync::ReplicaStoreAdapter;
pub use telemetry::init_tracing;
