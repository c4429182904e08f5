//! Configuration and persistence for replica-sync.
//!
//! [`config`] loads the TOML configuration (with environment overrides) and
//! [`persistence`] owns the DuckDB database holding replica rows and
//! per-scope sync metadata.

pub mod config;
pub mod persistence;

pub use config::{AppConfig, DatabaseConfig, LoggingConfig, SyncConfig, MAX_ACTIVITY_PROBE_BATCH};
pub use persistence::{EntityRow, Persistence, PersistenceClosed, SyncMetadataRow};
