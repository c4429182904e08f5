//! Glue between the sync engine and the DuckDB persistence layer.

pub mod persistence_impl;

pub use persistence_impl::ReplicaStoreAdapter;
