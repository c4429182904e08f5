//! Wiring of configuration, the DuckDB replica and a live source into a
//! running sync engine.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::sync::ReplicaStoreAdapter;
use replica_sync_config::{AppConfig, Persistence};
use replica_sync_engine::{EngineConfig, LiveEvent, LiveSource, ScopeId, SyncOrchestrator};

/// A configured engine bound to its replica database
pub struct ReplicaSyncService {
    config: AppConfig,
    persistence: Persistence,
    orchestrator: Arc<SyncOrchestrator>,
}

/// Background tasks started by [`ReplicaSyncService::spawn`]
pub struct ServiceHandle {
    pub scheduler: JoinHandle<()>,
    pub events: Option<JoinHandle<usize>>,
}

impl ServiceHandle {
    /// Wait for the background tasks to exit
    pub async fn join(self) -> Result<()> {
        self.scheduler.await.context("Sync scheduler task panicked")?;
        if let Some(events) = self.events {
            let applied = events.await.context("Event task panicked")?;
            info!("Event consumer applied {} events", applied);
        }
        Ok(())
    }
}

impl ReplicaSyncService {
    /// Open the replica database named in `config` and build the engine
    pub fn open(config: AppConfig, source: Arc<dyn LiveSource>) -> Result<Self> {
        config.validate()?;
        let persistence = Persistence::new(&config.database.path).with_context(|| {
            format!(
                "Failed to open replica database at {}",
                config.database.path.display()
            )
        })?;
        Ok(Self::with_persistence(config, persistence, source))
    }

    pub fn with_persistence(
        config: AppConfig,
        persistence: Persistence,
        source: Arc<dyn LiveSource>,
    ) -> Self {
        let store = Arc::new(ReplicaStoreAdapter::new(persistence.clone()));
        let engine_config = EngineConfig::from(&config.sync);
        let orchestrator = Arc::new(SyncOrchestrator::new(source, store, engine_config));
        Self {
            config,
            persistence,
            orchestrator,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    pub fn orchestrator(&self) -> Arc<SyncOrchestrator> {
        self.orchestrator.clone()
    }

    /// Run the startup pass over `scopes`, then keep them in sync on the
    /// configured interval. If given, live events are applied by a second
    /// task.
    pub fn spawn(
        &self,
        scopes: Vec<ScopeId>,
        events: Option<mpsc::Receiver<LiveEvent>>,
    ) -> ServiceHandle {
        info!("Starting replica sync for {} scopes", scopes.len());

        let orchestrator = self.orchestrator.clone();
        let scheduler = tokio::spawn(async move {
            orchestrator.run(scopes).await;
        });

        let events = events.map(|receiver| {
            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move { orchestrator.consume_events(receiver).await })
        });

        ServiceHandle { scheduler, events }
    }

    /// Stop the engine, then refuse further database access
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
        self.persistence.close();
    }
}
