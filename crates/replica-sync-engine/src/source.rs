//! The live platform as seen by the engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::types::{Entity, EntityId, EntityKind, Guild, Message, ScopeId};

pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Read access to the current state of the live platform.
#[async_trait]
pub trait LiveSource: Send + Sync {
    /// Current guild attributes, including approximate counts.
    async fn fetch_guild(&self, scope_id: &str) -> SourceResult<Guild>;

    /// Full enumeration of one entity kind within a scope. Used by full sync
    /// and by reconciliation of the small entity kinds.
    async fn fetch_all(&self, kind: EntityKind, scope_id: &str) -> SourceResult<Vec<Entity>>;

    /// Point fetch of a single entity. `Ok(None)` when it no longer exists.
    async fn fetch_entity(
        &self,
        kind: EntityKind,
        scope_id: &str,
        id: &str,
    ) -> SourceResult<Option<Entity>>;

    /// Newest-first window of messages in a channel, optionally strictly
    /// older than `before`.
    async fn fetch_recent_messages(
        &self,
        channel_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> SourceResult<Vec<Message>>;
}

/// A change notification delivered by the platform's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LiveEvent {
    /// Created or updated
    Changed { entity: Entity },
    /// Deleted, or for members: left the guild
    Removed {
        kind: EntityKind,
        scope_id: ScopeId,
        id: EntityId,
    },
}

impl LiveEvent {
    pub fn changed(entity: impl Into<Entity>) -> Self {
        LiveEvent::Changed {
            entity: entity.into(),
        }
    }

    pub fn removed(kind: EntityKind, scope_id: impl Into<String>, id: impl Into<String>) -> Self {
        LiveEvent::Removed {
            kind,
            scope_id: scope_id.into(),
            id: id.into(),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            LiveEvent::Changed { entity } => entity.kind(),
            LiveEvent::Removed { kind, .. } => *kind,
        }
    }

    pub fn scope_id(&self) -> &str {
        match self {
            LiveEvent::Changed { entity } => entity.scope_id(),
            LiveEvent::Removed { scope_id, .. } => scope_id,
        }
    }
}
