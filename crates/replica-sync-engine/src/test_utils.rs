//! In-memory store and scripted live source for exercising the engine
//! without a database or a platform connection.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::concurrency::ShutdownSignal;
use crate::error::{SourceError, StoreError};
use crate::metadata::SyncMetadata;
use crate::persistence::{ReplicaStore, StoreResult};
use crate::source::{LiveSource, SourceResult};
use crate::types::{Entity, EntityId, EntityKind, Guild, Member, Message};

/// `ReplicaStore` backed by hash maps, with write counters and failure switches.
#[derive(Default)]
pub struct MemoryStore {
    entities: Mutex<HashMap<(EntityKind, EntityId), Entity>>,
    metadata: Mutex<HashMap<(String, EntityKind), SyncMetadata>>,
    upserts: AtomicUsize,
    deactivations: AtomicUsize,
    bulk_calls: AtomicUsize,
    fail_metadata_writes: AtomicBool,
    fail_bulk_upserts: AtomicBool,
    fail_upsert_ids: Mutex<HashSet<EntityId>>,
    fail_get_ids: Mutex<HashSet<EntityId>>,
    shutdown_after_bulk: Mutex<Option<(usize, ShutdownSignal)>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed rows without touching the write counters
    pub fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let store = Self::new();
        for entity in entities {
            store.insert(entity);
        }
        store
    }

    pub fn insert(&self, entity: Entity) {
        self.entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((entity.kind(), entity.id()), entity);
    }

    pub fn entity(&self, kind: EntityKind, id: &str) -> Option<Entity> {
        self.entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, id.to_string()))
            .cloned()
    }

    pub fn member(&self, scope_id: &str, user_id: &str) -> Option<Member> {
        self.entity(EntityKind::Member, &Member::composite_id(scope_id, user_id))
            .and_then(|e| e.as_member().cloned())
    }

    pub fn rows(&self, kind: EntityKind) -> Vec<Entity> {
        self.entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    /// Entity rows written through `upsert`/`bulk_upsert`
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Rows flipped to inactive through `mark_inactive`
    pub fn deactivation_count(&self) -> usize {
        self.deactivations.load(Ordering::SeqCst)
    }

    pub fn bulk_call_count(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.upsert_count() + self.deactivation_count()
    }

    pub fn reset_counters(&self) {
        self.upserts.store(0, Ordering::SeqCst);
        self.deactivations.store(0, Ordering::SeqCst);
        self.bulk_calls.store(0, Ordering::SeqCst);
    }

    pub fn fail_metadata_writes(&self, fail: bool) {
        self.fail_metadata_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_bulk_upserts(&self, fail: bool) {
        self.fail_bulk_upserts.store(fail, Ordering::SeqCst);
    }

    /// Make single upserts of `id` fail
    pub fn fail_upsert_of(&self, id: impl Into<String>) {
        self.fail_upsert_ids.lock().unwrap_or_else(PoisonError::into_inner).insert(id.into());
    }

    /// Make point reads of `id` fail
    pub fn fail_get_of(&self, id: impl Into<String>) {
        self.fail_get_ids.lock().unwrap_or_else(PoisonError::into_inner).insert(id.into());
    }

    /// Raise `signal` once `calls` successful bulk upserts have gone through
    pub fn shutdown_after_bulk_upserts(&self, calls: usize, signal: ShutdownSignal) {
        *self.shutdown_after_bulk.lock().unwrap_or_else(PoisonError::into_inner) = Some((calls, signal));
    }

    /// Simulate the connection being torn down
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ReplicaStore for MemoryStore {
    async fn upsert(&self, entity: &Entity) -> StoreResult<()> {
        self.check_open()?;
        if self.fail_upsert_ids.lock().unwrap_or_else(PoisonError::into_inner).contains(&entity.id()) {
            return Err(StoreError::Backend(format!("upsert of {} rejected", entity.id())));
        }
        self.insert(entity.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn bulk_upsert(&self, entities: &[Entity]) -> StoreResult<usize> {
        self.check_open()?;
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_bulk_upserts.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("bulk upsert rejected".to_string()));
        }
        for entity in entities {
            self.insert(entity.clone());
        }
        self.upserts.fetch_add(entities.len(), Ordering::SeqCst);
        if let Some((after, signal)) = &*self.shutdown_after_bulk.lock().unwrap_or_else(PoisonError::into_inner) {
            if self.bulk_call_count() >= *after {
                signal.trigger();
            }
        }
        Ok(entities.len())
    }

    async fn mark_inactive(&self, kind: EntityKind, ids: &[EntityId]) -> StoreResult<usize> {
        self.check_open()?;
        let mut entities = self.entities.lock().unwrap_or_else(PoisonError::into_inner);
        let mut changed = 0;
        for id in ids {
            if let Some(entity) = entities.get_mut(&(kind, id.clone())) {
                if entity.is_active() {
                    entity.set_active(false);
                    changed += 1;
                }
            }
        }
        self.deactivations.fetch_add(changed, Ordering::SeqCst);
        Ok(changed)
    }

    async fn get_ids(&self, scope_id: &str, kind: EntityKind) -> StoreResult<HashSet<EntityId>> {
        self.check_open()?;
        Ok(self
            .entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|e| e.kind() == kind && e.scope_id() == scope_id && e.is_active())
            .map(Entity::id)
            .collect())
    }

    async fn point_exists(&self, kind: EntityKind, id: &str) -> StoreResult<bool> {
        self.check_open()?;
        Ok(self.entity(kind, id).is_some())
    }

    async fn get(&self, kind: EntityKind, id: &str) -> StoreResult<Option<Entity>> {
        self.check_open()?;
        if self.fail_get_ids.lock().unwrap_or_else(PoisonError::into_inner).contains(id) {
            return Err(StoreError::Backend(format!("read of {} failed", id)));
        }
        Ok(self.entity(kind, id))
    }

    async fn count_active(&self, scope_id: &str, kind: EntityKind) -> StoreResult<u64> {
        Ok(self.get_ids(scope_id, kind).await?.len() as u64)
    }

    async fn get_metadata(
        &self,
        scope_id: &str,
        kind: EntityKind,
    ) -> StoreResult<Option<SyncMetadata>> {
        self.check_open()?;
        Ok(self
            .metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(scope_id.to_string(), kind))
            .cloned())
    }

    async fn upsert_metadata(&self, metadata: &SyncMetadata) -> StoreResult<()> {
        self.check_open()?;
        if self.fail_metadata_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("metadata write rejected".to_string()));
        }
        self.metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((metadata.scope_id.clone(), metadata.kind), metadata.clone());
        Ok(())
    }
}

/// `LiveSource` whose state is set up by the test.
#[derive(Default)]
pub struct ScriptedSource {
    guilds: Mutex<HashMap<String, Guild>>,
    entities: Mutex<Vec<Entity>>,
    stray: Mutex<Vec<(EntityKind, Entity)>>,
    messages: Mutex<HashMap<String, Vec<Message>>>,
    denied_channels: Mutex<HashSet<String>>,
    failing_kinds: Mutex<HashSet<EntityKind>>,
    message_fetches: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_guild(&self, guild: Guild) {
        self.guilds.lock().unwrap_or_else(PoisonError::into_inner).insert(guild.id.clone(), guild);
    }

    /// Add or replace a channel, role or member
    pub fn put(&self, entity: impl Into<Entity>) {
        let entity = entity.into();
        let mut entities = self.entities.lock().unwrap_or_else(PoisonError::into_inner);
        entities.retain(|e| !(e.kind() == entity.kind() && e.id() == entity.id()));
        entities.push(entity);
    }

    pub fn remove(&self, kind: EntityKind, id: &str) {
        self.entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|e| !(e.kind() == kind && e.id() == id));
    }

    /// Return `entity` from `fetch_all(kind, ..)` whatever its own kind
    pub fn put_in_listing(&self, kind: EntityKind, entity: impl Into<Entity>) {
        self.stray
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind, entity.into()));
    }

    pub fn add_message(&self, message: Message) {
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        let channel = messages.entry(message.channel_id.clone()).or_default();
        channel.retain(|m| m.id != message.id);
        channel.push(message);
    }

    pub fn deny_channel(&self, channel_id: impl Into<String>) {
        self.denied_channels.lock().unwrap_or_else(PoisonError::into_inner).insert(channel_id.into());
    }

    /// Make `fetch_all(kind, ..)` fail with a transport error
    pub fn fail_fetch_all(&self, kind: EntityKind) {
        self.failing_kinds.lock().unwrap_or_else(PoisonError::into_inner).insert(kind);
    }

    /// Number of `fetch_recent_messages` calls made so far
    pub fn message_fetch_count(&self) -> usize {
        self.message_fetches.load(Ordering::SeqCst)
    }

    fn newest_first(&self, channel_id: &str) -> Vec<Message> {
        let mut messages = self
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel_id)
            .cloned()
            .unwrap_or_default();
        messages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        messages
    }
}

#[async_trait]
impl LiveSource for ScriptedSource {
    async fn fetch_guild(&self, scope_id: &str) -> SourceResult<Guild> {
        self.guilds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(scope_id.to_string()))
    }

    async fn fetch_all(&self, kind: EntityKind, scope_id: &str) -> SourceResult<Vec<Entity>> {
        if self.failing_kinds.lock().unwrap_or_else(PoisonError::into_inner).contains(&kind) {
            return Err(SourceError::Transport(format!("{} listing failed", kind)));
        }
        match kind {
            EntityKind::Guild => Ok(vec![Entity::Guild(self.fetch_guild(scope_id).await?)]),
            EntityKind::Message => Ok(self
                .messages
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .flatten()
                .filter(|m| m.guild_id == scope_id)
                .cloned()
                .map(Entity::Message)
                .collect()),
            _ => {
                let mut listed: Vec<Entity> = self
                    .entities
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .filter(|e| e.kind() == kind && e.scope_id() == scope_id)
                    .cloned()
                    .collect();
                listed.extend(
                    self.stray
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .iter()
                        .filter(|(listing, e)| *listing == kind && e.scope_id() == scope_id)
                        .map(|(_, e)| e.clone()),
                );
                Ok(listed)
            }
        }
    }

    async fn fetch_entity(
        &self,
        kind: EntityKind,
        scope_id: &str,
        id: &str,
    ) -> SourceResult<Option<Entity>> {
        let all = self.fetch_all(kind, scope_id).await?;
        Ok(all.into_iter().find(|e| match e {
            Entity::Member(m) => m.user_id == id || m.entity_id() == id,
            other => other.id() == id,
        }))
    }

    async fn fetch_recent_messages(
        &self,
        channel_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> SourceResult<Vec<Message>> {
        self.message_fetches.fetch_add(1, Ordering::SeqCst);
        if self.denied_channels.lock().unwrap_or_else(PoisonError::into_inner).contains(channel_id) {
            return Err(SourceError::AccessDenied(channel_id.to_string()));
        }

        let messages = self.newest_first(channel_id);
        let start = match before {
            Some(cursor) => match messages.iter().position(|m| m.id == cursor) {
                Some(index) => index + 1,
                None => return Ok(Vec::new()),
            },
            None => 0,
        };
        Ok(messages.into_iter().skip(start).take(limit).collect())
    }
}
