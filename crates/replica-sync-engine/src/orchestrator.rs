//! Sync lifecycle: full versus incremental passes, live events, drift checks
//! and shutdown.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::activity::ActivityScopeFilter;
use crate::concurrency::{BoundedExecutor, ShutdownSignal};
use crate::config::EngineConfig;
use crate::error::{ErrorClass, Result, SourceError, StoreError, SyncError};
use crate::healer::{BackfillReport, HealReport, MessageHealer};
use crate::metadata::{FullSyncPolicy, SyncMetadataStore};
use crate::persistence::ReplicaStore;
use crate::profile::ProfileHistoryTracker;
use crate::reconciler::{EntityReconciler, ReconcilePlan, ReconcileReport};
use crate::source::{LiveEvent, LiveSource};
use crate::types::{Channel, Entity, EntityId, EntityKind, Member, ScopeId};

/// Where a scope is in its sync lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopePhase {
    Idle,
    Deciding,
    Full,
    Incremental,
}

/// Shared per-scope phase table.
///
/// A scope that is not `Idle` is busy and further sync triggers for it are
/// dropped. Cloning shares the table.
#[derive(Debug, Clone, Default)]
pub struct ScopePhases {
    inner: Arc<Mutex<HashMap<ScopeId, ScopePhase>>>,
}

impl ScopePhases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, scope_id: &str) -> ScopePhase {
        self.lock().get(scope_id).copied().unwrap_or(ScopePhase::Idle)
    }

    pub fn is_busy(&self, scope_id: &str) -> bool {
        self.get(scope_id) != ScopePhase::Idle
    }

    pub fn any_busy(&self) -> bool {
        self.lock().values().any(|phase| *phase != ScopePhase::Idle)
    }

    /// Claim an idle scope. Returns `None` if it is already busy.
    pub fn try_begin(&self, scope_id: &str) -> Option<PhaseGuard> {
        let mut phases = self.lock();
        let phase = phases.entry(scope_id.to_string()).or_insert(ScopePhase::Idle);
        if *phase != ScopePhase::Idle {
            return None;
        }
        *phase = ScopePhase::Deciding;
        Some(PhaseGuard {
            phases: self.clone(),
            scope_id: scope_id.to_string(),
        })
    }

    fn set(&self, scope_id: &str, phase: ScopePhase) {
        self.lock().insert(scope_id.to_string(), phase);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ScopeId, ScopePhase>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Returns its scope to `Idle` when dropped, however the pass ended.
#[derive(Debug)]
pub struct PhaseGuard {
    phases: ScopePhases,
    scope_id: ScopeId,
}

impl PhaseGuard {
    pub fn enter(&self, phase: ScopePhase) {
        self.phases.set(&self.scope_id, phase);
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        self.phases.set(&self.scope_id, ScopePhase::Idle);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassMode {
    Full,
    Incremental,
}

/// Summary of one completed pass over a scope
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub scope_id: ScopeId,
    pub mode: PassMode,
    pub reconciled: Vec<ReconcileReport>,
    pub profile_changes: usize,
    pub messages: Option<HealReport>,
    pub backfill: Vec<(String, BackfillReport)>,
    pub elapsed_ms: u128,
}

impl PassReport {
    fn new(pass_id: Uuid, scope_id: &str, mode: PassMode) -> Self {
        Self {
            pass_id,
            scope_id: scope_id.to_string(),
            mode,
            reconciled: Vec::new(),
            profile_changes: 0,
            messages: None,
            backfill: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub fn reconciled(&self, kind: EntityKind) -> Option<&ReconcileReport> {
        self.reconciled.iter().find(|r| r.kind == kind)
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum SyncOutcome {
    Completed(PassReport),
    /// Another pass already owns the scope
    Skipped,
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&PassReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::Skipped => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KindDrift {
    pub kind: EntityKind,
    pub live: u64,
    pub replica: u64,
    pub ratio: f64,
    pub flagged: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DriftReport {
    pub scope_id: ScopeId,
    pub kinds: Vec<KindDrift>,
}

impl DriftReport {
    pub fn flagged(&self) -> impl Iterator<Item = &KindDrift> {
        self.kinds.iter().filter(|k| k.flagged)
    }
}

/// Relative difference of `replica` against `live`
pub fn drift_ratio(live: u64, replica: u64) -> f64 {
    if live == 0 {
        return if replica == 0 { 0.0 } else { 1.0 };
    }
    live.abs_diff(replica) as f64 / live as f64
}

/// Live member ids arrive either bare or already composite
fn member_replica_id(scope_id: &str, id: &str) -> EntityId {
    let prefix = format!("{}:", scope_id);
    if id.starts_with(&prefix) {
        id.to_string()
    } else {
        Member::composite_id(scope_id, id)
    }
}

fn replica_id(kind: EntityKind, scope_id: &str, id: &str) -> EntityId {
    match kind {
        EntityKind::Member => member_replica_id(scope_id, id),
        _ => id.to_string(),
    }
}

enum MemberOutcome {
    Ready(Entity, bool),
    Held(EntityId),
    Skipped,
}

#[derive(Default)]
struct PreparedMembers {
    members: Vec<Entity>,
    /// Ids whose profile changed against the stored row
    changed: HashSet<EntityId>,
    held: Vec<EntityId>,
}

/// Owns the sync lifecycle of every scope.
pub struct SyncOrchestrator {
    source: Arc<dyn LiveSource>,
    store: Arc<dyn ReplicaStore>,
    config: EngineConfig,
    metadata: SyncMetadataStore,
    tracker: ProfileHistoryTracker,
    reconciler: EntityReconciler,
    healer: MessageHealer,
    activity: ActivityScopeFilter,
    phases: ScopePhases,
    shutdown: ShutdownSignal,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn LiveSource>,
        store: Arc<dyn ReplicaStore>,
        config: EngineConfig,
    ) -> Self {
        Self::with_phases(source, store, config, ScopePhases::new())
    }

    /// Build with a phase table shared with other components
    pub fn with_phases(
        source: Arc<dyn LiveSource>,
        store: Arc<dyn ReplicaStore>,
        config: EngineConfig,
        phases: ScopePhases,
    ) -> Self {
        let shutdown = ShutdownSignal::new();
        let metadata = SyncMetadataStore::new(
            store.clone(),
            FullSyncPolicy {
                max_age: config.full_sync_max_age,
                stale_syncing_after: config.stale_syncing_after,
            },
        );
        let reconciler = EntityReconciler::new(
            store.clone(),
            metadata.clone(),
            config.bulk_batch_size,
            config.batch_delay,
            shutdown.clone(),
        );
        let healer = MessageHealer::new(
            source.clone(),
            store.clone(),
            config.clone(),
            shutdown.clone(),
        );
        let activity = ActivityScopeFilter::new(
            source.clone(),
            store.clone(),
            config.activity_window,
            config.activity_probe_batch,
            shutdown.clone(),
        );

        Self {
            tracker: ProfileHistoryTracker::new(config.profile_history_limit),
            source,
            store,
            config,
            metadata,
            reconciler,
            healer,
            activity,
            phases,
            shutdown,
        }
    }

    pub fn metadata(&self) -> &SyncMetadataStore {
        &self.metadata
    }

    pub fn phases(&self) -> &ScopePhases {
        &self.phases
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.phases.any_busy()
    }

    pub fn is_scope_syncing(&self, scope_id: &str) -> bool {
        self.phases.is_busy(scope_id)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_shutting_down() {
            Err(SyncError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn log_failure(&self, what: &str, scope_id: &str, e: &SyncError) {
        match e.class() {
            ErrorClass::Shutdown => debug!(scope_id, error = %e, "{} interrupted by shutdown", what),
            ErrorClass::AccessDenied => info!(scope_id, error = %e, "{} skipped: access denied", what),
            _ if self.shutdown.is_shutting_down() => {
                debug!(scope_id, error = %e, "{} failed during shutdown", what)
            }
            _ => error!(scope_id, error = %e, "{} failed", what),
        }
    }

    // ========== Passes ==========

    /// Startup pass over every scope, one after another
    pub async fn start(&self, scopes: &[ScopeId]) -> usize {
        info!(scopes = scopes.len(), "Starting replica sync");
        let mut completed = 0;
        for scope_id in scopes {
            if self.shutdown.is_shutting_down() {
                break;
            }
            if let Ok(SyncOutcome::Completed(_)) = self.sync_scope(scope_id).await {
                completed += 1;
            }
        }
        completed
    }

    /// Decide between a full and an incremental pass and run it.
    pub async fn sync_scope(&self, scope_id: &str) -> Result<SyncOutcome> {
        self.ensure_running()?;
        let Some(guard) = self.phases.try_begin(scope_id) else {
            debug!(scope_id, "Sync already in progress, dropping trigger");
            return Ok(SyncOutcome::Skipped);
        };

        let full = self.metadata.needs_full_sync(scope_id, &EntityKind::ALL).await;
        self.run_pass(scope_id, &guard, full).await
    }

    /// Full resync regardless of metadata
    pub async fn force_full_sync(&self, scope_id: &str) -> Result<SyncOutcome> {
        self.ensure_running()?;
        let Some(guard) = self.phases.try_begin(scope_id) else {
            info!(scope_id, "Forced full sync requested while busy, dropping");
            return Ok(SyncOutcome::Skipped);
        };
        self.run_pass(scope_id, &guard, true).await
    }

    async fn run_pass(&self, scope_id: &str, guard: &PhaseGuard, full: bool) -> Result<SyncOutcome> {
        let pass_id = Uuid::now_v7();
        let started = Instant::now();
        let mode = if full { PassMode::Full } else { PassMode::Incremental };
        info!(%pass_id, scope_id, ?mode, "Sync pass starting");

        let result = if full {
            guard.enter(ScopePhase::Full);
            self.full_sync(scope_id, pass_id).await
        } else {
            guard.enter(ScopePhase::Incremental);
            self.incremental_sync(scope_id, pass_id).await
        };

        match result {
            Ok(mut report) => {
                report.elapsed_ms = started.elapsed().as_millis();
                info!(
                    %pass_id,
                    scope_id,
                    ?mode,
                    profile_changes = report.profile_changes,
                    elapsed_ms = report.elapsed_ms as u64,
                    "Sync pass finished"
                );
                Ok(SyncOutcome::Completed(report))
            }
            Err(e) => {
                self.log_failure("Sync pass", scope_id, &e);
                Err(e)
            }
        }
    }

    async fn full_sync(&self, scope_id: &str, pass_id: Uuid) -> Result<PassReport> {
        let mut report = PassReport::new(pass_id, scope_id, PassMode::Full);
        for kind in EntityKind::ALL {
            self.metadata.mark_syncing(scope_id, kind).await;
        }

        self.sync_guild(scope_id, true).await?;

        self.ensure_running()?;
        let channels = self.source.fetch_all(EntityKind::Channel, scope_id).await?;
        report.reconciled.push(
            self.reconciler
                .replace(scope_id, EntityKind::Channel, channels.clone())
                .await?,
        );

        self.ensure_running()?;
        let roles = self.source.fetch_all(EntityKind::Role, scope_id).await?;
        report
            .reconciled
            .push(self.reconciler.replace(scope_id, EntityKind::Role, roles).await?);

        self.ensure_running()?;
        let live_members = self.source.fetch_all(EntityKind::Member, scope_id).await?;
        let prepared = self.prepare_members(live_members).await?;
        report.profile_changes = prepared.changed.len();
        let plan = ReconcilePlan {
            held: prepared.held,
            ..ReconcilePlan::rewrite_all()
        };
        report.reconciled.push(
            self.reconciler
                .reconcile_with(scope_id, EntityKind::Member, prepared.members, plan)
                .await?,
        );

        for channel in message_channels(&channels) {
            self.ensure_running()?;
            match self
                .healer
                .backfill_channel(channel, self.config.backfill_max_pages)
                .await
            {
                Ok(backfill) => report.backfill.push((channel.id.clone(), backfill)),
                Err(e) if e.class() == ErrorClass::Shutdown => return Err(e),
                Err(e) => warn!(%pass_id, channel_id = %channel.id, error = %e, "Channel backfill failed"),
            }
        }
        self.finish_messages(scope_id, true).await?;

        Ok(report)
    }

    async fn incremental_sync(&self, scope_id: &str, pass_id: Uuid) -> Result<PassReport> {
        let mut report = PassReport::new(pass_id, scope_id, PassMode::Incremental);
        for kind in EntityKind::ALL {
            self.metadata.mark_syncing(scope_id, kind).await;
        }

        self.sync_guild(scope_id, false).await?;

        self.ensure_running()?;
        let channels = self.source.fetch_all(EntityKind::Channel, scope_id).await?;
        report.reconciled.push(
            self.reconciler
                .reconcile(scope_id, EntityKind::Channel, channels.clone())
                .await?,
        );

        self.ensure_running()?;
        let roles = self.source.fetch_all(EntityKind::Role, scope_id).await?;
        report
            .reconciled
            .push(self.reconciler.reconcile(scope_id, EntityKind::Role, roles).await?);

        self.ensure_running()?;
        let live_members = self.source.fetch_all(EntityKind::Member, scope_id).await?;
        let prepared = self.prepare_members(live_members).await?;
        // Members already in the replica are only rewritten when their profile moved
        let plan = ReconcilePlan {
            refresh: prepared.changed,
            held: prepared.held,
            ..ReconcilePlan::default()
        };
        let member_report = self
            .reconciler
            .reconcile_with(scope_id, EntityKind::Member, prepared.members, plan)
            .await?;
        report.profile_changes = member_report.refreshed;
        report.reconciled.push(member_report);

        self.ensure_running()?;
        if self.activity.is_scope_active(scope_id).await {
            let live_channels: Vec<Channel> = channels
                .iter()
                .filter_map(|e| e.as_channel().cloned())
                .collect();
            let active = self.activity.filter_active_channels(live_channels).await;
            debug!(%pass_id, scope_id, active_channels = active.len(), "Selected channels for healing");
            report.messages = Some(self.healer.heal_messages(scope_id, &active).await);
        } else {
            info!(%pass_id, scope_id, "Scope inactive, skipping message healing");
        }
        self.finish_messages(scope_id, false).await?;

        Ok(report)
    }

    async fn sync_guild(&self, scope_id: &str, full: bool) -> Result<()> {
        self.ensure_running()?;
        let guild = self.source.fetch_guild(scope_id).await?;
        self.store.upsert(&Entity::Guild(guild)).await?;
        self.metadata
            .mark_healthy(scope_id, EntityKind::Guild, 1, full)
            .await;
        Ok(())
    }

    /// Mark messages healthy, unless shutdown cut the message step short
    async fn finish_messages(&self, scope_id: &str, full: bool) -> Result<()> {
        self.ensure_running()?;
        let count = match self.store.count_active(scope_id, EntityKind::Message).await {
            Ok(count) => count,
            Err(e) => {
                warn!(scope_id, error = %e, "Could not count replicated messages");
                0
            }
        };
        self.metadata
            .mark_healthy(scope_id, EntityKind::Message, count, full)
            .await;
        Ok(())
    }

    /// Run live members through the profile tracker against their stored rows.
    ///
    /// Entities that are not members are skipped. A member whose stored row
    /// cannot be read is held: it stays live but is not written this pass.
    async fn prepare_members(&self, live: Vec<Entity>) -> Result<PreparedMembers> {
        let executor = BoundedExecutor::new(self.config.member_chunk_size, self.shutdown.clone());
        let now = Utc::now();
        let outcomes = executor
            .run(live, |entity| self.prepare_member(entity, now))
            .await;

        self.ensure_running()?;
        let mut prepared = PreparedMembers::default();
        for outcome in outcomes {
            match outcome? {
                MemberOutcome::Ready(entity, changed) => {
                    if changed {
                        prepared.changed.insert(entity.id());
                    }
                    prepared.members.push(entity);
                }
                MemberOutcome::Held(id) => prepared.held.push(id),
                MemberOutcome::Skipped => {}
            }
        }
        Ok(prepared)
    }

    async fn prepare_member(&self, entity: Entity, now: DateTime<Utc>) -> Result<MemberOutcome> {
        let member = match entity {
            Entity::Member(member) => member,
            other => {
                let e = SyncError::InvalidEntity(format!("expected member, got {}", other.kind()));
                warn!(id = %other.id(), error = %e, "Skipping entity in member listing");
                return Ok(MemberOutcome::Skipped);
            }
        };

        let id = member.entity_id();
        match self.store.get(EntityKind::Member, &id).await {
            Ok(stored) => {
                let stored = stored.as_ref().and_then(Entity::as_member);
                let (merged, entry) = self.tracker.merge(member, stored, now);
                Ok(MemberOutcome::Ready(Entity::Member(merged), entry.is_some()))
            }
            Err(StoreError::Closed) => Err(StoreError::Closed.into()),
            Err(e) => {
                warn!(id = %id, error = %e, "Stored member unreadable, leaving it untouched this pass");
                Ok(MemberOutcome::Held(id))
            }
        }
    }

    // ========== Live events ==========

    /// Apply one live event to the replica
    pub async fn handle_event(&self, event: LiveEvent) -> Result<()> {
        self.ensure_running()?;
        match event {
            LiveEvent::Changed { entity } => self.apply_change(entity).await,
            LiveEvent::Removed { kind, scope_id, id } => {
                let id = replica_id(kind, &scope_id, &id);
                let changed = self.store.mark_inactive(kind, std::slice::from_ref(&id)).await?;
                debug!(%kind, scope_id = %scope_id, id = %id, changed, "Applied removal");
                Ok(())
            }
        }
    }

    async fn apply_change(&self, entity: Entity) -> Result<()> {
        let entity = match entity {
            Entity::Message(message) if message.is_automated() => {
                debug!(id = %message.id, "Ignoring automated message");
                return Ok(());
            }
            Entity::Member(member) => {
                let stored = self.store.get(EntityKind::Member, &member.entity_id()).await?;
                let stored = stored.as_ref().and_then(Entity::as_member);
                let (merged, entry) = self.tracker.merge(member, stored, Utc::now());
                if let Some(entry) = entry {
                    debug!(
                        id = %merged.entity_id(),
                        fields = ?entry.changed_fields.keys().collect::<Vec<_>>(),
                        "Profile changed"
                    );
                }
                Entity::Member(merged)
            }
            other => other,
        };
        self.store.upsert(&entity).await?;
        Ok(())
    }

    /// Apply events until the channel closes or shutdown is raised.
    /// Returns the number of events applied.
    pub async fn consume_events(&self, mut events: mpsc::Receiver<LiveEvent>) -> usize {
        let mut applied = 0;
        loop {
            let event = tokio::select! {
                _ = self.shutdown.wait() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let kind = event.kind();
            let scope_id = event.scope_id().to_string();
            match self.handle_event(event).await {
                Ok(()) => applied += 1,
                Err(e) => self.log_failure(&format!("{} event", kind), &scope_id, &e),
            }
        }
        debug!(applied, "Event stream finished");
        applied
    }

    // ========== Forced operations ==========

    /// Re-read one entity from the live side and write it. An entity that no
    /// longer exists is marked inactive. Returns whether it is still live.
    pub async fn force_sync_entity(
        &self,
        scope_id: &str,
        kind: EntityKind,
        id: &str,
    ) -> Result<bool> {
        self.ensure_running()?;
        let live_id = match kind {
            EntityKind::Member => {
                let prefix = format!("{}:", scope_id);
                id.strip_prefix(&prefix).unwrap_or(id).to_string()
            }
            _ => id.to_string(),
        };

        let fetched = match self.source.fetch_entity(kind, scope_id, &live_id).await {
            Ok(fetched) => fetched,
            Err(SourceError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        match fetched {
            Some(entity) => {
                self.apply_change(entity).await?;
                info!(scope_id, %kind, id, "Entity resynced");
                Ok(true)
            }
            None => {
                let replica_id = replica_id(kind, scope_id, id);
                self.store
                    .mark_inactive(kind, std::slice::from_ref(&replica_id))
                    .await?;
                info!(scope_id, %kind, id, "Entity gone from live side, marked inactive");
                Ok(false)
            }
        }
    }

    // ========== Drift ==========

    /// Compare replica counts with live counts. Kinds drifting past the
    /// threshold are flagged `needs_healing` for the next pass.
    pub async fn check_drift(&self, scope_id: &str) -> Result<DriftReport> {
        self.ensure_running()?;
        let guild = self.source.fetch_guild(scope_id).await?;
        let mut report = DriftReport {
            scope_id: scope_id.to_string(),
            kinds: Vec::new(),
        };

        for kind in [EntityKind::Channel, EntityKind::Role, EntityKind::Member] {
            self.ensure_running()?;
            let live = match kind {
                EntityKind::Member => match guild.approximate_member_count.or(guild.member_count) {
                    Some(count) => count,
                    None => {
                        debug!(scope_id, "No live member count, skipping member drift");
                        continue;
                    }
                },
                _ => self.source.fetch_all(kind, scope_id).await?.len() as u64,
            };
            let replica = self.store.count_active(scope_id, kind).await?;
            let ratio = drift_ratio(live, replica);
            let flagged = ratio > self.config.drift_threshold;
            if flagged {
                warn!(scope_id, %kind, live, replica, ratio, "Replica drifted from live counts");
                self.metadata.mark_needs_healing(scope_id, kind).await;
            }
            report.kinds.push(KindDrift {
                kind,
                live,
                replica,
                ratio,
                flagged,
            });
        }
        Ok(report)
    }

    // ========== Scheduling ==========

    /// Startup pass over `scopes`, then a pass per scope every
    /// `sync_interval` and drift detection every `drift_interval`. Returns
    /// once shutdown is raised.
    pub async fn run(&self, scopes: Vec<ScopeId>) {
        self.start(&scopes).await;
        info!(
            "Starting sync scheduler with interval {} seconds",
            self.config.sync_interval.as_secs()
        );

        let mut sync_tick = time::interval_at(
            time::Instant::now() + self.config.sync_interval,
            self.config.sync_interval,
        );
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut drift_tick = time::interval_at(
            time::Instant::now() + self.config.drift_interval,
            self.config.drift_interval,
        );
        drift_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                _ = sync_tick.tick() => {
                    for scope_id in &scopes {
                        if self.shutdown.is_shutting_down() {
                            break;
                        }
                        // Failures are logged inside the pass
                        let _ = self.sync_scope(scope_id).await;
                    }
                }
                _ = drift_tick.tick() => {
                    for scope_id in &scopes {
                        if self.shutdown.is_shutting_down() {
                            break;
                        }
                        if let Err(e) = self.check_drift(scope_id).await {
                            self.log_failure("Drift check", scope_id, &e);
                        }
                    }
                }
            }
        }
        info!("Sync scheduler stopped");
    }

    /// Raise the shutdown flag and give in-flight writes a moment to land
    pub async fn shutdown(&self) {
        info!("Shutting down replica sync");
        self.shutdown.trigger();
        time::sleep(self.config.shutdown_grace).await;
    }
}

fn message_channels(channels: &[Entity]) -> impl Iterator<Item = &Channel> {
    channels
        .iter()
        .filter_map(Entity::as_channel)
        .filter(|c| c.active && c.kind.is_message_bearing())
}
