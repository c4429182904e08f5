//! Activity heuristics that bound how much message healing a pass does.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::concurrency::{BoundedExecutor, ShutdownSignal};
use crate::error::SourceError;
use crate::persistence::ReplicaStore;
use crate::source::LiveSource;
use crate::types::{Channel, EntityKind};

/// Decides which scopes and channels are worth a message pass.
#[derive(Clone)]
pub struct ActivityScopeFilter {
    source: Arc<dyn LiveSource>,
    store: Arc<dyn ReplicaStore>,
    window: Duration,
    probes: BoundedExecutor,
}

impl ActivityScopeFilter {
    pub fn new(
        source: Arc<dyn LiveSource>,
        store: Arc<dyn ReplicaStore>,
        window: Duration,
        probe_batch: usize,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            source,
            store,
            window,
            probes: BoundedExecutor::new(probe_batch, shutdown),
        }
    }

    /// Whether `at` falls strictly inside the activity window ending at `now`
    pub fn is_recent(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - at < self.window
    }

    /// Cheap scope-level check made before any per-channel work.
    ///
    /// Anyone online, or membership that moved since the replica last saw it,
    /// counts as activity. Whenever the counts needed to decide are missing
    /// the scope is treated as active.
    pub async fn is_scope_active(&self, scope_id: &str) -> bool {
        let guild = match self.source.fetch_guild(scope_id).await {
            Ok(guild) => guild,
            Err(e) => {
                warn!(scope_id, error = %e, "Guild lookup failed, assuming active");
                return true;
            }
        };

        if guild.approximate_presence_count.is_some_and(|online| online > 0) {
            return true;
        }

        let live_members = guild.approximate_member_count.or(guild.member_count);
        if let Some(live_members) = live_members {
            match self.store.count_active(scope_id, EntityKind::Member).await {
                Ok(replica_members) if replica_members != live_members => {
                    debug!(scope_id, replica_members, live_members, "Membership changed");
                    return true;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(scope_id, error = %e, "Replica member count unavailable, assuming active");
                    return true;
                }
            }
        }

        match guild.approximate_presence_count {
            Some(_) => {
                debug!(scope_id, "Nobody online and membership unchanged");
                false
            }
            None => true,
        }
    }

    pub async fn filter_active_channels(&self, channels: Vec<Channel>) -> Vec<Channel> {
        self.filter_active_channels_at(channels, Utc::now()).await
    }

    /// Keep the message-bearing channels with a message inside the window.
    ///
    /// Channels carrying a cached `last_message_at` are decided locally. The
    /// rest are probed with a one-message read. Input order is preserved.
    pub async fn filter_active_channels_at(
        &self,
        channels: Vec<Channel>,
        now: DateTime<Utc>,
    ) -> Vec<Channel> {
        let candidates: Vec<Channel> = channels
            .into_iter()
            .filter(|c| c.active && c.kind.is_message_bearing())
            .collect();

        let mut keep = vec![false; candidates.len()];
        let mut to_probe = Vec::new();
        for (index, channel) in candidates.iter().enumerate() {
            match channel.last_message_at {
                Some(at) => keep[index] = self.is_recent(at, now),
                None => to_probe.push((index, channel.id.clone())),
            }
        }

        if !to_probe.is_empty() {
            debug!(count = to_probe.len(), "Probing channels without a cached watermark");
            let probed = self
                .probes
                .run(to_probe, |(index, channel_id)| async move {
                    (index, self.probe(&channel_id, now).await)
                })
                .await;
            for (index, active) in probed {
                keep[index] = active;
            }
        }

        candidates
            .into_iter()
            .zip(keep)
            .filter_map(|(channel, active)| active.then_some(channel))
            .collect()
    }

    async fn probe(&self, channel_id: &str, now: DateTime<Utc>) -> bool {
        match self.source.fetch_recent_messages(channel_id, 1, None).await {
            Ok(messages) => messages
                .first()
                .is_some_and(|newest| self.is_recent(newest.created_at, now)),
            Err(SourceError::AccessDenied(_)) => {
                debug!(channel_id, "No access to channel, treating as inactive");
                false
            }
            Err(e) => {
                warn!(channel_id, error = %e, "Activity probe failed");
                false
            }
        }
    }
}
