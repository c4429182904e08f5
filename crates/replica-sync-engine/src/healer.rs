//! Windowed message reconciliation and channel backfill.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::concurrency::{BoundedExecutor, ShutdownSignal};
use crate::config::EngineConfig;
use crate::error::{Result, SourceError, StoreError, SyncError};
use crate::persistence::ReplicaStore;
use crate::source::LiveSource;
use crate::types::{Channel, Entity, EntityKind, Message};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealReport {
    pub channels: usize,
    /// Inserted or re-synced after an edit
    pub synced: usize,
    /// Authored by bots or the platform
    pub skipped: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub access_denied_channels: Vec<String>,
    /// Channels whose window could not be fetched
    pub failed_channels: Vec<String>,
}

impl HealReport {
    fn absorb(&mut self, other: HealReport) {
        self.channels += other.channels;
        self.synced += other.synced;
        self.skipped += other.skipped;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
        self.access_denied_channels.extend(other.access_denied_channels);
        self.failed_channels.extend(other.failed_channels);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackfillReport {
    pub pages: usize,
    pub synced: usize,
    pub skipped: usize,
    pub failed: usize,
    pub access_denied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageOutcome {
    Synced,
    Unchanged,
    Failed,
}

/// Channel batch width: wide for few channels, narrowing as the count grows.
pub fn channel_batch_size(active_channels: usize, min: usize, max: usize) -> usize {
    let max = max.max(min);
    max.saturating_sub(active_channels / 10).clamp(min, max)
}

#[derive(Clone)]
pub struct MessageHealer {
    source: Arc<dyn LiveSource>,
    store: Arc<dyn ReplicaStore>,
    config: EngineConfig,
    shutdown: ShutdownSignal,
}

impl MessageHealer {
    pub fn new(
        source: Arc<dyn LiveSource>,
        store: Arc<dyn ReplicaStore>,
        config: EngineConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            source,
            store,
            config,
            shutdown,
        }
    }

    /// Check the newest window of every channel against the replica.
    pub async fn heal_messages(&self, scope_id: &str, channels: &[Channel]) -> HealReport {
        let batch = channel_batch_size(
            channels.len(),
            self.config.channel_batch_min,
            self.config.channel_batch_max,
        );
        let executor = BoundedExecutor::new(batch, self.shutdown.clone());
        let mut report = HealReport::default();

        debug!(scope_id, channels = channels.len(), batch, "Healing messages");

        for (index, chunk) in channels.chunks(batch).enumerate() {
            if index > 0 && !self.shutdown.sleep(self.config.batch_delay).await {
                break;
            }
            if self.shutdown.is_shutting_down() {
                break;
            }
            let outcomes = executor
                .run(chunk, |channel| self.heal_channel(channel))
                .await;
            for outcome in outcomes {
                report.absorb(outcome);
            }
        }

        info!(
            scope_id,
            channels = report.channels,
            synced = report.synced,
            skipped = report.skipped,
            unchanged = report.unchanged,
            failed = report.failed,
            denied = report.access_denied_channels.len(),
            "Message healing finished"
        );
        report
    }

    async fn heal_channel(&self, channel: &Channel) -> HealReport {
        let mut report = HealReport {
            channels: 1,
            ..HealReport::default()
        };

        let window = match self
            .source
            .fetch_recent_messages(&channel.id, self.config.message_window, None)
            .await
        {
            Ok(window) => window,
            Err(SourceError::AccessDenied(_)) => {
                debug!(channel_id = %channel.id, "No access to channel");
                report.access_denied_channels.push(channel.id.clone());
                return report;
            }
            Err(e) => {
                warn!(channel_id = %channel.id, error = %e, "Failed to fetch message window");
                report.failed_channels.push(channel.id.clone());
                return report;
            }
        };

        let (automated, human): (Vec<Message>, Vec<Message>) =
            window.into_iter().partition(Message::is_automated);
        report.skipped = automated.len();

        let sub_batch = BoundedExecutor::new(self.config.message_sub_batch, self.shutdown.clone());
        for chunk in human.chunks(self.config.message_sub_batch) {
            if self.shutdown.is_shutting_down() {
                break;
            }
            let outcomes = sub_batch.run(chunk, |message| self.heal_message(message)).await;
            for outcome in outcomes {
                match outcome {
                    MessageOutcome::Synced => report.synced += 1,
                    MessageOutcome::Unchanged => report.unchanged += 1,
                    MessageOutcome::Failed => report.failed += 1,
                }
            }
        }
        report
    }

    async fn heal_message(&self, message: &Message) -> MessageOutcome {
        match self.needs_write(message).await {
            Ok(false) => MessageOutcome::Unchanged,
            Ok(true) => match self.store.upsert(&Entity::Message(message.clone())).await {
                Ok(()) => MessageOutcome::Synced,
                Err(e) => {
                    self.log_store_failure(&message.id, &e);
                    MessageOutcome::Failed
                }
            },
            Err(e) => {
                self.log_store_failure(&message.id, &e);
                MessageOutcome::Failed
            }
        }
    }

    /// Absent rows are inserted. Present rows are rewritten only when the
    /// live edit time is newer than the stored one.
    async fn needs_write(&self, message: &Message) -> std::result::Result<bool, StoreError> {
        if !self.store.point_exists(EntityKind::Message, &message.id).await? {
            return Ok(true);
        }
        let Some(live_edit) = message.edited_at else {
            return Ok(false);
        };
        let stored = self.store.get(EntityKind::Message, &message.id).await?;
        Ok(match stored.as_ref().and_then(Entity::as_message) {
            Some(stored) => stored.edited_at.map_or(true, |stored_edit| live_edit > stored_edit),
            None => true,
        })
    }

    fn log_store_failure(&self, message_id: &str, error: &StoreError) {
        if matches!(error, StoreError::Closed) && self.shutdown.is_shutting_down() {
            debug!(message_id, "Store closed during shutdown");
        } else {
            warn!(message_id, error = %error, "Failed to heal message");
        }
    }

    /// Walk a channel's history backwards page by page, writing every
    /// human-authored message.
    ///
    /// Stops on a short page, at `max_pages`, or on shutdown.
    pub async fn backfill_channel(&self, channel: &Channel, max_pages: usize) -> Result<BackfillReport> {
        let mut report = BackfillReport::default();
        let mut before: Option<String> = None;
        let page_size = self.config.message_window;

        while report.pages < max_pages {
            if report.pages > 0 && !self.shutdown.sleep(self.config.page_delay).await {
                break;
            }
            if self.shutdown.is_shutting_down() {
                break;
            }

            let page = match self
                .source
                .fetch_recent_messages(&channel.id, page_size, before.as_deref())
                .await
            {
                Ok(page) => page,
                Err(SourceError::AccessDenied(_)) => {
                    debug!(channel_id = %channel.id, "No access to channel, skipping backfill");
                    report.access_denied = true;
                    return Ok(report);
                }
                Err(e) => return Err(SyncError::from(e)),
            };
            report.pages += 1;

            let Some(oldest) = page.last() else {
                break;
            };
            before = Some(oldest.id.clone());
            let short_page = page.len() < page_size;

            let entities: Vec<Entity> = page
                .into_iter()
                .filter(|m| {
                    let keep = !m.is_automated();
                    if !keep {
                        report.skipped += 1;
                    }
                    keep
                })
                .map(Entity::Message)
                .collect();

            if !entities.is_empty() {
                match self.store.bulk_upsert(&entities).await {
                    Ok(count) => report.synced += count,
                    Err(StoreError::Closed) => return Err(StoreError::Closed.into()),
                    Err(e) => {
                        warn!(channel_id = %channel.id, error = %e, "Page upsert failed, retrying one by one");
                        for entity in &entities {
                            match self.store.upsert(entity).await {
                                Ok(()) => report.synced += 1,
                                Err(StoreError::Closed) => return Err(StoreError::Closed.into()),
                                Err(e) => {
                                    warn!(id = %entity.id(), error = %e, "Message upsert failed");
                                    report.failed += 1;
                                }
                            }
                        }
                    }
                }
            }

            if short_page {
                break;
            }
        }

        debug!(
            channel_id = %channel.id,
            pages = report.pages,
            synced = report.synced,
            "Channel backfill finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryStore, ScriptedSource};
    use crate::types::ChannelKind;
    use chrono::{Duration, Utc};

    fn healer(source: Arc<ScriptedSource>, store: Arc<MemoryStore>) -> MessageHealer {
        MessageHealer::new(source, store, EngineConfig::default().without_delays(), ShutdownSignal::new())
    }

    fn channel(id: &str) -> Channel {
        Channel::new(id, "g1", id, ChannelKind::Text)
    }

    fn message(id: &str, channel: &str, minutes_ago: i64) -> Message {
        Message::new(id, "g1", channel, "u1", Utc::now() - Duration::minutes(minutes_ago))
    }

    #[test]
    fn channel_batch_size_narrows_with_channel_count() {
        assert_eq!(channel_batch_size(0, 2, 5), 5);
        assert_eq!(channel_batch_size(9, 2, 5), 5);
        assert_eq!(channel_batch_size(10, 2, 5), 4);
        assert_eq!(channel_batch_size(25, 2, 5), 3);
        assert_eq!(channel_batch_size(30, 2, 5), 2);
        assert_eq!(channel_batch_size(500, 2, 5), 2);
    }

    #[tokio::test]
    async fn inserts_missing_and_skips_automated_messages() {
        let source = Arc::new(ScriptedSource::new());
        source.add_message(message("m1", "c1", 5));
        source.add_message(message("m2", "c1", 4));
        let mut bot = message("m3", "c1", 3);
        bot.author_bot = true;
        source.add_message(bot);
        let mut system = message("m4", "c1", 2);
        system.system = true;
        source.add_message(system);

        let store = Arc::new(MemoryStore::with_entities(vec![message("m1", "c1", 5).into()]));
        let report = healer(source, store.clone())
            .heal_messages("g1", &[channel("c1")])
            .await;

        assert_eq!(report.synced, 1);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.skipped, 2);
        assert!(store.entity(EntityKind::Message, "m2").is_some());
        assert!(store.entity(EntityKind::Message, "m3").is_none());
    }

    #[tokio::test]
    async fn resyncs_only_newer_edits() {
        let created = Utc::now() - Duration::hours(1);
        let mut stored = Message::new("m1", "g1", "c1", "u1", created);
        stored.edited_at = Some(created + Duration::minutes(5));
        stored.content = "old".into();

        let mut same = stored.clone();
        same.id = "m2".into();
        let store = Arc::new(MemoryStore::with_entities(vec![stored.clone().into(), same.clone().into()]));

        let mut edited = stored.clone();
        edited.edited_at = Some(created + Duration::minutes(30));
        edited.content = "new".into();

        let source = Arc::new(ScriptedSource::new());
        source.add_message(edited);
        source.add_message(same);

        let report = healer(source, store.clone())
            .heal_messages("g1", &[channel("c1")])
            .await;

        assert_eq!(report.synced, 1);
        assert_eq!(report.unchanged, 1);
        let row = store.entity(EntityKind::Message, "m1").unwrap();
        assert_eq!(row.as_message().unwrap().content, "new");
    }

    #[tokio::test]
    async fn denied_channel_counts_zero_and_is_reported() {
        let source = Arc::new(ScriptedSource::new());
        source.add_message(message("m1", "secret", 1));
        source.add_message(message("m2", "open", 1));
        source.deny_channel("secret");
        let store = Arc::new(MemoryStore::new());

        let report = healer(source, store)
            .heal_messages("g1", &[channel("secret"), channel("open")])
            .await;

        assert_eq!(report.synced, 1);
        assert_eq!(report.access_denied_channels, vec!["secret".to_string()]);
    }

    #[tokio::test]
    async fn only_the_newest_window_is_checked() {
        let source = Arc::new(ScriptedSource::new());
        for i in 0..150 {
            source.add_message(message(&format!("m{:03}", i), "c1", 200 - i));
        }
        let store = Arc::new(MemoryStore::new());

        let report = healer(source, store.clone())
            .heal_messages("g1", &[channel("c1")])
            .await;

        assert_eq!(report.synced, 100);
        assert!(store.entity(EntityKind::Message, "m149").is_some());
        assert!(store.entity(EntityKind::Message, "m000").is_none());
    }

    #[tokio::test]
    async fn backfill_walks_pages_until_a_short_one() {
        let source = Arc::new(ScriptedSource::new());
        for i in 0..250 {
            source.add_message(message(&format!("m{:03}", i), "c1", 1000 - i));
        }
        let store = Arc::new(MemoryStore::new());

        let report = healer(source.clone(), store.clone())
            .backfill_channel(&channel("c1"), 10)
            .await
            .unwrap();

        assert_eq!(report.pages, 3);
        assert_eq!(report.synced, 250);
        assert_eq!(store.rows(EntityKind::Message).len(), 250);
        assert_eq!(source.message_fetch_count(), 3);
    }

    #[tokio::test]
    async fn backfill_respects_page_budget() {
        let source = Arc::new(ScriptedSource::new());
        for i in 0..250 {
            source.add_message(message(&format!("m{:03}", i), "c1", 1000 - i));
        }
        let store = Arc::new(MemoryStore::new());

        let report = healer(source, store.clone())
            .backfill_channel(&channel("c1"), 1)
            .await
            .unwrap();

        assert_eq!(report.pages, 1);
        assert_eq!(report.synced, 100);
    }

    #[tokio::test]
    async fn backfill_of_denied_channel_is_not_an_error() {
        let source = Arc::new(ScriptedSource::new());
        source.deny_channel("c1");
        let report = healer(source, Arc::new(MemoryStore::new()))
            .backfill_channel(&channel("c1"), 10)
            .await
            .unwrap();
        assert!(report.access_denied);
        assert_eq!(report.synced, 0);
    }
}
