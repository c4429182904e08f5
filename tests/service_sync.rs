use std::env;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serial_test::serial;
use tempfile::tempdir;
use tokio::sync::mpsc;

use replica_sync::engine::test_utils::ScriptedSource;
use replica_sync::engine::{
    Channel, ChannelKind, EntityKind, Guild, LiveEvent, Member, Message, PassMode, ReplicaStore,
    Role, SyncStatus,
};
use replica_sync::{AppConfig, ReplicaStoreAdapter, ReplicaSyncService};

fn scripted_guild() -> Arc<ScriptedSource> {
    let source = Arc::new(ScriptedSource::new());
    let mut guild = Guild::new("g1", "guild");
    guild.approximate_member_count = Some(2);
    source.set_guild(guild);
    source.put(Channel::new("c1", "g1", "general", ChannelKind::Text));
    source.put(Channel::new("cat", "g1", "Text Channels", ChannelKind::Category));
    source.put(Role::new("r1", "g1", "mods"));
    source.put(Member::new("g1", "u1", "alice"));
    source.put(Member::new("g1", "u2", "bob"));
    for i in 0..3 {
        source.add_message(Message::new(
            format!("m{}", i),
            "g1",
            "c1",
            "u1",
            Utc::now() - Duration::minutes(30 - i),
        ));
    }
    source
}

fn test_config(dir: &std::path::Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.database.path = dir.join("replica.duckdb");
    config.sync.page_delay_ms = 0;
    config.sync.batch_delay_ms = 0;
    config.sync.shutdown_grace_ms = 0;
    config
}

#[tokio::test]
async fn full_then_incremental_pass_against_duckdb() {
    let dir = tempdir().expect("tempdir");
    let source = scripted_guild();
    let service =
        ReplicaSyncService::open(test_config(dir.path()), source.clone()).expect("service");
    let orchestrator = service.orchestrator();
    let store = ReplicaStoreAdapter::new(service.persistence().clone());

    let first = orchestrator.sync_scope("g1").await.expect("first pass");
    assert_eq!(first.report().expect("report").mode, PassMode::Full);
    assert_eq!(store.count_active("g1", EntityKind::Message).await.expect("count"), 3);
    assert_eq!(store.count_active("g1", EntityKind::Member).await.expect("count"), 2);

    let meta = store
        .get_metadata("g1", EntityKind::Message)
        .await
        .expect("metadata")
        .expect("present");
    assert_eq!(meta.status, SyncStatus::Healthy);
    assert_eq!(meta.entity_count, 3);

    source.remove(EntityKind::Member, "g1:u2");
    let second = orchestrator.sync_scope("g1").await.expect("second pass");
    let report = second.report().expect("report");
    assert_eq!(report.mode, PassMode::Incremental);
    assert_eq!(
        report.reconciled(EntityKind::Member).expect("members").deactivated,
        1
    );

    let bob = store
        .get(EntityKind::Member, "g1:u2")
        .await
        .expect("get")
        .expect("row kept");
    assert!(!bob.is_active());
}

#[tokio::test]
async fn events_flow_through_the_spawned_service() {
    let dir = tempdir().expect("tempdir");
    let source = scripted_guild();
    let service = ReplicaSyncService::open(test_config(dir.path()), source).expect("service");
    let store = ReplicaStoreAdapter::new(service.persistence().clone());

    let (tx, rx) = mpsc::channel(16);
    let handle = service.spawn(Vec::new(), Some(rx));

    tx.send(LiveEvent::changed(Member::new("g1", "u7", "gina")))
        .await
        .expect("send");
    tx.send(LiveEvent::changed(
        Member::new("g1", "u7", "gina").with_nickname("gigi"),
    ))
    .await
    .expect("send");
    tx.send(LiveEvent::removed(EntityKind::Role, "g1", "r1"))
        .await
        .expect("send");
    drop(tx);

    // the event task ends when the channel closes; the scheduler needs shutdown
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let gina = store
        .get(EntityKind::Member, "g1:u7")
        .await
        .expect("get")
        .expect("row");
    let gina = gina.as_member().expect("member");
    assert_eq!(gina.nickname.as_deref(), Some("gigi"));
    assert_eq!(gina.profile_history.len(), 1);

    service.shutdown().await;
    handle.join().await.expect("join");
    assert!(store.persistence().is_closed());
}

#[tokio::test]
async fn spawned_service_runs_the_startup_pass() {
    let dir = tempdir().expect("tempdir");
    let service =
        ReplicaSyncService::open(test_config(dir.path()), scripted_guild()).expect("service");
    let store = ReplicaStoreAdapter::new(service.persistence().clone());

    let handle = service.spawn(vec!["g1".to_string()], None);

    let mut members = 0;
    for _ in 0..50 {
        members = store.count_active("g1", EntityKind::Member).await.expect("count");
        if members == 2 && !service.orchestrator().is_syncing() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(members, 2);

    let meta = store
        .get_metadata("g1", EntityKind::Message)
        .await
        .expect("metadata")
        .expect("present");
    assert_eq!(meta.status, SyncStatus::Healthy);

    service.shutdown().await;
    handle.join().await.expect("join");
}

#[tokio::test]
#[serial]
async fn database_path_can_come_from_the_environment() {
    let dir = tempdir().expect("tempdir");
    let db_path = dir.path().join("nested").join("from-env.duckdb");
    env::set_var("REPLICA_SYNC_DB_PATH", &db_path);

    let mut config = AppConfig::default();
    config.apply_env_overrides().expect("overrides");
    env::remove_var("REPLICA_SYNC_DB_PATH");

    let service =
        ReplicaSyncService::open(config, Arc::new(ScriptedSource::new())).expect("service");
    assert_eq!(service.persistence().path(), Some(db_path.as_path()));
    assert!(db_path.parent().expect("parent").exists());
}
