use std::sync::Arc;

use replica_sync_engine::test_utils::{MemoryStore, ScriptedSource};
use replica_sync_engine::{
    EngineConfig, EntityKind, Guild, Member, PassMode, SyncMetadata, MetadataUpdate,
    ReplicaStore, SyncOrchestrator, SyncStatus,
};

fn live_members(source: &ScriptedSource) {
    source.put(Member::new("g1", "u1", "alice"));
    source.put(Member::new("g1", "u2", "bob"));
    source.put(Member::new("g1", "u3", "carol"));
}

async fn mark_healthy(store: &MemoryStore) {
    let now = chrono::Utc::now();
    for kind in EntityKind::ALL {
        let update = MetadataUpdate {
            last_full_sync: Some(now),
            status: Some(SyncStatus::Healthy),
            ..MetadataUpdate::default()
        };
        let record = SyncMetadata::merge(None, "g1", kind, &update, now);
        store.upsert_metadata(&record).await.expect("metadata");
    }
}

#[tokio::test]
async fn incremental_member_sync_converges_without_duplicates() {
    let source = Arc::new(ScriptedSource::new());
    source.set_guild(Guild::new("g1", "guild"));
    live_members(&source);

    let store = Arc::new(MemoryStore::with_entities(vec![
        Member::new("g1", "u1", "alice").into(),
        Member::new("g1", "u2", "bob").into(),
        Member::new("g1", "u9", "stale").into(),
    ]));
    mark_healthy(&store).await;

    let orchestrator = SyncOrchestrator::new(
        source.clone(),
        store.clone(),
        EngineConfig::default().without_delays(),
    );

    let outcome = orchestrator.sync_scope("g1").await.expect("sync");
    let report = outcome.report().expect("pass ran");
    assert_eq!(report.mode, PassMode::Incremental);

    let active = store
        .get_ids("g1", EntityKind::Member)
        .await
        .expect("active ids");
    let mut active: Vec<_> = active.into_iter().collect();
    active.sort();
    assert_eq!(active, vec!["g1:u1", "g1:u2", "g1:u3"]);

    let stale = store.member("g1", "u9").expect("stale row kept");
    assert!(!stale.active);
    assert_eq!(store.rows(EntityKind::Member).len(), 4);

    let members = report.reconciled(EntityKind::Member).expect("member report");
    assert_eq!(members.upserted, 1);
    assert_eq!(members.deactivated, 1);

    let meta = store
        .get_metadata("g1", EntityKind::Member)
        .await
        .expect("metadata read")
        .expect("metadata present");
    assert_eq!(meta.entity_count, 3);
    assert_eq!(meta.status, SyncStatus::Healthy);
}

#[tokio::test]
async fn rejoining_member_keeps_profile_history() {
    let source = Arc::new(ScriptedSource::new());
    source.set_guild(Guild::new("g1", "guild"));
    source.put(Member::new("g1", "u1", "alice"));

    let store = Arc::new(MemoryStore::new());
    let orchestrator = SyncOrchestrator::new(
        source.clone(),
        store.clone(),
        EngineConfig::default().without_delays(),
    );
    orchestrator.sync_scope("g1").await.expect("full sync");

    source.put(Member::new("g1", "u1", "alice").with_nickname("ally"));
    orchestrator
        .force_sync_entity("g1", EntityKind::Member, "u1")
        .await
        .expect("force sync");

    source.remove(EntityKind::Member, "g1:u1");
    mark_healthy(&store).await;
    orchestrator.sync_scope("g1").await.expect("incremental");
    assert!(!store.member("g1", "u1").expect("row").active);

    source.put(Member::new("g1", "u1", "alice").with_nickname("ally"));
    orchestrator.sync_scope("g1").await.expect("incremental");

    let member = store.member("g1", "u1").expect("row");
    assert!(member.active);
    assert_eq!(member.profile_history.len(), 1);
}
