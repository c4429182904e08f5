//! DuckDB-backed persistence for replica rows and sync metadata.
//!
//! Rows are kept deliberately schema-light: every replicated entity lives in
//! `replica_entities` keyed by `(kind, id)` with its attributes serialized as
//! JSON text. Timestamps are stored as RFC 3339 strings.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Returned by every operation once [`Persistence::close`] has been called.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("persistence has been closed")]
pub struct PersistenceClosed;

/// A replicated entity as stored in `replica_entities`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub kind: String,
    pub id: String,
    pub scope_id: String,
    pub active: bool,
    pub data: serde_json::Value,
    /// Last modification time reported by the live platform, if any
    pub source_updated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A row of `sync_metadata`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMetadataRow {
    pub scope_id: String,
    pub kind: String,
    pub last_full_sync: Option<DateTime<Utc>>,
    pub last_check: DateTime<Utc>,
    pub entity_count: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS replica_entities (
    kind VARCHAR NOT NULL,
    id VARCHAR NOT NULL,
    scope_id VARCHAR NOT NULL,
    active BOOLEAN NOT NULL DEFAULT TRUE,
    data VARCHAR NOT NULL,
    source_updated_at VARCHAR,
    updated_at VARCHAR NOT NULL,
    PRIMARY KEY (kind, id)
);

CREATE TABLE IF NOT EXISTS sync_metadata (
    scope_id VARCHAR NOT NULL,
    kind VARCHAR NOT NULL,
    last_full_sync VARCHAR,
    last_check VARCHAR NOT NULL,
    entity_count BIGINT NOT NULL DEFAULT 0,
    status VARCHAR NOT NULL,
    created_at VARCHAR NOT NULL,
    updated_at VARCHAR NOT NULL,
    PRIMARY KEY (scope_id, kind)
);
"#;

const UPSERT_ENTITY: &str = r#"
INSERT INTO replica_entities (kind, id, scope_id, active, data, source_updated_at, updated_at)
VALUES (?, ?, ?, ?, ?, ?, ?)
ON CONFLICT (kind, id) DO UPDATE SET
    scope_id = excluded.scope_id,
    active = excluded.active,
    data = excluded.data,
    source_updated_at = excluded.source_updated_at,
    updated_at = excluded.updated_at
"#;

/// Handle to the replica database.
///
/// Cloning is cheap; all clones share one connection.
#[derive(Clone)]
pub struct Persistence {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Persistence {
    /// Open (or create) the database at `db_path` and ensure the schema exists
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open DuckDB at {}", path.display()))?;
        info!("Opened replica database at {}", path.display());
        Self::from_connection(conn, Some(path))
    }

    /// Open a throwaway in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory DuckDB")?;
        Self::from_connection(conn, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to create replica schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Database file path, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Refuse all further operations. Used while the host process shuts down.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Replica persistence closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        if self.is_closed() {
            return Err(PersistenceClosed.into());
        }
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("replica connection mutex poisoned"))
    }

    // ========== Entity Operations ==========

    /// Insert or replace a single entity row
    pub fn entity_upsert(&self, row: &EntityRow) -> Result<()> {
        let conn = self.conn()?;
        let data = serde_json::to_string(&row.data)?;
        conn.execute(
            UPSERT_ENTITY,
            params![
                row.kind,
                row.id,
                row.scope_id,
                row.active,
                data,
                row.source_updated_at.map(|t| t.to_rfc3339()),
                row.updated_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to upsert {} {}", row.kind, row.id))?;
        Ok(())
    }

    /// Upsert many rows inside one transaction. Returns the number written.
    pub fn entity_upsert_many(&self, rows: &[EntityRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for row in rows {
            let data = serde_json::to_string(&row.data)?;
            tx.execute(
                UPSERT_ENTITY,
                params![
                    row.kind,
                    row.id,
                    row.scope_id,
                    row.active,
                    data,
                    row.source_updated_at.map(|t| t.to_rfc3339()),
                    row.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("Failed to upsert {} {}", row.kind, row.id))?;
        }
        tx.commit().context("Failed to commit bulk upsert")?;
        Ok(rows.len())
    }

    /// Flip `active` to false for the given ids. Returns rows changed.
    pub fn entity_mark_inactive(&self, kind: &str, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        for id in ids {
            changed += tx
                .execute(
                    "UPDATE replica_entities SET active = FALSE, updated_at = ? \
                     WHERE kind = ? AND id = ? AND active = TRUE",
                    params![now, kind, id],
                )
                .with_context(|| format!("Failed to deactivate {} {}", kind, id))?;
        }
        tx.commit().context("Failed to commit deactivation")?;
        Ok(changed)
    }

    /// Ids of active rows of `kind` within a scope
    pub fn entity_active_ids(&self, scope_id: &str, kind: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM replica_entities WHERE scope_id = ? AND kind = ? AND active = TRUE",
        )?;
        let rows = stmt.query_map(params![scope_id, kind], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(id?);
        }
        Ok(ids)
    }

    /// Point read of a single row, active or not
    pub fn entity_get(&self, kind: &str, id: &str) -> Result<Option<EntityRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT kind, id, scope_id, active, data, source_updated_at, updated_at \
             FROM replica_entities WHERE kind = ? AND id = ?",
        )?;
        let mut rows = stmt.query_map(params![kind, id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let Some(raw) = rows.next() else {
            return Ok(None);
        };
        let (kind, id, scope_id, active, data, source_updated_at, updated_at) = raw?;
        Ok(Some(EntityRow {
            data: serde_json::from_str(&data)
                .with_context(|| format!("Corrupt JSON payload for {} {}", kind, id))?,
            source_updated_at: source_updated_at.as_deref().map(parse_ts).transpose()?,
            updated_at: parse_ts(&updated_at)?,
            kind,
            id,
            scope_id,
            active,
        }))
    }

    /// Whether a row exists for `(kind, id)`, active or not
    pub fn entity_exists(&self, kind: &str, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM replica_entities WHERE kind = ? AND id = ?",
            params![kind, id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Number of active rows of `kind` within a scope
    pub fn entity_count_active(&self, scope_id: &str, kind: &str) -> Result<i64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM replica_entities WHERE scope_id = ? AND kind = ? AND active = TRUE",
            params![scope_id, kind],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // ========== Sync Metadata Operations ==========

    pub fn sync_metadata_get(&self, scope_id: &str, kind: &str) -> Result<Option<SyncMetadataRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT scope_id, kind, last_full_sync, last_check, entity_count, status, created_at, updated_at \
             FROM sync_metadata WHERE scope_id = ? AND kind = ?",
        )?;
        let mut rows = stmt.query_map(params![scope_id, kind], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let Some(raw) = rows.next() else {
            return Ok(None);
        };
        let (scope_id, kind, last_full_sync, last_check, entity_count, status, created_at, updated_at) =
            raw?;
        Ok(Some(SyncMetadataRow {
            scope_id,
            kind,
            last_full_sync: last_full_sync.as_deref().map(parse_ts).transpose()?,
            last_check: parse_ts(&last_check)?,
            entity_count,
            status,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        }))
    }

    /// Write a complete metadata row, replacing any existing one
    pub fn sync_metadata_upsert(&self, row: &SyncMetadataRow) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO sync_metadata
                (scope_id, kind, last_full_sync, last_check, entity_count, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (scope_id, kind) DO UPDATE SET
                last_full_sync = excluded.last_full_sync,
                last_check = excluded.last_check,
                entity_count = excluded.entity_count,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
            params![
                row.scope_id,
                row.kind,
                row.last_full_sync.map(|t| t.to_rfc3339()),
                row.last_check.to_rfc3339(),
                row.entity_count,
                row.status,
                row.created_at.to_rfc3339(),
                row.updated_at.to_rfc3339(),
            ],
        )
        .with_context(|| {
            format!(
                "Failed to upsert sync metadata for {}/{}",
                row.scope_id, row.kind
            )
        })?;
        Ok(())
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp {:?}", raw))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::tempdir;

    fn row(kind: &str, id: &str, scope: &str) -> EntityRow {
        EntityRow {
            kind: kind.to_string(),
            id: id.to_string(),
            scope_id: scope.to_string(),
            active: true,
            data: json!({ "id": id, "name": format!("{}-{}", kind, id) }),
            source_updated_at: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn upsert_then_get_round_trips_payload() {
        let persistence = Persistence::in_memory().unwrap();
        let mut channel = row("channel", "c1", "g1");
        channel.source_updated_at = Some(Utc::now() - Duration::minutes(5));
        persistence.entity_upsert(&channel).unwrap();

        let stored = persistence.entity_get("channel", "c1").unwrap().unwrap();
        assert_eq!(stored.data["name"], "channel-c1");
        assert!(stored.active);
        assert!(stored.source_updated_at.is_some());
        assert!(persistence.entity_get("channel", "missing").unwrap().is_none());
    }

    #[test]
    fn upsert_overwrites_existing_row_without_duplicating() {
        let persistence = Persistence::in_memory().unwrap();
        persistence.entity_upsert(&row("role", "r1", "g1")).unwrap();

        let mut renamed = row("role", "r1", "g1");
        renamed.data = json!({ "id": "r1", "name": "moderators" });
        persistence.entity_upsert(&renamed).unwrap();

        assert_eq!(persistence.entity_count_active("g1", "role").unwrap(), 1);
        let stored = persistence.entity_get("role", "r1").unwrap().unwrap();
        assert_eq!(stored.data["name"], "moderators");
    }

    #[test]
    fn mark_inactive_keeps_rows_but_hides_them_from_active_ids() {
        let persistence = Persistence::in_memory().unwrap();
        let rows = vec![row("channel", "a", "g1"), row("channel", "b", "g1")];
        assert_eq!(persistence.entity_upsert_many(&rows).unwrap(), 2);

        let changed = persistence
            .entity_mark_inactive("channel", &["b".to_string(), "zzz".to_string()])
            .unwrap();
        assert_eq!(changed, 1);

        assert_eq!(
            persistence.entity_active_ids("g1", "channel").unwrap(),
            vec!["a".to_string()]
        );
        assert!(persistence.entity_exists("channel", "b").unwrap());
        assert!(!persistence.entity_get("channel", "b").unwrap().unwrap().active);
    }

    #[test]
    fn active_ids_are_scoped() {
        let persistence = Persistence::in_memory().unwrap();
        persistence
            .entity_upsert_many(&[row("role", "r1", "g1"), row("role", "r2", "g2")])
            .unwrap();

        assert_eq!(persistence.entity_active_ids("g1", "role").unwrap(), vec!["r1"]);
        assert_eq!(persistence.entity_count_active("g2", "role").unwrap(), 1);
        assert_eq!(persistence.entity_count_active("g2", "channel").unwrap(), 0);
    }

    #[test]
    fn metadata_upsert_preserves_created_at() {
        let persistence = Persistence::in_memory().unwrap();
        let created = Utc::now() - Duration::days(3);
        let mut meta = SyncMetadataRow {
            scope_id: "g1".to_string(),
            kind: "member".to_string(),
            last_full_sync: None,
            last_check: created,
            entity_count: 10,
            status: "syncing".to_string(),
            created_at: created,
            updated_at: created,
        };
        persistence.sync_metadata_upsert(&meta).unwrap();

        meta.status = "healthy".to_string();
        meta.entity_count = 12;
        meta.created_at = Utc::now();
        meta.updated_at = Utc::now();
        persistence.sync_metadata_upsert(&meta).unwrap();

        let stored = persistence.sync_metadata_get("g1", "member").unwrap().unwrap();
        assert_eq!(stored.status, "healthy");
        assert_eq!(stored.entity_count, 12);
        assert_eq!(stored.created_at.timestamp(), created.timestamp());
        assert!(persistence.sync_metadata_get("g1", "role").unwrap().is_none());
    }

    #[test]
    fn closed_persistence_refuses_operations() {
        let persistence = Persistence::in_memory().unwrap();
        persistence.close();

        let err = persistence.entity_upsert(&row("guild", "g1", "g1")).unwrap_err();
        assert!(err.downcast_ref::<PersistenceClosed>().is_some());
    }

    #[test]
    fn file_backed_database_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("replica.duckdb");

        {
            let persistence = Persistence::new(&db_path).expect("persistence");
            persistence.entity_upsert(&row("guild", "g1", "g1")).unwrap();
        }

        let reopened = Persistence::new(&db_path).expect("reopen");
        assert!(reopened.entity_exists("guild", "g1").unwrap());
        assert_eq!(reopened.path(), Some(db_path.as_path()));
    }
}
