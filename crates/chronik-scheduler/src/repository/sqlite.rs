use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chronik_core::config::DatabaseConfig;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, instrument};

use super::{dedup_ids, JobRepository};
use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::types::{EngineHandle, JobId, PersistedRecord};

const SELECT_COLUMNS: &str = "SELECT id, group_id, super_group_id, recurrence_expression, paused,
        created_at, updated_at, engine_handle, behavior_payload, input_payload
 FROM jobs";

/// `jobs` table access over a single SQLite connection.
///
/// The connection sits behind a `Mutex`; every batch runs in its own
/// transaction, so a failed batch leaves no partial rows behind.
pub struct SqliteJobRepository {
    db: Mutex<Connection>,
}

impl SqliteJobRepository {
    /// Wrap an open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open the database named in `config`. `:memory:` opens a private
    /// in-memory database.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let conn = if config.path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(&config.path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(SchedulerError::store)?;
                }
            }
            let conn = Connection::open(&config.path)?;
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
            conn
        };
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        info!(path = %config.path, "job store opened");
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn select(&self, filter: &str, params: impl rusqlite::Params) -> Result<Vec<PersistedRecord>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!("{SELECT_COLUMNS} {filter}"))?;
        let records = stmt
            .query_map(params, row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn load_active(&self) -> Result<Vec<PersistedRecord>> {
        self.select("WHERE paused = 0 ORDER BY id", [])
    }

    async fn load_all(&self) -> Result<Vec<PersistedRecord>> {
        self.select("ORDER BY id", [])
    }

    #[instrument(skip(self), fields(count = ids.len()))]
    async fn load_by_ids(&self, ids: &[JobId]) -> Result<Vec<PersistedRecord>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
        let mut found = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in dedup_ids(ids) {
            match stmt.query_row([id], row_to_record).optional()? {
                Some(record) => found.push(record),
                None => missing.push(id),
            }
        }
        if !missing.is_empty() {
            return Err(SchedulerError::NotFound { ids: missing });
        }
        Ok(found)
    }

    #[instrument(skip_all, fields(count = records.len()))]
    async fn insert(&self, records: &[PersistedRecord]) -> Result<()> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO jobs
                 (id, group_id, super_group_id, recurrence_expression, paused,
                  created_at, updated_at, engine_handle, behavior_payload, input_payload)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            )?;
            for r in records {
                stmt.execute(rusqlite::params![
                    r.id,
                    r.group_id,
                    r.super_group_id,
                    r.recurrence,
                    r.paused,
                    r.created_at.to_rfc3339(),
                    r.updated_at.to_rfc3339(),
                    r.engine_handle.map(|h| h.to_string()),
                    r.behavior_payload,
                    r.input_payload,
                ])?;
            }
        }
        tx.commit()?;
        debug!("jobs inserted");
        Ok(())
    }

    #[instrument(skip(self), fields(count = ids.len()))]
    async fn delete(&self, ids: &[JobId]) -> Result<()> {
        let mut db = self.conn();
        let tx = db.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM jobs WHERE id = ?1")?;
            for id in ids {
                deleted += stmt.execute([id])?;
            }
        }
        tx.commit()?;
        debug!(deleted, "jobs deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(count = ids.len()))]
    async fn set_paused(&self, ids: &[JobId], paused: bool) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut db = self.conn();
        let tx = db.transaction()?;
        let mut missing = Vec::new();
        {
            let mut stmt = tx.prepare("UPDATE jobs SET paused = ?1, updated_at = ?2 WHERE id = ?3")?;
            for id in ids {
                if stmt.execute(rusqlite::params![paused, now, id])? == 0 {
                    missing.push(*id);
                }
            }
        }
        if !missing.is_empty() {
            // dropping `tx` rolls the whole batch back
            return Err(SchedulerError::NotFound { ids: missing });
        }
        tx.commit()?;
        Ok(())
    }

    #[instrument(skip_all, fields(count = records.len()))]
    async fn set_handle_and_schedule(&self, records: &[PersistedRecord]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut db = self.conn();
        let tx = db.transaction()?;
        let mut missing = Vec::new();
        {
            let mut stmt = tx.prepare(
                "UPDATE jobs SET engine_handle = ?1, recurrence_expression = ?2, updated_at = ?3
                 WHERE id = ?4",
            )?;
            for r in records {
                let handle = r.engine_handle.map(|h| h.to_string());
                if stmt.execute(rusqlite::params![handle, r.recurrence, now, r.id])? == 0 {
                    missing.push(r.id);
                }
            }
        }
        if !missing.is_empty() {
            return Err(SchedulerError::NotFound { ids: missing });
        }
        tx.commit()?;
        Ok(())
    }
}

fn parse_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PersistedRecord> {
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    let handle: Option<String> = row.get(7)?;
    let engine_handle = handle
        .map(|h| h.parse::<EngineHandle>())
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;

    Ok(PersistedRecord {
        id: row.get(0)?,
        group_id: row.get(1)?,
        super_group_id: row.get(2)?,
        recurrence: row.get(3)?,
        paused: row.get(4)?,
        created_at: parse_time(5, &created_at)?,
        updated_at: parse_time(6, &updated_at)?,
        engine_handle,
        behavior_payload: row.get(8)?,
        input_payload: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: JobId) -> PersistedRecord {
        let now = Utc::now();
        PersistedRecord {
            id,
            group_id: id * 10,
            super_group_id: id * 100,
            recurrence: "@every 5s".into(),
            paused: false,
            created_at: now,
            updated_at: now,
            engine_handle: Some(EngineHandle::new()),
            behavior_payload: vec![0, 4, b'e', b'c', b'h', b'o', b'{', b'}'],
            input_payload: vec![1, 0],
        }
    }

    #[tokio::test]
    async fn insert_and_load_round_trip() {
        let repo = SqliteJobRepository::open_in_memory().expect("open");
        let records = vec![record(1), record(2)];
        repo.insert(&records).await.expect("insert");

        let loaded = repo.load_all().await.expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, 1);
        assert_eq!(loaded[0].engine_handle, records[0].engine_handle);
        assert_eq!(loaded[0].behavior_payload, records[0].behavior_payload);
        assert_eq!(loaded[1].super_group_id, 200);
        // RFC 3339 keeps sub-second precision
        assert_eq!(loaded[0].created_at, records[0].created_at);
    }

    #[tokio::test]
    async fn insert_is_all_or_nothing() {
        let repo = SqliteJobRepository::open_in_memory().expect("open");
        repo.insert(&[record(1)]).await.expect("insert");

        // 2 is new, 1 collides: nothing from this batch may land.
        let err = repo.insert(&[record(2), record(1)]).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Store(_)));
        let ids: Vec<_> = repo.load_all().await.expect("load").iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn load_by_ids_reports_every_missing_id() {
        let repo = SqliteJobRepository::open_in_memory().expect("open");
        repo.insert(&[record(1), record(2)]).await.expect("insert");

        let found = repo.load_by_ids(&[2, 1, 2]).await.expect("load");
        assert_eq!(found.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 1]);

        match repo.load_by_ids(&[1, 8, 9]).await {
            Err(SchedulerError::NotFound { ids }) => assert_eq!(ids, vec![8, 9]),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pause_filters_active_set() {
        let repo = SqliteJobRepository::open_in_memory().expect("open");
        repo.insert(&[record(1), record(2), record(3)]).await.expect("insert");
        repo.set_paused(&[2], true).await.expect("pause");

        let active: Vec<_> = repo.load_active().await.expect("load").iter().map(|r| r.id).collect();
        assert_eq!(active, vec![1, 3]);

        repo.set_paused(&[2], false).await.expect("resume");
        assert_eq!(repo.load_active().await.expect("load").len(), 3);
    }

    #[tokio::test]
    async fn set_paused_with_missing_id_changes_nothing() {
        let repo = SqliteJobRepository::open_in_memory().expect("open");
        repo.insert(&[record(1)]).await.expect("insert");
        assert!(matches!(
            repo.set_paused(&[1, 5], true).await,
            Err(SchedulerError::NotFound { .. })
        ));
        assert!(!repo.load_by_ids(&[1]).await.expect("load")[0].paused);
    }

    #[tokio::test]
    async fn handle_and_schedule_batch_is_atomic() {
        let repo = SqliteJobRepository::open_in_memory().expect("open");
        let original = record(1);
        repo.insert(&[original.clone()]).await.expect("insert");

        let mut changed = original.clone();
        changed.recurrence = "@every 1m".into();
        changed.engine_handle = Some(EngineHandle::new());

        // second row does not exist, so the first update must roll back too
        let err = repo
            .set_handle_and_schedule(&[changed.clone(), record(2)])
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound { .. }));
        let stored = &repo.load_by_ids(&[1]).await.expect("load")[0];
        assert_eq!(stored.recurrence, "@every 5s");
        assert_eq!(stored.engine_handle, original.engine_handle);

        repo.set_handle_and_schedule(&[changed.clone()]).await.expect("update");
        let stored = &repo.load_by_ids(&[1]).await.expect("load")[0];
        assert_eq!(stored.recurrence, "@every 1m");
        assert_eq!(stored.engine_handle, changed.engine_handle);
        assert!(stored.updated_at >= original.updated_at);
    }

    #[tokio::test]
    async fn delete_removes_rows() {
        let repo = SqliteJobRepository::open_in_memory().expect("open");
        repo.insert(&[record(1), record(2)]).await.expect("insert");
        repo.delete(&[1]).await.expect("delete");
        let ids: Vec<_> = repo.load_all().await.expect("load").iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn open_from_config() {
        let config = DatabaseConfig {
            path: ":memory:".into(),
            busy_timeout_ms: 100,
        };
        let repo = SqliteJobRepository::open(&config).expect("open");
        assert!(repo.load_all().await.expect("load").is_empty());
    }
}
