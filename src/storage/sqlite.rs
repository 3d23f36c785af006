//! SQLite persistence for runs, pipelines, cache entries and images.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use super::models::*;
use crate::error::{Error, Result};
use crate::runtime::{CacheQuery, CacheRecord};

/// SQLite-backed persistence.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS runs (
                pk INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT UNIQUE,
                name TEXT NOT NULL,
                source TEXT NOT NULL,
                user_name TEXT NOT NULL,
                fs_name TEXT NOT NULL,
                fs_id TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                entry TEXT NOT NULL DEFAULT '',
                parameters TEXT NOT NULL DEFAULT '{}',
                run_yaml TEXT NOT NULL,
                runtime_view TEXT NOT NULL DEFAULT '{}',
                image_url TEXT NOT NULL DEFAULT '',
                message TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                create_time TEXT NOT NULL,
                activate_time TEXT,
                update_time TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pipelines (
                pk INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT UNIQUE,
                name TEXT NOT NULL,
                user_name TEXT NOT NULL,
                pipeline_yaml TEXT NOT NULL,
                create_time TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS run_caches (
                pk INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT UNIQUE,
                fingerprint TEXT NOT NULL,
                run_id TEXT NOT NULL,
                step_name TEXT NOT NULL,
                fs_id TEXT NOT NULL,
                source TEXT NOT NULL,
                expired_time INTEGER NOT NULL DEFAULT -1,
                create_time TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS images (
                pk INTEGER PRIMARY KEY AUTOINCREMENT,
                image_id TEXT NOT NULL,
                fs_id TEXT NOT NULL,
                url TEXT NOT NULL DEFAULT '',
                create_time TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_runs_user ON runs(user_name);
            CREATE INDEX IF NOT EXISTS idx_caches_fp
                ON run_caches(fingerprint, fs_id, step_name);
            CREATE INDEX IF NOT EXISTS idx_images_fs ON images(fs_id);
            "#,
        )?;
        Ok(())
    }

    // ----- runs -----

    /// Insert a run and back-fill its id from the primary key.
    pub async fn create_run(&self, run: &mut Run) -> Result<String> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO runs
               (id, name, source, user_name, fs_name, fs_id, description, entry,
                parameters, run_yaml, runtime_view, image_url, message, status,
                create_time, activate_time, update_time)
               VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"#,
            params![
                run.name,
                run.source,
                run.user_name,
                run.fs_name,
                run.fs_id,
                run.description,
                run.entry,
                serde_json::to_string(&run.parameters)?,
                run.run_yaml,
                serde_json::to_string(&run.runtime_view)?,
                run.image_url,
                run.message,
                run.status.to_string(),
                run.create_time.to_rfc3339(),
                run.activate_time.map(|t| t.to_rfc3339()),
                run.update_time.to_rfc3339(),
            ],
        )?;
        let pk = conn.last_insert_rowid();
        let id = format!("run-{:06}", pk);
        conn.execute("UPDATE runs SET id = ?1 WHERE pk = ?2", params![id, pk])?;
        run.pk = pk;
        run.id = id.clone();
        Ok(id)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
            params![run_id],
            row_to_run,
        )
        .optional()?
        .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
    }

    pub async fn get_last_run_pk(&self) -> Result<i64> {
        let conn = self.conn.lock().await;
        let pk = conn
            .query_row("SELECT MAX(pk) FROM runs", [], |row| {
                row.get::<_, Option<i64>>(0)
            })?
            .unwrap_or(0);
        Ok(pk)
    }

    /// List runs after the pk marker, oldest first.
    pub async fn list_runs(&self, query: &RunQuery) -> Result<Vec<Run>> {
        let mut sql = format!("SELECT {} FROM runs WHERE pk > ?", RUN_COLUMNS);
        let mut args: Vec<rusqlite::types::Value> = vec![query.pk_marker.into()];
        for (column, filter) in [
            ("user_name", &query.user_filter),
            ("fs_name", &query.fs_filter),
            ("id", &query.run_filter),
            ("name", &query.name_filter),
        ] {
            if !filter.is_empty() {
                let placeholders = vec!["?"; filter.len()].join(", ");
                sql.push_str(&format!(" AND {} IN ({})", column, placeholders));
                args.extend(filter.iter().map(|v| v.clone().into()));
            }
        }
        sql.push_str(" ORDER BY pk ASC LIMIT ?");
        args.push((query.max_keys.max(1) as i64).into());

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), row_to_run)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }

    pub async fn list_runs_by_status(&self, statuses: &[RunStatus]) -> Result<Vec<Run>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM runs WHERE status IN ({}) ORDER BY pk ASC",
            RUN_COLUMNS, placeholders
        );
        let args: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), row_to_run)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }

    /// Apply a partial update to a run.
    pub async fn update_run(&self, run_id: &str, patch: RunPatch) -> Result<()> {
        let mut sets = vec!["update_time = ?".to_string()];
        let mut args: Vec<rusqlite::types::Value> = vec![Utc::now().to_rfc3339().into()];
        if let Some(status) = patch.status {
            sets.push("status = ?".to_string());
            args.push(status.to_string().into());
            if !matches!(status, RunStatus::Initiating) && patch.touch_activate_time {
                sets.push("activate_time = ?".to_string());
                args.push(Utc::now().to_rfc3339().into());
            }
        }
        if let Some(message) = patch.message {
            sets.push("message = ?".to_string());
            args.push(message.into());
        }
        if let Some(view) = patch.runtime_view {
            sets.push("runtime_view = ?".to_string());
            args.push(serde_json::to_string(&view)?.into());
        }
        if let Some(image_url) = patch.image_url {
            sets.push("image_url = ?".to_string());
            args.push(image_url.into());
        }
        let sql = format!("UPDATE runs SET {} WHERE id = ?", sets.join(", "));
        args.push(run_id.to_string().into());

        let conn = self.conn.lock().await;
        let changed = conn.execute(&sql, params_from_iter(args))?;
        if changed == 0 {
            return Err(Error::RunNotFound(run_id.to_string()));
        }
        Ok(())
    }

    pub async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        message: impl Into<Option<String>>,
    ) -> Result<()> {
        self.update_run(
            run_id,
            RunPatch {
                status: Some(status),
                message: message.into(),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn delete_run(&self, run_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute("DELETE FROM runs WHERE id = ?1", params![run_id])?;
        if changed == 0 {
            return Err(Error::RunNotFound(run_id.to_string()));
        }
        Ok(())
    }

    // ----- pipelines -----

    pub async fn create_pipeline(&self, pipeline: &mut Pipeline) -> Result<String> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO pipelines (id, name, user_name, pipeline_yaml, create_time)
               VALUES (NULL, ?1, ?2, ?3, ?4)"#,
            params![
                pipeline.name,
                pipeline.user_name,
                pipeline.pipeline_yaml,
                pipeline.create_time.to_rfc3339(),
            ],
        )?;
        let pk = conn.last_insert_rowid();
        let id = format!("ppl-{:06}", pk);
        conn.execute(
            "UPDATE pipelines SET id = ?1 WHERE pk = ?2",
            params![id, pk],
        )?;
        pipeline.pk = pk;
        pipeline.id = id.clone();
        Ok(id)
    }

    pub async fn get_pipeline(&self, pipeline_id: &str) -> Result<Pipeline> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT pk, id, name, user_name, pipeline_yaml, create_time
             FROM pipelines WHERE id = ?1",
            params![pipeline_id],
            |row| {
                Ok(Pipeline {
                    pk: row.get(0)?,
                    id: row.get(1)?,
                    name: row.get(2)?,
                    user_name: row.get(3)?,
                    pipeline_yaml: row.get(4)?,
                    create_time: parse_time(row, 5)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| Error::RunNotFound(format!("pipeline {}", pipeline_id)))
    }

    // ----- run caches -----

    pub async fn create_run_cache(&self, record: &CacheRecord) -> Result<String> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO run_caches
               (id, fingerprint, run_id, step_name, fs_id, source, expired_time, create_time)
               VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                record.fingerprint,
                record.run_id,
                record.step_name,
                record.fs_id,
                record.source,
                record.expired_time,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let pk = conn.last_insert_rowid();
        let id = format!("cch-{:06}", pk);
        conn.execute(
            "UPDATE run_caches SET id = ?1 WHERE pk = ?2",
            params![id, pk],
        )?;
        Ok(id)
    }

    /// Matching cache entries, newest first.
    pub async fn list_run_caches(&self, query: &CacheQuery) -> Result<Vec<RunCacheRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"SELECT pk, id, fingerprint, run_id, step_name, fs_id, source,
                      expired_time, create_time
               FROM run_caches
               WHERE fingerprint = ?1 AND fs_id = ?2 AND step_name = ?3 AND source = ?4
               ORDER BY pk DESC"#,
        )?;
        let rows = stmt.query_map(
            params![
                query.fingerprint,
                query.fs_id,
                query.step_name,
                query.source
            ],
            |row| {
                Ok(RunCacheRow {
                    pk: row.get(0)?,
                    id: row.get(1)?,
                    fingerprint: row.get(2)?,
                    run_id: row.get(3)?,
                    step_name: row.get(4)?,
                    fs_id: row.get(5)?,
                    source: row.get(6)?,
                    expired_time: row.get(7)?,
                    create_time: parse_time(row, 8)?,
                })
            },
        )?;
        let mut caches = Vec::new();
        for row in rows {
            caches.push(row?);
        }
        Ok(caches)
    }

    // ----- images -----

    pub async fn add_image(&self, image_id: &str, fs_id: &str, url: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO images (image_id, fs_id, url, create_time) VALUES (?1, ?2, ?3, ?4)",
            params![image_id, fs_id, url, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn list_image_ids_by_fs_id(&self, fs_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT image_id FROM images WHERE fs_id = ?1 ORDER BY pk ASC")?;
        let rows = stmt.query_map(params![fs_id], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}

/// Fields a run update may touch; unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub message: Option<String>,
    pub runtime_view: Option<RuntimeView>,
    pub image_url: Option<String>,
    /// Stamp activate_time alongside a status change out of `initiating`.
    pub touch_activate_time: bool,
}

const RUN_COLUMNS: &str = "pk, id, name, source, user_name, fs_name, fs_id, description, entry, \
     parameters, run_yaml, runtime_view, image_url, message, status, \
     create_time, activate_time, update_time";

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    let parameters: String = row.get(9)?;
    let runtime_view: String = row.get(11)?;
    let status: String = row.get(14)?;
    Ok(Run {
        pk: row.get(0)?,
        id: row.get(1)?,
        name: row.get(2)?,
        source: row.get(3)?,
        user_name: row.get(4)?,
        fs_name: row.get(5)?,
        fs_id: row.get(6)?,
        description: row.get(7)?,
        entry: row.get(8)?,
        parameters: serde_json::from_str(&parameters).map_err(|e| column_error(9, e))?,
        run_yaml: row.get(10)?,
        workflow_source: None,
        runtime_view: serde_json::from_str(&runtime_view).map_err(|e| column_error(11, e))?,
        image_url: row.get(12)?,
        message: row.get(13)?,
        status: RunStatus::from_str(&status)
            .map_err(|e| column_error(14, std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?,
        create_time: parse_time(row, 15)?,
        activate_time: parse_opt_time(row, 16)?,
        update_time: parse_time(row, 17)?,
    })
}

fn parse_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| column_error(idx, e))
}

fn parse_opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| column_error(idx, e)),
    }
}

fn column_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(err),
    )
}
