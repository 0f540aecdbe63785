//! SQLite-backed state store.
//!
//! Each table keeps the indexed columns needed for queries and guards
//! (status, version, foreign keys) alongside the full record as `json_data`.
//! Guarded updates re-check status and version in the `WHERE` clause so the
//! guard also holds across processes sharing one database file.

use rusqlite::{Connection, TransactionBehavior, params};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::domain::{
    EventRecord, Job, JobStatus, NewEvent, NewJob, NewProject, NewProtocolRun, NewStepRun, Project,
    ProjectConfigUpdate, ProtocolRun, ProtocolStatus, ProtocolUpdate, StepRun, StepStatus, StepUpdate,
};
use crate::error::{ProtoflowError, Result};
use crate::store::StateStore;

/// File name of the database inside a data directory
pub const DB_FILE: &str = "protoflow.db";

/// State store over a single SQLite connection.
pub struct SqliteStore {
    db: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open or create a store in `base_dir`.
    pub fn open_at(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir)?;
        Self::open(&base_dir.join(DB_FILE))
    }

    /// Open or create a store at an explicit database path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let db = Connection::open(db_path)?;
        db.busy_timeout(Duration::from_secs(5))?;
        db.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::init_schema(&db)?;
        log::debug!("Opened state store at {}", db_path.display());
        Ok(Self {
            db: Mutex::new(db),
            path: Some(db_path.to_path_buf()),
        })
    }

    /// Open a private in-memory store (tests, one-shot runs).
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::init_schema(&db)?;
        Ok(Self {
            db: Mutex::new(db),
            path: None,
        })
    }

    /// Path of the database file, if on disk.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init_schema(db: &Connection) -> Result<()> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                json_data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS protocol_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL REFERENCES projects(id),
                protocol_name TEXT NOT NULL,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                json_data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_protocol_runs_project ON protocol_runs(project_id);
            CREATE INDEX IF NOT EXISTS idx_protocol_runs_status ON protocol_runs(status);

            CREATE TABLE IF NOT EXISTS step_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                protocol_run_id INTEGER NOT NULL REFERENCES protocol_runs(id),
                step_index INTEGER NOT NULL,
                step_name TEXT NOT NULL,
                status TEXT NOT NULL,
                version INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                json_data TEXT NOT NULL,
                UNIQUE(protocol_run_id, step_index),
                UNIQUE(protocol_run_id, step_name)
            );

            CREATE INDEX IF NOT EXISTS idx_step_runs_status ON step_runs(status);

            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                protocol_run_id INTEGER,
                step_run_id INTEGER,
                event_type TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                json_data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_protocol ON events(protocol_run_id);

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                target_id INTEGER NOT NULL,
                idempotency_key TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                run_after INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                json_data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, run_after);

            CREATE TABLE IF NOT EXISTS token_usage (
                protocol_run_id INTEGER PRIMARY KEY REFERENCES protocol_runs(id),
                tokens INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| ProtoflowError::Storage(format!("Lock poisoned: {}", e)))
    }
}

/// Read the `json_data` column of at most one row.
fn query_one<T: DeserializeOwned, P: rusqlite::Params>(db: &Connection, sql: &str, params: P) -> Result<Option<T>> {
    let result = db.query_row(sql, params, |row| row.get::<_, String>(0));
    match result {
        Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Read the `json_data` column of every matching row.
fn query_all<T: DeserializeOwned, P: rusqlite::Params>(db: &Connection, sql: &str, params: P) -> Result<Vec<T>> {
    let mut stmt = db.prepare(sql)?;
    let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;

    let mut records = Vec::new();
    for row in rows {
        records.push(serde_json::from_str(&row?)?);
    }
    Ok(records)
}

impl StateStore for SqliteStore {
    fn create_project(&self, new: NewProject) -> Result<Project> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO projects (name, created_at, updated_at, json_data) VALUES (?1, 0, 0, '{}')",
            params![new.name],
        )?;
        let project = new.into_record(tx.last_insert_rowid());
        tx.execute(
            "UPDATE projects SET created_at = ?1, updated_at = ?2, json_data = ?3 WHERE id = ?4",
            params![
                project.created_at,
                project.updated_at,
                serde_json::to_string(&project)?,
                project.id
            ],
        )?;
        tx.commit()?;
        Ok(project)
    }

    fn get_project(&self, id: i64) -> Result<Option<Project>> {
        let db = self.conn()?;
        query_one(&db, "SELECT json_data FROM projects WHERE id = ?1", [id])
    }

    fn list_projects(&self) -> Result<Vec<Project>> {
        let db = self.conn()?;
        query_all(&db, "SELECT json_data FROM projects ORDER BY id", [])
    }

    fn update_project_config(&self, id: i64, update: ProjectConfigUpdate) -> Result<Project> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let mut project: Project = query_one(&tx, "SELECT json_data FROM projects WHERE id = ?1", [id])?
            .ok_or_else(|| ProtoflowError::not_found("project", id))?;
        update.apply(&mut project);
        tx.execute(
            "UPDATE projects SET updated_at = ?1, json_data = ?2 WHERE id = ?3",
            params![project.updated_at, serde_json::to_string(&project)?, id],
        )?;
        tx.commit()?;
        Ok(project)
    }

    fn create_protocol_run(&self, new: NewProtocolRun) -> Result<ProtocolRun> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            r#"
            INSERT INTO protocol_runs
            (project_id, protocol_name, status, version, created_at, updated_at, json_data)
            VALUES (?1, ?2, ?3, 0, 0, 0, '{}')
            "#,
            params![new.project_id, new.protocol_name, ProtocolStatus::Pending.as_str()],
        )?;
        let run = new.into_record(tx.last_insert_rowid());
        tx.execute(
            "UPDATE protocol_runs SET version = ?1, created_at = ?2, updated_at = ?3, json_data = ?4 WHERE id = ?5",
            params![
                run.version as i64,
                run.created_at,
                run.updated_at,
                serde_json::to_string(&run)?,
                run.id
            ],
        )?;
        tx.commit()?;
        Ok(run)
    }

    fn get_protocol_run(&self, id: i64) -> Result<Option<ProtocolRun>> {
        let db = self.conn()?;
        query_one(&db, "SELECT json_data FROM protocol_runs WHERE id = ?1", [id])
    }

    fn list_protocol_runs(&self, project_id: Option<i64>) -> Result<Vec<ProtocolRun>> {
        let db = self.conn()?;
        match project_id {
            Some(project_id) => query_all(
                &db,
                "SELECT json_data FROM protocol_runs WHERE project_id = ?1 ORDER BY id",
                [project_id],
            ),
            None => query_all(&db, "SELECT json_data FROM protocol_runs ORDER BY id", []),
        }
    }

    fn update_protocol(&self, id: i64, expected: ProtocolStatus, update: ProtocolUpdate) -> Result<ProtocolRun> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut run: ProtocolRun = query_one(&tx, "SELECT json_data FROM protocol_runs WHERE id = ?1", [id])?
            .ok_or_else(|| ProtoflowError::not_found("protocol_run", id))?;

        if run.status != expected {
            return Err(ProtoflowError::StateConflict {
                entity: "protocol_run",
                id,
                expected: expected.to_string(),
                actual: run.status.to_string(),
            });
        }
        if let Some(next) = update.status {
            if next != run.status && !run.status.can_transition_to(next) {
                return Err(ProtoflowError::InvalidTransition {
                    entity: "protocol_run",
                    id,
                    from: run.status.to_string(),
                    to: next.to_string(),
                });
            }
        }

        let previous_version = run.version;
        update.apply(&mut run);
        let changed = tx.execute(
            r#"
            UPDATE protocol_runs SET status = ?1, version = ?2, updated_at = ?3, json_data = ?4
            WHERE id = ?5 AND status = ?6 AND version = ?7
            "#,
            params![
                run.status.as_str(),
                run.version as i64,
                run.updated_at,
                serde_json::to_string(&run)?,
                id,
                expected.as_str(),
                previous_version as i64
            ],
        )?;
        if changed == 0 {
            return Err(ProtoflowError::StateConflict {
                entity: "protocol_run",
                id,
                expected: expected.to_string(),
                actual: "concurrently modified".to_string(),
            });
        }
        tx.commit()?;
        Ok(run)
    }

    fn create_step_run(&self, new: NewStepRun) -> Result<StepRun> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            r#"
            INSERT INTO step_runs
            (protocol_run_id, step_index, step_name, status, version, created_at, updated_at, json_data)
            VALUES (?1, ?2, ?3, ?4, 0, 0, 0, '{}')
            "#,
            params![
                new.protocol_run_id,
                new.step_index,
                new.step_name,
                StepStatus::Pending.as_str()
            ],
        )?;
        let step = new.into_record(tx.last_insert_rowid());
        tx.execute(
            "UPDATE step_runs SET version = ?1, created_at = ?2, updated_at = ?3, json_data = ?4 WHERE id = ?5",
            params![
                step.version as i64,
                step.created_at,
                step.updated_at,
                serde_json::to_string(&step)?,
                step.id
            ],
        )?;
        tx.commit()?;
        Ok(step)
    }

    fn get_step_run(&self, id: i64) -> Result<Option<StepRun>> {
        let db = self.conn()?;
        query_one(&db, "SELECT json_data FROM step_runs WHERE id = ?1", [id])
    }

    fn list_step_runs(&self, protocol_run_id: i64) -> Result<Vec<StepRun>> {
        let db = self.conn()?;
        query_all(
            &db,
            "SELECT json_data FROM step_runs WHERE protocol_run_id = ?1 ORDER BY step_index",
            [protocol_run_id],
        )
    }

    fn update_step(&self, id: i64, expected: StepStatus, update: StepUpdate) -> Result<StepRun> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut step: StepRun = query_one(&tx, "SELECT json_data FROM step_runs WHERE id = ?1", [id])?
            .ok_or_else(|| ProtoflowError::not_found("step_run", id))?;

        if step.status != expected {
            return Err(ProtoflowError::StateConflict {
                entity: "step_run",
                id,
                expected: expected.to_string(),
                actual: step.status.to_string(),
            });
        }
        if let Some(next) = update.status {
            if next != step.status && !step.status.can_transition_to(next) {
                return Err(ProtoflowError::InvalidTransition {
                    entity: "step_run",
                    id,
                    from: step.status.to_string(),
                    to: next.to_string(),
                });
            }
        }

        let previous_version = step.version;
        let tokens = update.tokens_used;
        update.apply(&mut step);
        let changed = tx.execute(
            r#"
            UPDATE step_runs SET status = ?1, version = ?2, updated_at = ?3, json_data = ?4
            WHERE id = ?5 AND status = ?6 AND version = ?7
            "#,
            params![
                step.status.as_str(),
                step.version as i64,
                step.updated_at,
                serde_json::to_string(&step)?,
                id,
                expected.as_str(),
                previous_version as i64
            ],
        )?;
        if changed == 0 {
            return Err(ProtoflowError::StateConflict {
                entity: "step_run",
                id,
                expected: expected.to_string(),
                actual: "concurrently modified".to_string(),
            });
        }
        if let Some(tokens) = tokens {
            tx.execute(
                r#"
                INSERT INTO token_usage (protocol_run_id, tokens) VALUES (?1, ?2)
                ON CONFLICT(protocol_run_id) DO UPDATE SET tokens = tokens + excluded.tokens
                "#,
                params![step.protocol_run_id, tokens as i64],
            )?;
        }
        tx.commit()?;
        Ok(step)
    }

    fn protocol_token_usage(&self, protocol_run_id: i64) -> Result<u64> {
        let db = self.conn()?;
        let result = db.query_row(
            "SELECT tokens FROM token_usage WHERE protocol_run_id = ?1",
            [protocol_run_id],
            |row| row.get::<_, i64>(0),
        );
        match result {
            Ok(tokens) => Ok(tokens.max(0) as u64),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn append_event(&self, event: NewEvent) -> Result<EventRecord> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            r#"
            INSERT INTO events (protocol_run_id, step_run_id, event_type, created_at, json_data)
            VALUES (?1, ?2, ?3, 0, '{}')
            "#,
            params![event.protocol_run_id, event.step_run_id, event.event_type],
        )?;
        let record = event.into_record(tx.last_insert_rowid());
        tx.execute(
            "UPDATE events SET created_at = ?1, json_data = ?2 WHERE id = ?3",
            params![record.created_at, serde_json::to_string(&record)?, record.id],
        )?;
        tx.commit()?;
        Ok(record)
    }

    fn list_events(&self, protocol_run_id: Option<i64>) -> Result<Vec<EventRecord>> {
        let db = self.conn()?;
        match protocol_run_id {
            Some(id) => query_all(
                &db,
                "SELECT json_data FROM events WHERE protocol_run_id = ?1 ORDER BY id",
                [id],
            ),
            None => query_all(&db, "SELECT json_data FROM events ORDER BY id", []),
        }
    }

    fn insert_job(&self, new: NewJob, max_attempts: u32) -> Result<(Job, bool)> {
        let db = self.conn()?;
        let job = new.into_record(max_attempts);
        let inserted = db.execute(
            r#"
            INSERT OR IGNORE INTO jobs
            (id, job_type, target_id, idempotency_key, status, run_after, created_at, updated_at, json_data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                job.id,
                job.job_type.as_str(),
                job.target_id,
                job.idempotency_key,
                job.status.as_str(),
                job.run_after,
                job.created_at,
                job.updated_at,
                serde_json::to_string(&job)?
            ],
        )?;
        if inserted == 1 {
            return Ok((job, true));
        }

        let existing: Job = query_one(
            &db,
            "SELECT json_data FROM jobs WHERE idempotency_key = ?1",
            [&job.idempotency_key],
        )?
        .ok_or_else(|| ProtoflowError::Storage(format!("job key vanished: {}", job.idempotency_key)))?;
        Ok((existing, false))
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let db = self.conn()?;
        query_one(&db, "SELECT json_data FROM jobs WHERE id = ?1", [id])
    }

    fn claim_next_job(&self, now: i64, lease_ms: i64) -> Result<Option<Job>> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // Started jobs past their lease were abandoned by a worker that stopped
        let job: Option<Job> = query_one(
            &tx,
            r#"
            SELECT json_data FROM jobs
            WHERE status IN ('queued', 'started') AND run_after <= ?1
            ORDER BY run_after, created_at
            LIMIT 1
            "#,
            [now],
        )?;
        let Some(mut job) = job else {
            return Ok(None);
        };

        let (previous_status, previous_run_after) = (job.status, job.run_after);
        if job.lease_expired(now) {
            log::warn!("Reclaiming job {} after its lease expired (attempt {})", job.id, job.attempt);
        }
        job.mark_started(now.saturating_add(lease_ms));
        let changed = tx.execute(
            r#"
            UPDATE jobs SET status = ?1, run_after = ?2, updated_at = ?3, json_data = ?4
            WHERE id = ?5 AND status = ?6 AND run_after = ?7
            "#,
            params![
                job.status.as_str(),
                job.run_after,
                job.updated_at,
                serde_json::to_string(&job)?,
                job.id,
                previous_status.as_str(),
                previous_run_after
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        tx.commit()?;
        Ok(Some(job))
    }

    fn requeue_started_jobs(&self, reason: &str) -> Result<usize> {
        let mut db = self.conn()?;
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let started: Vec<Job> = query_all(&tx, "SELECT json_data FROM jobs WHERE status = 'started'", [])?;
        for mut job in started.iter().cloned() {
            job.mark_requeued(reason);
            tx.execute(
                "UPDATE jobs SET status = ?1, run_after = ?2, updated_at = ?3, json_data = ?4 WHERE id = ?5",
                params![
                    job.status.as_str(),
                    job.run_after,
                    job.updated_at,
                    serde_json::to_string(&job)?,
                    job.id
                ],
            )?;
        }
        tx.commit()?;
        Ok(started.len())
    }

    fn save_job(&self, job: &Job) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            "UPDATE jobs SET status = ?1, run_after = ?2, updated_at = ?3, json_data = ?4 WHERE id = ?5",
            params![
                job.status.as_str(),
                job.run_after,
                job.updated_at,
                serde_json::to_string(job)?,
                job.id
            ],
        )?;
        Ok(())
    }

    fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let db = self.conn()?;
        match status {
            Some(status) => query_all(
                &db,
                "SELECT json_data FROM jobs WHERE status = ?1 ORDER BY created_at",
                [status.as_str()],
            ),
            None => query_all(&db, "SELECT json_data FROM jobs ORDER BY created_at", []),
        }
    }

    fn count_jobs(&self, status: JobStatus) -> Result<usize> {
        let db = self.conn()?;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
