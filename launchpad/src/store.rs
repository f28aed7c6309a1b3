//! Durable run records backed by SQLite.
//!
//! Holds every accepted request, its run status, and the append-only
//! sequence of step attempts. The engine writes each attempt here before
//! moving on, which is what makes crash-resume and redelivery safe.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{PipelineError, Result};
use crate::model::{DeploymentRequest, RunStatus, StepOutcome, StepResult, WorkflowRun};
use crate::runid::RunId;

/// Run store.
pub struct RunStore {
    db: Mutex<Connection>,
}

impl RunStore {
    /// Open or create a run database.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Connection::open(path)?;
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self { db: Mutex::new(db) };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            db: Mutex::new(Connection::open_in_memory()?),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn migrate(&self) -> Result<()> {
        self.conn().execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                request_json TEXT NOT NULL,
                status TEXT NOT NULL,
                failure TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);

            CREATE TABLE IF NOT EXISTS step_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES runs(run_id),
                name TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                value_json TEXT,
                error TEXT,
                started_at TEXT NOT NULL,
                ended_at TEXT NOT NULL,
                UNIQUE(run_id, name, attempt)
            );
            CREATE INDEX IF NOT EXISTS idx_step_results_run ON step_results(run_id, id);",
        )?;
        Ok(())
    }

    /// Record a newly accepted request as a `Pending` run.
    /// Returns `false` if the run already exists (redelivery).
    pub fn insert_run(&self, run_id: &RunId, request: &DeploymentRequest) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let request_json = serde_json::to_string(request)?;
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO runs (run_id, request_json, status, failure, created_at, updated_at)
             VALUES (?1, ?2, ?3, NULL, ?4, ?4)",
            params![run_id.as_str(), request_json, RunStatus::Pending.as_str(), now],
        )?;
        Ok(inserted == 1)
    }

    /// Move a run to a new status. Terminal runs never move again;
    /// returns `false` when the transition was refused.
    pub fn set_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        failure: Option<&str>,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn().execute(
            "UPDATE runs SET status = ?2, failure = ?3, updated_at = ?4
             WHERE run_id = ?1 AND status NOT IN ('succeeded', 'failed')",
            params![run_id.as_str(), status.as_str(), failure, now],
        )?;
        Ok(changed == 1)
    }

    /// Append one step attempt.
    pub fn append_step(&self, run_id: &RunId, step: &StepResult) -> Result<()> {
        let (outcome, value_json, error) = match &step.outcome {
            StepOutcome::Success(v) => ("success", Some(serde_json::to_string(v)?), None),
            StepOutcome::Retryable(e) => ("retryable", None, Some(e.as_str())),
            StepOutcome::Fatal(e) => ("fatal", None, Some(e.as_str())),
        };
        self.conn().execute(
            "INSERT INTO step_results (run_id, name, attempt, outcome, value_json, error, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run_id.as_str(),
                step.name,
                step.attempt,
                outcome,
                value_json,
                error,
                step.started_at.to_rfc3339(),
                step.ended_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Load a run with all recorded step attempts, in recording order.
    pub fn load(&self, run_id: &RunId) -> Result<Option<WorkflowRun>> {
        let db = self.conn();
        let row = db
            .query_row(
                "SELECT request_json, status, failure FROM runs WHERE run_id = ?1",
                params![run_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((request_json, status, failure)) = row else {
            return Ok(None);
        };

        let request: DeploymentRequest = serde_json::from_str(&request_json)?;
        let status = RunStatus::parse(&status).ok_or_else(|| {
            PipelineError::Store(rusqlite::Error::InvalidColumnType(
                1,
                format!("status {status}"),
                rusqlite::types::Type::Text,
            ))
        })?;

        let mut stmt = db.prepare(
            "SELECT name, attempt, outcome, value_json, error, started_at, ended_at
             FROM step_results WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let raw = stmt
            .query_map(params![run_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut steps = Vec::with_capacity(raw.len());
        for (name, attempt, outcome, value_json, error, started_at, ended_at) in raw {
            let outcome = match outcome.as_str() {
                "success" => StepOutcome::Success(match value_json {
                    Some(v) => serde_json::from_str(&v)?,
                    None => serde_json::Value::Null,
                }),
                "retryable" => StepOutcome::Retryable(error.unwrap_or_default()),
                _ => StepOutcome::Fatal(error.unwrap_or_default()),
            };
            steps.push(StepResult {
                name,
                attempt,
                outcome,
                started_at: parse_ts(&started_at),
                ended_at: parse_ts(&ended_at),
            });
        }

        Ok(Some(WorkflowRun {
            run_id: run_id.clone(),
            request,
            steps,
            status,
            failure,
        }))
    }

    /// Runs that have not reached a terminal state, oldest first.
    pub fn unfinished(&self) -> Result<Vec<RunId>> {
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT run_id FROM runs WHERE status IN ('pending', 'running')
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|r| r.map(RunId::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default()
}
