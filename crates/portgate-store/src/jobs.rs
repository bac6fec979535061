//! Job and multi-job persistence (`jobs.db`)

use crate::query::{append_options_to_query, ListOptions, SortOption};
use crate::StoreError;
use portgate_proto::{Job, JobResult, JobStatus, JobSummary, MultiJob, MultiJobSummary};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Store for [`Job`] and [`MultiJob`] records
#[derive(Clone)]
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                jid TEXT PRIMARY KEY,
                client_id TEXT NOT NULL,
                client_name TEXT NOT NULL,
                multi_job_id TEXT,
                schedule_id TEXT,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                created_by TEXT NOT NULL,
                timeout_sec INTEGER NOT NULL,
                pid INTEGER,
                command TEXT NOT NULL,
                interpreter TEXT NOT NULL,
                cwd TEXT NOT NULL,
                is_sudo INTEGER NOT NULL,
                is_script INTEGER NOT NULL,
                has_shebang INTEGER NOT NULL,
                error TEXT,
                result_json TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_client_id ON jobs(client_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_multi_job_id ON jobs(multi_job_id)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS multi_jobs (
                jid TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                created_by TEXT NOT NULL,
                client_ids TEXT NOT NULL,
                group_ids TEXT NOT NULL,
                command TEXT NOT NULL,
                interpreter TEXT NOT NULL,
                cwd TEXT NOT NULL,
                is_sudo INTEGER NOT NULL,
                is_script INTEGER NOT NULL,
                has_shebang INTEGER NOT NULL,
                timeout_sec INTEGER NOT NULL,
                concurrent INTEGER NOT NULL,
                abort_on_error INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// Create or update a job record
    pub fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        self.insert_job("INSERT OR REPLACE", job)
    }

    /// Create a job record. A duplicate `jid` leaves the stored row intact
    /// and reports success.
    pub fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        self.insert_job("INSERT OR IGNORE", job)
    }

    fn insert_job(&self, verb: &str, job: &Job) -> Result<(), StoreError> {
        let result_json = match &job.result {
            Some(result) => Some(serde_json::to_string(result)?),
            None => None,
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "{} INTO jobs (
                    jid, client_id, client_name, multi_job_id, schedule_id, status,
                    started_at, finished_at, created_by, timeout_sec, pid, command,
                    interpreter, cwd, is_sudo, is_script, has_shebang, error, result_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                verb
            ),
            params![
                job.jid,
                job.client_id,
                job.client_name,
                job.multi_job_id,
                job.schedule_id,
                job.status.as_str(),
                job.started_at,
                job.finished_at,
                job.created_by,
                job.timeout_sec,
                job.pid,
                job.command,
                job.interpreter,
                job.cwd,
                job.is_sudo,
                job.is_script,
                job.has_shebang,
                job.error,
                result_json,
            ],
        )?;
        Ok(())
    }

    pub fn get_by_jid(&self, client_id: &str, jid: &str) -> Result<Option<Job>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                &format!(
                    "SELECT {} FROM jobs WHERE client_id = ?1 AND jid = ?2",
                    JOB_COLUMNS
                ),
                params![client_id, jid],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Job summaries of one client. Sorted by `finished_at` descending when
    /// the options carry no explicit sort.
    pub fn get_summaries_by_client_id(
        &self,
        client_id: &str,
        options: &ListOptions,
    ) -> Result<Vec<JobSummary>, StoreError> {
        let mut options = options.clone();
        if options.sorts.is_empty() {
            options.sorts = vec![SortOption {
                column: "finished_at".to_string(),
                is_asc: false,
            }];
        }

        let (sql, sql_params) = append_options_to_query(
            &options,
            "SELECT jid, status, finished_at FROM jobs WHERE client_id = ?",
            vec![client_id.to_string()],
        );

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(sql_params), |row| {
                let status: String = row.get(1)?;
                Ok(JobSummary {
                    jid: row.get(0)?,
                    status: parse_status(&status, 1)?,
                    finished_at: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Children of a multi-job, finished first (newest finish leading),
    /// running children last.
    pub fn get_by_multi_job_id(&self, multi_job_id: &str) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs WHERE multi_job_id = ?1
             ORDER BY finished_at DESC, started_at ASC, jid ASC",
            JOB_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![multi_job_id], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn save_multi_job(&self, multi_job: &MultiJob) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO multi_jobs (
                jid, started_at, created_by, client_ids, group_ids, command,
                interpreter, cwd, is_sudo, is_script, has_shebang, timeout_sec,
                concurrent, abort_on_error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                multi_job.jid,
                multi_job.started_at,
                multi_job.created_by,
                serde_json::to_string(&multi_job.client_ids)?,
                serde_json::to_string(&multi_job.group_ids)?,
                multi_job.command,
                multi_job.interpreter,
                multi_job.cwd,
                multi_job.is_sudo,
                multi_job.is_script,
                multi_job.has_shebang,
                multi_job.timeout_sec,
                multi_job.concurrent,
                multi_job.abort_on_error,
            ],
        )?;
        Ok(())
    }

    /// Fetch a multi-job with its children attached
    pub fn get_multi_job(&self, jid: &str) -> Result<Option<MultiJob>, StoreError> {
        let row = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT jid, started_at, created_by, client_ids, group_ids, command,
                        interpreter, cwd, is_sudo, is_script, has_shebang, timeout_sec,
                        concurrent, abort_on_error
                 FROM multi_jobs WHERE jid = ?1",
                params![jid],
                multi_job_from_row,
            )
            .optional()?
        };

        match row {
            Some(mut multi_job) => {
                multi_job.jobs = self.get_by_multi_job_id(jid)?;
                Ok(Some(multi_job))
            }
            None => Ok(None),
        }
    }

    pub fn get_all_multi_job_summaries(&self) -> Result<Vec<MultiJobSummary>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT jid, started_at, created_by FROM multi_jobs ORDER BY started_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(MultiJobSummary {
                    jid: row.get(0)?,
                    started_at: row.get(1)?,
                    created_by: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

const JOB_COLUMNS: &str = "jid, client_id, client_name, multi_job_id, schedule_id, status, \
     started_at, finished_at, created_by, timeout_sec, pid, command, \
     interpreter, cwd, is_sudo, is_script, has_shebang, error, result_json";

fn parse_status(raw: &str, column: usize) -> rusqlite::Result<JobStatus> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            column,
            Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get(5)?;
    let result_json: Option<String> = row.get(18)?;
    let result: Option<JobResult> = match result_json {
        Some(json) => Some(serde_json::from_str(&json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(18, Type::Text, Box::new(e))
        })?),
        None => None,
    };

    Ok(Job {
        jid: row.get(0)?,
        client_id: row.get(1)?,
        client_name: row.get(2)?,
        multi_job_id: row.get(3)?,
        schedule_id: row.get(4)?,
        status: parse_status(&status, 5)?,
        started_at: row.get(6)?,
        finished_at: row.get(7)?,
        created_by: row.get(8)?,
        timeout_sec: row.get(9)?,
        pid: row.get(10)?,
        command: row.get(11)?,
        interpreter: row.get(12)?,
        cwd: row.get(13)?,
        is_sudo: row.get(14)?,
        is_script: row.get(15)?,
        has_shebang: row.get(16)?,
        error: row.get(17)?,
        result,
    })
}

fn multi_job_from_row(row: &Row<'_>) -> rusqlite::Result<MultiJob> {
    let client_ids: String = row.get(3)?;
    let group_ids: String = row.get(4)?;
    Ok(MultiJob {
        jid: row.get(0)?,
        started_at: row.get(1)?,
        created_by: row.get(2)?,
        client_ids: serde_json::from_str(&client_ids)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?,
        group_ids: serde_json::from_str(&group_ids)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        command: row.get(5)?,
        interpreter: row.get(6)?,
        cwd: row.get(7)?,
        is_sudo: row.get(8)?,
        is_script: row.get(9)?,
        has_shebang: row.get(10)?,
        timeout_sec: row.get(11)?,
        concurrent: row.get(12)?,
        abort_on_error: row.get(13)?,
        jobs: Vec::new(),
    })
}
