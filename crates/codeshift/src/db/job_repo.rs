//! Job repository: rows of the `jobs` and `job_source_files` tables.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    /// Insertion order; breaks ties between equal `created_at` values.
    pub seq: i64,
    pub name: String,
    pub target_profile: String,
    pub priority: i32,
    pub status: String,
    pub compile_attempts: u32,
    pub retry_count: u32,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    pub output_file_path: Option<String>,
    pub worker: Option<String>,
    pub cancel_requested: bool,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            seq: row.get("seq")?,
            name: row.get("name")?,
            target_profile: row.get("target_profile")?,
            priority: row.get("priority")?,
            status: row.get("status")?,
            compile_attempts: row.get("compile_attempts")?,
            retry_count: row.get("retry_count")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            error_message: row.get("error_message")?,
            output_file_path: row.get("output_file_path")?,
            worker: row.get("worker")?,
            cancel_requested: row.get("cancel_requested")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// One source file of a job, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFileRow {
    pub position: u32,
    pub path: String,
    pub content: String,
}

/// Inserts a new job row together with its source files.
pub fn insert(db: &Database, job: &JobRow, files: &[SourceFileRow]) -> Result<(), DatabaseError> {
    db.transaction(|tx| {
        tx.execute(
            "INSERT INTO jobs (id, seq, name, target_profile, priority, status, compile_attempts,
             retry_count, created_at, started_at, completed_at, error_message, output_file_path,
             worker, cancel_requested, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                job.id,
                job.seq,
                job.name,
                job.target_profile,
                job.priority,
                job.status,
                job.compile_attempts,
                job.retry_count,
                job.created_at,
                job.started_at,
                job.completed_at,
                job.error_message,
                job.output_file_path,
                job.worker,
                job.cancel_requested,
                job.updated_at,
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO job_source_files (job_id, position, path, content)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for file in files {
                stmt.execute(params![job.id, file.position, file.path, file.content])?;
            }
        }
        Ok(())
    })
}

/// Updates the mutable columns of a job row.
pub fn update(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET status=?2, compile_attempts=?3, retry_count=?4, started_at=?5,
             completed_at=?6, error_message=?7, output_file_path=?8, worker=?9,
             cancel_requested=?10, updated_at=?11
             WHERE id=?1",
            params![
                job.id,
                job.status,
                job.compile_attempts,
                job.retry_count,
                job.started_at,
                job.completed_at,
                job.error_message,
                job.output_file_path,
                job.worker,
                job.cancel_requested,
                job.updated_at,
            ],
        )?;
        Ok(())
    })
}

/// Loads the source files of a job in submission order.
pub fn source_files(db: &Database, job_id: &str) -> Result<Vec<SourceFileRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT position, path, content FROM job_source_files
             WHERE job_id = ?1 ORDER BY position",
        )?;
        let rows = stmt
            .query_map(params![job_id], |r| {
                Ok(SourceFileRow {
                    position: r.get(0)?,
                    path: r.get(1)?,
                    content: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Every job row in insertion order.
pub fn list_all(db: &Database) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY seq")?;
        let rows = stmt
            .query_map([], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
