//! Stage attempt repository for the `stage_attempts` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw stage attempt row. `metrics` is a JSON object of counters.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRow {
    pub job_id: String,
    pub stage: String,
    pub attempt_number: u32,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub outcome: Option<String>,
    pub detail: String,
    pub metrics: String,
}

impl AttemptRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            stage: row.get("stage")?,
            attempt_number: row.get("attempt_number")?,
            started_at: row.get("started_at")?,
            ended_at: row.get("ended_at")?,
            outcome: row.get("outcome")?,
            detail: row.get("detail")?,
            metrics: row.get("metrics")?,
        })
    }
}

/// Inserts a freshly opened attempt.
pub fn insert(db: &Database, attempt: &AttemptRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO stage_attempts (job_id, stage, attempt_number, started_at, ended_at,
             outcome, detail, metrics)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                attempt.job_id,
                attempt.stage,
                attempt.attempt_number,
                attempt.started_at,
                attempt.ended_at,
                attempt.outcome,
                attempt.detail,
                attempt.metrics,
            ],
        )?;
        Ok(())
    })
}

/// Records the closing fields of an attempt. Rows that are already closed
/// are left untouched.
pub fn close(db: &Database, attempt: &AttemptRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE stage_attempts SET ended_at=?4, outcome=?5, detail=?6, metrics=?7
             WHERE job_id=?1 AND stage=?2 AND attempt_number=?3 AND outcome IS NULL",
            params![
                attempt.job_id,
                attempt.stage,
                attempt.attempt_number,
                attempt.ended_at,
                attempt.outcome,
                attempt.detail,
                attempt.metrics,
            ],
        )?;
        Ok(())
    })
}

/// All attempts of a job in execution order.
pub fn list_for_job(db: &Database, job_id: &str) -> Result<Vec<AttemptRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM stage_attempts WHERE job_id = ?1
             ORDER BY started_at, rowid",
        )?;
        let rows = stmt
            .query_map(params![job_id], AttemptRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::job_repo::{self, JobRow};

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        job_repo::insert(
            &db,
            &JobRow {
                id: "j1".to_string(),
                seq: 1,
                name: "n".to_string(),
                target_profile: "p1".to_string(),
                priority: 0,
                status: "COMPILING".to_string(),
                compile_attempts: 1,
                retry_count: 0,
                created_at: "2026-01-01T00:00:00Z".to_string(),
                started_at: None,
                completed_at: None,
                error_message: None,
                output_file_path: None,
                worker: None,
                cancel_requested: false,
                updated_at: "2026-01-01T00:00:00Z".to_string(),
            },
            &[],
        )
        .unwrap();
        db
    }

    fn open_row(stage: &str, n: u32, started_at: &str) -> AttemptRow {
        AttemptRow {
            job_id: "j1".to_string(),
            stage: stage.to_string(),
            attempt_number: n,
            started_at: started_at.to_string(),
            ended_at: None,
            outcome: None,
            detail: String::new(),
            metrics: "{}".to_string(),
        }
    }

    #[test]
    fn test_insert_and_list_in_order() {
        let db = test_db();
        insert(&db, &open_row("analyze", 1, "2026-01-01T00:00:01Z")).unwrap();
        insert(&db, &open_row("convert", 1, "2026-01-01T00:00:02Z")).unwrap();
        insert(&db, &open_row("compile", 1, "2026-01-01T00:00:03Z")).unwrap();

        let rows = list_for_job(&db, "j1").unwrap();
        let stages: Vec<_> = rows.iter().map(|r| r.stage.as_str()).collect();
        assert_eq!(stages, vec!["analyze", "convert", "compile"]);
    }

    #[test]
    fn test_close_is_write_once() {
        let db = test_db();
        insert(&db, &open_row("compile", 1, "2026-01-01T00:00:01Z")).unwrap();

        let mut closed = open_row("compile", 1, "2026-01-01T00:00:01Z");
        closed.ended_at = Some("2026-01-01T00:00:09Z".to_string());
        closed.outcome = Some("failure".to_string());
        closed.detail = "undefined symbol".to_string();
        close(&db, &closed).unwrap();

        let mut again = closed.clone();
        again.outcome = Some("success".to_string());
        close(&db, &again).unwrap();

        let rows = list_for_job(&db, "j1").unwrap();
        assert_eq!(rows[0].outcome.as_deref(), Some("failure"));
        assert_eq!(rows[0].detail, "undefined symbol");
    }
}
