//! Log repository for the `job_logs` table.

use rusqlite::params;

use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRow {
    pub job_id: String,
    pub seq: u64,
    pub text: String,
    pub appended_at: String,
}

pub fn insert(db: &Database, row: &LogRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO job_logs (job_id, seq, text, appended_at) VALUES (?1, ?2, ?3, ?4)",
            params![row.job_id, row.seq as i64, row.text, row.appended_at],
        )?;
        Ok(())
    })
}

/// All chunks of a job's log in sequence order.
pub fn list_for_job(db: &Database, job_id: &str) -> Result<Vec<LogRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT job_id, seq, text, appended_at FROM job_logs
             WHERE job_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![job_id], |r| {
                Ok(LogRow {
                    job_id: r.get(0)?,
                    seq: r.get::<_, i64>(1)? as u64,
                    text: r.get(2)?,
                    appended_at: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Distinct job ids that have at least one log chunk.
pub fn job_ids(db: &Database) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT DISTINCT job_id FROM job_logs ORDER BY job_id")?;
        let ids = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(job_id: &str, seq: u64, text: &str) -> LogRow {
        LogRow {
            job_id: job_id.to_string(),
            seq,
            text: text.to_string(),
            appended_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_insert_and_list_in_seq_order() {
        let db = Database::open_in_memory().unwrap();
        insert(&db, &row("j1", 1, "second\n")).unwrap();
        insert(&db, &row("j1", 0, "first\n")).unwrap();
        insert(&db, &row("j2", 0, "other\n")).unwrap();

        let rows = list_for_job(&db, "j1").unwrap();
        let texts: Vec<_> = rows.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["first\n", "second\n"]);
        assert_eq!(job_ids(&db).unwrap(), vec!["j1", "j2"]);
    }

    #[test]
    fn test_sequence_numbers_are_unique_per_job() {
        let db = Database::open_in_memory().unwrap();
        insert(&db, &row("j1", 0, "a")).unwrap();
        assert!(insert(&db, &row("j1", 0, "b")).is_err());
    }
}
