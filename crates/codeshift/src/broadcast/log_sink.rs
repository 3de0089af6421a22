//! Per-job execution logs with live subscription.
//!
//! Each job owns an append-only sequence of text chunks. Subscribers get the
//! accumulated text as one [`LogItem::Snapshot`] followed by every chunk
//! appended afterwards, and a final [`LogItem::End`] once the job's log is
//! closed. The snapshot and the registration happen under the same per-job
//! lock as appends, so nothing is lost or duplicated across the boundary.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::db::log_repo::{self, LogRow};
use crate::db::{Database, DatabaseError};
use crate::error::LogError;
use crate::job::{JobId, JobStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogChunk {
    pub seq: u64,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// One delivery on a log subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum LogItem {
    /// Everything appended before the subscription, as one block.
    Snapshot { text: String, next_seq: u64 },
    Chunk(LogChunk),
    /// The job reached a terminal status; nothing follows.
    End { status: JobStatus },
}

impl LogItem {
    /// Text carried by this item, empty for `End`.
    pub fn text(&self) -> &str {
        match self {
            LogItem::Snapshot { text, .. } => text,
            LogItem::Chunk(chunk) => &chunk.text,
            LogItem::End { .. } => "",
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, LogItem::End { .. })
    }
}

/// Receiving end of a log subscription. Dropping it unsubscribes.
pub struct LogSubscription {
    rx: mpsc::UnboundedReceiver<LogItem>,
}

impl Stream for LogSubscription {
    type Item = LogItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<LogItem>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Default)]
struct JobLog {
    chunks: Vec<LogChunk>,
    closed: Option<JobStatus>,
    subscribers: Vec<mpsc::UnboundedSender<LogItem>>,
}

impl JobLog {
    fn text(&self) -> String {
        self.chunks.iter().map(|c| c.text.as_str()).collect()
    }
}

/// Append-only log store with broadcast to live subscribers.
#[derive(Default)]
pub struct LogSink {
    db: RwLock<Option<Database>>,
    logs: RwLock<HashMap<JobId, Arc<Mutex<JobLog>>>>,
}

fn lock_log(log: &Mutex<JobLog>) -> MutexGuard<'_, JobLog> {
    match log.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Job log lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_database(&self, db: Database) {
        let mut guard = match self.db.write() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Log sink DB lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        *guard = Some(db);
    }

    fn database(&self) -> Option<Database> {
        match self.db.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => {
                log::warn!("Log sink DB lock was poisoned, recovering");
                poisoned.into_inner().clone()
            }
        }
    }

    fn find(&self, job_id: &JobId) -> Option<Arc<Mutex<JobLog>>> {
        let logs = match self.logs.read() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Log sink lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        logs.get(job_id).cloned()
    }

    fn find_or_create(&self, job_id: &JobId) -> Arc<Mutex<JobLog>> {
        if let Some(log) = self.find(job_id) {
            return log;
        }
        let mut logs = match self.logs.write() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Log sink lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        logs.entry(job_id.clone()).or_default().clone()
    }

    /// Creates an empty log for a new job so it can be subscribed to before
    /// anything is written.
    pub fn register(&self, job_id: &JobId) {
        self.find_or_create(job_id);
    }

    /// Appends a chunk. Best effort: failures are logged, never returned.
    pub fn append(&self, job_id: &JobId, text: &str) {
        if text.is_empty() {
            return;
        }
        let slot = self.find_or_create(job_id);
        let mut entry = lock_log(&slot);

        if let Some(status) = entry.closed {
            log::warn!(
                "Dropping log append for job {} after it ended with {}",
                job_id,
                status
            );
            return;
        }
        self.push_chunk(job_id, &mut entry, text);
    }

    fn push_chunk(&self, job_id: &JobId, entry: &mut JobLog, text: &str) {
        let chunk = LogChunk {
            seq: entry.chunks.len() as u64,
            text: text.to_string(),
            at: Utc::now(),
        };

        if let Some(db) = self.database() {
            let row = LogRow {
                job_id: job_id.to_string(),
                seq: chunk.seq,
                text: chunk.text.clone(),
                appended_at: chunk.at.to_rfc3339(),
            };
            if let Err(e) = log_repo::insert(&db, &row) {
                log::error!("Failed to persist log chunk {} for job {}: {}", chunk.seq, job_id, e);
            }
        }

        entry
            .subscribers
            .retain(|tx| tx.send(LogItem::Chunk(chunk.clone())).is_ok());
        entry.chunks.push(chunk);
    }

    /// Full text appended so far.
    pub fn snapshot(&self, job_id: &JobId) -> Result<String, LogError> {
        let slot = self
            .find(job_id)
            .ok_or_else(|| LogError::UnknownJob(job_id.clone()))?;
        let text = lock_log(&slot).text();
        Ok(text)
    }

    /// Chunks with `seq >= from`.
    pub fn chunks_since(&self, job_id: &JobId, from: u64) -> Result<Vec<LogChunk>, LogError> {
        let slot = self
            .find(job_id)
            .ok_or_else(|| LogError::UnknownJob(job_id.clone()))?;
        let entry = lock_log(&slot);
        Ok(entry.chunks.iter().skip(from as usize).cloned().collect())
    }

    /// Subscribes to a job's log: snapshot first, then live chunks, then the
    /// end marker.
    pub fn subscribe(&self, job_id: &JobId) -> Result<LogSubscription, LogError> {
        let slot = self
            .find(job_id)
            .ok_or_else(|| LogError::UnknownJob(job_id.clone()))?;
        let mut entry = lock_log(&slot);

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(LogItem::Snapshot {
            text: entry.text(),
            next_seq: entry.chunks.len() as u64,
        });
        match entry.closed {
            Some(status) => {
                let _ = tx.send(LogItem::End { status });
            }
            None => entry.subscribers.push(tx),
        }
        Ok(LogSubscription { rx })
    }

    /// Marks the log finished and sends the end marker to every subscriber.
    ///
    /// `last_line` is appended in the same critical section, so only the
    /// caller that actually closes the log writes it. Returns `false` when
    /// the log was already closed.
    pub fn close(&self, job_id: &JobId, status: JobStatus, last_line: Option<&str>) -> bool {
        let slot = self.find_or_create(job_id);
        let mut entry = lock_log(&slot);
        if entry.closed.is_some() {
            return false;
        }
        if let Some(line) = last_line.filter(|l| !l.is_empty()) {
            self.push_chunk(job_id, &mut entry, line);
        }
        entry.closed = Some(status);
        for tx in entry.subscribers.drain(..) {
            let _ = tx.send(LogItem::End { status });
        }
        log::debug!("Closed log for job {} ({})", job_id, status);
        true
    }

    pub fn is_closed(&self, job_id: &JobId) -> bool {
        self.find(job_id)
            .map(|slot| {
                let entry = lock_log(&slot);
                entry.closed.is_some()
            })
            .unwrap_or(false)
    }

    /// Live subscribers still attached. Disconnected ones are pruned on the
    /// next append.
    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.find(job_id)
            .map(|slot| {
                let entry = lock_log(&slot);
                entry.subscribers.len()
            })
            .unwrap_or(0)
    }

    /// Rebuilds all logs from the database. `terminal_status` tells which jobs
    /// already finished; their logs come back closed.
    pub fn load_from_database<F>(&self, terminal_status: F) -> Result<usize, DatabaseError>
    where
        F: Fn(&JobId) -> Option<JobStatus>,
    {
        let Some(db) = self.database() else {
            return Ok(0);
        };

        let mut restored = HashMap::new();
        for id in log_repo::job_ids(&db)? {
            let rows = log_repo::list_for_job(&db, &id)?;
            let chunks = rows
                .into_iter()
                .map(|row| {
                    let at = DateTime::parse_from_rfc3339(&row.appended_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|_| DatabaseError::Corrupt {
                            column: "job_logs.appended_at",
                            value: row.appended_at.clone(),
                        })?;
                    Ok(LogChunk {
                        seq: row.seq,
                        text: row.text,
                        at,
                    })
                })
                .collect::<Result<Vec<_>, DatabaseError>>()?;
            let id = JobId::from(id);
            let entry = JobLog {
                chunks,
                closed: terminal_status(&id),
                subscribers: Vec::new(),
            };
            restored.insert(id, Arc::new(Mutex::new(entry)));
        }

        let count = restored.len();
        let mut logs = match self.logs.write() {
            Ok(g) => g,
            Err(poisoned) => {
                log::warn!("Log sink lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        *logs = restored;
        log::info!("Loaded logs for {} jobs from database", count);
        Ok(count)
    }
}
