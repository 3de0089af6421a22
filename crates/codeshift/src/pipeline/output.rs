use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::broadcast::LogSink;
use crate::job::{JobId, Stage};

/// Incremental output from a running stage.
pub trait StageOutput: Send + Sync {
    fn line(&self, text: &str);
}

/// Log-append session for one stage attempt.
///
/// Every line goes to the job's log as it arrives. The session writes a
/// closing line on [`finish`](Self::finish); if it is dropped unfinished (the
/// attempt future was dropped or a collaborator panicked) it writes an
/// abnormal-end line instead.
pub struct LogSession {
    sink: Arc<LogSink>,
    job_id: JobId,
    prefix: String,
    finished: AtomicBool,
}

impl LogSession {
    pub fn open(sink: Arc<LogSink>, job_id: JobId, stage: Stage, attempt: u32) -> Self {
        let session = Self {
            sink,
            job_id,
            prefix: format!("[{} #{}]", stage, attempt),
            finished: AtomicBool::new(false),
        };
        session.line("started");
        session
    }

    pub fn finish(&self, summary: &str) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.write(summary);
        }
    }

    fn write(&self, text: &str) {
        let mut chunk = String::with_capacity(self.prefix.len() + text.len() + 2);
        chunk.push_str(&self.prefix);
        chunk.push(' ');
        chunk.push_str(text.trim_end_matches('\n'));
        chunk.push('\n');
        self.sink.append(&self.job_id, &chunk);
    }
}

impl StageOutput for LogSession {
    fn line(&self, text: &str) {
        self.write(text);
    }
}

impl Drop for LogSession {
    fn drop(&mut self) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.write("ended abnormally");
        }
    }
}
