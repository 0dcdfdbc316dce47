use heapless::HistoryBuffer;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

const STATUS_HISTORY_SIZE: usize = 32;

/// The host's status surface.
pub trait StatusSink: Send + Sync {
    fn report_status(&self, text: &str);
    fn report_error(&self, text: &str);
    fn debug_log(&self, text: &str);
}

impl<S: StatusSink + ?Sized> StatusSink for Arc<S> {
    fn report_status(&self, text: &str) {
        (**self).report_status(text)
    }

    fn report_error(&self, text: &str) {
        (**self).report_error(text)
    }

    fn debug_log(&self, text: &str) {
        (**self).debug_log(text)
    }
}

/// Sends everything to `tracing`. Used when no host is embedding us.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn report_status(&self, text: &str) {
        info!("📊 {}", text);
    }

    fn report_error(&self, text: &str) {
        error!("❌ {}", text);
    }

    fn debug_log(&self, text: &str) {
        debug!("{}", text);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Status,
    Error,
    Debug,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub kind: StatusKind,
    pub text: String,
}

struct Recorded {
    history: HistoryBuffer<StatusRecord, STATUS_HISTORY_SIZE>,
    errors_reported: u32,
}

/// Keeps the most recent reports in a bounded history.
#[derive(Clone)]
pub struct RecordingSink {
    inner: Arc<Mutex<Recorded>>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Recorded {
                history: HistoryBuffer::new(),
                errors_reported: 0,
            })),
        }
    }

    fn record(&self, kind: StatusKind, text: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if kind == StatusKind::Error {
            inner.errors_reported = inner.errors_reported.saturating_add(1);
        }
        inner.history.write(StatusRecord {
            kind,
            text: text.to_string(),
        });
    }

    /// Records oldest first.
    pub fn records(&self) -> Vec<StatusRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.history.oldest_ordered().cloned().collect()
    }

    pub fn of_kind(&self, kind: StatusKind) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.text)
            .collect()
    }

    pub fn last_status(&self) -> Option<String> {
        self.of_kind(StatusKind::Status).pop()
    }

    /// Total errors ever reported, including ones pushed out of the history.
    pub fn errors_reported(&self) -> u32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).errors_reported
    }
}

impl StatusSink for RecordingSink {
    fn report_status(&self, text: &str) {
        self.record(StatusKind::Status, text);
    }

    fn report_error(&self, text: &str) {
        self.record(StatusKind::Error, text);
    }

    fn debug_log(&self, text: &str) {
        self.record(StatusKind::Debug, text);
    }
}
