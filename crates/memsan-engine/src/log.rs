//! Structured engine event log.
//!
//! Records follow the JSONL log contract used by the harness: required
//! `timestamp`, `trace_id`, `level`, `event`; optional context fields are
//! omitted when absent. The log keeps a bounded ring in memory and can mirror
//! every line to a writer.

use std::collections::VecDeque;
use std::io::Write;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Severity level for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// One structured event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    // Required
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    // Optional
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pfn: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl EventRecord {
    /// Create a record with required fields only. The trace id is assigned
    /// by [`EventLog::record`].
    #[must_use]
    pub fn new(level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: String::new(),
            level,
            event: event.into(),
            pfn: None,
            addr: None,
            size: None,
            cpu: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_pfn(mut self, pfn: usize) -> Self {
        self.pfn = Some(pfn);
        self
    }

    #[must_use]
    pub fn with_addr(mut self, addr: u64) -> Self {
        self.addr = Some(addr);
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn with_cpu(mut self, cpu: usize) -> Self {
        self.cpu = Some(cpu);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

struct EventLogInner {
    ring: VecDeque<EventRecord>,
    capacity: usize,
    seq: u64,
    writer: Option<Box<dyn Write + Send>>,
}

/// Bounded in-memory event log with an optional JSONL mirror.
pub struct EventLog {
    inner: Mutex<EventLogInner>,
}

impl EventLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(EventLogInner {
                ring: VecDeque::with_capacity(capacity.min(4096)),
                capacity,
                seq: 0,
                writer: None,
            }),
        }
    }

    /// Mirror every subsequent record to `writer` as JSONL.
    pub fn set_writer(&self, writer: Box<dyn Write + Send>) {
        self.inner.lock().writer = Some(writer);
    }

    /// Append a record. Write failures on the mirror are dropped; the log
    /// must never fail the operation that produced the event.
    pub fn record(&self, mut record: EventRecord) {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        record.trace_id = format!("memsan::{:06}", inner.seq);
        if let Some(writer) = inner.writer.as_mut()
            && let Ok(line) = record.to_jsonl()
        {
            let _ = writeln!(writer, "{line}");
        }
        if inner.capacity == 0 {
            return;
        }
        if inner.ring.len() == inner.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(record);
    }

    /// Records currently held in memory, oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<EventRecord> {
        self.inner.lock().ring.iter().cloned().collect()
    }

    /// Number of in-memory records with the given event name.
    #[must_use]
    pub fn count(&self, event: &str) -> usize {
        self.inner
            .lock()
            .ring
            .iter()
            .filter(|r| r.event == event)
            .count()
    }

    /// Flush the mirror writer, if any.
    pub fn flush(&self) -> std::io::Result<()> {
        match self.inner.lock().writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();
    // Approximate calendar fields; precise enough for ordering log lines.
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        1970 + secs / 31_557_600,
        (secs % 31_557_600) / 2_629_800 + 1,
        (secs % 2_629_800) / 86400 + 1,
        (secs % 86400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        millis,
    )
}
