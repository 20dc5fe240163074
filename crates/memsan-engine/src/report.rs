//! Diagnostics for detected uses of uninitialized memory.
//!
//! A [`Report`] is built by the propagation engine and handed to the
//! [`Reporter`], which applies the report policy, the per-location dedupe
//! table and the per-task reentrancy flags, then fans the report out to the
//! installed [`ReportSink`]s under a single lock so one report's lines stay
//! together.

use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::{MAX_REPORTS, ReportPolicy};
use crate::context::with_context;
use crate::depot::OriginHandle;
use crate::engine::Sanitizer;
use crate::log::{EventLog, EventRecord, LogLevel};
use crate::metrics::EngineMetrics;
use crate::origin::{self, OriginCause, OriginRecord};

/// Why a report was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportReason {
    UninitValue,
    CopyToUntrusted,
    TransferToPeripheral,
    UseAfterFree,
}

impl ReportReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UninitValue => "uninit-value",
            Self::CopyToUntrusted => "kernel-infoleak",
            Self::TransferToPeripheral => "peripheral-infoleak",
            Self::UseAfterFree => "use-after-free",
        }
    }
}

/// One step of a provenance chain as printed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "link", rename_all = "snake_case")]
pub enum ChainLink {
    StoredAt { frames: Vec<u64> },
    CreatedAt { cause: OriginCause, frames: Vec<u64> },
    LocalVariable { descr: String, frames: Vec<u64> },
    Elided { count: u32 },
    Missing,
}

/// A detected use of uninitialized data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub reason: ReportReason,
    /// Location of the offending use: a source location or an instruction address.
    pub location: String,
    pub origin: OriginHandle,
    /// Access start; `None` for register uses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<u64>,
    pub size: usize,
    /// First and last poisoned offsets, inclusive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_addr: Option<u64>,
    /// Stack of the use, innermost first.
    pub stack: Vec<u64>,
    /// Provenance, newest link first.
    pub chain: Vec<ChainLink>,
}

impl Report {
    /// Poisoned byte range relative to the access, if any.
    #[must_use]
    pub fn offsets(&self) -> Option<(usize, usize)> {
        self.first.zip(self.last)
    }
}

fn write_frames(f: &mut fmt::Formatter<'_>, frames: &[u64]) -> fmt::Result {
    for pc in frames {
        writeln!(f, " {pc:#018x}")?;
    }
    Ok(())
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "BUG: MEMSAN: {} in {}", self.reason.as_str(), self.location)?;
        write_frames(f, &self.stack)?;
        for link in &self.chain {
            writeln!(f)?;
            match link {
                ChainLink::StoredAt { frames } => {
                    writeln!(f, "Uninit was stored to memory at:")?;
                    write_frames(f, frames)?;
                }
                ChainLink::CreatedAt { frames, .. } => {
                    writeln!(f, "Uninit was created at:")?;
                    write_frames(f, frames)?;
                }
                ChainLink::LocalVariable { descr, frames } => {
                    writeln!(f, "Local variable {descr} created at:")?;
                    write_frames(f, frames)?;
                }
                ChainLink::Elided { count } => writeln!(f, "{count} older links elided")?,
                ChainLink::Missing => writeln!(f, "Uninit origin unknown")?,
            }
        }
        if let Some((first, last)) = self.offsets() {
            writeln!(f)?;
            if first == last {
                writeln!(f, "Byte {first} of {} is uninitialized", self.size)?;
            } else {
                writeln!(f, "Bytes {first}-{last} of {} are uninitialized", self.size)?;
            }
        }
        if let Some(addr) = self.addr {
            writeln!(f, "Memory access of size {} starts at {addr:#x}", self.size)?;
        }
        if let Some(user) = self.user_addr {
            writeln!(f, "Data copied to untrusted address {user:#x}")?;
        }
        Ok(())
    }
}

/// Destination for emitted reports.
pub trait ReportSink: Send + Sync {
    fn emit(&self, report: &Report);
}

/// Writes the text form to standard error.
#[derive(Debug, Default)]
pub struct StderrSink;

impl ReportSink for StderrSink {
    fn emit(&self, report: &Report) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{report}");
    }
}

/// Keeps every report in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    reports: Mutex<Vec<Report>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }

    pub fn clear(&self) {
        self.reports.lock().clear();
    }
}

impl ReportSink for MemorySink {
    fn emit(&self, report: &Report) {
        self.reports.lock().push(report.clone());
    }
}

/// One JSON object per report, one report per line.
pub struct JsonlSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonlSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> ReportSink for JsonlSink<W> {
    fn emit(&self, report: &Report) {
        if let Ok(line) = serde_json::to_string(report) {
            let mut w = self.writer.lock();
            let _ = writeln!(w, "{line}");
        }
    }
}

/// Serializes report output and applies the report policy.
pub struct Reporter {
    policy: ReportPolicy,
    dedupe: bool,
    lock: Mutex<()>,
    sinks: RwLock<Vec<Arc<dyn ReportSink>>>,
    seen: Mutex<HashSet<String>>,
}

impl Reporter {
    #[must_use]
    pub fn new(policy: ReportPolicy, dedupe: bool) -> Self {
        Self {
            policy,
            dedupe,
            lock: Mutex::new(()),
            sinks: RwLock::new(Vec::new()),
            seen: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub const fn policy(&self) -> ReportPolicy {
        self.policy
    }

    pub fn add_sink(&self, sink: Arc<dyn ReportSink>) {
        self.sinks.write().push(sink);
    }

    /// True if `location` has not reported yet. Once the table is full,
    /// new locations always report.
    fn first_from(&self, location: &str) -> bool {
        if !self.dedupe {
            return true;
        }
        let mut seen = self.seen.lock();
        if seen.contains(location) {
            return false;
        }
        if seen.len() < MAX_REPORTS {
            seen.insert(location.to_string());
        }
        true
    }

    /// Emit `report`. Returns false if it was suppressed.
    pub fn submit(&self, report: &Report, metrics: &EngineMetrics, events: &EventLog) -> bool {
        if !self.policy.emits() {
            EngineMetrics::inc(&metrics.reports_suppressed);
            return false;
        }
        let entered = with_context(|ctx| {
            let task = ctx.task_mut();
            if !task.allow_reporting || task.is_reporting {
                return false;
            }
            task.allow_reporting = false;
            task.is_reporting = true;
            true
        });
        if !entered {
            EngineMetrics::inc(&metrics.reports_suppressed);
            return false;
        }

        let emitted = self.first_from(&report.location);
        if emitted {
            let _serial = self.lock.lock();
            for sink in self.sinks.read().iter() {
                sink.emit(report);
            }
            EngineMetrics::inc(&metrics.reports_emitted);
            events.record(
                EventRecord::new(LogLevel::Warn, "report")
                    .with_size(report.size)
                    .with_details(serde_json::json!({
                        "reason": report.reason.as_str(),
                        "location": report.location,
                        "origin": report.origin.raw(),
                        "first": report.first,
                        "last": report.last,
                    })),
            );
        } else {
            EngineMetrics::inc(&metrics.reports_suppressed);
        }

        with_context(|ctx| {
            let task = ctx.task_mut();
            task.is_reporting = false;
            task.allow_reporting = true;
        });

        if emitted && self.policy.is_fatal() {
            panic!(
                "memsan: {} in {} (report policy is panic)",
                report.reason.as_str(),
                report.location
            );
        }
        emitted
    }
}

impl Sanitizer {
    /// Provenance chain behind `handle`, newest link first.
    #[must_use]
    pub fn describe_origin(&self, handle: OriginHandle) -> Vec<ChainLink> {
        let records = origin::walk(self.depot.as_ref(), handle);
        if records.is_empty() {
            return vec![ChainLink::Missing];
        }
        let mut chain = Vec::with_capacity(records.len());
        for (_, record) in records {
            match record {
                OriginRecord::Chain { stored_at, .. } => {
                    let frames = match origin::load(self.depot.as_ref(), stored_at) {
                        Some(OriginRecord::Stack { frames, .. }) => frames,
                        _ => Vec::new(),
                    };
                    chain.push(ChainLink::StoredAt { frames });
                }
                OriginRecord::FrameChain { pc, .. } => {
                    chain.push(ChainLink::StoredAt { frames: vec![pc] });
                }
                OriginRecord::Summary { elided, .. } => chain.push(ChainLink::Elided { count: elided }),
                OriginRecord::Stack { cause, frames } => {
                    chain.push(ChainLink::CreatedAt { cause, frames });
                }
                OriginRecord::Alloca { descr, pc1, pc2 } => {
                    let frames = [pc1, pc2].into_iter().filter(|&pc| pc != 0).collect();
                    chain.push(ChainLink::LocalVariable { descr, frames });
                }
            }
        }
        chain
    }

    /// Build a report for a use at `location` and submit it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn raise(
        &self,
        reason: ReportReason,
        location: String,
        origin: OriginHandle,
        addr: Option<u64>,
        size: usize,
        poisoned: Option<(usize, usize)>,
        user_addr: Option<u64>,
    ) -> Report {
        let reason = if reason == ReportReason::UninitValue && origin.is_after_free() {
            ReportReason::UseAfterFree
        } else {
            reason
        };
        let stack = with_context(|ctx| ctx.stack_frames(self.config.irq_entry_text));
        let report = Report {
            reason,
            location,
            origin,
            addr,
            size,
            first: poisoned.map(|p| p.0),
            last: poisoned.map(|p| p.1),
            user_addr,
            stack,
            chain: self.describe_origin(origin),
        };
        EngineMetrics::inc(&self.metrics.violations);
        self.reporter.submit(&report, &self.metrics, &self.events);
        report
    }
}
