//! Engine configuration.
//!
//! Describes the geometry of the tracked address space (direct map, large
//! virtual regions, per-CPU windows, the untrusted boundary), the metadata
//! pool limit, depot capacity and the report policy.
//!
//! The report policy is set via the `MEMSAN_REPORT_POLICY` environment variable:
//! - `continue` (default): emit the report and keep running.
//! - `panic`: emit the report, then halt. Used for "fatal on report" hosts.
//! - `silent`: count violations but never emit a report.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of one primary page and of one shadow or origin page.
pub const PAGE_SIZE: usize = 4096;
/// Number of primary bytes covered by one origin handle.
pub const ORIGIN_SIZE: usize = 4;
/// Longest provenance chain kept before the oldest link is summarized.
pub const MAX_CHAIN_DEPTH: u32 = 7;
/// Nesting levels of the execution context stack, task level included.
pub const NESTED_CONTEXT_MAX: usize = 8;
/// Bytes of parameter metadata per execution context.
pub const PARAM_SIZE: usize = 800;
/// Bytes of return-value metadata per execution context.
pub const RETVAL_SIZE: usize = 800;
/// Frames kept per captured stack.
pub const MAX_STACK_DEPTH: usize = 64;
/// Distinct report locations remembered for deduplication.
pub const MAX_REPORTS: usize = 12_800;
/// Boot-time ranges that may be registered before the engine is ready.
pub const MAX_FUTURE_RANGES: usize = 128;

/// What happens after a use of uninitialized memory is detected.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportPolicy {
    /// Emit the report and continue execution.
    #[default]
    Continue,
    /// Emit the report and then halt the host.
    Panic,
    /// Count the violation, emit nothing.
    Silent,
}

impl ReportPolicy {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "continue" | "default" | "warn" => Self::Continue,
            "panic" | "fatal" | "halt" => Self::Panic,
            "silent" | "off" | "quiet" => Self::Silent,
            _ => Self::Continue,
        }
    }

    /// Returns true if reports reach the sinks.
    #[must_use]
    pub const fn emits(self) -> bool {
        !matches!(self, Self::Silent)
    }

    /// Returns true if a report halts the host.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::Panic)
    }
}

// 0=unresolved, 1=Continue, 2=Panic, 3=Silent, 255=resolving.
// Non-blocking so that a hook firing from inside std::env::var() during
// resolution sees RESOLVING and falls back to Continue instead of waiting.
static CACHED_POLICY: AtomicU8 = AtomicU8::new(0);

const POLICY_UNRESOLVED: u8 = 0;
const POLICY_CONTINUE: u8 = 1;
const POLICY_PANIC: u8 = 2;
const POLICY_SILENT: u8 = 3;
const POLICY_RESOLVING: u8 = 255;

fn policy_to_u8(policy: ReportPolicy) -> u8 {
    match policy {
        ReportPolicy::Continue => POLICY_CONTINUE,
        ReportPolicy::Panic => POLICY_PANIC,
        ReportPolicy::Silent => POLICY_SILENT,
    }
}

fn u8_to_policy(v: u8) -> ReportPolicy {
    match v {
        POLICY_PANIC => ReportPolicy::Panic,
        POLICY_SILENT => ReportPolicy::Silent,
        _ => ReportPolicy::Continue,
    }
}

/// Get the process-wide report policy (reads the env var on first call, caches thereafter).
#[must_use]
pub fn report_policy() -> ReportPolicy {
    let cached = CACHED_POLICY.load(Ordering::Relaxed);
    if cached != POLICY_UNRESOLVED && cached != POLICY_RESOLVING {
        return u8_to_policy(cached);
    }
    if cached == POLICY_RESOLVING {
        return ReportPolicy::Continue;
    }

    if CACHED_POLICY
        .compare_exchange(
            POLICY_UNRESOLVED,
            POLICY_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_POLICY.load(Ordering::Relaxed);
        return if v != POLICY_UNRESOLVED && v != POLICY_RESOLVING {
            u8_to_policy(v)
        } else {
            ReportPolicy::Continue
        };
    }

    let policy = std::env::var("MEMSAN_REPORT_POLICY")
        .map(|v| ReportPolicy::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_POLICY.store(policy_to_u8(policy), Ordering::Release);
    policy
}

/// A large virtual region whose metadata lives at a fixed offset in the
/// shadow universe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualRegion {
    pub name: String,
    /// First primary address of the region (page aligned).
    pub start: u64,
    /// One past the last primary address (page aligned).
    pub end: u64,
    /// Shadow-universe address that `start` maps to.
    pub meta_base: u64,
}

impl VirtualRegion {
    #[must_use]
    pub fn new(name: impl Into<String>, start: u64, end: u64, meta_base: u64) -> Self {
        Self {
            name: name.into(),
            start,
            end,
            meta_base,
        }
    }

    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Shadow-universe address for a primary address inside this region.
    #[must_use]
    pub const fn meta_addr(&self, addr: u64) -> u64 {
        addr - self.start + self.meta_base
    }
}

/// Rejected layout parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{what} must be page aligned (got {value:#x})")]
    Misaligned { what: &'static str, value: u64 },
    #[error("{what} must be non-zero")]
    Empty { what: &'static str },
    #[error("region '{name}' overlaps {other}")]
    Overlap { name: String, other: String },
    #[error("depot capacity {requested} exceeds handle space {max}")]
    DepotTooLarge { requested: usize, max: usize },
    #[error("more than {max} future ranges registered")]
    TooManyFutureRanges { max: usize },
    #[error("future range {start:#x}..{end:#x} is outside the direct map")]
    FutureRangeOutside { start: u64, end: u64 },
}

/// Full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// First address of the page-backed direct map.
    pub direct_map_base: u64,
    /// Number of page descriptors in the direct map.
    pub direct_map_pages: usize,
    /// Large virtual regions, checked before anything else.
    pub virtual_regions: Vec<VirtualRegion>,
    /// First address of the per-CPU reserved windows.
    pub cpu_window_base: u64,
    /// Bytes reserved per CPU (page multiple).
    pub cpu_window_size: usize,
    pub nr_cpus: usize,
    /// Addresses strictly below this value are on the untrusted side.
    pub untrusted_limit: u64,
    /// Interrupt entry text; captured stacks are cut after the first frame inside it.
    pub irq_entry_text: Option<(u64, u64)>,
    /// Upper bound on shadow+origin pages handed out by the lifecycle manager.
    pub meta_page_limit: Option<usize>,
    /// Maximum number of distinct records in the provenance store.
    pub depot_capacity: usize,
    pub report_policy: ReportPolicy,
    /// Suppress repeated reports from the same location.
    pub dedupe_reports: bool,
    /// Install the stderr text sink at construction.
    pub stderr_reports: bool,
    /// Records kept by the in-memory event log.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            direct_map_base: 0xffff_8880_0000_0000,
            direct_map_pages: 1024,
            virtual_regions: vec![
                VirtualRegion::new(
                    "vmalloc",
                    0xffff_c900_0000_0000,
                    0xffff_c900_0400_0000,
                    0xffff_e900_0000_0000,
                ),
                VirtualRegion::new(
                    "modules",
                    0xffff_ffff_a000_0000,
                    0xffff_ffff_a400_0000,
                    0xffff_ea00_0000_0000,
                ),
            ],
            cpu_window_base: 0xffff_fe00_0000_0000,
            cpu_window_size: 4 * PAGE_SIZE,
            nr_cpus: 4,
            untrusted_limit: 0x0000_7fff_ffff_f000,
            irq_entry_text: None,
            meta_page_limit: None,
            depot_capacity: 1 << 20,
            report_policy: report_policy(),
            dedupe_reports: true,
            stderr_reports: false,
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_direct_map(mut self, base: u64, pages: usize) -> Self {
        self.direct_map_base = base;
        self.direct_map_pages = pages;
        self
    }

    #[must_use]
    pub fn with_meta_page_limit(mut self, limit: usize) -> Self {
        self.meta_page_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_report_policy(mut self, policy: ReportPolicy) -> Self {
        self.report_policy = policy;
        self
    }

    #[must_use]
    pub fn with_irq_entry_text(mut self, start: u64, end: u64) -> Self {
        self.irq_entry_text = Some((start, end));
        self
    }

    #[must_use]
    pub fn with_depot_capacity(mut self, capacity: usize) -> Self {
        self.depot_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_dedupe(mut self, dedupe: bool) -> Self {
        self.dedupe_reports = dedupe;
        self
    }

    /// One past the last direct-map address.
    #[must_use]
    pub const fn direct_map_end(&self) -> u64 {
        self.direct_map_base + (self.direct_map_pages * PAGE_SIZE) as u64
    }

    /// One past the last per-CPU window address.
    #[must_use]
    pub const fn cpu_window_end(&self) -> u64 {
        self.cpu_window_base + (self.cpu_window_size * self.nr_cpus) as u64
    }

    /// Check layout consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let page = PAGE_SIZE as u64;
        if self.direct_map_pages == 0 {
            return Err(ConfigError::Empty {
                what: "direct_map_pages",
            });
        }
        if self.direct_map_base % page != 0 {
            return Err(ConfigError::Misaligned {
                what: "direct_map_base",
                value: self.direct_map_base,
            });
        }
        if self.nr_cpus == 0 {
            return Err(ConfigError::Empty { what: "nr_cpus" });
        }
        if self.cpu_window_size == 0 {
            return Err(ConfigError::Empty {
                what: "cpu_window_size",
            });
        }
        if self.cpu_window_base % page != 0 || self.cpu_window_size % PAGE_SIZE != 0 {
            return Err(ConfigError::Misaligned {
                what: "cpu_window",
                value: self.cpu_window_base,
            });
        }
        if self.depot_capacity == 0 {
            return Err(ConfigError::Empty {
                what: "depot_capacity",
            });
        }
        let max = crate::depot::MAX_DEPOT_RECORDS;
        if self.depot_capacity > max {
            return Err(ConfigError::DepotTooLarge {
                requested: self.depot_capacity,
                max,
            });
        }

        let mut spans: Vec<(String, u64, u64)> = vec![
            (
                "direct map".to_string(),
                self.direct_map_base,
                self.direct_map_end(),
            ),
            (
                "cpu windows".to_string(),
                self.cpu_window_base,
                self.cpu_window_end(),
            ),
        ];
        for region in &self.virtual_regions {
            if region.start % page != 0 || region.end % page != 0 || region.meta_base % page != 0
            {
                return Err(ConfigError::Misaligned {
                    what: "virtual region",
                    value: region.start,
                });
            }
            if region.end <= region.start {
                return Err(ConfigError::Empty {
                    what: "virtual region",
                });
            }
            spans.push((region.name.clone(), region.start, region.end));
        }
        for (i, (name, start, end)) in spans.iter().enumerate() {
            for (other, o_start, o_end) in spans.iter().skip(i + 1) {
                if start < o_end && o_start < end {
                    return Err(ConfigError::Overlap {
                        name: name.clone(),
                        other: other.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
