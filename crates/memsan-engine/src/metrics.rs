//! Atomic counters for engine observability.
//!
//! All counters use relaxed ordering. They are diagnostic, never used to
//! synchronize anything.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-engine operation counters.
pub struct EngineMetrics {
    /// Page allocations that received metadata.
    pub allocs: AtomicU64,
    /// Allocations degraded to untracked after pool exhaustion.
    pub degraded_allocs: AtomicU64,
    /// Allocations explicitly marked untracked by the host.
    pub untracked_allocs: AtomicU64,
    pub frees: AtomicU64,
    pub splits: AtomicU64,
    pub page_copies: AtomicU64,
    /// Virtual pages mapped with fresh metadata.
    pub ranges_mapped: AtomicU64,
    /// Virtual pages whose metadata was reclaimed on unmap.
    pub ranges_reclaimed: AtomicU64,
    pub poisons: AtomicU64,
    pub unpoisons: AtomicU64,
    pub checks: AtomicU64,
    /// Checks that found at least one poisoned byte.
    pub violations: AtomicU64,
    pub reports_emitted: AtomicU64,
    /// Reports dropped by dedupe, the reentrancy flag or the silent policy.
    pub reports_suppressed: AtomicU64,
    pub chains_created: AtomicU64,
    /// Chains that hit the depth cap and folded their oldest link.
    pub chains_summarized: AtomicU64,
    /// Locator lookups answered with a dummy buffer.
    pub dummy_fallbacks: AtomicU64,
    /// Stack saves refused by a full depot.
    pub depot_full: AtomicU64,
}

impl EngineMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocs: AtomicU64::new(0),
            degraded_allocs: AtomicU64::new(0),
            untracked_allocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            splits: AtomicU64::new(0),
            page_copies: AtomicU64::new(0),
            ranges_mapped: AtomicU64::new(0),
            ranges_reclaimed: AtomicU64::new(0),
            poisons: AtomicU64::new(0),
            unpoisons: AtomicU64::new(0),
            checks: AtomicU64::new(0),
            violations: AtomicU64::new(0),
            reports_emitted: AtomicU64::new(0),
            reports_suppressed: AtomicU64::new(0),
            chains_created: AtomicU64::new(0),
            chains_summarized: AtomicU64::new(0),
            dummy_fallbacks: AtomicU64::new(0),
            depot_full: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocs: Self::get(&self.allocs),
            degraded_allocs: Self::get(&self.degraded_allocs),
            untracked_allocs: Self::get(&self.untracked_allocs),
            frees: Self::get(&self.frees),
            splits: Self::get(&self.splits),
            page_copies: Self::get(&self.page_copies),
            ranges_mapped: Self::get(&self.ranges_mapped),
            ranges_reclaimed: Self::get(&self.ranges_reclaimed),
            poisons: Self::get(&self.poisons),
            unpoisons: Self::get(&self.unpoisons),
            checks: Self::get(&self.checks),
            violations: Self::get(&self.violations),
            reports_emitted: Self::get(&self.reports_emitted),
            reports_suppressed: Self::get(&self.reports_suppressed),
            chains_created: Self::get(&self.chains_created),
            chains_summarized: Self::get(&self.chains_summarized),
            dummy_fallbacks: Self::get(&self.dummy_fallbacks),
            depot_full: Self::get(&self.depot_full),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub allocs: u64,
    pub degraded_allocs: u64,
    pub untracked_allocs: u64,
    pub frees: u64,
    pub splits: u64,
    pub page_copies: u64,
    pub ranges_mapped: u64,
    pub ranges_reclaimed: u64,
    pub poisons: u64,
    pub unpoisons: u64,
    pub checks: u64,
    pub violations: u64,
    pub reports_emitted: u64,
    pub reports_suppressed: u64,
    pub chains_created: u64,
    pub chains_summarized: u64,
    pub dummy_fallbacks: u64,
    pub depot_full: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = EngineMetrics::new();
        let snap = m.snapshot();
        assert_eq!(snap.allocs, 0);
        assert_eq!(snap.violations, 0);
    }

    #[test]
    fn increment_works() {
        let m = EngineMetrics::new();
        EngineMetrics::inc(&m.checks);
        EngineMetrics::inc(&m.checks);
        EngineMetrics::add(&m.ranges_mapped, 5);
        let snap = m.snapshot();
        assert_eq!(snap.checks, 2);
        assert_eq!(snap.ranges_mapped, 5);
    }

    #[test]
    fn snapshot_serializes() {
        let m = EngineMetrics::new();
        EngineMetrics::inc(&m.poisons);
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert_eq!(json["poisons"], 1);
    }
}
