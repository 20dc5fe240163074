//! Built-in end-to-end scenarios.
//!
//! Each scenario runs against its own engine so results never depend on
//! execution order.

use std::sync::Arc;

use memsan_engine::locator::MetaKind;
use memsan_engine::report::ChainLink;
use memsan_engine::{
    AllocFlags, EngineConfig, MemorySink, MetricsSnapshot, Report, ReportPolicy, ReportReason,
    Sanitizer,
};
use serde::Serialize;

use crate::HarnessError;

const SCENARIO_BASE: u64 = 0xffff_8880_0000_0000;
const SCENARIO_PAGES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// A fresh allocation reads as uninitialized until written.
    FreshAllocation,
    /// A zero-filled allocation reads as initialized.
    ZeroedAllocation,
    /// A partially poisoned region reports only the poisoned bytes.
    PartialPoison,
    /// Freed and zero-reallocated pages carry no stale poison.
    ZeroedReallocation,
}

impl Scenario {
    pub const ALL: [Self; 4] = [
        Self::FreshAllocation,
        Self::ZeroedAllocation,
        Self::PartialPoison,
        Self::ZeroedReallocation,
    ];

    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::FreshAllocation => "a",
            Self::ZeroedAllocation => "b",
            Self::PartialPoison => "c",
            Self::ZeroedReallocation => "d",
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::FreshAllocation => "fresh_allocation",
            Self::ZeroedAllocation => "zeroed_allocation",
            Self::PartialPoison => "partial_poison",
            Self::ZeroedReallocation => "zeroed_reallocation",
        }
    }

    /// Parse a CLI selector: a scenario id or name, or `all`.
    pub fn select(selector: &str) -> Result<Vec<Self>, HarnessError> {
        let wanted = selector.to_ascii_lowercase();
        if wanted == "all" {
            return Ok(Self::ALL.to_vec());
        }
        Self::ALL
            .into_iter()
            .find(|s| s.id() == wanted || s.name() == wanted)
            .map(|s| vec![s])
            .ok_or(HarnessError::UnknownScenario(selector.to_string()))
    }

    /// Run against a fresh engine.
    pub fn run(self) -> Result<ScenarioOutcome, HarnessError> {
        let engine = Sanitizer::new(
            EngineConfig::default()
                .with_direct_map(SCENARIO_BASE, SCENARIO_PAGES)
                .with_report_policy(ReportPolicy::Continue)
                .with_dedupe(false),
        )?;
        engine.initialize();
        let sink = Arc::new(MemorySink::new());
        engine.add_sink(sink.clone());

        let mut notes = Vec::new();
        let passed = match self {
            Self::FreshAllocation => fresh_allocation(&engine, &mut notes),
            Self::ZeroedAllocation => zeroed_allocation(&engine, &mut notes),
            Self::PartialPoison => partial_poison(&engine, &mut notes),
            Self::ZeroedReallocation => zeroed_reallocation(&engine, &mut notes),
        };

        Ok(ScenarioOutcome {
            scenario: self,
            passed,
            reports: sink.reports(),
            notes,
            metrics: engine.metrics().snapshot(),
        })
    }
}

/// Result of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    pub scenario: Scenario,
    pub passed: bool,
    /// Everything the engine emitted during the run.
    pub reports: Vec<Report>,
    /// Failed expectations, one line each.
    pub notes: Vec<String>,
    pub metrics: MetricsSnapshot,
}

fn expect(notes: &mut Vec<String>, ok: bool, what: impl FnOnce() -> String) -> bool {
    if !ok {
        notes.push(what());
    }
    ok
}

fn expect_report(
    notes: &mut Vec<String>,
    report: Option<&Report>,
    offsets: (usize, usize),
) -> bool {
    match report {
        Some(r) => expect(notes, r.offsets() == Some(offsets), || {
            format!("expected poisoned bytes {offsets:?}, got {:?}", r.offsets())
        }),
        None => expect(notes, false, || "expected a report, got none".to_string()),
    }
}

fn fresh_allocation(engine: &Sanitizer, notes: &mut Vec<String>) -> bool {
    engine.alloc_pages(0, 0, AllocFlags::ZERO);
    let obj = engine.page_addr(0) + 40;
    engine.on_object_alloc(obj, 8, AllocFlags::empty());
    let stored = engine
        .locate(obj, 8, MetaKind::Origin)
        .map(|span| span.origin(0))
        .unwrap_or_default();

    let report = engine.check(obj, 8, ReportReason::UninitValue);
    let mut ok = expect_report(notes, report.as_ref(), (0, 7));
    if let Some(r) = &report {
        ok &= expect(notes, stored.is_some() && r.origin == stored, || {
            format!("report origin {:?} differs from stored {stored:?}", r.origin)
        });
        ok &= expect(
            notes,
            matches!(r.chain.last(), Some(ChainLink::CreatedAt { .. })),
            || "chain does not end at the allocation".to_string(),
        );
    }
    ok
}

fn zeroed_allocation(engine: &Sanitizer, notes: &mut Vec<String>) -> bool {
    engine.alloc_pages(1, 0, AllocFlags::ZERO);
    let obj = engine.page_addr(1) + 8;
    engine.on_object_alloc(obj, 8, AllocFlags::ZERO);
    let report = engine.check(obj, 8, ReportReason::UninitValue);
    expect(notes, report.is_none(), || {
        "zeroed object reported as uninitialized".to_string()
    })
}

fn partial_poison(engine: &Sanitizer, notes: &mut Vec<String>) -> bool {
    engine.alloc_pages(2, 0, AllocFlags::ZERO);
    let region = engine.page_addr(2) + 64;
    engine.poison(region + 4, 4);
    let poisoned = engine
        .locate(region + 4, 4, MetaKind::Origin)
        .map(|span| span.origin(0))
        .unwrap_or_default();

    let report = engine.check(region, 16, ReportReason::UninitValue);
    let mut ok = expect_report(notes, report.as_ref(), (4, 7));
    if let Some(r) = &report {
        ok &= expect(notes, r.origin == poisoned, || {
            format!("report origin {:?} differs from poison {poisoned:?}", r.origin)
        });
    }
    ok
}

fn zeroed_reallocation(engine: &Sanitizer, notes: &mut Vec<String>) -> bool {
    engine.alloc_pages(8, 2, AllocFlags::empty());
    let mut ok = expect(
        notes,
        engine
            .check(engine.page_addr(8), 16, ReportReason::UninitValue)
            .is_some(),
        || "non-zeroed pages read as initialized".to_string(),
    );
    engine.free_pages(8, 2);
    engine.alloc_pages(8, 2, AllocFlags::ZERO);
    for pfn in 8..12 {
        let report = engine.check(engine.page_addr(pfn), 4096, ReportReason::UninitValue);
        ok &= expect(notes, report.is_none(), || {
            format!("stale poison on page {pfn} after zeroed reallocation")
        });
    }
    ok
}
