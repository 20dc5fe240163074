use std::sync::Arc;

use memsan_engine::config::MAX_CHAIN_DEPTH;
use memsan_engine::error::fatal_hits;
use memsan_engine::locator::MetaKind;
use memsan_engine::report::{ChainLink, Report, ReportSink};
use memsan_engine::{
    AllocFlags, AllocStatus, EngineConfig, MemorySink, ReportPolicy, ReportReason, RuntimeGuard,
    Sanitizer,
};

const BASE: u64 = 0x20_0000_0000;

fn engine() -> (Sanitizer, Arc<MemorySink>) {
    let s = Sanitizer::new(
        EngineConfig::default()
            .with_direct_map(BASE, 128)
            .with_report_policy(ReportPolicy::Continue)
            .with_dedupe(false),
    )
    .expect("valid config");
    s.initialize();
    let sink = Arc::new(MemorySink::new());
    s.add_sink(sink.clone());
    (s, sink)
}

#[test]
fn scenario_a_fresh_allocation_is_poisoned() {
    let (s, sink) = engine();
    assert_eq!(s.alloc_pages(0, 0, AllocFlags::ZERO), AllocStatus::Tracked);
    let obj = s.page_addr(0) + 40;
    s.on_object_alloc(obj, 8, AllocFlags::empty());

    let shadow = s.locate(obj, 8, MetaKind::Shadow).expect("tracked");
    assert!((0..8).all(|i| shadow.shadow(i) == 0xff));
    let origin = s.locate(obj, 8, MetaKind::Origin).expect("tracked");
    assert!(origin.origin(0).is_some());
    assert_eq!(origin.origin(0), origin.origin(4));

    let report = s.check(obj, 8, ReportReason::UninitValue).expect("report");
    assert_eq!(report.offsets(), Some((0, 7)));
    assert_eq!(report.origin, origin.origin(0));
    assert_eq!(sink.len(), 1);
}

#[test]
fn scenario_a_page_allocation_is_poisoned() {
    let (s, _) = engine();
    s.alloc_pages(3, 0, AllocFlags::empty());
    let report = s
        .check(s.page_addr(3), 8, ReportReason::UninitValue)
        .expect("report");
    assert_eq!(report.offsets(), Some((0, 7)));
    assert!(matches!(
        report.chain.as_slice(),
        [ChainLink::CreatedAt { .. }]
    ));
}

#[test]
fn scenario_b_zeroed_allocation_is_clean() {
    let (s, sink) = engine();
    s.alloc_pages(1, 0, AllocFlags::ZERO);
    let obj = s.page_addr(1) + 8;
    s.on_object_alloc(obj, 8, AllocFlags::ZERO);
    assert!(s.check(obj, 8, ReportReason::UninitValue).is_none());
    assert!(sink.is_empty());
}

#[test]
fn scenario_c_partial_poison_reports_its_own_origin() {
    let (s, _) = engine();
    s.alloc_pages(2, 0, AllocFlags::ZERO);
    let region = s.page_addr(2) + 64;
    s.poison(region + 4, 4);
    let poison_origin = s
        .locate(region + 4, 4, MetaKind::Origin)
        .expect("tracked")
        .origin(0);

    let report = s.check(region, 16, ReportReason::UninitValue).expect("report");
    assert_eq!(report.offsets(), Some((4, 7)));
    assert_eq!(report.origin, poison_origin);
    let text = report.to_string();
    assert!(text.contains("Bytes 4-7 of 16 are uninitialized"), "{text}");
}

#[test]
fn scenario_d_zeroed_reallocation_has_no_stale_poison() {
    let (s, _) = engine();
    s.alloc_pages(8, 2, AllocFlags::empty());
    assert!(s.check(s.page_addr(8), 16, ReportReason::UninitValue).is_some());
    s.free_pages(8, 2);
    s.alloc_pages(8, 2, AllocFlags::ZERO);
    for pfn in 8..12 {
        assert!(
            s.check(s.page_addr(pfn), 4096, ReportReason::UninitValue).is_none(),
            "pfn={pfn}"
        );
    }
}

#[test]
fn unpoison_then_check_never_reports() {
    let (s, sink) = engine();
    s.alloc_pages(4, 1, AllocFlags::empty());
    let a = s.page_addr(4) + 4000;
    s.unpoison(a, 200);
    assert!(s.check(a, 200, ReportReason::UninitValue).is_none());
    assert!(sink.is_empty());
}

#[test]
fn chain_length_stays_bounded() {
    let (s, _) = engine();
    s.alloc_pages(16, 0, AllocFlags::ZERO);
    let a = s.page_addr(16);
    let b = a + 1024;
    s.poison(a, 8);

    let copies = 20usize;
    let (mut src, mut dst) = (a, b);
    for _ in 0..copies {
        s.memcpy_meta(dst, src, 8);
        std::mem::swap(&mut src, &mut dst);
    }
    let report = s.check(src, 8, ReportReason::UninitValue).expect("report");
    assert_eq!(report.offsets(), Some((0, 7)));
    assert_eq!(report.chain.len(), MAX_CHAIN_DEPTH as usize + 2);
    let stored = report
        .chain
        .iter()
        .filter(|l| matches!(l, ChainLink::StoredAt { .. }))
        .count();
    assert_eq!(stored, MAX_CHAIN_DEPTH as usize);
    let elided = copies as u32 - MAX_CHAIN_DEPTH;
    assert!(report.chain.contains(&ChainLink::Elided { count: elided }));
    assert!(matches!(
        report.chain.last(),
        Some(ChainLink::CreatedAt { .. })
    ));
    assert!(report.to_string().contains(&format!("{elided} older links elided")));
}

#[test]
fn nested_runtime_entry_is_fatal_once() {
    let before = fatal_hits();
    let result = std::panic::catch_unwind(|| {
        let _outer = RuntimeGuard::enter();
        let _inner = RuntimeGuard::enter();
    });
    assert!(result.is_err());
    assert_eq!(fatal_hits(), before + 1);
    assert!(RuntimeGuard::try_enter().is_some());
}

struct ReentrantSink {
    seen_in_runtime: parking_lot::Mutex<Vec<bool>>,
}

impl ReportSink for ReentrantSink {
    fn emit(&self, _report: &Report) {
        let blocked = RuntimeGuard::try_enter().is_none();
        self.seen_in_runtime.lock().push(blocked);
    }
}

#[test]
fn sinks_run_inside_the_runtime() {
    let (s, _) = engine();
    let sink = Arc::new(ReentrantSink {
        seen_in_runtime: parking_lot::Mutex::new(Vec::new()),
    });
    s.add_sink(sink.clone());
    s.alloc_pages(5, 0, AllocFlags::empty());
    s.check(s.page_addr(5), 4, ReportReason::UninitValue);
    assert_eq!(*sink.seen_in_runtime.lock(), vec![true]);
}

#[test]
fn interrupt_scratch_does_not_leak_into_task() {
    let (s, _) = engine();
    s.syscall_enter();
    s.with_context_state(|st| st.param[..8].fill(0xff));
    s.interrupt_enter();
    s.with_context_state(|st| {
        assert!(st.is_clear());
        st.retval[0] = 0xff;
    });
    s.nmi_enter();
    s.with_context_state(|st| assert!(st.is_clear()));
    s.nmi_exit();
    s.interrupt_exit();
    s.with_context_state(|st| {
        assert_eq!(st.param[..8], [0xff; 8]);
        assert_eq!(st.retval[0], 0);
    });
    s.syscall_exit();
}

#[test]
#[should_panic(expected = "execution context stack overflow")]
fn context_stack_is_bounded() {
    let (s, _) = engine();
    for _ in 0..8 {
        s.exception_enter();
    }
}

#[test]
fn dedupe_suppresses_repeat_locations() {
    let s = Sanitizer::new(
        EngineConfig::default()
            .with_direct_map(BASE, 8)
            .with_report_policy(ReportPolicy::Continue),
    )
    .expect("config");
    s.initialize();
    let sink = Arc::new(MemorySink::new());
    s.add_sink(sink.clone());
    s.alloc_pages(0, 0, AllocFlags::empty());
    for _ in 0..3 {
        // Same call site every iteration.
        assert!(s.check(s.page_addr(0), 4, ReportReason::UninitValue).is_some());
    }
    assert_eq!(sink.len(), 1);
    let snap = s.metrics().snapshot();
    assert_eq!(snap.reports_emitted, 1);
    assert_eq!(snap.reports_suppressed, 2);
}

#[test]
fn engines_are_shared_across_cores() {
    let (s, _) = engine();
    let s = Arc::new(s);
    let handles: Vec<_> = (0..4)
        .map(|cpu| {
            let s = Arc::clone(&s);
            std::thread::spawn(move || {
                s.bind_cpu(cpu);
                let pfn = 32 + cpu * 4;
                s.alloc_pages(pfn, 2, AllocFlags::ZERO);
                let a = s.page_addr(pfn) + 100;
                s.poison(a, 3);
                let r = s.check(a, 8, ReportReason::UninitValue);
                s.free_pages(pfn, 2);
                r.and_then(|r| r.offsets())
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().expect("thread"), Some((0, 2)));
    }
    assert_eq!(s.meta_pages_in_use(), 0);
}
