//! Propagation and provenance.
//!
//! Every operation here is an instrumentation hook: it is skipped before the
//! engine is ready, for disabled tasks, and when the current core is already
//! inside the runtime.

use std::collections::HashMap;
use std::panic::Location;

use crate::config::{ORIGIN_SIZE, PAGE_SIZE};
use crate::context::with_context;
use crate::depot::OriginHandle;
use crate::engine::Sanitizer;
use crate::error::InvariantViolation;
use crate::lifecycle::AllocFlags;
use crate::locator::{Resolved, page_chunks};
use crate::meta::{MetaPage, POISONED};
use crate::metrics::EngineMetrics;
use crate::origin::{self, ChainOutcome, LinkSite, OriginCause, OriginRecord};
use crate::report::{Report, ReportReason};

/// Poisoned bytes seen so far in one metadata region of a checked access.
#[derive(Default)]
struct PoisonRun {
    first: Option<(usize, OriginHandle)>,
    last: usize,
}

impl PoisonRun {
    fn note(&mut self, at: usize, origin: impl FnOnce() -> OriginHandle) {
        if self.first.is_none() {
            self.first = Some((at, origin()));
        }
        self.last = at;
    }

    /// `(first, last, origin)` of the run, resetting it.
    fn take(&mut self) -> Option<(usize, usize, OriginHandle)> {
        let (first, origin) = self.first.take()?;
        Some((first, self.last, origin))
    }
}

/// Largest inline asm store taken at face value; bigger ones are assumed to
/// be a single word.
const ASM_STORE_MAX: usize = 32;
const ASM_STORE_FALLBACK: usize = 8;

#[track_caller]
fn caller_location() -> String {
    let loc = Location::caller();
    format!("{}:{}", loc.file(), loc.line())
}

impl Sanitizer {
    fn check_span(&self, addr: u64, size: usize) {
        if addr.checked_add(size as u64).is_none() {
            self.fatal(InvariantViolation::AddressOverflow { start: addr, len: size });
        }
    }

    /// Write `shadow` over `[addr, addr + size)` and, if given, `origin` over
    /// every origin group it touches.
    fn set_meta(&self, addr: u64, size: usize, shadow: u8, origin: Option<OriginHandle>) {
        self.check_span(addr, size);
        for (chunk, _, len) in page_chunks(addr, size) {
            let span = self.chunk_span(chunk, true);
            span.fill_shadow(len, shadow);
            if let Some(h) = origin {
                span.fill_origin(len, h);
            }
        }
    }

    /// Mark `[addr, addr + size)` uninitialized, with the current stack as origin.
    pub fn poison(&self, addr: u64, size: usize) {
        let Some(_guard) = self.enter_hook() else {
            return;
        };
        let origin = self.save_stack(OriginCause::Poison);
        self.set_meta(addr, size, POISONED, Some(origin));
        EngineMetrics::inc(&self.metrics.poisons);
    }

    /// Mark `[addr, addr + size)` initialized. Origins are left alone.
    pub fn unpoison(&self, addr: u64, size: usize) {
        let Some(_guard) = self.enter_hook() else {
            return;
        };
        self.set_meta(addr, size, 0, None);
        EngineMetrics::inc(&self.metrics.unpoisons);
    }

    /// Report if any byte of `[addr, addr + size)` is poisoned. The report
    /// location is the caller.
    #[track_caller]
    pub fn check(&self, addr: u64, size: usize, reason: ReportReason) -> Option<Report> {
        self.check_at(addr, size, reason, caller_location(), None)
    }

    /// [`Self::check`] with an explicit location. Bytes without metadata
    /// count as initialized. Poisoned bytes are merged into one report per
    /// run of contiguous metadata, carrying the origin of that run's first
    /// poisoned byte; an access crossing into separate storage gets one
    /// report per region. Returns the first report.
    pub fn check_at(
        &self,
        addr: u64,
        size: usize,
        reason: ReportReason,
        location: String,
        user_addr: Option<u64>,
    ) -> Option<Report> {
        let _guard = self.enter_hook()?;
        self.check_span(addr, size);
        EngineMetrics::inc(&self.metrics.checks);

        let mut reports = Vec::new();
        let mut run = PoisonRun::default();
        let mut prev: Option<MetaPage> = None;
        for (chunk, off, len) in page_chunks(addr, size) {
            let Resolved::Meta(span) = self.resolve(chunk) else {
                prev = None;
                if let Some(r) = run.take() {
                    reports.push(r);
                }
                continue;
            };
            let page = MetaPage::new(span.block.clone(), span.offset / PAGE_SIZE);
            if !prev.as_ref().is_some_and(|p| p.is_followed_by(&page))
                && let Some(r) = run.take()
            {
                reports.push(r);
            }
            prev = Some(page);
            for i in 0..len {
                if span.shadow(i) != 0 {
                    run.note(off + i, || span.origin(i));
                }
            }
        }
        if let Some(r) = run.take() {
            reports.push(r);
        }

        let mut first_report = None;
        for (first, last, origin) in reports {
            let report = self.raise(
                reason,
                location.clone(),
                origin,
                Some(addr),
                size,
                Some((first, last)),
                user_addr,
            );
            first_report.get_or_insert(report);
        }
        first_report
    }

    /// Extend the chain of `prev` with the current stack as the store site.
    fn chain(&self, prev: OriginHandle) -> OriginHandle {
        if prev.is_none() {
            return prev;
        }
        let stored_at = self.save_stack(OriginCause::Store);
        if stored_at.is_none() {
            return prev;
        }
        self.record_chain(origin::chain_origin(
            self.depot.as_ref(),
            prev,
            LinkSite::Stack(stored_at),
        ))
    }

    fn record_chain(&self, outcome: ChainOutcome) -> OriginHandle {
        match outcome {
            ChainOutcome::Linked(_) => EngineMetrics::inc(&self.metrics.chains_created),
            ChainOutcome::Summarized(_) => EngineMetrics::inc(&self.metrics.chains_summarized),
            ChainOutcome::Unchanged(_) => {}
        }
        outcome.handle()
    }

    /// New origin recording that `prev` was stored from the current stack.
    pub fn chain_origin(&self, prev: OriginHandle) -> OriginHandle {
        match self.enter_hook() {
            Some(_guard) => self.chain(prev),
            None => prev,
        }
    }

    /// New origin recording that `prev` was stored by the instruction at `pc`.
    pub fn chain_origin_at(&self, prev: OriginHandle, pc: u64) -> OriginHandle {
        let Some(_guard) = self.enter_hook() else {
            return prev;
        };
        if prev.is_none() {
            return prev;
        }
        self.record_chain(origin::chain_origin(
            self.depot.as_ref(),
            prev,
            LinkSite::Frame(pc),
        ))
    }

    /// Copy metadata for `n` bytes from `src` to `dst`. Overlap is handled:
    /// the source is read in full before the destination is written.
    ///
    /// Shadow is copied byte for byte. Each destination origin group takes
    /// the chained origin of the first poisoned byte copied into it. A group
    /// that receives only clean bytes is cleared if fully overwritten and
    /// left alone otherwise, so a partial copy never hides the origin of
    /// bytes it did not touch.
    fn move_meta(&self, dst: u64, src: u64, n: usize) {
        if n == 0 || dst == src {
            return;
        }
        self.check_span(dst, n);
        self.check_span(src, n);

        let mut shadow = Vec::with_capacity(n);
        let mut origins = Vec::with_capacity(n);
        for (chunk, _, len) in page_chunks(src, n) {
            match self.resolve(chunk) {
                Resolved::Meta(span) => {
                    for i in 0..len {
                        shadow.push(span.shadow(i));
                        origins.push(span.origin(i));
                    }
                }
                _ => {
                    shadow.extend(std::iter::repeat_n(0, len));
                    origins.extend(std::iter::repeat_n(OriginHandle::NONE, len));
                }
            }
        }

        let group = ORIGIN_SIZE as u64;
        let mut chained: HashMap<OriginHandle, OriginHandle> = HashMap::new();
        for (chunk, off, len) in page_chunks(dst, n) {
            let span = self.chunk_span(chunk, true);
            for i in 0..len {
                span.set_shadow(i, shadow[off + i]);
            }
            let chunk_end = chunk + len as u64;
            let mut i = 0;
            while i < len {
                let at = chunk + i as u64;
                let group_start = at & !(group - 1);
                let run = ((group_start + group).min(chunk_end) - at) as usize;
                let covered = at == group_start && run == ORIGIN_SIZE;
                let poisoned = (off + i..off + i + run).find(|&j| shadow[j] != 0);
                match poisoned {
                    Some(j) => {
                        let prev = origins[j];
                        let h = *chained.entry(prev).or_insert_with(|| self.chain(prev));
                        span.set_origin(i, h);
                    }
                    None if covered => span.set_origin(i, OriginHandle::NONE),
                    None => {}
                }
                i += run;
            }
        }
    }

    /// Metadata side of `memcpy(dst, src, n)`.
    pub fn memcpy_meta(&self, dst: u64, src: u64, n: usize) {
        let Some(_guard) = self.enter_hook() else {
            return;
        };
        self.move_meta(dst, src, n);
    }

    /// Metadata side of `memmove(dst, src, n)`.
    pub fn memmove_meta(&self, dst: u64, src: u64, n: usize) {
        let Some(_guard) = self.enter_hook() else {
            return;
        };
        self.move_meta(dst, src, n);
    }

    /// Called after a bulk copy of `requested` bytes towards `dst` of which
    /// `remaining` were not copied. A destination below the untrusted
    /// boundary gets the transferred prefix checked; anything else gets the
    /// metadata copied.
    #[track_caller]
    pub fn copy_to_untrusted(
        &self,
        dst: u64,
        src: u64,
        requested: usize,
        remaining: usize,
    ) -> Option<Report> {
        self.copy_to_untrusted_at(dst, src, requested, remaining, caller_location())
    }

    /// [`Self::copy_to_untrusted`] with an explicit report location.
    pub fn copy_to_untrusted_at(
        &self,
        dst: u64,
        src: u64,
        requested: usize,
        remaining: usize,
        location: String,
    ) -> Option<Report> {
        if requested == 0 || remaining >= requested {
            return None;
        }
        let copied = requested - remaining;
        if dst < self.config.untrusted_limit {
            return self.check_at(
                src,
                copied,
                ReportReason::CopyToUntrusted,
                location,
                Some(dst),
            );
        }
        self.memcpy_meta(dst, src, copied);
        None
    }

    /// Data that arrived from the untrusted side is initialized.
    pub fn copy_from_untrusted(&self, dst: u64, requested: usize, remaining: usize) {
        if remaining < requested {
            self.unpoison(dst, requested - remaining);
        }
    }

    /// Check a buffer about to be handed to a peripheral.
    #[track_caller]
    pub fn check_peripheral_transfer(&self, addr: u64, size: usize) -> Option<Report> {
        self.check_at(
            addr,
            size,
            ReportReason::TransferToPeripheral,
            caller_location(),
            None,
        )
    }

    /// Slab object allocated.
    pub fn on_object_alloc(&self, addr: u64, size: usize, flags: AllocFlags) {
        let Some(_guard) = self.enter_hook() else {
            return;
        };
        if flags.contains(AllocFlags::ZERO) {
            self.set_meta(addr, size, 0, None);
        } else {
            let origin = self.save_stack(OriginCause::Allocation);
            self.set_meta(addr, size, POISONED, Some(origin));
        }
    }

    /// Slab object freed: poisoned with an after-free origin.
    pub fn on_object_free(&self, addr: u64, size: usize) {
        let Some(_guard) = self.enter_hook() else {
            return;
        };
        let origin = self.save_stack(OriginCause::ObjectFree);
        let origin = if origin.is_some() {
            origin.with_extra(OriginHandle::EXTRA_AFTER_FREE)
        } else {
            origin
        };
        self.set_meta(addr, size, POISONED, Some(origin));
    }

    /// Large allocation served directly by the page allocator.
    pub fn on_large_alloc(&self, addr: u64, size: usize, flags: AllocFlags) {
        self.on_object_alloc(addr, size, flags);
    }

    pub fn on_large_free(&self, addr: u64, size: usize) {
        self.on_object_free(addr, size);
    }

    /// Poison a fresh stack variable described by `descr`, declared at `pc`.
    pub fn poison_alloca(&self, addr: u64, size: usize, descr: &str, pc: u64) {
        let Some(_guard) = self.enter_hook() else {
            return;
        };
        let caller = with_context(|ctx| ctx.stack_frames(None).first().copied().unwrap_or(0));
        let origin = self.store_record(&OriginRecord::Alloca {
            descr: descr.to_string(),
            pc1: pc,
            pc2: caller,
        });
        self.set_meta(addr, size, POISONED, Some(origin));
        EngineMetrics::inc(&self.metrics.poisons);
    }

    pub fn unpoison_alloca(&self, addr: u64, size: usize) {
        self.unpoison(addr, size);
    }

    /// Inline asm reads memory.
    #[track_caller]
    pub fn asm_load(&self, addr: u64, size: usize) -> Option<Report> {
        self.asm_load_at(addr, size, caller_location())
    }

    pub fn asm_load_at(&self, addr: u64, size: usize, location: String) -> Option<Report> {
        self.check_at(addr, size, ReportReason::UninitValue, location, None)
    }

    /// Inline asm writes memory; the written bytes become initialized.
    pub fn asm_store(&self, addr: u64, size: usize) {
        let size = if size > ASM_STORE_MAX {
            ASM_STORE_FALLBACK
        } else {
            size
        };
        self.unpoison(addr, size);
    }

    /// An uninitialized register value with provenance `origin` was used.
    #[track_caller]
    pub fn warning(&self, origin: OriginHandle) -> Option<Report> {
        self.warning_at(origin, caller_location())
    }

    pub fn warning_at(&self, origin: OriginHandle, location: String) -> Option<Report> {
        let _guard = self.enter_hook()?;
        Some(self.raise(
            ReportReason::UninitValue,
            location,
            origin,
            None,
            0,
            None,
            None,
        ))
    }

    /// Registers saved to memory on exception entry are initialized.
    pub fn unpoison_registers(&self, addr: u64, size: usize) {
        self.unpoison(addr, size);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{EngineConfig, PAGE_SIZE};
    use crate::report::{ChainLink, MemorySink};

    fn engine() -> (Sanitizer, Arc<MemorySink>) {
        let s = Sanitizer::new(
            EngineConfig::default()
                .with_direct_map(0x10_0000_0000, 32)
                .with_report_policy(crate::config::ReportPolicy::Continue)
                .with_dedupe(false),
        )
        .unwrap();
        s.initialize();
        let sink = Arc::new(MemorySink::new());
        s.add_sink(sink.clone());
        (s, sink)
    }

    #[test]
    fn poison_then_check_reports_whole_range() {
        let (s, sink) = engine();
        s.alloc_pages(0, 0, AllocFlags::ZERO);
        let a = s.page_addr(0) + 32;
        s.poison(a, 10);
        let r = s.check(a, 10, ReportReason::UninitValue).unwrap();
        assert_eq!(r.offsets(), Some((0, 9)));
        assert!(r.location.contains("propagate.rs"));
        assert_eq!(sink.len(), 1);
        s.unpoison(a, 10);
        assert!(s.check(a, 10, ReportReason::UninitValue).is_none());
    }

    #[test]
    fn check_merges_within_one_block() {
        let (s, sink) = engine();
        s.alloc_pages(2, 1, AllocFlags::ZERO);
        let boundary = s.page_addr(3);
        s.poison(boundary - 3, 1);
        s.poison(boundary + 5, 2);
        let r = s.check(boundary - 8, 16, ReportReason::UninitValue).unwrap();
        assert_eq!(r.offsets(), Some((5, 14)));
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn check_reports_each_region_separately() {
        let (s, sink) = engine();
        s.alloc_pages(4, 0, AllocFlags::ZERO);
        s.alloc_pages(5, 0, AllocFlags::ZERO);
        let b = s.page_addr(5);
        s.func_entry(0x1000);
        s.poison(b - 2, 2);
        s.func_exit();
        s.func_entry(0x2000);
        s.poison(b, 2);
        s.func_exit();
        let left = s.locate(b - 2, 1, crate::locator::MetaKind::Origin).unwrap().origin(0);
        let right = s.locate(b, 1, crate::locator::MetaKind::Origin).unwrap().origin(0);
        assert_ne!(left, right);

        let r = s.check(b - 16, 32, ReportReason::UninitValue).unwrap();
        assert_eq!(r.offsets(), Some((14, 15)));
        let reports = sink.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].offsets(), Some((14, 15)));
        assert_eq!(reports[0].origin, left);
        assert_eq!(reports[1].offsets(), Some((16, 17)));
        assert_eq!(reports[1].origin, right);
    }

    #[test]
    fn check_splits_at_untracked_gap() {
        let (s, sink) = engine();
        s.alloc_pages(10, 0, AllocFlags::ZERO);
        s.alloc_pages(12, 0, AllocFlags::ZERO);
        s.poison(s.page_addr(11) - 1, 1);
        s.poison(s.page_addr(12), 1);
        let start = s.page_addr(11) - 4;
        assert!(s.check(start, PAGE_SIZE + 8, ReportReason::UninitValue).is_some());
        let offsets: Vec<_> = sink.reports().iter().map(Report::offsets).collect();
        assert_eq!(offsets, vec![Some((3, 3)), Some((PAGE_SIZE + 4, PAGE_SIZE + 4))]);
    }

    #[test]
    fn untracked_memory_reads_clean() {
        let (s, sink) = engine();
        s.poison(s.page_addr(9), 8);
        assert!(s.check(s.page_addr(9), 8, ReportReason::UninitValue).is_none());
        assert!(sink.is_empty());
    }

    #[test]
    fn copy_chains_and_keeps_offsets() {
        let (s, _) = engine();
        s.alloc_pages(0, 0, AllocFlags::ZERO);
        let src = s.page_addr(0);
        let dst = src + 256;
        s.poison(src + 4, 4);
        let src_origin = s.locate(src + 4, 4, crate::locator::MetaKind::Origin).unwrap().origin(0);
        s.memcpy_meta(dst, src, 16);
        let r = s.check(dst, 16, ReportReason::UninitValue).unwrap();
        assert_eq!(r.offsets(), Some((4, 7)));
        assert_ne!(r.origin, src_origin);
        assert!(matches!(r.chain[0], ChainLink::StoredAt { .. }));
        assert!(matches!(r.chain.last(), Some(ChainLink::CreatedAt { .. })));
        assert_eq!(EngineMetrics::get(&s.metrics().chains_created), 1);
    }

    #[test]
    fn partial_group_copy_keeps_foreign_origin() {
        let (s, _) = engine();
        s.alloc_pages(0, 0, AllocFlags::ZERO);
        let base = s.page_addr(0);
        // Destination group [64, 68): byte 64 poisoned, bytes 66..68 get clean data.
        s.poison(base + 64, 1);
        let before = s.locate(base + 64, 1, crate::locator::MetaKind::Origin).unwrap().origin(0);
        s.memcpy_meta(base + 66, base + 128, 2);
        let after = s.locate(base + 64, 1, crate::locator::MetaKind::Origin).unwrap().origin(0);
        assert_eq!(before, after);
        // A fully overwritten clean group is cleared.
        s.poison(base + 72, 4);
        s.memcpy_meta(base + 72, base + 128, 4);
        let cleared = s.locate(base + 72, 4, crate::locator::MetaKind::Origin).unwrap().origin(0);
        assert!(cleared.is_none());
    }

    #[test]
    fn overlapping_move() {
        let (s, _) = engine();
        s.alloc_pages(0, 0, AllocFlags::ZERO);
        let base = s.page_addr(0);
        s.poison(base, 4);
        s.memmove_meta(base + 2, base, 8);
        let r = s.check(base, 16, ReportReason::UninitValue).unwrap();
        assert_eq!(r.offsets(), Some((0, 5)));
    }

    #[test]
    fn copy_to_untrusted_checks_transferred_prefix() {
        let (s, _) = engine();
        s.alloc_pages(0, 0, AllocFlags::ZERO);
        let src = s.page_addr(0);
        s.poison(src + 12, 4);
        assert!(s.copy_to_untrusted(0x1000, src, 16, 16).is_none());
        assert!(s.copy_to_untrusted(0x1000, src, 16, 4).is_none());
        let r = s.copy_to_untrusted(0x1000, src, 16, 0).unwrap();
        assert_eq!(r.reason, ReportReason::CopyToUntrusted);
        assert_eq!(r.offsets(), Some((12, 15)));
        assert_eq!(r.user_addr, Some(0x1000));
        assert!(r.to_string().contains("kernel-infoleak"));
    }

    #[test]
    fn copy_to_trusted_destination_moves_metadata() {
        let (s, _) = engine();
        s.alloc_pages(0, 0, AllocFlags::ZERO);
        let src = s.page_addr(0);
        s.poison(src, 2);
        assert!(s.copy_to_untrusted(src + 512, src, 8, 0).is_none());
        let r = s.check(src + 512, 8, ReportReason::UninitValue).unwrap();
        assert_eq!(r.offsets(), Some((0, 1)));
    }

    #[test]
    fn copy_from_untrusted_unpoisons_prefix() {
        let (s, _) = engine();
        s.alloc_pages(0, 0, AllocFlags::empty());
        let dst = s.page_addr(0);
        s.copy_from_untrusted(dst, 8, 2);
        let r = s.check(dst, 8, ReportReason::UninitValue).unwrap();
        assert_eq!(r.offsets(), Some((6, 7)));
    }

    #[test]
    fn object_free_reports_use_after_free() {
        let (s, _) = engine();
        s.alloc_pages(1, 0, AllocFlags::ZERO);
        let obj = s.page_addr(1) + 64;
        s.on_object_alloc(obj, 32, AllocFlags::ZERO);
        assert!(s.check(obj, 32, ReportReason::UninitValue).is_none());
        s.on_object_free(obj, 32);
        let r = s.check(obj + 8, 4, ReportReason::UninitValue).unwrap();
        assert_eq!(r.reason, ReportReason::UseAfterFree);
        assert!(r.origin.is_after_free());
        s.on_large_alloc(obj, 32, AllocFlags::empty());
        let r = s.check(obj, 4, ReportReason::UninitValue).unwrap();
        assert_eq!(r.reason, ReportReason::UninitValue);
    }

    #[test]
    fn alloca_names_the_variable() {
        let (s, _) = engine();
        let frame = s.config().cpu_window_base;
        s.func_entry(0xffff_ffff_8123_0000);
        s.poison_alloca(frame, 16, "buf", 0xffff_ffff_8123_0040);
        s.func_exit();
        let r = s.check(frame, 16, ReportReason::UninitValue).unwrap();
        assert_eq!(
            r.chain,
            vec![ChainLink::LocalVariable {
                descr: "buf".to_string(),
                frames: vec![0xffff_ffff_8123_0040, 0xffff_ffff_8123_0000],
            }]
        );
        assert!(r.to_string().contains("Local variable buf created at:"));
        s.unpoison_alloca(frame, 16);
        assert!(s.check(frame, 16, ReportReason::UninitValue).is_none());
    }

    #[test]
    fn asm_store_clamps_large_sizes() {
        let (s, _) = engine();
        s.alloc_pages(0, 0, AllocFlags::empty());
        let a = s.page_addr(0);
        s.asm_store(a, 64);
        let r = s.asm_load(a, 16).unwrap();
        assert_eq!(r.offsets(), Some((8, 15)));
        s.asm_store(a, 16);
        assert!(s.asm_load(a, 16).is_none());
    }

    #[test]
    fn warning_has_no_offsets() {
        let (s, sink) = engine();
        let origin = s.save_stack(OriginCause::Poison);
        let r = s.warning(origin).unwrap();
        assert_eq!(r.addr, None);
        assert_eq!(r.offsets(), None);
        assert!(!r.to_string().contains("Memory access"));
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn peripheral_transfer_reason() {
        let (s, _) = engine();
        s.alloc_pages(0, 0, AllocFlags::empty());
        let r = s.check_peripheral_transfer(s.page_addr(0), 4).unwrap();
        assert!(r.to_string().starts_with("BUG: MEMSAN: peripheral-infoleak in"));
    }

    #[test]
    fn hooks_inside_runtime_are_skipped() {
        let (s, _) = engine();
        s.alloc_pages(0, 0, AllocFlags::ZERO);
        let a = s.page_addr(0);
        {
            let _g = crate::guard::RuntimeGuard::enter();
            s.poison(a, 4);
            assert!(s.check(a, 4, ReportReason::UninitValue).is_none());
        }
        assert!(s.check(a, 4, ReportReason::UninitValue).is_none());
    }

    #[test]
    fn registers_and_large_copies() {
        let (s, _) = engine();
        s.alloc_pages(4, 2, AllocFlags::empty());
        let a = s.page_addr(4);
        s.unpoison_registers(a, 2 * PAGE_SIZE);
        let r = s.check(a, 3 * PAGE_SIZE, ReportReason::UninitValue).unwrap();
        assert_eq!(r.offsets(), Some((2 * PAGE_SIZE, 3 * PAGE_SIZE - 1)));
    }

    #[test]
    #[should_panic(expected = "wraps the address space")]
    fn wrapping_range_is_fatal() {
        let (s, _) = engine();
        s.unpoison(u64::MAX - 2, 8);
    }
}
