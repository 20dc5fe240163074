//! Host allocator and boot hooks.

use std::ffi::c_int;

use memsan_engine::{AllocFlags, AllocStatus, EngineConfig};

use crate::engine_state::{self, InstallError};
use crate::macros::hook_fn;

/// `memsan_alloc_pages` result codes.
pub const MEMSAN_ALLOC_TRACKED: c_int = 0;
pub const MEMSAN_ALLOC_UNTRACKED: c_int = 1;
pub const MEMSAN_ALLOC_DEGRADED: c_int = 2;

/// Build the process-wide engine over a direct map of `pages` pages at
/// `base`. Returns 0, `-EALREADY` if an engine exists, or `-EINVAL` for a
/// rejected layout. Reports go to stderr.
#[unsafe(no_mangle)]
pub extern "C" fn memsan_init(base: u64, pages: usize) -> c_int {
    let mut config = EngineConfig::default().with_direct_map(base, pages);
    config.stderr_reports = true;
    match engine_state::install(config) {
        Ok(_) => 0,
        Err(InstallError::AlreadyInstalled) => -libc::EALREADY,
        Err(InstallError::Config(_)) => -libc::EINVAL,
    }
}

hook_fn! {
    /// Register a boot-time range to receive clean metadata at start.
    fn memsan_record_future_range(start: u64, end: u64) -> c_int [passthrough = -libc::ENODEV] |engine| {
        match engine.record_future_range(start, end) {
            Ok(()) => 0,
            Err(memsan_engine::config::ConfigError::TooManyFutureRanges { .. }) => -libc::ENOSPC,
            Err(_) => -libc::EINVAL,
        }
    }
}

hook_fn! {
    /// Set up boot ranges and start tracking.
    fn memsan_start() -> c_int [passthrough = -libc::ENODEV] |engine| {
        engine.initialize();
        0
    }
}

hook_fn! {
    fn memsan_alloc_pages(pfn: usize, order: u32, flags: u32) -> c_int [passthrough = MEMSAN_ALLOC_UNTRACKED] |engine| {
        match engine.alloc_pages(pfn, order, AllocFlags::from_bits_truncate(flags)) {
            AllocStatus::Tracked => MEMSAN_ALLOC_TRACKED,
            AllocStatus::Untracked => MEMSAN_ALLOC_UNTRACKED,
            AllocStatus::Degraded => MEMSAN_ALLOC_DEGRADED,
        }
    }
}

hook_fn! {
    fn memsan_free_pages(pfn: usize, order: u32) |engine| {
        engine.free_pages(pfn, order);
    }
}

hook_fn! {
    fn memsan_split_pages(pfn: usize, order: u32) |engine| {
        engine.split_pages(pfn, order);
    }
}

hook_fn! {
    fn memsan_copy_page_meta(dst_pfn: usize, src_pfn: usize) |engine| {
        engine.copy_page_meta(dst_pfn, src_pfn);
    }
}

hook_fn! {
    fn memsan_ignore_pages(pfn: usize, order: u32) |engine| {
        engine.ignore_pages(pfn, order);
    }
}

hook_fn! {
    fn memsan_clear_page(addr: u64) |engine| {
        engine.clear_page(addr);
    }
}

hook_fn! {
    /// Returns the number of pages that received metadata.
    fn memsan_map_range(start: u64, end: u64) -> usize [passthrough = 0] |engine| {
        engine.map_range(start, end)
    }
}

hook_fn! {
    /// Returns the number of metadata pages reclaimed.
    fn memsan_unmap_range(start: u64, end: u64) -> usize [passthrough = 0] |engine| {
        engine.unmap_range(start, end)
    }
}

/// Map the metadata of `count` direct-map pages listed at `pfns` behind the
/// virtual range starting at `start`.
///
/// # Safety
///
/// `pfns` must be null or point to `count` readable `usize` values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memsan_vmap_pages(start: u64, pfns: *const usize, count: usize) {
    let Some(engine) = engine_state::engine() else {
        return;
    };
    if pfns.is_null() || count == 0 {
        return;
    }
    // SAFETY: caller contract above.
    let pfns = unsafe { std::slice::from_raw_parts(pfns, count) };
    engine.vmap_pages(start, pfns);
}

hook_fn! {
    fn memsan_vunmap_range(start: u64, end: u64) |engine| {
        engine.vunmap_range(start, end);
    }
}
