//! Metadata lifecycle manager.
//!
//! Allocates and releases shadow+origin storage in lockstep with the host's
//! page allocator and virtual mappings. A page either has both halves of its
//! metadata or neither; running out of metadata degrades the page to
//! untracked instead of failing the host.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, MAX_FUTURE_RANGES, PAGE_SIZE};
use crate::engine::Sanitizer;
use crate::error::InvariantViolation;
use crate::guard::RuntimeGuard;
use crate::locator::{PageSlot, PageTrack, Region, VirtualSlot};
use crate::log::{EventRecord, LogLevel};
use crate::meta::{BlockKind, MetaInit, MetaPage};
use crate::metrics::EngineMetrics;
use crate::origin::OriginCause;

const PAGE: u64 = PAGE_SIZE as u64;

bitflags! {
    /// Host allocation flags relevant to metadata.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocFlags: u32 {
        /// Memory is zero-filled by the host.
        const ZERO = 1 << 0;
        /// Do not track these pages at all.
        const NO_SHADOW = 1 << 1;
    }
}

/// Result of [`Sanitizer::alloc_pages`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocStatus {
    Tracked,
    /// Deliberately untracked: `NO_SHADOW`, or allocated from inside the runtime.
    Untracked,
    /// Metadata could not be allocated; the pages read as clean.
    Degraded,
}

impl Sanitizer {
    /// Allocate metadata for `2^order` pages starting at `pfn`.
    pub fn alloc_pages(&self, pfn: usize, order: u32, flags: AllocFlags) -> AllocStatus {
        let pages = 1usize << order;
        self.check_pages(pfn, pages);
        for i in 0..pages {
            if self.space.slot(pfn + i).read().allocated {
                self.fatal(InvariantViolation::DoubleAlloc { pfn: pfn + i });
            }
        }
        EngineMetrics::inc(&self.metrics.allocs);

        let guard = RuntimeGuard::try_enter();
        if guard.is_none() || flags.contains(AllocFlags::NO_SHADOW) {
            self.set_pages(pfn, pages, |_| PageSlot {
                allocated: true,
                track: PageTrack::Untracked,
            });
            EngineMetrics::inc(&self.metrics.untracked_allocs);
            return AllocStatus::Untracked;
        }

        let init = if flags.contains(AllocFlags::ZERO) || !self.is_ready() {
            MetaInit::Clean
        } else {
            MetaInit::Poisoned(self.save_stack(OriginCause::Allocation))
        };
        match self.pool.allocate(BlockKind::Page, pages, init) {
            Ok(block) => {
                self.set_pages(pfn, pages, |i| PageSlot {
                    allocated: true,
                    track: PageTrack::Tracked(MetaPage::new(block.clone(), i)),
                });
                AllocStatus::Tracked
            }
            Err(e) => {
                self.set_pages(pfn, pages, |_| PageSlot {
                    allocated: true,
                    track: PageTrack::Untracked,
                });
                EngineMetrics::inc(&self.metrics.degraded_allocs);
                self.events.record(
                    EventRecord::new(LogLevel::Warn, "metadata_alloc_failed")
                        .with_pfn(pfn)
                        .with_size(pages * PAGE_SIZE)
                        .with_details(serde_json::json!({ "error": e.to_string(), "order": order })),
                );
                AllocStatus::Degraded
            }
        }
    }

    fn set_pages(&self, pfn: usize, pages: usize, mut slot: impl FnMut(usize) -> PageSlot) {
        for i in 0..pages {
            *self.space.slot(pfn + i).write() = slot(i);
        }
    }

    /// Number of pages in `[pfn, pfn + pages)` that carry metadata storage.
    fn storage_count(&self, pfn: usize, pages: usize) -> usize {
        (0..pages)
            .filter(|i| self.space.slot(pfn + i).read().track.storage().is_some())
            .count()
    }

    /// Release the metadata of `2^order` pages starting at `pfn`.
    pub fn free_pages(&self, pfn: usize, order: u32) {
        let pages = 1usize << order;
        self.check_pages(pfn, pages);
        let _guard = RuntimeGuard::try_enter();

        for i in 0..pages {
            if !self.space.slot(pfn + i).read().allocated {
                self.fatal(InvariantViolation::DoubleFree { pfn: pfn + i });
            }
        }
        let present = self.storage_count(pfn, pages);
        if present != 0 && present != pages {
            self.fatal(InvariantViolation::MixedMetadata {
                pfn,
                present,
                total: pages,
            });
        }

        if present == pages {
            let first = self.space.slot(pfn).read().track.storage().cloned();
            if let Some(first) = first
                && !first.block.is_split()
                && (first.index != 0 || first.block.pages() != pages)
            {
                self.fatal(InvariantViolation::OrderMismatch {
                    pfn,
                    order,
                    pages: first.block.pages(),
                });
            }
            for i in 0..pages {
                let page = self.space.slot(pfn + i).read().track.storage().cloned();
                if let Some(page) = page
                    && !page.block.release_page(page.index)
                {
                    self.fatal(InvariantViolation::MetadataDoubleFree { pfn: pfn + i });
                }
            }
            self.pool.free(pages);
        }

        self.set_pages(pfn, pages, |_| PageSlot::default());
        EngineMetrics::inc(&self.metrics.frees);
    }

    /// The host split a `2^order` allocation into single pages; each page's
    /// metadata becomes independently freeable.
    pub fn split_pages(&self, pfn: usize, order: u32) {
        let pages = 1usize << order;
        self.check_pages(pfn, pages);
        let present = self.storage_count(pfn, pages);
        if present != 0 && present != pages {
            self.fatal(InvariantViolation::MixedMetadata {
                pfn,
                present,
                total: pages,
            });
        }
        for i in 0..pages {
            if let Some(page) = self.space.slot(pfn + i).read().track.storage() {
                page.block.mark_split();
            }
        }
        EngineMetrics::inc(&self.metrics.splits);
    }

    /// Mirror a page copy from `src` to `dst` onto their metadata.
    pub fn copy_page_meta(&self, dst: usize, src: usize) {
        self.check_pages(dst, 1);
        self.check_pages(src, 1);
        let _guard = RuntimeGuard::try_enter();
        let src_track = self.space.slot(src).read().track.clone();
        let mut slot = self.space.slot(dst).write();
        match src_track {
            PageTrack::Untracked => {
                // The destination's storage would describe the wrong bytes.
                if let Some(page) = std::mem::take(&mut slot.track).into_storage()
                    && page.block.release_page(page.index)
                {
                    self.pool.free(1);
                }
            }
            PageTrack::Ignored(_) => {
                let storage = std::mem::take(&mut slot.track).into_storage();
                slot.track = PageTrack::Ignored(storage);
            }
            PageTrack::Tracked(from) => {
                if let Some(to) = slot.track.storage() {
                    to.block.copy_page_from(to.index, &from.block, from.index);
                }
            }
        }
        EngineMetrics::inc(&self.metrics.page_copies);
    }

    /// Zero the shadow and origin of the page at `addr`.
    pub fn clear_page(&self, addr: u64) {
        if addr % PAGE != 0 {
            self.fatal(InvariantViolation::UnalignedPage { addr });
        }
        match self.classify(addr) {
            Region::Direct { pfn, .. } => {
                if let Some(page) = self.space.slot(pfn).read().track.storage() {
                    page.clear();
                }
            }
            Region::Virtual { region } => {
                let key = self.config.virtual_regions[region].meta_addr(addr);
                if let Some(slot) = self.space.universe.read().get(&key) {
                    slot.page.clear();
                }
            }
            Region::CpuWindow { cpu, offset } => {
                self.space.cpu_windows[cpu].clear_page(offset / PAGE_SIZE);
            }
            Region::Unmapped => {}
        }
    }

    /// Exclude `2^order` pages from tracking. Storage is kept for the free.
    pub fn ignore_pages(&self, pfn: usize, order: u32) {
        let pages = 1usize << order;
        self.check_pages(pfn, pages);
        for i in 0..pages {
            let mut slot = self.space.slot(pfn + i).write();
            let storage = std::mem::take(&mut slot.track).into_storage();
            slot.track = PageTrack::Ignored(storage);
        }
    }

    /// Region index for a page-aligned `[start, end)` inside one virtual region.
    fn virtual_range(&self, start: u64, end: u64) -> usize {
        let region = self
            .config
            .virtual_regions
            .iter()
            .position(|r| r.contains(start) && end > start && end <= r.end);
        match region {
            Some(region) if start % PAGE == 0 && end % PAGE == 0 => region,
            _ => self.fatal(InvariantViolation::InvalidRange { start, end }),
        }
    }

    /// Allocate fresh, clean metadata behind a new virtual mapping. Returns
    /// the number of pages that got metadata; the rest stay untracked.
    pub fn map_range(&self, start: u64, end: u64) -> usize {
        let region = self.virtual_range(start, end);
        let _guard = RuntimeGuard::try_enter();
        let mut mapped = 0;
        let mut addr = start;
        while addr < end {
            let block = match self.pool.allocate(BlockKind::Virtual, 1, MetaInit::Clean) {
                Ok(block) => block,
                Err(e) => {
                    EngineMetrics::inc(&self.metrics.degraded_allocs);
                    self.events.record(
                        EventRecord::new(LogLevel::Warn, "metadata_map_failed")
                            .with_addr(addr)
                            .with_size((end - addr) as usize)
                            .with_details(serde_json::json!({ "error": e.to_string() })),
                    );
                    break;
                }
            };
            let key = self.config.virtual_regions[region].meta_addr(addr);
            let old = self.space.universe.write().insert(
                key,
                VirtualSlot {
                    page: MetaPage::new(block, 0),
                    owned: true,
                },
            );
            if let Some(old) = old {
                self.reclaim(old);
            }
            mapped += 1;
            addr += PAGE;
        }
        EngineMetrics::add(&self.metrics.ranges_mapped, mapped as u64);
        mapped
    }

    fn reclaim(&self, slot: VirtualSlot) -> bool {
        if slot.owned && slot.page.block.release_page(slot.page.index) {
            self.pool.free(1);
            return true;
        }
        false
    }

    /// Tear down the metadata mapping of `[start, end)`. Only pages that were
    /// actually backed with owned storage are reclaimed; returns their count.
    pub fn unmap_range(&self, start: u64, end: u64) -> usize {
        let region = self.virtual_range(start, end);
        let _guard = RuntimeGuard::try_enter();
        let mut reclaimed = 0;
        let mut addr = start;
        while addr < end {
            let key = self.config.virtual_regions[region].meta_addr(addr);
            let old = self.space.universe.write().remove(&key);
            if let Some(old) = old
                && self.reclaim(old)
            {
                reclaimed += 1;
            }
            addr += PAGE;
        }
        EngineMetrics::add(&self.metrics.ranges_reclaimed, reclaimed as u64);
        reclaimed
    }

    /// Map the existing metadata of direct-map pages `pfns` behind the
    /// virtual range starting at `start`, without copying. Pages with no
    /// metadata map as untracked.
    pub fn vmap_pages(&self, start: u64, pfns: &[usize]) {
        let end = start.saturating_add((pfns.len() * PAGE_SIZE) as u64);
        if pfns.is_empty() {
            return;
        }
        let region = self.virtual_range(start, end);
        for (i, &pfn) in pfns.iter().enumerate() {
            self.check_pages(pfn, 1);
            let key = self.config.virtual_regions[region].meta_addr(start + i as u64 * PAGE);
            let page = match &self.space.slot(pfn).read().track {
                PageTrack::Tracked(page) => Some(page.clone()),
                _ => None,
            };
            let old = {
                let mut universe = self.space.universe.write();
                match page {
                    Some(page) => universe.insert(key, VirtualSlot { page, owned: false }),
                    None => universe.remove(&key),
                }
            };
            if let Some(old) = old {
                self.reclaim(old);
            }
        }
    }

    /// Drop borrowed mappings created by [`Self::vmap_pages`].
    pub fn vunmap_range(&self, start: u64, end: u64) {
        self.unmap_range(start, end);
    }

    /// Remember a boot-time direct-map range whose metadata is set up by
    /// [`Self::initialize`].
    pub fn record_future_range(&self, start: u64, end: u64) -> Result<(), ConfigError> {
        let start = start & !(PAGE - 1);
        let end = end.div_ceil(PAGE) * PAGE;
        if start >= end
            || start < self.config.direct_map_base
            || end > self.config.direct_map_end()
        {
            return Err(ConfigError::FutureRangeOutside { start, end });
        }
        let mut ranges = self.future_ranges.lock();
        if ranges.len() >= MAX_FUTURE_RANGES {
            return Err(ConfigError::TooManyFutureRanges {
                max: MAX_FUTURE_RANGES,
            });
        }
        ranges.push((start, end));
        Ok(())
    }

    /// Give every recorded boot range clean metadata, then start tracking.
    pub fn initialize(&self) {
        let ranges = std::mem::take(&mut *self.future_ranges.lock());
        let mut pages = 0usize;
        for (start, end) in ranges {
            let (Some(first), Some(last)) = (self.pfn_of(start), self.pfn_of(end - 1)) else {
                continue;
            };
            for pfn in first..=last {
                let mut slot = self.space.slot(pfn).write();
                if slot.track.storage().is_some() {
                    continue;
                }
                match self.pool.allocate(BlockKind::Page, 1, MetaInit::Clean) {
                    Ok(block) => {
                        *slot = PageSlot {
                            allocated: true,
                            track: PageTrack::Tracked(MetaPage::new(block, 0)),
                        };
                        pages += 1;
                    }
                    Err(_) => {
                        EngineMetrics::inc(&self.metrics.degraded_allocs);
                        slot.allocated = true;
                    }
                }
            }
        }
        self.ready.store(true, std::sync::atomic::Ordering::Release);
        self.events.record(
            EventRecord::new(LogLevel::Info, "engine_ready")
                .with_details(serde_json::json!({ "boot_pages": pages })),
        );
    }
}
