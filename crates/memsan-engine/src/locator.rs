//! Metadata locator.
//!
//! Translates a primary address into the shadow/origin storage covering it.
//! Regions are classified in priority order:
//! 1. large virtual regions (metadata at a fixed offset in the shadow universe),
//! 2. the current CPU's reserved window (static per-CPU arrays),
//! 3. the page-backed direct map (per-page descriptor),
//! 4. anything else is unmapped.
//!
//! Lookups never allocate. Callers that need a pointer unconditionally get a
//! dummy span instead of `None`: the load dummy always reads clean, the store
//! dummy swallows writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU8};

use parking_lot::RwLock;

use crate::config::{EngineConfig, ORIGIN_SIZE, PAGE_SIZE};
use crate::context::with_context;
use crate::depot::OriginHandle;
use crate::engine::Sanitizer;
use crate::error::InvariantViolation;
use crate::meta::{BlockKind, DummyMeta, MetaBlock, MetaInit, MetaPage};
use crate::metrics::EngineMetrics;

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// Tracking state of one direct-map page.
#[derive(Debug, Clone, Default)]
pub enum PageTrack {
    /// No metadata; reads are clean, writes dropped.
    #[default]
    Untracked,
    /// Paired shadow+origin storage.
    Tracked(MetaPage),
    /// Explicitly excluded. Storage, if any, is kept for the eventual free.
    Ignored(Option<MetaPage>),
}

impl PageTrack {
    /// Storage attached to the page regardless of the ignore tag.
    #[must_use]
    pub fn storage(&self) -> Option<&MetaPage> {
        match self {
            Self::Tracked(page) | Self::Ignored(Some(page)) => Some(page),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_storage(self) -> Option<MetaPage> {
        match self {
            Self::Tracked(page) | Self::Ignored(Some(page)) => Some(page),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignored(_))
    }
}

/// Direct-map page descriptor.
#[derive(Debug, Clone, Default)]
pub struct PageSlot {
    pub allocated: bool,
    pub track: PageTrack,
}

/// A page of the shadow universe.
#[derive(Debug, Clone)]
pub struct VirtualSlot {
    pub page: MetaPage,
    /// Fresh storage owned by the mapping (reclaimed on unmap), as opposed to
    /// storage borrowed from direct-map pages.
    pub owned: bool,
}

/// Where an address lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Virtual { region: usize },
    CpuWindow { cpu: usize, offset: usize },
    Direct { pfn: usize, offset: usize },
    Unmapped,
}

/// Result of resolving one address.
#[derive(Debug, Clone)]
pub enum Resolved {
    Meta(MetaSpan),
    Ignored,
    Untracked,
    Unmapped,
}

/// Requested half of the metadata pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    Shadow,
    Origin,
}

/// Position inside a metadata block. `offset` indexes shadow bytes; origin
/// accesses use the group holding that byte.
#[derive(Debug, Clone)]
pub struct MetaSpan {
    pub block: Arc<MetaBlock>,
    pub offset: usize,
}

impl MetaSpan {
    #[must_use]
    pub fn new(block: Arc<MetaBlock>, offset: usize) -> Self {
        Self { block, offset }
    }

    #[must_use]
    pub fn is_dummy(&self) -> bool {
        matches!(
            self.block.kind(),
            BlockKind::DummyLoad | BlockKind::DummyStore
        )
    }

    #[must_use]
    pub fn shadow(&self, i: usize) -> u8 {
        self.block.shadow_at(self.offset + i)
    }

    pub fn set_shadow(&self, i: usize, value: u8) {
        self.block.set_shadow(self.offset + i, value);
    }

    pub fn fill_shadow(&self, len: usize, value: u8) {
        self.block.fill_shadow(self.offset, len, value);
    }

    /// Origin of the group covering byte `i`.
    #[must_use]
    pub fn origin(&self, i: usize) -> OriginHandle {
        self.block.origin_at(self.offset + i)
    }

    pub fn set_origin(&self, i: usize, handle: OriginHandle) {
        self.block.set_origin(self.offset + i, handle);
    }

    /// Set every origin group overlapping bytes `[0, len)`.
    pub fn fill_origin(&self, len: usize, handle: OriginHandle) {
        self.block.fill_origin(self.offset, len, handle);
    }

    #[must_use]
    pub fn shadow_cell(&self) -> &AtomicU8 {
        self.block.shadow_cell(self.offset)
    }

    #[must_use]
    pub fn origin_cell(&self) -> &AtomicU32 {
        self.block.origin_cell(self.offset)
    }

    #[must_use]
    pub fn read_shadow(&self, len: usize) -> Vec<u8> {
        (0..len).map(|i| self.shadow(i)).collect()
    }
}

/// Paired pointers handed to instrumented code.
#[derive(Debug, Clone)]
pub struct ShadowOriginPtr {
    pub shadow: MetaSpan,
    /// Aligned down to the origin group of the first byte.
    pub origin: MetaSpan,
}

impl ShadowOriginPtr {
    #[must_use]
    pub fn is_dummy(&self) -> bool {
        self.shadow.is_dummy()
    }
}

/// All metadata storage reachable by address.
pub struct MetaSpace {
    pub(crate) pages: Box<[RwLock<PageSlot>]>,
    pub(crate) universe: RwLock<HashMap<u64, VirtualSlot>>,
    pub(crate) cpu_windows: Box<[Arc<MetaBlock>]>,
    pub(crate) dummy: DummyMeta,
}

impl MetaSpace {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        let window_pages = config.cpu_window_size / PAGE_SIZE;
        Self {
            pages: (0..config.direct_map_pages)
                .map(|_| RwLock::new(PageSlot::default()))
                .collect(),
            universe: RwLock::new(HashMap::new()),
            cpu_windows: (0..config.nr_cpus)
                .map(|_| {
                    Arc::new(MetaBlock::new(
                        BlockKind::CpuWindow,
                        window_pages,
                        MetaInit::Clean,
                    ))
                })
                .collect(),
            dummy: DummyMeta::new(),
        }
    }

    #[must_use]
    pub fn slot(&self, pfn: usize) -> &RwLock<PageSlot> {
        &self.pages[pfn]
    }
}

/// Split `[addr, addr + len)` into pieces that never cross a page boundary.
/// Yields `(address, offset into the access, length)`.
pub fn page_chunks(addr: u64, len: usize) -> impl Iterator<Item = (u64, usize, usize)> {
    let mut done = 0usize;
    std::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let cur = addr + done as u64;
        let room = PAGE_SIZE - (cur & PAGE_MASK) as usize;
        let take = room.min(len - done);
        let item = (cur, done, take);
        done += take;
        Some(item)
    })
}

impl Sanitizer {
    /// Classify `addr`. Per-CPU windows resolve only for the calling core.
    #[must_use]
    pub fn classify(&self, addr: u64) -> Region {
        let cfg = &self.config;
        if let Some(region) = cfg.virtual_regions.iter().position(|r| r.contains(addr)) {
            return Region::Virtual { region };
        }
        if addr >= cfg.cpu_window_base && addr < cfg.cpu_window_end() {
            let cpu = with_context(|ctx| ctx.cpu());
            let window = cfg.cpu_window_base + (cpu * cfg.cpu_window_size) as u64;
            if cpu < cfg.nr_cpus && addr >= window {
                let offset = (addr - window) as usize;
                if offset < cfg.cpu_window_size {
                    return Region::CpuWindow { cpu, offset };
                }
            }
            return Region::Unmapped;
        }
        if addr >= cfg.direct_map_base && addr < cfg.direct_map_end() {
            let rel = addr - cfg.direct_map_base;
            return Region::Direct {
                pfn: (rel / PAGE_SIZE as u64) as usize,
                offset: (rel & PAGE_MASK) as usize,
            };
        }
        Region::Unmapped
    }

    /// Resolve one address to its metadata.
    #[must_use]
    pub fn resolve(&self, addr: u64) -> Resolved {
        match self.classify(addr) {
            Region::Virtual { region } => {
                let key = self.config.virtual_regions[region].meta_addr(addr & !PAGE_MASK);
                match self.space.universe.read().get(&key) {
                    Some(slot) => Resolved::Meta(MetaSpan::new(
                        slot.page.block.clone(),
                        slot.page.base() + (addr & PAGE_MASK) as usize,
                    )),
                    None => Resolved::Untracked,
                }
            }
            Region::CpuWindow { cpu, offset } => {
                Resolved::Meta(MetaSpan::new(self.space.cpu_windows[cpu].clone(), offset))
            }
            Region::Direct { pfn, offset } => match &self.space.pages[pfn].read().track {
                PageTrack::Tracked(page) => {
                    Resolved::Meta(MetaSpan::new(page.block.clone(), page.base() + offset))
                }
                PageTrack::Ignored(_) => Resolved::Ignored,
                PageTrack::Untracked => Resolved::Untracked,
            },
            Region::Unmapped => Resolved::Unmapped,
        }
    }

    /// Shadow or origin storage for an access of `size` bytes at `addr`,
    /// or `None` if there is none. Origin lookups round `addr` down to the
    /// origin group. Never allocates.
    #[must_use]
    pub fn locate(&self, addr: u64, size: usize, kind: MetaKind) -> Option<MetaSpan> {
        if size > PAGE_SIZE {
            self.fatal(InvariantViolation::OversizedAccess { addr, size });
        }
        let addr = match kind {
            MetaKind::Shadow => addr,
            MetaKind::Origin => addr & !(ORIGIN_SIZE as u64 - 1),
        };
        match self.resolve(addr) {
            Resolved::Meta(span) => Some(span),
            _ => None,
        }
    }

    /// Like [`Self::locate`], but an access whose metadata spans two
    /// non-adjacent pages is fatal.
    #[must_use]
    pub fn locate_contiguous(&self, addr: u64, size: usize, kind: MetaKind) -> Option<MetaSpan> {
        let span = self.locate(addr, size, kind)?;
        if !self.is_contiguous(addr, size) {
            self.fatal(InvariantViolation::Discontiguous { addr, size });
        }
        Some(span)
    }

    /// Backing page of `addr` for contiguity purposes.
    fn meta_page_of(&self, addr: u64) -> Option<MetaPage> {
        match self.classify(addr) {
            Region::Virtual { region } => {
                let key = self.config.virtual_regions[region].meta_addr(addr & !PAGE_MASK);
                self.space
                    .universe
                    .read()
                    .get(&key)
                    .map(|slot| slot.page.clone())
            }
            Region::CpuWindow { cpu, offset } => Some(MetaPage::new(
                self.space.cpu_windows[cpu].clone(),
                offset / PAGE_SIZE,
            )),
            Region::Direct { pfn, .. } => match &self.space.pages[pfn].read().track {
                PageTrack::Tracked(page) => Some(page.clone()),
                _ => None,
            },
            Region::Unmapped => None,
        }
    }

    /// True if the metadata of `[addr, addr + size)` is one run of storage:
    /// every page boundary crossed joins adjacent pages of the same block,
    /// or joins two pages that both lack metadata.
    #[must_use]
    pub fn is_contiguous(&self, addr: u64, size: usize) -> bool {
        if size <= 1 {
            return true;
        }
        let Some(last) = addr.checked_add(size as u64 - 1) else {
            return false;
        };
        let mut page = addr & !PAGE_MASK;
        let end_page = last & !PAGE_MASK;
        let mut cur = self.meta_page_of(page);
        while page < end_page {
            let next_addr = page + PAGE_SIZE as u64;
            let next = self.meta_page_of(next_addr);
            let joined = match (&cur, &next) {
                (Some(a), Some(b)) => a.is_followed_by(b),
                (None, None) => true,
                _ => false,
            };
            if !joined {
                return false;
            }
            cur = next;
            page = next_addr;
        }
        true
    }

    /// Storage for one page-local chunk, falling back to a dummy.
    pub(crate) fn chunk_span(&self, addr: u64, store: bool) -> MetaSpan {
        match self.resolve(addr) {
            Resolved::Meta(span) => span,
            _ => {
                EngineMetrics::inc(&self.metrics.dummy_fallbacks);
                MetaSpan::new(self.space.dummy.for_access(store).clone(), 0)
            }
        }
    }

    /// Paired pointers used by engine internals; no readiness or runtime check.
    pub(crate) fn meta_ptr(&self, addr: u64, size: usize, store: bool) -> ShadowOriginPtr {
        match self.locate_contiguous(addr, size, MetaKind::Shadow) {
            Some(shadow) => {
                let pad = (addr % ORIGIN_SIZE as u64) as usize;
                let origin = MetaSpan::new(shadow.block.clone(), shadow.offset - pad);
                ShadowOriginPtr { shadow, origin }
            }
            None => self.dummy_ptr(store),
        }
    }

    pub(crate) fn dummy_ptr(&self, store: bool) -> ShadowOriginPtr {
        EngineMetrics::inc(&self.metrics.dummy_fallbacks);
        let block = self.space.dummy.for_access(store).clone();
        ShadowOriginPtr {
            shadow: MetaSpan::new(block.clone(), 0),
            origin: MetaSpan::new(block, 0),
        }
    }

    /// Paired shadow and origin pointers for instrumented code. Always
    /// succeeds: without metadata, or before the engine is ready, or from
    /// inside the runtime, the dummy pair for `store` is returned.
    #[must_use]
    pub fn shadow_origin_ptr(&self, addr: u64, size: usize, store: bool) -> ShadowOriginPtr {
        if size > PAGE_SIZE {
            self.fatal(InvariantViolation::OversizedAccess { addr, size });
        }
        if !self.is_ready() || with_context(|ctx| ctx.in_runtime()) {
            return self.dummy_ptr(store);
        }
        self.meta_ptr(addr, size, store)
    }

    /// Load-side pointers for an `n`-byte access.
    #[must_use]
    pub fn metadata_ptr_for_load(&self, addr: u64, n: usize) -> ShadowOriginPtr {
        self.shadow_origin_ptr(addr, n, false)
    }

    /// Store-side pointers for an `n`-byte access.
    #[must_use]
    pub fn metadata_ptr_for_store(&self, addr: u64, n: usize) -> ShadowOriginPtr {
        self.shadow_origin_ptr(addr, n, true)
    }
}
