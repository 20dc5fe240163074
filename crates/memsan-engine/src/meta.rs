//! Shadow and origin storage.
//!
//! A [`MetaBlock`] owns the shadow bytes and origin slots for a run of
//! primary pages. Shadow and origin are allocated together and released
//! together, so a page either has both or neither. Individual pages of a
//! block are referenced through [`MetaPage`].
//!
//! Storage is plain heap memory outside the tracked address space; metadata
//! is therefore never itself shadowed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};

use crate::config::{ORIGIN_SIZE, PAGE_SIZE};
use crate::depot::OriginHandle;
use crate::error::MetaAllocError;

/// Origin slots per page.
pub const ORIGINS_PER_PAGE: usize = PAGE_SIZE / ORIGIN_SIZE;

/// Shadow byte value for a fully poisoned byte.
pub const POISONED: u8 = 0xff;

/// What a block backs. Dummy load blocks reject writes so they always read clean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Page,
    Virtual,
    CpuWindow,
    DummyLoad,
    DummyStore,
}

/// Initial contents of a fresh block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaInit {
    Clean,
    Poisoned(OriginHandle),
}

/// Paired shadow+origin storage for `pages` consecutive pages.
#[derive(Debug)]
pub struct MetaBlock {
    kind: BlockKind,
    pages: usize,
    shadow: Box<[AtomicU8]>,
    origin: Box<[AtomicU32]>,
    released: Box<[AtomicBool]>,
    split: AtomicBool,
}

impl MetaBlock {
    #[must_use]
    pub fn new(kind: BlockKind, pages: usize, init: MetaInit) -> Self {
        let (shadow_byte, origin_raw) = match init {
            MetaInit::Clean => (0, 0),
            MetaInit::Poisoned(h) => (POISONED, h.raw()),
        };
        Self {
            kind,
            pages,
            shadow: (0..pages * PAGE_SIZE)
                .map(|_| AtomicU8::new(shadow_byte))
                .collect(),
            origin: (0..pages * ORIGINS_PER_PAGE)
                .map(|_| AtomicU32::new(origin_raw))
                .collect(),
            released: (0..pages).map(|_| AtomicBool::new(false)).collect(),
            split: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> BlockKind {
        self.kind
    }

    #[must_use]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    /// Bytes of shadow in this block.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shadow.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shadow.is_empty()
    }

    const fn writable(&self) -> bool {
        !matches!(self.kind, BlockKind::DummyLoad)
    }

    #[must_use]
    pub fn shadow_at(&self, offset: usize) -> u8 {
        self.shadow[offset].load(Ordering::Relaxed)
    }

    pub fn set_shadow(&self, offset: usize, value: u8) {
        if self.writable() {
            self.shadow[offset].store(value, Ordering::Relaxed);
        }
    }

    /// Fill `len` shadow bytes starting at `offset`.
    pub fn fill_shadow(&self, offset: usize, len: usize, value: u8) {
        if !self.writable() {
            return;
        }
        for byte in &self.shadow[offset..offset + len] {
            byte.store(value, Ordering::Relaxed);
        }
    }

    /// Shadow cell at `offset`, for callers that hand out raw addresses.
    #[must_use]
    pub fn shadow_cell(&self, offset: usize) -> &AtomicU8 {
        &self.shadow[offset]
    }

    /// Origin cell of the group holding shadow byte `offset`.
    #[must_use]
    pub fn origin_cell(&self, offset: usize) -> &AtomicU32 {
        &self.origin[offset / ORIGIN_SIZE]
    }

    /// Origin of the group holding shadow byte `offset`.
    #[must_use]
    pub fn origin_at(&self, offset: usize) -> OriginHandle {
        OriginHandle::from_raw(self.origin[offset / ORIGIN_SIZE].load(Ordering::Relaxed))
    }

    pub fn set_origin(&self, offset: usize, handle: OriginHandle) {
        if self.writable() {
            self.origin[offset / ORIGIN_SIZE].store(handle.raw(), Ordering::Relaxed);
        }
    }

    /// Write `handle` to every origin group overlapping `[offset, offset + len)`.
    pub fn fill_origin(&self, offset: usize, len: usize, handle: OriginHandle) {
        if !self.writable() || len == 0 {
            return;
        }
        let first = offset / ORIGIN_SIZE;
        let last = (offset + len - 1) / ORIGIN_SIZE;
        for slot in &self.origin[first..=last] {
            slot.store(handle.raw(), Ordering::Relaxed);
        }
    }

    /// Zero shadow and origin of one page.
    pub fn clear_page(&self, index: usize) {
        self.fill_shadow(index * PAGE_SIZE, PAGE_SIZE, 0);
        if self.writable() {
            let base = index * ORIGINS_PER_PAGE;
            for slot in &self.origin[base..base + ORIGINS_PER_PAGE] {
                slot.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Copy one page of shadow and origin from `src`.
    pub fn copy_page_from(&self, index: usize, src: &MetaBlock, src_index: usize) {
        if !self.writable() {
            return;
        }
        let (d, s) = (index * PAGE_SIZE, src_index * PAGE_SIZE);
        for i in 0..PAGE_SIZE {
            self.shadow[d + i].store(src.shadow[s + i].load(Ordering::Relaxed), Ordering::Relaxed);
        }
        let (d, s) = (index * ORIGINS_PER_PAGE, src_index * ORIGINS_PER_PAGE);
        for i in 0..ORIGINS_PER_PAGE {
            self.origin[d + i].store(src.origin[s + i].load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn is_split(&self) -> bool {
        self.split.load(Ordering::Acquire)
    }

    pub fn mark_split(&self) {
        self.split.store(true, Ordering::Release);
    }

    /// Mark page `index` released. Returns false if it already was.
    pub fn release_page(&self, index: usize) -> bool {
        !self.released[index].swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_released(&self, index: usize) -> bool {
        self.released[index].load(Ordering::Acquire)
    }
}

/// One page of a [`MetaBlock`].
#[derive(Debug, Clone)]
pub struct MetaPage {
    pub block: Arc<MetaBlock>,
    pub index: usize,
}

impl MetaPage {
    #[must_use]
    pub fn new(block: Arc<MetaBlock>, index: usize) -> Self {
        Self { block, index }
    }

    /// Byte offset of this page's shadow inside its block.
    #[must_use]
    pub const fn base(&self) -> usize {
        self.index * PAGE_SIZE
    }

    /// True if `next` is the page right after this one in the same block.
    #[must_use]
    pub fn is_followed_by(&self, next: &MetaPage) -> bool {
        Arc::ptr_eq(&self.block, &next.block) && next.index == self.index + 1
    }

    pub fn clear(&self) {
        self.block.clear_page(self.index);
    }
}

/// Budget of shadow+origin pages.
///
/// Shadow and origin are reserved separately so that a failure on the second
/// reservation can be unwound.
#[derive(Debug)]
pub struct MetaPool {
    limit: Option<usize>,
    used: AtomicUsize,
}

impl MetaPool {
    #[must_use]
    pub const fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    /// Reserve `pages` metadata pages.
    pub fn reserve(&self, pages: usize) -> Result<(), MetaAllocError> {
        let Some(limit) = self.limit else {
            self.used.fetch_add(pages, Ordering::Relaxed);
            return Ok(());
        };
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let available = limit.saturating_sub(current);
            if pages > available {
                return Err(MetaAllocError::Exhausted {
                    requested: pages,
                    available,
                });
            }
            match self.used.compare_exchange_weak(
                current,
                current + pages,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(seen) => current = seen,
            }
        }
    }

    pub fn release(&self, pages: usize) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(pages))
            });
    }

    /// Metadata pages currently handed out.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Reserve shadow then origin for `pages` primary pages and build the
    /// block. Either reservation failing leaves the pool unchanged.
    pub fn allocate(
        &self,
        kind: BlockKind,
        pages: usize,
        init: MetaInit,
    ) -> Result<Arc<MetaBlock>, MetaAllocError> {
        self.reserve(pages)?;
        if let Err(e) = self.reserve(pages) {
            self.release(pages);
            return Err(e);
        }
        Ok(Arc::new(MetaBlock::new(kind, pages, init)))
    }

    /// Return the shadow and origin pages of `pages` primary pages.
    pub fn free(&self, pages: usize) {
        self.release(2 * pages);
    }
}

/// Fallback storage returned when an address has no metadata. Loads read
/// clean, stores land in a separate sink nobody reads.
#[derive(Debug)]
pub struct DummyMeta {
    pub load: Arc<MetaBlock>,
    pub store: Arc<MetaBlock>,
}

impl DummyMeta {
    #[must_use]
    pub fn new() -> Self {
        // Two pages so an unaligned page-sized origin span still fits.
        Self {
            load: Arc::new(MetaBlock::new(BlockKind::DummyLoad, 2, MetaInit::Clean)),
            store: Arc::new(MetaBlock::new(BlockKind::DummyStore, 2, MetaInit::Clean)),
        }
    }

    #[must_use]
    pub fn for_access(&self, store: bool) -> &Arc<MetaBlock> {
        if store { &self.store } else { &self.load }
    }
}

impl Default for DummyMeta {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poisoned_block_is_filled() {
        let h = OriginHandle::from_raw(7);
        let b = MetaBlock::new(BlockKind::Page, 2, MetaInit::Poisoned(h));
        assert_eq!(b.len(), 2 * PAGE_SIZE);
        assert_eq!(b.shadow_at(0), POISONED);
        assert_eq!(b.shadow_at(2 * PAGE_SIZE - 1), POISONED);
        assert_eq!(b.origin_at(5), h);
        assert_eq!(b.origin_at(2 * PAGE_SIZE - 1), h);
    }

    #[test]
    fn fill_origin_covers_partial_groups() {
        let b = MetaBlock::new(BlockKind::Page, 1, MetaInit::Clean);
        let h = OriginHandle::from_raw(3);
        b.fill_origin(6, 3, h);
        assert_eq!(b.origin_at(3), OriginHandle::NONE);
        assert_eq!(b.origin_at(4), h);
        assert_eq!(b.origin_at(8), h);
        assert_eq!(b.origin_at(12), OriginHandle::NONE);
    }

    #[test]
    fn dummy_load_ignores_writes() {
        let d = DummyMeta::new();
        d.load.fill_shadow(0, 16, POISONED);
        d.load.set_origin(0, OriginHandle::from_raw(1));
        assert_eq!(d.load.shadow_at(3), 0);
        assert_eq!(d.load.origin_at(0), OriginHandle::NONE);
        d.store.fill_shadow(0, 16, POISONED);
        assert_eq!(d.store.shadow_at(3), POISONED);
    }

    #[test]
    fn release_is_one_shot() {
        let b = MetaBlock::new(BlockKind::Page, 2, MetaInit::Clean);
        assert!(b.release_page(1));
        assert!(!b.release_page(1));
        assert!(b.is_released(1));
        assert!(!b.is_released(0));
    }

    #[test]
    fn copy_and_clear_page() {
        let src = MetaBlock::new(BlockKind::Page, 1, MetaInit::Poisoned(OriginHandle::from_raw(9)));
        let dst = MetaBlock::new(BlockKind::Page, 2, MetaInit::Clean);
        dst.copy_page_from(1, &src, 0);
        assert_eq!(dst.shadow_at(0), 0);
        assert_eq!(dst.shadow_at(PAGE_SIZE + 17), POISONED);
        assert_eq!(dst.origin_at(PAGE_SIZE + 17), OriginHandle::from_raw(9));
        dst.clear_page(1);
        assert_eq!(dst.shadow_at(PAGE_SIZE + 17), 0);
        assert_eq!(dst.origin_at(PAGE_SIZE + 17), OriginHandle::NONE);
    }

    #[test]
    fn pool_unwinds_when_origin_reservation_fails() {
        let pool = MetaPool::new(Some(3));
        let err = pool
            .allocate(BlockKind::Page, 2, MetaInit::Clean)
            .unwrap_err();
        assert_eq!(
            err,
            MetaAllocError::Exhausted {
                requested: 2,
                available: 1
            }
        );
        assert_eq!(pool.used(), 0);
        pool.allocate(BlockKind::Page, 1, MetaInit::Clean).unwrap();
        assert_eq!(pool.used(), 2);
        pool.free(1);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn pages_know_their_neighbours() {
        let block = Arc::new(MetaBlock::new(BlockKind::Page, 2, MetaInit::Clean));
        let other = Arc::new(MetaBlock::new(BlockKind::Page, 2, MetaInit::Clean));
        let a = MetaPage::new(block.clone(), 0);
        let b = MetaPage::new(block, 1);
        let c = MetaPage::new(other, 1);
        assert!(a.is_followed_by(&b));
        assert!(!b.is_followed_by(&a));
        assert!(!a.is_followed_by(&c));
    }
}
