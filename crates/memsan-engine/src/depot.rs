//! Provenance store.
//!
//! Records are lists of `u64` frames, content-addressed by a BLAKE3 digest so
//! that saving an identical record twice returns the same handle. Handles are
//! 32-bit: the low 27 bits index the record (1-based, 0 means "no origin"),
//! the high 5 bits are caller-defined extra bits carried alongside.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Bits of a handle used to index records.
pub const HANDLE_INDEX_BITS: u32 = 27;
/// Bits of a handle available to callers.
pub const HANDLE_EXTRA_BITS: u32 = 5;
/// Largest number of records a depot can address.
pub const MAX_DEPOT_RECORDS: usize = (1 << HANDLE_INDEX_BITS) - 1;

const INDEX_MASK: u32 = (1 << HANDLE_INDEX_BITS) - 1;
const EXTRA_MASK: u32 = (1 << HANDLE_EXTRA_BITS) - 1;

/// Compact reference to a provenance record. Zero means "no origin".
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
#[repr(transparent)]
pub struct OriginHandle(u32);

impl OriginHandle {
    pub const NONE: Self = Self(0);

    /// Extra bit marking memory poisoned by a free.
    pub const EXTRA_AFTER_FREE: u8 = 0b1;

    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 & INDEX_MASK == 0
    }

    #[must_use]
    pub const fn is_some(self) -> bool {
        !self.is_none()
    }

    /// 1-based record index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 & INDEX_MASK
    }

    #[must_use]
    pub const fn extra(self) -> u8 {
        ((self.0 >> HANDLE_INDEX_BITS) & EXTRA_MASK) as u8
    }

    /// Same record, with `extra` replacing the extra bits.
    #[must_use]
    pub const fn with_extra(self, extra: u8) -> Self {
        if self.is_none() {
            return Self::NONE;
        }
        Self(self.index() | ((extra as u32 & EXTRA_MASK) << HANDLE_INDEX_BITS))
    }

    #[must_use]
    pub const fn without_extra(self) -> Self {
        Self(self.index())
    }

    #[must_use]
    pub const fn is_after_free(self) -> bool {
        self.extra() & Self::EXTRA_AFTER_FREE != 0
    }

    const fn from_index(index: u32) -> Self {
        Self(index & INDEX_MASK)
    }
}

/// Deduplicating stack store consumed by the engine.
pub trait StackDepot: Send + Sync {
    /// Store `frames`. Returns the handle of an identical record if one
    /// already exists, or `None` if the store is full.
    fn save(&self, frames: &[u64]) -> Option<OriginHandle>;

    /// Frames stored under `handle`. Extra bits are ignored.
    fn fetch(&self, handle: OriginHandle) -> Option<Arc<[u64]>>;

    /// Number of distinct records.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct DepotInner {
    by_digest: HashMap<[u8; 32], u32>,
    records: Vec<Arc<[u64]>>,
}

/// Heap-backed [`StackDepot`] with a fixed record capacity.
pub struct InMemoryDepot {
    inner: RwLock<DepotInner>,
    capacity: usize,
}

impl InMemoryDepot {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(DepotInner {
                by_digest: HashMap::new(),
                records: Vec::new(),
            }),
            capacity: capacity.min(MAX_DEPOT_RECORDS),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn digest(frames: &[u64]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(frames.len() as u64).to_le_bytes());
    for frame in frames {
        hasher.update(&frame.to_le_bytes());
    }
    *hasher.finalize().as_bytes()
}

impl StackDepot for InMemoryDepot {
    fn save(&self, frames: &[u64]) -> Option<OriginHandle> {
        let key = digest(frames);

        // Fast path: record already present.
        if let Some(&index) = self.inner.read().by_digest.get(&key) {
            return Some(OriginHandle::from_index(index));
        }

        let mut inner = self.inner.write();
        if let Some(&index) = inner.by_digest.get(&key) {
            return Some(OriginHandle::from_index(index));
        }
        if inner.records.len() >= self.capacity {
            return None;
        }
        inner.records.push(Arc::from(frames));
        let index = inner.records.len() as u32;
        inner.by_digest.insert(key, index);
        Some(OriginHandle::from_index(index))
    }

    fn fetch(&self, handle: OriginHandle) -> Option<Arc<[u64]>> {
        if handle.is_none() {
            return None;
        }
        let slot = handle.index() as usize - 1;
        self.inner.read().records.get(slot).cloned()
    }

    fn len(&self) -> usize {
        self.inner.read().records.len()
    }
}
