//! Metadata pointer hooks called by instrumented loads and stores.

use std::sync::atomic::{AtomicU8, AtomicU32};

use memsan_engine::ShadowOriginPtr;
use memsan_engine::config::{ORIGIN_SIZE, PAGE_SIZE};

use crate::macros::hook_fn;

/// Shadow and origin addresses for one access, as seen by instrumented code.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemsanMetaPtrs {
    pub shadow: *mut u8,
    pub origin: *mut u32,
}

// Scratch metadata handed out before an engine exists. Loads read zeros from
// their pair; stores scribble on theirs. Two pages each, like the engine's
// dummies, so an unaligned page-sized access stays in bounds.
const EARLY_SHADOW_LEN: usize = 2 * PAGE_SIZE;
const EARLY_ORIGIN_LEN: usize = EARLY_SHADOW_LEN / ORIGIN_SIZE;

static EARLY_LOAD_SHADOW: [AtomicU8; EARLY_SHADOW_LEN] =
    [const { AtomicU8::new(0) }; EARLY_SHADOW_LEN];
static EARLY_LOAD_ORIGIN: [AtomicU32; EARLY_ORIGIN_LEN] =
    [const { AtomicU32::new(0) }; EARLY_ORIGIN_LEN];
static EARLY_STORE_SHADOW: [AtomicU8; EARLY_SHADOW_LEN] =
    [const { AtomicU8::new(0) }; EARLY_SHADOW_LEN];
static EARLY_STORE_ORIGIN: [AtomicU32; EARLY_ORIGIN_LEN] =
    [const { AtomicU32::new(0) }; EARLY_ORIGIN_LEN];

fn early(store: bool) -> MemsanMetaPtrs {
    let (shadow, origin) = if store {
        (&EARLY_STORE_SHADOW, &EARLY_STORE_ORIGIN)
    } else {
        (&EARLY_LOAD_SHADOW, &EARLY_LOAD_ORIGIN)
    };
    MemsanMetaPtrs {
        shadow: shadow[0].as_ptr(),
        origin: origin[0].as_ptr(),
    }
}

impl From<ShadowOriginPtr> for MemsanMetaPtrs {
    fn from(ptr: ShadowOriginPtr) -> Self {
        Self {
            shadow: ptr.shadow.shadow_cell().as_ptr(),
            origin: ptr.origin.origin_cell().as_ptr(),
        }
    }
}

hook_fn! {
    fn memsan_metadata_ptr_for_load_n(addr: u64, size: usize) -> MemsanMetaPtrs [passthrough = early(false)] |engine| {
        engine.metadata_ptr_for_load(addr, size).into()
    }
}

hook_fn! {
    fn memsan_metadata_ptr_for_store_n(addr: u64, size: usize) -> MemsanMetaPtrs [passthrough = early(true)] |engine| {
        engine.metadata_ptr_for_store(addr, size).into()
    }
}

macro_rules! fixed_size_hooks {
    ($($size:literal => $load:ident, $store:ident;)*) => {
        $(
            hook_fn! {
                fn $load(addr: u64) -> MemsanMetaPtrs [passthrough = early(false)] |engine| {
                    engine.metadata_ptr_for_load(addr, $size).into()
                }
            }

            hook_fn! {
                fn $store(addr: u64) -> MemsanMetaPtrs [passthrough = early(true)] |engine| {
                    engine.metadata_ptr_for_store(addr, $size).into()
                }
            }
        )*
    };
}

fixed_size_hooks! {
    1 => memsan_metadata_ptr_for_load_1, memsan_metadata_ptr_for_store_1;
    2 => memsan_metadata_ptr_for_load_2, memsan_metadata_ptr_for_store_2;
    4 => memsan_metadata_ptr_for_load_4, memsan_metadata_ptr_for_store_4;
    8 => memsan_metadata_ptr_for_load_8, memsan_metadata_ptr_for_store_8;
}
