//! Hook surface against a live process-wide engine.

use std::ffi::CString;
use std::sync::Once;

use memsan_abi::context_abi::{
    memsan_get_context_state, memsan_interrupt_enter, memsan_interrupt_exit,
    memsan_syscall_enter, memsan_syscall_exit,
};
use memsan_abi::engine_state;
use memsan_abi::instrument_abi::{
    memsan_metadata_ptr_for_load_4, memsan_metadata_ptr_for_load_n,
    memsan_metadata_ptr_for_store_8,
};
use memsan_abi::lifecycle_abi::{
    MEMSAN_ALLOC_TRACKED, memsan_alloc_pages, memsan_free_pages, memsan_init,
    memsan_record_future_range, memsan_start,
};
use memsan_abi::propagate_abi::{
    MEMSAN_REASON_COPY_TO_USER, MEMSAN_REASON_UNINIT, memsan_asm_load, memsan_asm_store,
    memsan_chain_origin, memsan_check,
    memsan_copy_to_untrusted, memsan_memcpy_meta, memsan_object_alloc, memsan_poison,
    memsan_poison_alloca, memsan_unpoison,
};

const BASE: u64 = 0xffff_8880_0000_0000;
const PAGES: usize = 64;
const PAGE: u64 = 4096;
const ZERO: u32 = 1;

static INIT: Once = Once::new();

/// Each test owns a disjoint set of page frames.
fn ready() {
    INIT.call_once(|| {
        assert_eq!(memsan_init(BASE, PAGES), 0);
        assert_eq!(memsan_record_future_range(BASE + 60 * PAGE, BASE + 62 * PAGE), 0);
        assert_eq!(memsan_start(), 0);
    });
}

fn page(pfn: u64) -> u64 {
    BASE + pfn * PAGE
}

#[test]
fn second_init_is_rejected() {
    ready();
    assert_eq!(memsan_init(BASE, PAGES), -libc::EALREADY);
    assert!(engine_state::engine().is_some());
}

#[test]
fn future_ranges_are_clean_after_start() {
    ready();
    assert_eq!(memsan_check(page(60), 2 * PAGE as usize, MEMSAN_REASON_UNINIT, 0x1000), 0);
    assert_eq!(
        memsan_record_future_range(BASE + PAGES as u64 * PAGE, BASE + (PAGES as u64 + 1) * PAGE),
        -libc::EINVAL
    );
}

#[test]
fn poison_check_unpoison_through_hooks() {
    ready();
    assert_eq!(memsan_alloc_pages(0, 1, ZERO), MEMSAN_ALLOC_TRACKED);
    let a = page(0) + 100;
    assert_eq!(memsan_check(a, 16, MEMSAN_REASON_UNINIT, 0x2000), 0);
    memsan_poison(a + 4, 4);
    assert_eq!(memsan_check(a, 16, MEMSAN_REASON_UNINIT, 0x2004), 1);
    memsan_unpoison(a, 16);
    assert_eq!(memsan_check(a, 16, MEMSAN_REASON_UNINIT, 0x2008), 0);
    memsan_free_pages(0, 1);
}

#[test]
fn object_allocations_start_poisoned() {
    ready();
    memsan_alloc_pages(2, 0, ZERO);
    memsan_object_alloc(page(2) + 64, 32, 0);
    assert_eq!(memsan_check(page(2) + 64, 32, MEMSAN_REASON_UNINIT, 0x3000), 1);
    memsan_object_alloc(page(2) + 128, 32, ZERO);
    assert_eq!(memsan_check(page(2) + 128, 32, MEMSAN_REASON_UNINIT, 0x3004), 0);
    memsan_free_pages(2, 0);
}

#[test]
fn metadata_pointers_alias_engine_shadow() {
    ready();
    memsan_alloc_pages(4, 0, ZERO);
    let a = page(4) + 8;

    let store = memsan_metadata_ptr_for_store_8(a);
    assert!(!store.shadow.is_null());
    // SAFETY: the pointers cover eight shadow bytes and two origin slots of
    // a live tracked page.
    unsafe {
        std::ptr::write_bytes(store.shadow, 0xff, 8);
        *store.origin = 7;
    }
    assert_eq!(memsan_check(a, 8, MEMSAN_REASON_UNINIT, 0x4000), 1);

    let load = memsan_metadata_ptr_for_load_4(a);
    // SAFETY: as above.
    unsafe {
        assert_eq!(*load.shadow, 0xff);
        assert_eq!(*load.origin, 7);
    }
    memsan_unpoison(a, 8);
    // SAFETY: as above.
    assert_eq!(unsafe { *load.shadow }, 0);
    memsan_free_pages(4, 0);
}

#[test]
fn untracked_addresses_get_clean_load_metadata() {
    ready();
    let ptrs = memsan_metadata_ptr_for_load_n(0x1000, 16);
    // SAFETY: dummy load storage spans a page of zeroed shadow.
    let shadow = unsafe { std::slice::from_raw_parts(ptrs.shadow, 16) };
    assert!(shadow.iter().all(|&b| b == 0));
}

#[test]
fn copies_carry_poison_and_chain_origins() {
    ready();
    memsan_alloc_pages(6, 0, ZERO);
    let src = page(6);
    let dst = page(6) + 2048;
    memsan_poison(src, 8);
    memsan_memcpy_meta(dst, src, 8);
    assert_eq!(memsan_check(dst, 8, MEMSAN_REASON_UNINIT, 0x5000), 1);

    let origin = memsan_metadata_ptr_for_load_n(dst, 4);
    // SAFETY: live tracked page.
    let handle = unsafe { *origin.origin };
    assert_ne!(handle, 0);
    assert_ne!(memsan_chain_origin(handle), handle);
    assert_eq!(memsan_chain_origin(0), 0);
    memsan_free_pages(6, 0);
}

#[test]
fn leaks_to_untrusted_memory_are_reported() {
    ready();
    memsan_alloc_pages(8, 0, ZERO);
    let src = page(8);
    memsan_poison(src + 12, 4);
    // Everything copied.
    assert_eq!(memsan_copy_to_untrusted(0x7000, src, 16, 0, 0x6000), 1);
    // The poisoned tail was never transferred.
    assert_eq!(memsan_copy_to_untrusted(0x7000, src, 16, 4, 0x6004), 0);
    assert_eq!(memsan_check(src, 16, MEMSAN_REASON_COPY_TO_USER, 0x6008), 1);
    memsan_free_pages(8, 0);
}

#[test]
fn stack_variables_start_poisoned() {
    ready();
    memsan_alloc_pages(10, 0, ZERO);
    let descr = CString::new("buf@handler").expect("no interior nul");
    // SAFETY: descr is a valid C string for the duration of the call.
    unsafe { memsan_poison_alloca(page(10) + 32, 24, descr.as_ptr(), 0x7000) };
    assert_eq!(memsan_check(page(10) + 40, 4, MEMSAN_REASON_UNINIT, 0x7004), 1);
    // SAFETY: null descriptions are accepted.
    unsafe { memsan_poison_alloca(page(10) + 512, 8, std::ptr::null(), 0x7008) };
    assert_eq!(memsan_check(page(10) + 512, 8, MEMSAN_REASON_UNINIT, 0x700c), 1);
    memsan_free_pages(10, 0);
}

#[test]
fn context_hooks_nest() {
    ready();
    memsan_syscall_enter();
    memsan_interrupt_enter();
    memsan_alloc_pages(12, 0, 0);
    assert_eq!(memsan_check(page(12), 4, MEMSAN_REASON_UNINIT, 0x8000), 1);
    memsan_free_pages(12, 0);
    memsan_interrupt_exit();
    memsan_syscall_exit();
}

#[test]
fn context_state_is_shared_in_place_per_level() {
    ready();
    let task = memsan_get_context_state();
    assert!(!task.is_null());
    // SAFETY: the task level's state lives as long as this thread's task.
    unsafe {
        (*task).param[0] = 0xff;
        (*task).retval_origin = memsan_engine::OriginHandle::from_raw(9);
    }
    assert_eq!(memsan_get_context_state(), task);

    memsan_interrupt_enter();
    let irq = memsan_get_context_state();
    assert_ne!(irq, task);
    // SAFETY: the interrupt level is live until memsan_interrupt_exit.
    unsafe {
        assert_eq!((*irq).param[0], 0);
        (*irq).param[0] = 1;
    }
    memsan_interrupt_exit();

    assert_eq!(memsan_get_context_state(), task);
    // SAFETY: as above.
    unsafe {
        assert_eq!((*task).param[0], 0xff);
        assert_eq!((*task).retval_origin.raw(), 9);
    }
}

#[test]
fn asm_accesses_check_and_initialize() {
    ready();
    memsan_alloc_pages(14, 0, 0);
    let a = page(14) + 256;
    assert_eq!(memsan_asm_load(a, 8, 0x9000), 1);
    memsan_asm_store(a, 8);
    assert_eq!(memsan_asm_load(a, 8, 0x9004), 0);
    memsan_free_pages(14, 0);
}
