//! Hooks fired before the engine is installed.

use memsan_abi::context_abi::memsan_get_context_state;
use memsan_abi::engine_state;
use memsan_abi::instrument_abi::{memsan_metadata_ptr_for_load_n, memsan_metadata_ptr_for_store_n};
use memsan_abi::lifecycle_abi::{
    MEMSAN_ALLOC_UNTRACKED, memsan_alloc_pages, memsan_free_pages, memsan_map_range, memsan_start,
};
use memsan_abi::propagate_abi::{MEMSAN_REASON_UNINIT, memsan_chain_origin, memsan_check, memsan_poison};

// One test per binary: installation is process-wide.
#[test]
fn hooks_pass_through_until_init() {
    assert!(engine_state::engine().is_none());

    assert_eq!(memsan_start(), -libc::ENODEV);
    assert_eq!(memsan_alloc_pages(0, 0, 0), MEMSAN_ALLOC_UNTRACKED);
    memsan_free_pages(0, 0);
    memsan_poison(0xffff_8880_0000_0000, 8);
    assert_eq!(memsan_check(0xffff_8880_0000_0000, 8, MEMSAN_REASON_UNINIT, 0), 0);
    assert_eq!(memsan_chain_origin(42), 42);
    assert_eq!(memsan_map_range(0, 4096), 0);

    let load = memsan_metadata_ptr_for_load_n(0x1234, 8);
    let store = memsan_metadata_ptr_for_store_n(0x1234, 8);
    assert_ne!(load.shadow, store.shadow);
    // SAFETY: early scratch storage is a static page.
    let shadow = unsafe { std::slice::from_raw_parts(load.shadow, 8) };
    assert!(shadow.iter().all(|&b| b == 0));

    let state = memsan_get_context_state();
    assert!(!state.is_null());
    // SAFETY: the throwaway state lives in this thread's context.
    unsafe { (*state).param[3] = 0xff };
    let again = memsan_get_context_state();
    // SAFETY: as above.
    assert!(unsafe { (*again).is_clear() });

    let config = memsan_engine::EngineConfig::default().with_direct_map(0xffff_8880_0000_0000, 16);
    let engine = engine_state::install(config).expect("first install");
    assert!(!engine.is_ready());
    assert_eq!(memsan_start(), 0);
    assert!(engine.is_ready());
    assert!(matches!(
        engine_state::install(memsan_engine::EngineConfig::default()),
        Err(engine_state::InstallError::AlreadyInstalled)
    ));
}
