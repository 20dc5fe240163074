//! Poison, check and copy hooks.

use std::ffi::{CStr, c_char, c_int};

use memsan_engine::{AllocFlags, OriginHandle, ReportReason};

use crate::engine_state;
use crate::macros::hook_fn;

/// `reason` codes accepted by `memsan_check`.
pub const MEMSAN_REASON_UNINIT: c_int = 0;
pub const MEMSAN_REASON_COPY_TO_USER: c_int = 1;
pub const MEMSAN_REASON_PERIPHERAL: c_int = 2;

fn reason_from(code: c_int) -> ReportReason {
    match code {
        MEMSAN_REASON_COPY_TO_USER => ReportReason::CopyToUntrusted,
        MEMSAN_REASON_PERIPHERAL => ReportReason::TransferToPeripheral,
        _ => ReportReason::UninitValue,
    }
}

fn location(pc: u64) -> String {
    format!("{pc:#x}")
}

hook_fn! {
    fn memsan_poison(addr: u64, size: usize) |engine| {
        engine.poison(addr, size);
    }
}

hook_fn! {
    fn memsan_unpoison(addr: u64, size: usize) |engine| {
        engine.unpoison(addr, size);
    }
}

hook_fn! {
    /// Returns 1 if the range holds uninitialized bytes, 0 otherwise.
    fn memsan_check(addr: u64, size: usize, reason: c_int, pc: u64) -> c_int [passthrough = 0] |engine| {
        c_int::from(
            engine
                .check_at(addr, size, reason_from(reason), location(pc), None)
                .is_some(),
        )
    }
}

hook_fn! {
    fn memsan_memcpy_meta(dst: u64, src: u64, n: usize) |engine| {
        engine.memcpy_meta(dst, src, n);
    }
}

hook_fn! {
    fn memsan_memmove_meta(dst: u64, src: u64, n: usize) |engine| {
        engine.memmove_meta(dst, src, n);
    }
}

hook_fn! {
    fn memsan_chain_origin(origin: u32) -> u32 [passthrough = origin] |engine| {
        engine.chain_origin(OriginHandle::from_raw(origin)).raw()
    }
}

hook_fn! {
    /// Returns 1 if the transferred prefix leaked uninitialized bytes.
    fn memsan_copy_to_untrusted(to: u64, from: u64, requested: usize, remaining: usize, pc: u64) -> c_int [passthrough = 0] |engine| {
        c_int::from(
            engine
                .copy_to_untrusted_at(to, from, requested, remaining, location(pc))
                .is_some(),
        )
    }
}

hook_fn! {
    fn memsan_copy_from_untrusted(to: u64, requested: usize, remaining: usize) |engine| {
        engine.copy_from_untrusted(to, requested, remaining);
    }
}

hook_fn! {
    fn memsan_object_alloc(addr: u64, size: usize, flags: u32) |engine| {
        engine.on_object_alloc(addr, size, AllocFlags::from_bits_truncate(flags));
    }
}

hook_fn! {
    fn memsan_object_free(addr: u64, size: usize) |engine| {
        engine.on_object_free(addr, size);
    }
}

hook_fn! {
    fn memsan_large_alloc(addr: u64, size: usize, flags: u32) |engine| {
        engine.on_large_alloc(addr, size, AllocFlags::from_bits_truncate(flags));
    }
}

hook_fn! {
    fn memsan_large_free(addr: u64, size: usize) |engine| {
        engine.on_large_free(addr, size);
    }
}

/// Poison a new stack variable.
///
/// # Safety
///
/// `descr` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memsan_poison_alloca(addr: u64, size: usize, descr: *const c_char, pc: u64) {
    let Some(engine) = engine_state::engine() else {
        return;
    };
    let descr = if descr.is_null() {
        std::borrow::Cow::Borrowed("<unknown>")
    } else {
        // SAFETY: caller contract above.
        unsafe { CStr::from_ptr(descr) }.to_string_lossy()
    };
    engine.poison_alloca(addr, size, &descr, pc);
}

hook_fn! {
    fn memsan_unpoison_alloca(addr: u64, size: usize) |engine| {
        engine.unpoison_alloca(addr, size);
    }
}

hook_fn! {
    /// Inline asm read of `[addr, addr + size)`. Returns 1 if it was reported.
    fn memsan_asm_load(addr: u64, size: usize, pc: u64) -> c_int [passthrough = 0] |engine| {
        c_int::from(engine.asm_load_at(addr, size, location(pc)).is_some())
    }
}

hook_fn! {
    fn memsan_asm_store(addr: u64, size: usize) |engine| {
        engine.asm_store(addr, size);
    }
}

hook_fn! {
    fn memsan_unpoison_registers(addr: u64, size: usize) |engine| {
        engine.unpoison_registers(addr, size);
    }
}

hook_fn! {
    /// Use of an uninitialized register value.
    fn memsan_warning(origin: u32, pc: u64) |engine| {
        engine.warning_at(OriginHandle::from_raw(origin), location(pc));
    }
}
