//! Execution-context hooks fired by entry code.

use memsan_engine::ContextState;
use memsan_engine::context::with_context;

use crate::macros::hook_fn;

hook_fn! {
    fn memsan_interrupt_enter() |engine| { engine.interrupt_enter(); }
}

hook_fn! {
    fn memsan_interrupt_exit() |engine| { engine.interrupt_exit(); }
}

hook_fn! {
    fn memsan_softirq_enter() |engine| { engine.softirq_enter(); }
}

hook_fn! {
    fn memsan_softirq_exit() |engine| { engine.softirq_exit(); }
}

hook_fn! {
    fn memsan_nmi_enter() |engine| { engine.nmi_enter(); }
}

hook_fn! {
    fn memsan_nmi_exit() |engine| { engine.nmi_exit(); }
}

hook_fn! {
    fn memsan_ist_enter() |engine| { engine.ist_enter(); }
}

hook_fn! {
    fn memsan_ist_exit() |engine| { engine.ist_exit(); }
}

hook_fn! {
    fn memsan_syscall_enter() |engine| { engine.syscall_enter(); }
}

hook_fn! {
    fn memsan_syscall_exit() |engine| { engine.syscall_exit(); }
}

hook_fn! {
    fn memsan_exception_enter() |engine| { engine.exception_enter(); }
}

hook_fn! {
    fn memsan_exception_exit() |engine| { engine.exception_exit(); }
}

hook_fn! {
    fn memsan_task_create() |engine| { engine.task_create(); }
}

hook_fn! {
    fn memsan_task_exit() |engine| { engine.task_exit(); }
}

hook_fn! {
    fn memsan_disable_current() |engine| { engine.disable_current(); }
}

hook_fn! {
    fn memsan_enable_current() |engine| { engine.enable_current(); }
}

hook_fn! {
    fn memsan_func_entry(pc: u64) |engine| { engine.func_entry(pc); }
}

hook_fn! {
    fn memsan_func_exit() |engine| { engine.func_exit(); }
}

hook_fn! {
    fn memsan_bind_cpu(cpu: usize) |engine| { engine.bind_cpu(cpu); }
}

fn early_context_state() -> *mut ContextState {
    with_context(|ctx| std::ptr::from_mut(ctx.current_state(false)))
}

hook_fn! {
    /// Scratch parameter, return-value and vararg metadata of the current
    /// execution level. Valid until the level is left; before `memsan_init`,
    /// or from inside the runtime, a zeroed throwaway state.
    fn memsan_get_context_state() -> *mut ContextState [passthrough = early_context_state()] |engine| {
        engine.context_state_ptr()
    }
}
