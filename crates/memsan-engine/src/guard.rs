//! Scoped runtime entry.
//!
//! Every engine entry point that touches shared metadata holds a
//! [`RuntimeGuard`]. Acquiring it disables preemption and interrupts on the
//! current core and moves the depth counter from 0 to 1; dropping it restores
//! both in reverse order on every exit path, unwinding included. Observing any
//! depth other than 0 on entry or 1 on exit is fatal.

use std::marker::PhantomData;

use crate::context::with_context;

/// Proof that the current core is inside the runtime. Not `Send`: the
/// guarded state is core-local.
#[must_use = "the runtime section ends when the guard is dropped"]
pub struct RuntimeGuard {
    irqs_were_enabled: bool,
    _core_local: PhantomData<*const ()>,
}

impl RuntimeGuard {
    /// Enter the runtime. Fatal if the current core is already inside it.
    pub fn enter() -> Self {
        let irqs_were_enabled = with_context(|ctx| ctx.enter_runtime());
        Self {
            irqs_were_enabled,
            _core_local: PhantomData,
        }
    }

    /// Enter the runtime unless the current core is already inside it.
    ///
    /// Hooks use this so that metadata operations triggered by the engine's
    /// own work are skipped instead of recursing.
    pub fn try_enter() -> Option<Self> {
        let irqs = with_context(|ctx| {
            if ctx.in_runtime() {
                None
            } else {
                Some(ctx.enter_runtime())
            }
        })?;
        Some(Self {
            irqs_were_enabled: irqs,
            _core_local: PhantomData,
        })
    }
}

impl Drop for RuntimeGuard {
    fn drop(&mut self) {
        let unwinding = std::thread::panicking();
        let irqs = self.irqs_were_enabled;
        with_context(|ctx| ctx.leave_runtime(irqs, unwinding));
    }
}
