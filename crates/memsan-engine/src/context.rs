//! Per-core execution context.
//!
//! Each host thread stands for one execution core and owns one
//! [`ExecutionContext`] in thread-local storage. It holds:
//! - the runtime depth counter used by [`crate::guard::RuntimeGuard`];
//! - the emulated preemption / interrupt / NMI state;
//! - the nested context stack: level 0 is the task, every interrupt,
//!   soft interrupt, NMI, IST, exception or nested syscall pushes a level with
//!   its own zeroed [`ContextState`];
//! - the task's reporting flags and shadow call stack.

use std::cell::RefCell;

use crate::config::{MAX_STACK_DEPTH, NESTED_CONTEXT_MAX, ORIGIN_SIZE, PARAM_SIZE, RETVAL_SIZE};
use crate::depot::OriginHandle;
use crate::error::{InvariantViolation, fatal};

/// Kind of a nesting level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    Task,
    Interrupt,
    SoftIrq,
    Nmi,
    Ist,
    Syscall,
    Exception,
}

impl ContextKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Interrupt => "interrupt",
            Self::SoftIrq => "softirq",
            Self::Nmi => "nmi",
            Self::Ist => "ist",
            Self::Syscall => "syscall",
            Self::Exception => "exception",
        }
    }
}

/// Scratch metadata exchanged between instrumented callers and callees.
///
/// Instrumented code reads and writes it in place, so the layout is fixed.
#[repr(C)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextState {
    pub param: [u8; PARAM_SIZE],
    pub param_origin: [OriginHandle; PARAM_SIZE / ORIGIN_SIZE],
    pub retval: [u8; RETVAL_SIZE],
    pub retval_origin: OriginHandle,
    pub va_arg: [u8; PARAM_SIZE],
    pub va_arg_origin: [OriginHandle; PARAM_SIZE / ORIGIN_SIZE],
    pub va_arg_overflow_size: u64,
    /// Origin of the value currently being produced.
    pub origin: OriginHandle,
}

impl ContextState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            param: [0; PARAM_SIZE],
            param_origin: [OriginHandle::NONE; PARAM_SIZE / ORIGIN_SIZE],
            retval: [0; RETVAL_SIZE],
            retval_origin: OriginHandle::NONE,
            va_arg: [0; PARAM_SIZE],
            va_arg_origin: [OriginHandle::NONE; PARAM_SIZE / ORIGIN_SIZE],
            va_arg_overflow_size: 0,
            origin: OriginHandle::NONE,
        }
    }

    pub fn clear(&mut self) {
        self.param.fill(0);
        self.param_origin.fill(OriginHandle::NONE);
        self.retval.fill(0);
        self.retval_origin = OriginHandle::NONE;
        self.va_arg.fill(0);
        self.va_arg_origin.fill(OriginHandle::NONE);
        self.va_arg_overflow_size = 0;
        self.origin = OriginHandle::NONE;
    }

    #[must_use]
    pub fn is_clear(&self) -> bool {
        *self == Self::new()
    }
}

impl Default for ContextState {
    fn default() -> Self {
        Self::new()
    }
}

/// Task-owned state: level 0 scratch plus reporting flags.
#[derive(Debug)]
pub struct TaskState {
    /// Instrumentation enabled for this task.
    pub enabled: bool,
    /// Cleared while a report is being produced.
    pub allow_reporting: bool,
    /// Set while a report is being produced.
    pub is_reporting: bool,
    pub cstate: Box<ContextState>,
}

impl TaskState {
    fn new() -> Self {
        Self {
            enabled: true,
            allow_reporting: true,
            is_reporting: false,
            cstate: Box::new(ContextState::new()),
        }
    }
}

/// One core's runtime state. See the module docs.
#[derive(Debug)]
pub struct ExecutionContext {
    cpu: usize,
    depth: u32,
    preempt_count: u32,
    irqs_enabled: bool,
    nmi_stopped: bool,
    level: usize,
    in_interrupt: u32,
    in_softirq: bool,
    in_nmi: bool,
    task_syscall: bool,
    kinds: [ContextKind; NESTED_CONTEXT_MAX],
    levels: Box<[ContextState]>,
    task: TaskState,
    call_stack: Vec<u64>,
    dummy: Box<ContextState>,
}

impl ExecutionContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cpu: 0,
            depth: 0,
            preempt_count: 0,
            irqs_enabled: true,
            nmi_stopped: false,
            level: 0,
            in_interrupt: 0,
            in_softirq: false,
            in_nmi: false,
            task_syscall: false,
            kinds: [ContextKind::Task; NESTED_CONTEXT_MAX],
            levels: (0..NESTED_CONTEXT_MAX)
                .map(|_| ContextState::new())
                .collect(),
            task: TaskState::new(),
            call_stack: Vec::new(),
            dummy: Box::new(ContextState::new()),
        }
    }

    #[must_use]
    pub const fn cpu(&self) -> usize {
        self.cpu
    }

    /// Pin this thread to a logical CPU (selects its per-CPU window).
    pub fn bind_cpu(&mut self, cpu: usize) {
        self.cpu = cpu;
    }

    #[must_use]
    pub const fn depth(&self) -> u32 {
        self.depth
    }

    #[must_use]
    pub const fn in_runtime(&self) -> bool {
        self.depth > 0
    }

    #[must_use]
    pub const fn preempt_count(&self) -> u32 {
        self.preempt_count
    }

    #[must_use]
    pub const fn irqs_enabled(&self) -> bool {
        self.irqs_enabled
    }

    #[must_use]
    pub const fn nmi_stopped(&self) -> bool {
        self.nmi_stopped
    }

    #[must_use]
    pub const fn level(&self) -> usize {
        self.level
    }

    /// Kind of the innermost level.
    #[must_use]
    pub const fn current_kind(&self) -> ContextKind {
        self.kinds[self.level]
    }

    #[must_use]
    pub const fn task(&self) -> &TaskState {
        &self.task
    }

    pub fn task_mut(&mut self) -> &mut TaskState {
        &mut self.task
    }

    // Runtime entry bookkeeping, driven by RuntimeGuard.

    pub(crate) fn enter_runtime(&mut self) -> bool {
        if self.depth != 0 {
            fatal(InvariantViolation::RecursiveEntry {
                depth: self.depth + 1,
            });
        }
        self.preempt_count += 1;
        let irqs = std::mem::replace(&mut self.irqs_enabled, false);
        self.nmi_stopped = true;
        self.depth = 1;
        irqs
    }

    pub(crate) fn leave_runtime(&mut self, irqs_were_enabled: bool, unwinding: bool) {
        if self.depth != 1 && !unwinding {
            fatal(InvariantViolation::MismatchedLeave { depth: self.depth });
        }
        self.depth = self.depth.saturating_sub(1);
        self.nmi_stopped = false;
        self.irqs_enabled = irqs_were_enabled;
        self.preempt_count = self.preempt_count.saturating_sub(1);
    }

    // Nested context stack.

    fn push(&mut self, kind: ContextKind) {
        let level = self.level + 1;
        if level >= NESTED_CONTEXT_MAX {
            fatal(InvariantViolation::ContextOverflow { level });
        }
        self.level = level;
        self.kinds[level] = kind;
        self.levels[level].clear();
    }

    fn pop(&mut self, kind: ContextKind) {
        if self.level == 0 {
            fatal(InvariantViolation::ContextUnderflow);
        }
        let innermost = self.kinds[self.level];
        if innermost != kind {
            fatal(InvariantViolation::ContextMismatch {
                expected: innermost.name(),
                found: kind.name(),
            });
        }
        self.levels[self.level].clear();
        self.level -= 1;
    }

    pub fn interrupt_enter(&mut self) {
        // A second, nested hardware interrupt is tolerated; a third is not.
        if self.in_interrupt > 1 {
            fatal(InvariantViolation::NestedContext {
                kind: ContextKind::Interrupt.name(),
                depth: self.in_interrupt,
            });
        }
        self.push(ContextKind::Interrupt);
        self.in_interrupt += 1;
    }

    pub fn interrupt_exit(&mut self) {
        if self.in_interrupt == 0 {
            fatal(InvariantViolation::ContextMismatch {
                expected: self.current_kind().name(),
                found: ContextKind::Interrupt.name(),
            });
        }
        self.pop(ContextKind::Interrupt);
        self.in_interrupt -= 1;
    }

    pub fn softirq_enter(&mut self) {
        if self.in_softirq {
            fatal(InvariantViolation::NestedContext {
                kind: ContextKind::SoftIrq.name(),
                depth: 1,
            });
        }
        self.push(ContextKind::SoftIrq);
        self.in_softirq = true;
    }

    pub fn softirq_exit(&mut self) {
        self.pop(ContextKind::SoftIrq);
        self.in_softirq = false;
    }

    pub fn nmi_enter(&mut self) {
        if self.in_nmi {
            fatal(InvariantViolation::NestedContext {
                kind: ContextKind::Nmi.name(),
                depth: 1,
            });
        }
        self.push(ContextKind::Nmi);
        self.in_nmi = true;
    }

    pub fn nmi_exit(&mut self) {
        self.pop(ContextKind::Nmi);
        self.in_nmi = false;
    }

    pub fn ist_enter(&mut self) {
        self.push(ContextKind::Ist);
    }

    pub fn ist_exit(&mut self) {
        self.pop(ContextKind::Ist);
    }

    pub fn exception_enter(&mut self) {
        self.push(ContextKind::Exception);
    }

    pub fn exception_exit(&mut self) {
        self.pop(ContextKind::Exception);
    }

    /// A syscall from the task level reuses level 0 with wiped scratch; a
    /// syscall issued from a nested context pushes its own level.
    pub fn syscall_enter(&mut self) {
        if self.level == 0 && !self.task_syscall {
            self.task_syscall = true;
            self.task.cstate.clear();
        } else {
            self.push(ContextKind::Syscall);
        }
    }

    pub fn syscall_exit(&mut self) {
        if self.level > 0 && self.kinds[self.level] == ContextKind::Syscall {
            self.pop(ContextKind::Syscall);
        } else if self.level == 0 && self.task_syscall {
            self.task_syscall = false;
        } else {
            fatal(InvariantViolation::ContextMismatch {
                expected: self.current_kind().name(),
                found: ContextKind::Syscall.name(),
            });
        }
    }

    /// Scratch state of the innermost level. Before the engine is ready, or
    /// from inside the runtime, a zeroed throwaway state is returned instead.
    pub fn current_state(&mut self, ready: bool) -> &mut ContextState {
        if !ready || self.in_runtime() {
            self.dummy.clear();
            return &mut self.dummy;
        }
        if self.level == 0 {
            &mut self.task.cstate
        } else {
            &mut self.levels[self.level]
        }
    }

    // Task lifecycle.

    pub fn task_create(&mut self) {
        self.task = TaskState::new();
        self.task_syscall = false;
        self.call_stack.clear();
    }

    pub fn task_exit(&mut self) {
        self.task.cstate.clear();
        self.task.enabled = false;
        self.call_stack.clear();
    }

    // Shadow call stack used for stack capture.

    pub fn func_entry(&mut self, pc: u64) {
        self.call_stack.push(pc);
    }

    pub fn func_exit(&mut self) {
        self.call_stack.pop();
    }

    /// Current stack, innermost frame first, cut after the first frame
    /// inside `irq_entry` so interrupt stacks stay deduplicable.
    #[must_use]
    pub fn stack_frames(&self, irq_entry: Option<(u64, u64)>) -> Vec<u64> {
        let mut frames = Vec::with_capacity(self.call_stack.len().min(MAX_STACK_DEPTH));
        for &pc in self.call_stack.iter().rev().take(MAX_STACK_DEPTH) {
            frames.push(pc);
            if let Some((start, end)) = irq_entry
                && pc >= start
                && pc < end
            {
                break;
            }
        }
        frames
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CONTEXT: RefCell<ExecutionContext> = RefCell::new(ExecutionContext::new());
}

/// Run `f` with the current core's context.
///
/// `f` must not call back into anything that resolves the context again.
pub fn with_context<F, R>(f: F) -> R
where
    F: FnOnce(&mut ExecutionContext) -> R,
{
    CONTEXT.with(|cell| f(&mut cell.borrow_mut()))
}

/// True while the current core is inside a guarded runtime section.
#[must_use]
pub fn in_runtime() -> bool {
    with_context(|ctx| ctx.in_runtime())
}
