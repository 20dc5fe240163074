//! The engine instance.
//!
//! [`Sanitizer`] ties together the metadata space, the metadata pool, the
//! provenance store and the reporter. Its operations are spread over the
//! `locator`, `lifecycle`, `propagate` and `report` modules; this file holds
//! construction, shared helpers and the execution-context hooks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::config::{ConfigError, EngineConfig, PAGE_SIZE};
use crate::context::{ContextState, with_context};
use crate::depot::{InMemoryDepot, OriginHandle, StackDepot};
use crate::error::{self, InvariantViolation};
use crate::guard::RuntimeGuard;
use crate::locator::MetaSpace;
use crate::log::{EventLog, EventRecord, LogLevel};
use crate::meta::MetaPool;
use crate::metrics::EngineMetrics;
use crate::origin::{self, OriginCause, OriginRecord};
use crate::report::{ReportSink, Reporter, StderrSink};

/// Shadow/origin metadata engine.
pub struct Sanitizer {
    pub(crate) config: EngineConfig,
    pub(crate) space: MetaSpace,
    pub(crate) pool: MetaPool,
    pub(crate) depot: Arc<dyn StackDepot>,
    pub(crate) reporter: Reporter,
    pub(crate) metrics: EngineMetrics,
    pub(crate) events: EventLog,
    pub(crate) ready: AtomicBool,
    pub(crate) future_ranges: Mutex<Vec<(u64, u64)>>,
}

impl Sanitizer {
    /// Build an engine with an in-memory provenance store.
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        let depot = Arc::new(InMemoryDepot::new(config.depot_capacity));
        Self::with_depot(config, depot)
    }

    /// Build an engine on top of an external provenance store.
    pub fn with_depot(
        config: EngineConfig,
        depot: Arc<dyn StackDepot>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let reporter = Reporter::new(config.report_policy, config.dedupe_reports);
        if config.stderr_reports {
            reporter.add_sink(Arc::new(StderrSink));
        }
        Ok(Self {
            space: MetaSpace::new(&config),
            pool: MetaPool::new(config.meta_page_limit),
            depot,
            reporter,
            metrics: EngineMetrics::new(),
            events: EventLog::new(config.event_capacity),
            ready: AtomicBool::new(false),
            future_ranges: Mutex::new(Vec::new()),
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    #[must_use]
    pub fn depot(&self) -> &dyn StackDepot {
        self.depot.as_ref()
    }

    /// Metadata pages currently held by the lifecycle manager.
    #[must_use]
    pub fn meta_pages_in_use(&self) -> usize {
        self.pool.used()
    }

    /// True once [`Self::initialize`] has run.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn add_sink(&self, sink: Arc<dyn ReportSink>) {
        self.reporter.add_sink(sink);
    }

    /// Log `violation` and halt.
    #[cold]
    #[track_caller]
    pub(crate) fn fatal(&self, violation: InvariantViolation) -> ! {
        self.events.record(
            EventRecord::new(LogLevel::Fatal, "invariant_violation")
                .with_details(serde_json::json!({ "violation": violation.to_string() })),
        );
        error::fatal(violation)
    }

    /// Save the current stack as a root origin.
    pub(crate) fn save_stack(&self, cause: OriginCause) -> OriginHandle {
        let frames = with_context(|ctx| ctx.stack_frames(self.config.irq_entry_text));
        self.store_record(&OriginRecord::Stack { cause, frames })
    }

    pub(crate) fn store_record(&self, record: &OriginRecord) -> OriginHandle {
        match origin::store(self.depot.as_ref(), record) {
            Some(h) => h,
            None => {
                EngineMetrics::inc(&self.metrics.depot_full);
                OriginHandle::NONE
            }
        }
    }

    /// Guard for an instrumentation hook, or `None` if the hook must be
    /// skipped: engine not ready, task disabled, or already in the runtime.
    pub(crate) fn enter_hook(&self) -> Option<RuntimeGuard> {
        if !self.is_ready() || !with_context(|ctx| ctx.task().enabled) {
            return None;
        }
        RuntimeGuard::try_enter()
    }

    /// First address of page `pfn` in the direct map.
    #[must_use]
    pub fn page_addr(&self, pfn: usize) -> u64 {
        self.config.direct_map_base + (pfn * PAGE_SIZE) as u64
    }

    /// Direct-map page holding `addr`.
    #[must_use]
    pub fn pfn_of(&self, addr: u64) -> Option<usize> {
        if addr < self.config.direct_map_base || addr >= self.config.direct_map_end() {
            return None;
        }
        Some(((addr - self.config.direct_map_base) / PAGE_SIZE as u64) as usize)
    }

    pub(crate) fn check_pages(&self, pfn: usize, pages: usize) {
        let end = pfn.saturating_add(pages);
        if end > self.config.direct_map_pages {
            self.fatal(InvariantViolation::PageOutOfRange { pfn, end });
        }
    }

    // Execution-context hooks. Each nested entry gets fresh scratch state.

    pub fn interrupt_enter(&self) {
        with_context(|ctx| ctx.interrupt_enter());
    }

    pub fn interrupt_exit(&self) {
        with_context(|ctx| ctx.interrupt_exit());
    }

    pub fn softirq_enter(&self) {
        with_context(|ctx| ctx.softirq_enter());
    }

    pub fn softirq_exit(&self) {
        with_context(|ctx| ctx.softirq_exit());
    }

    pub fn nmi_enter(&self) {
        with_context(|ctx| ctx.nmi_enter());
    }

    pub fn nmi_exit(&self) {
        with_context(|ctx| ctx.nmi_exit());
    }

    pub fn ist_enter(&self) {
        with_context(|ctx| ctx.ist_enter());
    }

    pub fn ist_exit(&self) {
        with_context(|ctx| ctx.ist_exit());
    }

    pub fn syscall_enter(&self) {
        with_context(|ctx| ctx.syscall_enter());
    }

    pub fn syscall_exit(&self) {
        with_context(|ctx| ctx.syscall_exit());
    }

    pub fn exception_enter(&self) {
        with_context(|ctx| ctx.exception_enter());
    }

    pub fn exception_exit(&self) {
        with_context(|ctx| ctx.exception_exit());
    }

    /// Run `f` on the current level's scratch state. Before the engine is
    /// ready, or inside the runtime, `f` sees a zeroed throwaway state.
    pub fn with_context_state<R>(&self, f: impl FnOnce(&mut ContextState) -> R) -> R {
        let ready = self.is_ready();
        with_context(|ctx| f(ctx.current_state(ready)))
    }

    /// Address of the current level's scratch state, for instrumented code
    /// that accesses it in place. Stays valid until the level is left or the
    /// task is recreated. Before the engine is ready, or inside the runtime,
    /// this is a zeroed throwaway state.
    pub fn context_state_ptr(&self) -> *mut ContextState {
        self.with_context_state(|st| std::ptr::from_mut(st))
    }

    pub fn task_create(&self) {
        with_context(|ctx| ctx.task_create());
    }

    pub fn task_exit(&self) {
        with_context(|ctx| ctx.task_exit());
    }

    /// Stop instrumenting the current task.
    pub fn disable_current(&self) {
        with_context(|ctx| ctx.task_mut().enabled = false);
    }

    pub fn enable_current(&self) {
        with_context(|ctx| ctx.task_mut().enabled = true);
    }

    pub fn func_entry(&self, pc: u64) {
        with_context(|ctx| ctx.func_entry(pc));
    }

    pub fn func_exit(&self) {
        with_context(|ctx| ctx.func_exit());
    }

    /// Bind the calling thread to core `cpu` (selects its per-CPU window).
    pub fn bind_cpu(&self, cpu: usize) {
        with_context(|ctx| ctx.bind_cpu(cpu));
    }
}

impl std::fmt::Debug for Sanitizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sanitizer")
            .field("ready", &self.is_ready())
            .field("direct_map_pages", &self.config.direct_map_pages)
            .field("meta_pages_in_use", &self.pool.used())
            .field("depot_records", &self.depot.len())
            .finish()
    }
}
