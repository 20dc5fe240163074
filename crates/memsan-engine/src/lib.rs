//! Shadow/origin metadata engine for memsan.
//!
//! Tracks, for every byte of tracked memory, whether it holds a definitely
//! initialized value and, if not, where the uninitialized value came from.
//! Instrumentation hooks call into a [`Sanitizer`]; the host allocator calls
//! its lifecycle hooks.
//!
//! # Architecture
//!
//! - **Locator** (`locator`): address to shadow/origin translation over
//!   virtual regions, per-CPU windows and the page-backed direct map
//! - **Lifecycle** (`lifecycle`): paired shadow+origin allocation, free,
//!   split, copy and virtual mappings
//! - **Propagation** (`propagate`): poison, unpoison, check, metadata copy
//!   and origin chaining
//! - **Provenance** (`origin`, `depot`): chain records over a
//!   content-addressed stack store
//! - **Runtime context** (`context`, `guard`): per-core reentrancy guard and
//!   nested execution-context stack
//! - **Reporting** (`report`): report formatting, dedupe and sinks
//! - **Configuration** (`config`), **metrics** (`metrics`) and the
//!   structured event log (`log`)

#![deny(unsafe_code)]

pub mod config;
pub mod context;
pub mod depot;
pub mod engine;
pub mod error;
pub mod guard;
pub mod lifecycle;
pub mod locator;
pub mod log;
pub mod meta;
pub mod metrics;
pub mod origin;
pub mod propagate;
pub mod report;

pub use config::{EngineConfig, ReportPolicy};
pub use context::{ContextKind, ContextState};
pub use depot::{InMemoryDepot, OriginHandle, StackDepot};
pub use engine::Sanitizer;
pub use error::{InvariantViolation, MetaAllocError};
pub use guard::RuntimeGuard;
pub use lifecycle::{AllocFlags, AllocStatus};
pub use locator::{MetaKind, ShadowOriginPtr};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use report::{MemorySink, Report, ReportReason, ReportSink};
