// Raw-pointer hooks document their contracts individually; the rest take
// plain integers.
#![allow(clippy::missing_safety_doc)]
//! # memsan-abi
//!
//! `extern "C"` hook surface for the memsan engine.
//!
//! This crate produces a `cdylib` (`libmemsan.so`) exporting the `memsan_*`
//! symbols that instrumented code, entry code and the host allocator call.
//! Every hook resolves the process-wide [`memsan_engine::Sanitizer`] installed
//! by `memsan_init` and forwards to it.
//!
//! # Architecture
//!
//! ```text
//! instrumented code -> hook (this crate) -> engine state -> Sanitizer -> metadata
//! ```
//!
//! Hooks called before `memsan_init` do nothing and return a neutral value;
//! metadata pointer hooks hand out scratch storage. Engine invariant
//! violations abort the process.

mod macros;

pub mod engine_state;

pub mod context_abi;
pub mod instrument_abi;
pub mod lifecycle_abi;
pub mod propagate_abi;

pub use instrument_abi::MemsanMetaPtrs;
