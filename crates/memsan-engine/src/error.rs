//! Error taxonomy.
//!
//! Three classes of failure exist:
//! - [`MetaAllocError`]: transient exhaustion of the metadata pool. Handled
//!   locally by degrading the affected region to untracked.
//! - Detected uninitialized use: not an error at all, surfaced as a report.
//! - [`InvariantViolation`]: the internal model is corrupt. Always fatal,
//!   raised through [`fatal`].

use std::cell::Cell;

use thiserror::Error;

/// A broken internal invariant. Never returned to the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("illegal recursive entry into the runtime (depth {depth})")]
    RecursiveEntry { depth: u32 },
    #[error("runtime leave without matching enter (depth {depth})")]
    MismatchedLeave { depth: u32 },
    #[error("execution context stack overflow (level {level})")]
    ContextOverflow { level: usize },
    #[error("execution context stack underflow")]
    ContextUnderflow,
    #[error("{found} exit while the innermost context is {expected}")]
    ContextMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("{kind} context entered while already nested {depth} deep")]
    NestedContext { kind: &'static str, depth: u32 },
    #[error("metadata present on {present} of {total} pages starting at pfn {pfn}")]
    MixedMetadata {
        pfn: usize,
        present: usize,
        total: usize,
    },
    #[error("page {pfn} freed while not allocated")]
    DoubleFree { pfn: usize },
    #[error("page {pfn} allocated while already allocated")]
    DoubleAlloc { pfn: usize },
    #[error("metadata of page {pfn} released twice")]
    MetadataDoubleFree { pfn: usize },
    #[error("order {order} at pfn {pfn} does not match a metadata block of {pages} pages")]
    OrderMismatch { pfn: usize, order: u32, pages: usize },
    #[error("pages {pfn}..{end} are outside the direct map")]
    PageOutOfRange { pfn: usize, end: usize },
    #[error("metadata for access of size {size} at {addr:#x} is not contiguous")]
    Discontiguous { addr: u64, size: usize },
    #[error("access of size {size} at {addr:#x} exceeds one page")]
    OversizedAccess { addr: u64, size: usize },
    #[error("range starting at {start:#x} with length {len} wraps the address space")]
    AddressOverflow { start: u64, len: usize },
    #[error("{start:#x}..{end:#x} is not a page-aligned range inside a virtual region")]
    InvalidRange { start: u64, end: u64 },
    #[error("address {addr:#x} is not page aligned")]
    UnalignedPage { addr: u64 },
}

/// The metadata pool could not satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MetaAllocError {
    #[error("metadata pool exhausted: {requested} pages requested, {available} available")]
    Exhausted { requested: usize, available: usize },
}

thread_local! {
    static FATAL_HITS: Cell<u64> = const { Cell::new(0) };
}

/// Number of times the fatal path fired on the current thread.
#[must_use]
pub fn fatal_hits() -> u64 {
    FATAL_HITS.with(Cell::get)
}

/// Halt on a broken invariant.
///
/// The host is expected to run with unwinding disabled or to treat the
/// unwind as termination; nothing in the engine catches it.
#[cold]
#[track_caller]
pub fn fatal(violation: InvariantViolation) -> ! {
    FATAL_HITS.with(|hits| hits.set(hits.get() + 1));
    panic!("memsan: fatal: {violation}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let v = InvariantViolation::MixedMetadata {
            pfn: 8,
            present: 1,
            total: 4,
        };
        assert_eq!(
            v.to_string(),
            "metadata present on 1 of 4 pages starting at pfn 8"
        );
        let e = MetaAllocError::Exhausted {
            requested: 2,
            available: 1,
        };
        assert!(e.to_string().contains("2 pages requested"));
    }

    #[test]
    fn fatal_counts_and_panics() {
        let before = fatal_hits();
        let result = std::panic::catch_unwind(|| fatal(InvariantViolation::ContextUnderflow));
        assert!(result.is_err());
        assert_eq!(fatal_hits(), before + 1);
    }
}
