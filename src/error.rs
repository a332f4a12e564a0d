//! Setup-time failures.
//!
//! Per spec.md §7, only two things are ever reported through `Result`: bad
//! configuration caught in `init` before any process-global state has been
//! touched, and failures standing up the variant-2 kernel service
//! connection. Everything else — operating on a handle after construction —
//! is a programming-bug-or-fatal-OS-failure per spec.md §7.1/§7.2 and is
//! reported with `panic!`, not `Result`, matching the `void`-returning API
//! in spec.md §6.1.

use thiserror::Error;

/// Failure constructing an [`crate::engine::physical::Allocator`] or
/// [`crate::engine::virtual_engine::Allocator`].
#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("failed to reserve the {requested} byte virtual arena: {source}")]
    ArenaReservationFailed {
        requested: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("a Multiheap-fit runtime already exists in this process; only one handle's worth of process-global state (reserved arena, pool/garbage lists) is supported at a time")]
    RuntimeAlreadyTaken,

    #[error("kernel page service unavailable: {0}")]
    PageServiceUnavailable(#[source] std::io::Error),
}
