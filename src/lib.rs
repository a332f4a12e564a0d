//! Multiheap-fit: a space-saving, relocating allocator for caller-owned,
//! application-indexed blocks.
//!
//! Clients register at most `N_max` logical blocks with sizes in
//! `[S_min, S_max]`. The allocator hands back a currently-valid address
//! on demand and is free to relocate any block whenever another is
//! freed — one segregated "pseudo-heap" per size class, each a dense
//! array of equally-sized slots, compacted on every free by swapping the
//! last live slot into the freed one. See [`engine::physical`] (variant
//! 1, OS-page-backed) and [`engine::virtual_engine`] (variant 2,
//! kernel-page-service-backed).

pub mod addr_map;
pub mod arena;
pub mod bits;
pub mod block_info;
pub mod engine;
pub mod error;
pub mod kernel_service;
pub mod os;
pub mod page_info;
pub mod page_recycle;
pub mod pseudo_heap;
pub mod size_class;
pub mod stats;
pub mod types;

use types::BlockId;

/// The allocator contract both engine variants implement (spec.md §6.1).
///
/// Precondition violations (bad length, operating on a block in the
/// wrong live/free state) and unrecoverable OS failures both `panic!`
/// rather than return `Result` — per spec.md §7, this allocator holds
/// process-global mappings and compacting invariants that cannot be
/// rolled back, so there is nothing a caller could do with a recoverable
/// error that `panic!` doesn't already do better.
pub trait Multiheap {
    /// Registers `id` as holding `length` bytes. `id` must currently be
    /// free and `length` must lie in `[S_min, S_max]`.
    fn allocate(&mut self, id: BlockId, length: usize);

    /// Frees `id`, which must currently be live. May relocate one other
    /// live block (the one compacted into `id`'s old slot).
    fn deallocate(&mut self, id: BlockId);

    /// Resizes `id` in place (logically — the block may relocate).
    /// A no-op if `new_length` maps to the same size class.
    fn reallocate(&mut self, id: BlockId, new_length: usize);

    /// The current address of `id`'s payload, or null if `id` is free.
    fn dereference(&self, id: BlockId) -> *mut u8;

    /// `const`-qualified twin of [`Multiheap::dereference`].
    fn dereference_const(&self, id: BlockId) -> *const u8;

    /// `id`'s internal (class-rounded) size, or 0 if free.
    fn length(&self, id: BlockId) -> usize;

    /// Single-lookup combination of [`Multiheap::dereference`] and
    /// [`Multiheap::length`].
    fn dereference_and_length(&self, id: BlockId) -> (*mut u8, usize);

    /// Total bytes currently used by this handle's components,
    /// including retained pool and garbage.
    fn using_mem(&self) -> usize;
}
