//! Process-global reserved address arena (spec.md §4.4, §9).
//!
//! At construction time the physical engine reserves the largest
//! contiguous virtual region it can get from the OS (a doubling-then-
//! halving probe, since reservation never touches physical memory the
//! request is almost always satisfied on the first try) and carves it
//! into `2^⌈log2 K⌉` equal slots, one per potential size class. Slot
//! addresses never change afterwards, which is what lets
//! [`crate::engine::physical`] hand out raw pointers that stay valid
//! across grow/shrink.
//!
//! Only one [`ReservedArena`] may exist per process at a time — two
//! physical-engine handles would otherwise fight over the same
//! just-reserved range. [`ArenaGuard`] enforces that with a single
//! `AtomicBool`.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::InitError;
use crate::os;
use crate::pseudo_heap::PseudoHeap;

static ARENA_TAKEN: AtomicBool = AtomicBool::new(false);

/// Held for the lifetime of the one live [`ReservedArena`] in the
/// process; dropping it releases the slot for a future construction.
struct ArenaGuard;

impl ArenaGuard {
    fn acquire() -> Result<ArenaGuard, InitError> {
        if ARENA_TAKEN.swap(true, Ordering::AcqRel) {
            return Err(InitError::RuntimeAlreadyTaken);
        }
        Ok(ArenaGuard)
    }
}

impl Drop for ArenaGuard {
    fn drop(&mut self) {
        ARENA_TAKEN.store(false, Ordering::Release);
    }
}

pub struct ReservedArena {
    _guard: ArenaGuard,
    base: *mut u8,
    total_size: usize,
    slot_pages: usize,
    num_slots: usize,
}

impl ReservedArena {
    /// Reserves room for `num_classes` size-class slots, each able to
    /// hold up to `n_max` blocks of stride `max_stride` bytes (the
    /// largest representative size plus any per-block id/header bytes
    /// the caller tracks alongside it).
    pub fn new(num_classes: usize, n_max: u64, max_stride: usize) -> Result<ReservedArena, InitError> {
        let guard = ArenaGuard::acquire()?;
        let num_slots = (num_classes.max(1)).next_power_of_two();
        let page = os::page_size();
        let per_class_bytes = (n_max as usize).saturating_mul(max_stride);
        let per_class_bytes = crate::types::align_up(per_class_bytes.max(page), page);
        let desired_total = per_class_bytes.saturating_mul(num_slots);

        let (base, total_size) = Self::probe_reserve(desired_total, page).map_err(|source| {
            InitError::ArenaReservationFailed {
                requested: desired_total,
                source,
            }
        })?;
        let slot_pages = (total_size / num_slots) / page;

        Ok(ReservedArena {
            _guard: guard,
            base,
            total_size,
            slot_pages,
            num_slots,
        })
    }

    /// Tries to reserve `desired` bytes, halving on failure (reservation
    /// failures are vanishingly rare on 64-bit address spaces, but the
    /// probe keeps construction robust on constrained targets).
    fn probe_reserve(desired: usize, page: usize) -> io::Result<(*mut u8, usize)> {
        let mut size = crate::types::align_up(desired.max(page), page);
        loop {
            match os::reserve(size) {
                Ok(base) => return Ok((base, size)),
                Err(e) => {
                    if size <= page {
                        return Err(e);
                    }
                    size = crate::types::align_up((size / 2).max(page), page);
                }
            }
        }
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn slot_pages(&self) -> usize {
        self.slot_pages
    }

    pub fn total_reserved(&self) -> usize {
        self.total_size
    }

    /// Hands out a [`PseudoHeap`] wrapping the `slot_index`'th slot.
    pub fn slot_heap(&self, slot_index: usize) -> PseudoHeap {
        debug_assert!(slot_index < self.num_slots);
        let base = unsafe { self.base.add(slot_index * self.slot_pages * os::page_size()) };
        PseudoHeap::new(base, self.slot_pages)
    }
}

impl Drop for ReservedArena {
    fn drop(&mut self) {
        if let Err(e) = os::release(self.base, self.total_size) {
            log::warn!("failed to release reserved arena at init: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    // `ReservedArena` enforces a process-wide singleton; every test here
    // (and every test elsewhere that constructs a physical-engine
    // `Allocator`) must run mutually exclusive of the others, since
    // `cargo test` runs `#[test]` functions in parallel by default.
    #[test]
    #[serial]
    #[cfg(unix)]
    fn reserves_enough_for_every_class_and_guards_singleton() {
        let arena = ReservedArena::new(4, 64, 256).unwrap();
        assert!(arena.num_slots() >= 4);
        assert_eq!(arena.num_slots(), arena.num_slots().next_power_of_two());
        assert!(arena.slot_pages() > 0);

        let second = ReservedArena::new(4, 64, 256);
        assert!(matches!(second, Err(InitError::RuntimeAlreadyTaken)));

        drop(arena);
        let third = ReservedArena::new(4, 64, 256);
        assert!(third.is_ok());
    }

    #[test]
    #[serial]
    #[cfg(unix)]
    fn slot_addresses_are_stable_and_distinct() {
        let arena = ReservedArena::new(3, 16, 128).unwrap();
        let a = arena.slot_heap(0).address();
        let b = arena.slot_heap(1).address();
        assert_ne!(a, b);
        assert_eq!(arena.slot_heap(0).address(), a);
    }
}
