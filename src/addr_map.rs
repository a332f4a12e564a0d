//! Address-mapping module (spec.md §4.7, variant 2 only).
//!
//! Reserves one virtual window of `2 · P_max` page-sized slots (spec.md
//! describes two windows of that size; with no second purpose named for
//! it and `main_index`/`sub_index` together only ever needing `2·P_max`
//! distinct slots, this implementation uses the one reservation those
//! formulas actually require — see `DESIGN.md`). `main_index(pid)` is
//! the primary mapping of physical page `pid`; `sub_index(pid)` is the
//! slot immediately after it, used to map `pid`'s linked successor so a
//! write straddling the page boundary lands on the right physical page
//! without the user-visible address ever changing.

use std::io;

use crate::kernel_service::PageService;
use crate::os;

pub struct AddressMap {
    base: *mut u8,
    page_size: usize,
    p_max: u32,
}

impl AddressMap {
    pub fn new(p_max: u32, page_size: usize) -> io::Result<AddressMap> {
        let total = (p_max as usize) * 2 * page_size;
        let base = os::reserve(crate::types::align_up(total.max(page_size), os::page_size()))?;
        Ok(AddressMap { base, page_size, p_max })
    }

    #[inline]
    pub fn main_index(pid: u32) -> usize {
        2 * pid as usize
    }

    #[inline]
    pub fn sub_index(pid: u32) -> usize {
        2 * pid as usize + 1
    }

    fn slot_addr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < 2 * self.p_max as usize);
        unsafe { self.base.add(index * self.page_size) }
    }

    /// The (stable, never-moving) user-visible address of physical page
    /// `pid`'s primary mapping — this is the pointer `dereference`
    /// arithmetic is based on.
    pub fn main_addr(&self, pid: u32) -> *mut u8 {
        self.slot_addr(Self::main_index(pid))
    }

    /// Maps `pid`'s physical page at its main slot.
    pub fn map_main(&mut self, pid: u32, svc: &mut impl PageService) -> io::Result<*mut u8> {
        let addr = self.main_addr(pid);
        svc.map_page(pid, addr)?;
        Ok(addr)
    }

    /// `set_next(pid, next)`: maps `next`'s physical page into `pid`'s
    /// sub slot, so writes overflowing `pid`'s main mapping fall through
    /// onto `next`.
    pub fn set_next(&mut self, pid: u32, next: u32, svc: &mut impl PageService) -> io::Result<()> {
        let addr = self.slot_addr(Self::sub_index(pid));
        svc.map_page(next, addr)
    }

    /// `reset_next(pid)`: replaces the sub slot with an inaccessible
    /// reservation, undoing [`AddressMap::set_next`].
    pub fn reset_next(&mut self, pid: u32, svc: &mut impl PageService) -> io::Result<()> {
        let addr = self.slot_addr(Self::sub_index(pid));
        svc.unmap(addr, self.page_size)
    }

    pub fn byte_len(&self) -> usize {
        2 * self.p_max as usize * self.page_size
    }
}

impl Drop for AddressMap {
    fn drop(&mut self) {
        let total = 2 * self.p_max as usize * self.page_size;
        if let Err(e) = os::release(self.base, crate::types::align_up(total, os::page_size())) {
            log::warn!("failed to release address-mapping window: {e}");
        }
    }
}
