//! Variant 1 (spec.md §4.8 V1 branches): each size class's pseudo-heap is
//! a contiguous slice of a process-reserved virtual arena
//! ([`crate::arena::ReservedArena`]), grown and shrunk in whole pages.
//!
//! Slot layout is `[header: id_byte bytes][payload: class size bytes]`;
//! the header holds the occupying block's id, which is what lets
//! `deallocate` find out which block to relocate during compaction
//! without a separate reverse-lookup table (spec.md §4.8: "write `b`
//! into the new slot's header").

use log::{debug, warn};

use crate::arena::ReservedArena;
use crate::bits::{get_field, put_field};
use crate::block_info::{BlockInfoTable, LocationLayout};
use crate::error::InitError;
use crate::os;
use crate::page_recycle::PageRecycle;
use crate::pseudo_heap::PseudoHeap;
use crate::size_class::{SizeClassMode, SizeClassTable};
use crate::stats::Stats;
use crate::types::{BlockId, SizeClass};
use crate::Multiheap;

/// Default geometric-table shape used by [`Allocator::init`]'s plain
/// four-argument constructor — chosen to keep the number of size
/// classes (and therefore reserved arena slots) small regardless of how
/// wide `[S_min, S_max]` is. Callers that need a different spacing
/// (exact per-byte classes, a different growth rate) use
/// [`Allocator::with_mode`].
const DEFAULT_GROWTH: f64 = 0.125;
const DEFAULT_MAX_CLASSES: usize = 256;

/// `init`'s configuration quadruple (spec.md §4.8), kept around on the
/// handle for diagnostics and to size the pool/garbage retention caps.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub s_min: usize,
    pub s_max: usize,
    pub n_max: u32,
    pub b_max: usize,
}

pub struct Allocator {
    cfg: Config,
    sizes: SizeClassTable,
    id_byte: u8,
    /// Per live class (index `class.heap_index()`): its pseudo-heap,
    /// slot stride (`id_byte + class size`), and live slot count.
    heaps: Vec<PseudoHeap>,
    strides: Vec<usize>,
    live_counts: Vec<u32>,
    info: BlockInfoTable,
    recycle: PageRecycle,
    /// Also holds the process-wide single-arena guard and releases the
    /// reservation on `Drop`.
    arena: ReservedArena,
    stats: Stats,
}

impl Allocator {
    /// `init(S_min, S_max, N_max, B_max)` (spec.md §4.8), using a
    /// geometric size-class spacing sized to stay well under
    /// [`DEFAULT_MAX_CLASSES`].
    pub fn init(s_min: usize, s_max: usize, n_max: u32, b_max: usize) -> Result<Allocator, InitError> {
        let align = std::mem::size_of::<usize>().min(s_min.max(1));
        let mode = SizeClassMode::Geometric {
            classes: DEFAULT_MAX_CLASSES,
            growth: DEFAULT_GROWTH,
            align,
        };
        Self::with_mode(s_min, s_max, n_max, b_max, mode)
    }

    /// As [`Allocator::init`], but with an explicit size-class spacing —
    /// mainly useful for tests that want `Exact` classes or a tighter
    /// geometric table than the default.
    pub fn with_mode(
        s_min: usize,
        s_max: usize,
        n_max: u32,
        b_max: usize,
        mode: SizeClassMode,
    ) -> Result<Allocator, InitError> {
        if !(s_min > 0 && s_min <= s_max) {
            return Err(InitError::InvalidConfig("require 0 < S_min <= S_max"));
        }
        if n_max == 0 {
            return Err(InitError::InvalidConfig("N_max must be >= 1"));
        }

        let sizes = SizeClassTable::build(mode, s_min, s_max);
        let max_class = sizes.size_to_class(s_max);
        let num_classes = max_class.0 as usize;

        let id_byte = crate::bits::required_bytes((n_max.saturating_sub(1)) as u64);
        let strides: Vec<usize> = (1..=num_classes as u32)
            .map(|c| id_byte as usize + sizes.class_to_size(SizeClass(c)))
            .collect();
        let max_stride = *strides.iter().max().unwrap();

        let arena = ReservedArena::new(num_classes, n_max as u64, max_stride)?;
        let heaps = (0..num_classes).map(|i| arena.slot_heap(i)).collect();

        let info = BlockInfoTable::new(
            n_max,
            num_classes as u32,
            LocationLayout::Slot { offset_bytes: id_byte },
        );

        let pool_garbage_cap_pages = (b_max / os::page_size() / 8).clamp(1, 4096);

        let mut allocator = Allocator {
            cfg: Config {
                s_min,
                s_max,
                n_max,
                b_max,
            },
            sizes,
            id_byte,
            heaps,
            strides,
            live_counts: vec![0u32; num_classes],
            info,
            recycle: PageRecycle::new(pool_garbage_cap_pages, pool_garbage_cap_pages),
            arena,
            stats: Stats::default(),
        };

        // warmup allocate/free pair at the maximum size (spec.md §4.8),
        // pre-paging the largest class's heap and touching every table.
        let warmup_id = BlockId(n_max - 1);
        allocator.allocate(warmup_id, s_max);
        allocator.deallocate(warmup_id);

        debug!(
            "multiheap-fit physical engine initialized: {} classes, {} bytes reserved",
            num_classes,
            allocator.arena.total_reserved()
        );
        Ok(allocator)
    }

    pub fn config(&self) -> Config {
        self.cfg
    }

    /// A diagnostics snapshot (SPEC_FULL.md §1.2). Unlike `live_blocks`
    /// (tracked incrementally in `allocate`/`deallocate` so its peak
    /// survives across calls), the byte-count fields are recomputed
    /// fresh from current component state on every call rather than
    /// threaded through every grow/shrink/recycle call site, so `peak`
    /// on those fields always equals `current`.
    pub fn stats(&self) -> Stats {
        let mut stats = self.stats;
        let page = os::page_size();
        stats.reserved = crate::stats::StatCount {
            current: self.arena.total_reserved() as i64,
            peak: self.arena.total_reserved() as i64,
            ..Default::default()
        };
        let committed_bytes: usize = self.heaps.iter().map(PseudoHeap::using_mem).sum();
        stats.committed = crate::stats::StatCount {
            current: committed_bytes as i64,
            peak: committed_bytes as i64,
            ..Default::default()
        };
        let pool_bytes = (self.recycle.pool_pages_used() * page) as i64;
        stats.pool = crate::stats::StatCount {
            current: pool_bytes,
            peak: pool_bytes,
            ..Default::default()
        };
        let garbage_bytes = (self.recycle.garbage_pages_used() * page) as i64;
        stats.garbage = crate::stats::StatCount {
            current: garbage_bytes,
            peak: garbage_bytes,
            ..Default::default()
        };
        let table_bytes = self.info.byte_len() as i64;
        stats.tables = crate::stats::StatCount {
            current: table_bytes,
            peak: table_bytes,
            ..Default::default()
        };
        stats
    }

    fn class_of(&self, length: usize) -> SizeClass {
        assert!(
            length >= self.cfg.s_min && length <= self.cfg.s_max,
            "length {} out of configured range [{}, {}]",
            length,
            self.cfg.s_min,
            self.cfg.s_max
        );
        self.sizes.size_to_class(length)
    }

    fn read_header(&self, heap_idx: usize, slot: u32) -> BlockId {
        let stride = self.strides[heap_idx];
        let len = (slot as usize + 1) * stride;
        let s = unsafe { std::slice::from_raw_parts(self.heaps[heap_idx].address(), len) };
        BlockId(get_field(s, slot as usize * stride, self.id_byte) as u32)
    }

    fn write_header(&mut self, heap_idx: usize, slot: u32, id: BlockId) {
        let stride = self.strides[heap_idx];
        let len = (slot as usize + 1) * stride;
        let s = unsafe { std::slice::from_raw_parts_mut(self.heaps[heap_idx].address(), len) };
        put_field(s, slot as usize * stride, self.id_byte, id.0 as u64);
    }

    fn copy_slot(&mut self, heap_idx: usize, from_slot: u32, to_slot: u32) {
        if from_slot == to_slot {
            return;
        }
        let stride = self.strides[heap_idx];
        let len = (from_slot.max(to_slot) as usize + 1) * stride;
        let s = unsafe { std::slice::from_raw_parts_mut(self.heaps[heap_idx].address(), len) };
        let (from_off, to_off) = (from_slot as usize * stride, to_slot as usize * stride);
        s.copy_within(from_off..from_off + stride, to_off);
    }

    fn payload_ptr(&self, heap_idx: usize, slot: u32) -> *mut u8 {
        let stride = self.strides[heap_idx];
        unsafe {
            self.heaps[heap_idx]
                .address()
                .add(slot as usize * stride + self.id_byte as usize)
        }
    }

    /// Appends `id` as a new slot of `class`, returning its payload
    /// address. Does not touch whatever `id`'s previous location was —
    /// callers (`allocate`, `reallocate`) are responsible for that.
    fn place_in_class(&mut self, id: BlockId, class: SizeClass) -> *mut u8 {
        let heap_idx = class.heap_index();
        let slot = self.live_counts[heap_idx];
        if slot == 0 {
            // heap was empty; clear any pool accounting entry for it (the
            // pages themselves, if any, are already committed).
            self.recycle.take_pool(heap_idx);
        }
        let needed_bytes = (slot as usize + 1) * self.strides[heap_idx];
        let committed_before = self.heaps[heap_idx].committed_pages();
        self.heaps[heap_idx]
            .grow(needed_bytes)
            .unwrap_or_else(|e| panic!("OS page commit failed growing size-class heap {heap_idx}: {e}"));
        if self.heaps[heap_idx].committed_pages() != committed_before {
            self.stats.map_calls.increase(1);
        }
        // growing back into a previously trimmed tail (spec.md §4.5: "a
        // subsequent grow... splices the garbage back in") consumes
        // whatever retained slack this heap was credited with; drop the
        // accounting entry so a later shrink of some other class doesn't
        // evict a record of pages this heap may already be using again.
        self.recycle.take_garbage(heap_idx);

        self.write_header(heap_idx, slot, id);
        self.info.set_size_class(id, class);
        self.info.set_slot(id, slot);
        self.live_counts[heap_idx] = slot + 1;
        self.payload_ptr(heap_idx, slot)
    }

    /// Removes whichever block currently occupies `(class, slot)` by
    /// compacting the last live slot into its place (spec.md §4.8's
    /// `deallocate`/V1 branch), then trims the heap.
    fn evict_slot(&mut self, class: SizeClass, slot: u32) {
        let heap_idx = class.heap_index();
        let last_slot = self.live_counts[heap_idx] - 1;
        if slot != last_slot {
            let moved_id = self.read_header(heap_idx, last_slot);
            self.copy_slot(heap_idx, last_slot, slot);
            self.info.set_slot(moved_id, slot);
        }
        self.live_counts[heap_idx] = last_slot;
        self.shrink_heap_after_removal(heap_idx);
    }

    fn shrink_heap_after_removal(&mut self, heap_idx: usize) {
        let stride = self.strides[heap_idx];
        let live = self.live_counts[heap_idx];
        let needed_bytes = live as usize * stride;

        if live == 0 {
            let pages = self.heaps[heap_idx].committed_pages();
            if !self.recycle.offer_pool(heap_idx, pages) {
                self.force_shrink_to_live(heap_idx);
            }
            return;
        }

        let committed_pages = self.heaps[heap_idx].committed_pages();
        let target_pages = needed_bytes.div_ceil(os::page_size());
        if target_pages >= committed_pages {
            return;
        }
        let trim_pages = committed_pages - target_pages;
        let evicted = self.recycle.offer_garbage(heap_idx, trim_pages);
        for (other_idx, _pages) in evicted {
            self.force_shrink_to_live(other_idx);
        }
    }

    /// Decommits `heap_idx`'s pseudo-heap down to exactly what its
    /// current live-slot count needs. Called when garbage/pool
    /// accounting refuses or evicts a retained range.
    fn force_shrink_to_live(&mut self, heap_idx: usize) {
        let needed_bytes = self.live_counts[heap_idx] as usize * self.strides[heap_idx];
        let committed_before = self.heaps[heap_idx].committed_pages();
        if let Err(e) = self.heaps[heap_idx].shrink(needed_bytes) {
            warn!("failed to decommit size-class heap {heap_idx}: {e}");
        } else if self.heaps[heap_idx].committed_pages() != committed_before {
            self.stats.map_calls.increase(1);
        }
    }
}

impl Multiheap for Allocator {
    fn allocate(&mut self, id: BlockId, length: usize) {
        assert!(id.0 < self.cfg.n_max, "block id {id} out of [0, N_max) range");
        assert!(
            self.info.size_class(id).is_free(),
            "allocate called on already-live block {id}"
        );
        let class = self.class_of(length);
        self.place_in_class(id, class);
        self.stats.live_blocks.increase(1);
    }

    fn deallocate(&mut self, id: BlockId) {
        let class = self.info.size_class(id);
        assert!(!class.is_free(), "deallocate called on already-free block {id}");
        let slot = self.info.slot(id);
        self.evict_slot(class, slot);
        self.info.set_size_class(id, SizeClass::FREE);
        self.stats.live_blocks.decrease(1);
    }

    fn reallocate(&mut self, id: BlockId, new_length: usize) {
        let cur_class = self.info.size_class(id);
        assert!(!cur_class.is_free(), "reallocate called on free block {id}");
        let new_class = self.class_of(new_length);
        if new_class == cur_class {
            return;
        }

        let old_heap_idx = cur_class.heap_index();
        let old_slot = self.info.slot(id);
        let old_ptr = self.payload_ptr(old_heap_idx, old_slot);
        let old_size = self.sizes.class_to_size(cur_class);

        let new_ptr = self.place_in_class(id, new_class);
        let copy_len = old_size.min(self.sizes.class_to_size(new_class));
        unsafe {
            std::ptr::copy_nonoverlapping(old_ptr, new_ptr, copy_len);
        }
        self.evict_slot(cur_class, old_slot);
    }

    fn dereference(&self, id: BlockId) -> *mut u8 {
        let class = self.info.size_class(id);
        if class.is_free() {
            return std::ptr::null_mut();
        }
        let slot = self.info.slot(id);
        self.payload_ptr(class.heap_index(), slot)
    }

    fn dereference_const(&self, id: BlockId) -> *const u8 {
        self.dereference(id) as *const u8
    }

    fn length(&self, id: BlockId) -> usize {
        let class = self.info.size_class(id);
        if class.is_free() {
            0
        } else {
            self.sizes.class_to_size(class)
        }
    }

    fn dereference_and_length(&self, id: BlockId) -> (*mut u8, usize) {
        (self.dereference(id), self.length(id))
    }

    fn using_mem(&self) -> usize {
        let heaps: usize = self.heaps.iter().map(PseudoHeap::using_mem).sum();
        heaps + self.info.byte_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    // Every test in this module constructs a physical `Allocator`, which
    // takes the process-wide `ReservedArena` singleton; `#[serial]` keeps
    // them from racing each other (or the tests in `crate::arena`) under
    // `cargo test`'s default parallel execution.

    fn small_allocator() -> Allocator {
        Allocator::init(1, 2048, 16, 32768).unwrap()
    }

    #[test]
    #[serial]
    fn s1_hello_world() {
        let mut a = small_allocator();
        a.allocate(BlockId(0), 1024);
        a.allocate(BlockId(1), 1024);
        let msg = b"Hello World\0";
        unsafe {
            std::ptr::copy_nonoverlapping(msg.as_ptr(), a.dereference(BlockId(1)), msg.len());
        }
        a.deallocate(BlockId(0));
        let p = a.dereference(BlockId(1));
        let got = unsafe { std::slice::from_raw_parts(p, 11) };
        assert_eq!(got, b"Hello World");
    }

    #[test]
    #[serial]
    fn s2_tail_swap_witness() {
        let mut a = Allocator::init(1, 64, 4, 4096).unwrap();
        a.allocate(BlockId(0), 16);
        a.allocate(BlockId(1), 16);
        a.allocate(BlockId(2), 16);
        let p2 = a.dereference(BlockId(2));
        let p1 = a.dereference(BlockId(1));
        a.deallocate(BlockId(1));
        // id 2 was the last live slot in its class; freeing id 1 must have
        // compacted it into id 1's old slot.
        assert_eq!(a.dereference(BlockId(2)), p1);
        let _ = p2;
    }

    #[test]
    #[serial]
    fn s3_class_change_on_resize() {
        let mut a = Allocator::init(1, 2048, 8, 32768).unwrap();
        a.allocate(BlockId(0), 100);
        unsafe {
            std::ptr::write_bytes(a.dereference(BlockId(0)), 0xA5, 100);
        }
        a.reallocate(BlockId(0), 2000);
        let got = unsafe { std::slice::from_raw_parts(a.dereference(BlockId(0)), 100) };
        assert!(got.iter().all(|&b| b == 0xA5));
        assert!(a.length(BlockId(0)) >= 2000);
    }

    #[test]
    #[serial]
    fn s4_exhaustive_density_invariants_hold() {
        let mut a = Allocator::init(1, 64, 32, 4096).unwrap();
        let lengths = [16usize, 32];
        let mut live = std::collections::HashSet::new();
        for id in 0..32u32 {
            a.allocate(BlockId(id), lengths[id as usize % 2]);
            live.insert(id);
            assert_invariants(&a, &live);
        }
        for (i, id) in (0..32u32).enumerate() {
            if i % 3 != 0 {
                continue;
            }
            a.deallocate(BlockId(id));
            live.remove(&id);
            assert_invariants(&a, &live);
        }
    }

    fn assert_invariants(a: &Allocator, live: &std::collections::HashSet<u32>) {
        for id in 0..a.cfg.n_max {
            let is_live = live.contains(&id);
            assert_eq!(!a.info.size_class(BlockId(id)).is_free(), is_live);
        }
        for (heap_idx, &count) in a.live_counts.iter().enumerate() {
            let needed = count as usize * a.strides[heap_idx];
            assert!(a.heaps[heap_idx].using_mem() >= needed);
        }
    }

    #[test]
    #[serial]
    fn s7_resource_recycling_bounded_after_full_cycle() {
        let mut a = Allocator::init(1, 2048, 64, 1 << 20).unwrap();
        for id in 0..64u32 {
            a.allocate(BlockId(id), 2048);
        }
        let peak = a.using_mem();
        for id in 0..64u32 {
            a.deallocate(BlockId(id));
        }
        let steady = a.using_mem();
        assert!(steady <= peak, "steady state {steady} should not exceed peak {peak}");
        assert!(
            steady <= a.cfg.b_max.max(peak / 4),
            "steady state {steady} should be bounded by configuration"
        );
    }

    #[test]
    #[serial]
    fn stats_snapshot_reflects_live_allocation() {
        let mut a = small_allocator();
        let before = a.stats();
        assert_eq!(before.live_blocks.current, 0);
        a.allocate(BlockId(0), 1024);
        let after = a.stats();
        assert_eq!(after.live_blocks.current, 1);
        assert!(after.committed.current > 0, "a committed heap page should be reflected");
        assert_eq!(after.reserved.current, a.arena.total_reserved() as i64);
        assert_eq!(after.tables.current, a.info.byte_len() as i64);
        assert!(after.map_calls.current > 0, "the commit that backed the new slot should count as a map call");
    }

    #[test]
    #[should_panic(expected = "out of [0, N_max) range")]
    #[serial]
    fn allocate_rejects_out_of_range_id() {
        let mut a = small_allocator();
        a.allocate(BlockId(9999), 16);
    }

    #[test]
    #[should_panic(expected = "already-free")]
    #[serial]
    fn deallocate_rejects_free_block() {
        let mut a = small_allocator();
        a.deallocate(BlockId(0));
    }
}
