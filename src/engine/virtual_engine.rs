//! Variant 2 (spec.md §4.8 V2 branches): size classes are backed by
//! pseudo-pages drawn from an external [`PageService`], chained with
//! [`AddressMap`]'s main/sub virtual-slot trick. Blocks whose stride
//! (`id_byte + class size`) fits in one physical page are packed many
//! to a page, newest-first, exactly like variant 1's slot array but at
//! byte offsets instead of array indices; a class's "head" page is
//! always the one most recently given a new block, and freeing the
//! block at the head's own offset is the trivial case, matching
//! variant 1's "last slot" compaction almost exactly.
//!
//! A class whose stride *exceeds* one physical page needs the straddle
//! trick: its sole occupant spans its page's main slot and the next
//! page's physical backing mapped into the sub slot immediately after
//! it (spec.md §4.7), so the user-visible address is one contiguous
//! pointer. This engine supports straddling across exactly one page
//! boundary (`id_byte + class size <= 2 * page_size`, enforced at
//! `init`); a third page would need a second sub slot, which the
//! address-mapping module doesn't provide.

use log::debug;

use crate::addr_map::AddressMap;
use crate::bits::{get_field, put_field};
use crate::block_info::{BlockInfoTable, LocationLayout};
use crate::error::InitError;
use crate::kernel_service::PageService;
use crate::page_info::PageInfoTable;
use crate::size_class::{SizeClassMode, SizeClassTable};
use crate::stats::Stats;
use crate::types::{BlockId, SizeClass};
use crate::Multiheap;

const DEFAULT_GROWTH: f64 = 0.125;
const DEFAULT_MAX_CLASSES: usize = 256;
/// Caps the chosen physical page order so a pathologically large
/// `S_max` produces a bounded, sane page size instead of one enormous
/// page — large classes beyond that instead exercise the straddle path.
const MAX_PAGE_ORDER: u32 = 4; // page_size <= 2^(4+12) = 64 KiB

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub s_min: usize,
    pub s_max: usize,
    pub n_max: u32,
    pub b_max: usize,
}

pub struct Allocator<S: PageService> {
    cfg: Config,
    sizes: SizeClassTable,
    id_byte: u8,
    page_size: usize,
    strides: Vec<usize>,
    info: BlockInfoTable,
    pages: PageInfoTable,
    addr: AddressMap,
    svc: S,
    stats: Stats,
}

impl<S: PageService> Allocator<S> {
    pub fn init(s_min: usize, s_max: usize, n_max: u32, b_max: usize, svc: S) -> Result<Allocator<S>, InitError> {
        if !(s_min > 0 && s_min <= s_max) {
            return Err(InitError::InvalidConfig("require 0 < S_min <= S_max"));
        }
        if n_max == 0 {
            return Err(InitError::InvalidConfig("N_max must be >= 1"));
        }

        let align = std::mem::size_of::<usize>().min(s_min.max(1));
        let sizes = SizeClassTable::build(
            SizeClassMode::Geometric {
                classes: DEFAULT_MAX_CLASSES,
                growth: DEFAULT_GROWTH,
                align,
            },
            s_min,
            s_max,
        );
        let num_classes = sizes.size_to_class(s_max).0 as usize;
        let id_byte = crate::bits::required_bytes((n_max.saturating_sub(1)) as u64);
        let strides: Vec<usize> = (1..=num_classes as u32)
            .map(|c| id_byte as usize + sizes.class_to_size(SizeClass(c)))
            .collect();
        let max_stride = *strides.iter().max().unwrap();

        let mut order = 0u32;
        while (4096usize << order) < max_stride && order < MAX_PAGE_ORDER {
            order += 1;
        }
        let page_size = 4096usize << order;
        if max_stride > 2 * page_size {
            return Err(InitError::InvalidConfig(
                "S_max is too large for the virtual engine's single-successor straddle span",
            ));
        }

        let mut svc = svc;
        svc.set_page_order(order as u8)
            .map_err(InitError::PageServiceUnavailable)?;

        // Packed classes put at most one block's worth of pages per live
        // block, but an oversized class's block straddles a primary page
        // plus an overflow page (`allocate_oversized`), so the fleet must
        // cover two ids per live block whenever the chosen page size
        // leaves any class oversized (spec.md §4.7: "the maximum number
        // of physical pages the allocator may need").
        let any_oversized = max_stride > page_size;
        let p_max = if any_oversized {
            n_max.max(1).saturating_mul(2).saturating_add(1)
        } else {
            n_max.max(1) + 1
        };
        svc.resize_fleet(p_max).map_err(InitError::PageServiceUnavailable)?;

        let pages = PageInfoTable::new(p_max, num_classes as u32, 8).map_err(|source| InitError::ArenaReservationFailed {
            requested: (p_max as usize).max(1) * page_size,
            source,
        })?;
        let addr = AddressMap::new(p_max, page_size).map_err(|source| InitError::ArenaReservationFailed {
            requested: 2 * p_max as usize * page_size,
            source,
        })?;

        let page_bytes = crate::bits::required_bytes(p_max as u64);
        let page_offset_bytes = crate::bits::required_bytes(page_size as u64);
        let info = BlockInfoTable::new(
            n_max,
            num_classes as u32,
            LocationLayout::Page {
                page_bytes,
                page_offset_bytes,
            },
        );

        let mut allocator = Allocator {
            cfg: Config {
                s_min,
                s_max,
                n_max,
                b_max,
            },
            sizes,
            id_byte,
            page_size,
            strides,
            info,
            pages,
            addr,
            svc,
            stats: Stats::default(),
        };

        let warmup_id = BlockId(n_max - 1);
        allocator.allocate(warmup_id, s_max);
        allocator.deallocate(warmup_id);

        debug!(
            "multiheap-fit virtual engine initialized: {} classes, page order {} ({} bytes)",
            num_classes, order, page_size
        );
        Ok(allocator)
    }

    pub fn config(&self) -> Config {
        self.cfg
    }

    /// The physical page size this instance settled on at `init` (spec.md
    /// §4.7). Classes whose stride exceeds this take the straddle path.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// A diagnostics snapshot (SPEC_FULL.md §1.2). As in the physical
    /// engine, the byte-count fields are recomputed fresh from current
    /// component state on every call (`live_blocks` is the exception,
    /// tracked incrementally so its peak survives across calls); variant
    /// 2 has no garbage list of its own (spec.md §4.5 is variant-1
    /// only), so that field always reads zero here.
    pub fn stats(&self) -> Stats {
        let mut stats = self.stats;
        let page = self.page_size as i64;
        stats.reserved = crate::stats::StatCount {
            current: self.addr.byte_len() as i64,
            peak: self.addr.byte_len() as i64,
            ..Default::default()
        };
        let committed = self.svc.bytes_used().unwrap_or(0) as i64;
        stats.committed = crate::stats::StatCount {
            current: committed,
            peak: committed,
            ..Default::default()
        };
        let pool_bytes = self.pages.pool_len() as i64 * page;
        stats.pool = crate::stats::StatCount {
            current: pool_bytes,
            peak: pool_bytes,
            ..Default::default()
        };
        let table_bytes = (self.pages.byte_len() + self.info.byte_len()) as i64;
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

    fn stride_of(&self, class: SizeClass) -> usize {
        self.strides[class.heap_index()]
    }

    fn is_oversized(&self, class: SizeClass) -> bool {
        self.stride_of(class) > self.page_size
    }

    fn slot_ptr(&self, page: u32, offset: u32) -> *mut u8 {
        unsafe { self.addr.main_addr(page).add(offset as usize) }
    }

    fn read_header(&self, page: u32, offset: u32) -> BlockId {
        let len = offset as usize + self.id_byte as usize;
        let s = unsafe { std::slice::from_raw_parts(self.addr.main_addr(page), len) };
        BlockId(get_field(s, offset as usize, self.id_byte) as u32)
    }

    fn write_header(&self, page: u32, offset: u32, id: BlockId, span: usize) {
        let s = unsafe { std::slice::from_raw_parts_mut(self.addr.main_addr(page), span) };
        put_field(s, offset as usize, self.id_byte, id.0 as u64);
    }

    fn copy_block(&self, from_page: u32, from_off: u32, to_page: u32, to_off: u32, stride: usize) {
        let from = self.slot_ptr(from_page, from_off);
        let to = self.slot_ptr(to_page, to_off);
        unsafe {
            std::ptr::copy(from, to, stride);
        }
    }

    fn allocate_oversized(&mut self, id: BlockId, class: SizeClass, stride: usize) {
        let (primary, _) = self.pages.pop_free_id();
        self.svc
            .allocate_page(primary)
            .unwrap_or_else(|e| panic!("kernel page service failed to allocate page {primary}: {e}"));
        self.addr
            .map_main(primary, &mut self.svc)
            .unwrap_or_else(|e| panic!("failed to map page {primary}: {e}"));
        self.stats.map_calls.increase(2);

        let (overflow, _) = self.pages.pop_free_id();
        self.svc
            .allocate_page(overflow)
            .unwrap_or_else(|e| panic!("kernel page service failed to allocate page {overflow}: {e}"));
        self.addr
            .set_next(primary, overflow, &mut self.svc)
            .unwrap_or_else(|e| panic!("failed to map straddle successor for page {primary}: {e}"));
        self.stats.map_calls.increase(2);

        self.pages.replace(
            primary,
            crate::page_info::PageRecord {
                prev: self.pages.null_page,
                next: overflow,
                offset: 0,
                size_class: class.0,
            },
        );
        self.pages.replace(
            overflow,
            crate::page_info::PageRecord {
                prev: primary,
                next: self.pages.null_page,
                offset: 0,
                size_class: class.0,
            },
        );

        self.write_header(primary, 0, id, stride);
        self.info.set_size_class(id, class);
        self.info.set_page_location(id, primary, self.id_byte as u32);
    }

    fn deallocate_oversized(&mut self, page: u32) {
        let rec = self.pages.get(page);
        let overflow = rec.next;
        self.addr
            .reset_next(page, &mut self.svc)
            .unwrap_or_else(|e| panic!("failed to unmap straddle successor for page {page}: {e}"));
        self.stats.map_calls.increase(1);

        // primary's main-slot mapping is real and retainable, exactly like
        // the packed path's kept pages: honor the pool decision.
        let kept_primary = self.pages.push_free_id(page);
        if !kept_primary {
            self.svc
                .unmap(self.addr.main_addr(page), self.page_size)
                .unwrap_or_else(|e| panic!("failed to unmap page {page}: {e}"));
            self.svc
                .release_page(page)
                .unwrap_or_else(|e| panic!("kernel page service failed to release page {page}: {e}"));
            self.stats.map_calls.increase(2);
        }

        // overflow never has a main-slot mapping of its own (it is only
        // ever reachable through another page's sub slot), so there is
        // nothing to retain: always release it and never let it re-enter
        // the pool claiming a live mapping it doesn't have.
        self.pages.push_free_id_no_pool(overflow);
        self.svc
            .release_page(overflow)
            .unwrap_or_else(|e| panic!("kernel page service failed to release page {overflow}: {e}"));
        self.stats.map_calls.increase(1);
    }
}

impl<S: PageService> Multiheap for Allocator<S> {
    fn allocate(&mut self, id: BlockId, length: usize) {
        assert!(id.0 < self.cfg.n_max, "block id {id} out of [0, N_max) range");
        assert!(
            self.info.size_class(id).is_free(),
            "allocate called on already-live block {id}"
        );
        let class = self.class_of(length);
        let stride = self.stride_of(class);

        if self.is_oversized(class) {
            self.allocate_oversized(id, class, stride);
            self.stats.live_blocks.increase(1);
            return;
        }

        let heap_idx = class.heap_index();
        let head = self.pages.class_head(heap_idx);
        let needs_new_head = head == self.pages.null_page || (self.pages.get(head).offset as usize) < stride;

        let (page, offset) = if needs_new_head {
            let (new_id, mapping_live) = self.pages.pop_free_id();
            if !mapping_live {
                self.svc
                    .allocate_page(new_id)
                    .unwrap_or_else(|e| panic!("kernel page service failed to allocate page {new_id}: {e}"));
                self.addr
                    .map_main(new_id, &mut self.svc)
                    .unwrap_or_else(|e| panic!("failed to map page {new_id}: {e}"));
                self.stats.map_calls.increase(2);
            }
            let offset = self.page_size as u32 - stride as u32;
            self.pages.replace(
                new_id,
                crate::page_info::PageRecord {
                    prev: self.pages.null_page,
                    next: head,
                    offset,
                    size_class: class.0,
                },
            );
            if head != self.pages.null_page {
                let mut old_head = self.pages.get(head);
                old_head.prev = new_id;
                self.pages.replace(head, old_head);
            }
            self.pages.set_class_head(heap_idx, new_id);
            (new_id, offset)
        } else {
            let mut rec = self.pages.get(head);
            rec.offset -= stride as u32;
            let offset = rec.offset;
            self.pages.replace(head, rec);
            (head, offset)
        };

        self.write_header(page, offset, id, self.page_size);
        self.info.set_size_class(id, class);
        self.info.set_page_location(id, page, offset + self.id_byte as u32);
        self.stats.live_blocks.increase(1);
    }

    fn deallocate(&mut self, id: BlockId) {
        let class = self.info.size_class(id);
        assert!(!class.is_free(), "deallocate called on already-free block {id}");
        let stride = self.stride_of(class);
        let (page, payload_offset) = self.info.page_location(id);
        let offset = payload_offset - self.id_byte as u32;

        if self.is_oversized(class) {
            self.deallocate_oversized(page);
            self.info.set_size_class(id, SizeClass::FREE);
            self.stats.live_blocks.decrease(1);
            return;
        }

        let heap_idx = class.heap_index();
        let head = self.pages.class_head(heap_idx);
        let head_rec = self.pages.get(head);

        if (page, offset) != (head, head_rec.offset) {
            let moved_id = self.read_header(head, head_rec.offset);
            self.copy_block(head, head_rec.offset, page, offset, stride);
            self.info.set_page_location(moved_id, page, offset + self.id_byte as u32);
        }

        let new_offset = head_rec.offset + stride as u32;
        if new_offset >= self.page_size as u32 {
            let next = head_rec.next;
            if next != self.pages.null_page {
                let mut next_rec = self.pages.get(next);
                next_rec.prev = self.pages.null_page;
                self.pages.replace(next, next_rec);
            }
            self.pages.set_class_head(heap_idx, next);
            let kept = self.pages.push_free_id(head);
            if !kept {
                self.svc
                    .unmap(self.addr.main_addr(head), self.page_size)
                    .unwrap_or_else(|e| panic!("failed to unmap page {head}: {e}"));
                self.svc
                    .release_page(head)
                    .unwrap_or_else(|e| panic!("kernel page service failed to release page {head}: {e}"));
                self.stats.map_calls.increase(2);
            }
        } else {
            let mut rec = head_rec;
            rec.offset = new_offset;
            self.pages.replace(head, rec);
        }

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
        let old_size = self.sizes.class_to_size(cur_class);
        let old_ptr = self.dereference(id);
        let copy_len = old_size.min(self.sizes.class_to_size(new_class));
        let mut scratch = vec![0u8; copy_len];
        unsafe {
            std::ptr::copy_nonoverlapping(old_ptr, scratch.as_mut_ptr(), copy_len);
        }
        self.deallocate(id);
        self.allocate(id, new_length);
        let new_ptr = self.dereference(id);
        unsafe {
            std::ptr::copy_nonoverlapping(scratch.as_ptr(), new_ptr, copy_len);
        }
    }

    fn dereference(&self, id: BlockId) -> *mut u8 {
        let class = self.info.size_class(id);
        if class.is_free() {
            return std::ptr::null_mut();
        }
        let (page, payload_offset) = self.info.page_location(id);
        self.slot_ptr(page, payload_offset)
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
        self.svc.bytes_used().unwrap_or(0) as usize + self.pages.byte_len() + self.info.byte_len() + self.addr.byte_len()
    }
}
