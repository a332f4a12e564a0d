//! Page-info table (spec.md §4.6, variant 2 only).
//!
//! One record per physical page id: `{prev, next, offset, size_class}`,
//! packed with [`crate::bits`] into widths fixed at construction from
//! `P_max` (the page-id cap), the page size, and the number of size
//! classes. Pages of the same class form a doubly-linked list; `offset`
//! is how far from the page start the next write lands (spec.md
//! invariant 4).

use crate::bits::{get_field, put_field};
use crate::os;
use crate::pseudo_heap::PseudoHeap;
use crate::types::align_up;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRecord {
    pub prev: u32,
    pub next: u32,
    pub offset: u32,
    pub size_class: u32,
}

pub struct PageInfoTable {
    heap: PseudoHeap,
    record_len: usize,
    prev_bytes: u8,
    next_bytes: u8,
    offset_bytes: u8,
    sc_bytes: u8,
    /// Sentinel meaning "no page"/"no class head" — one past the
    /// largest valid page id.
    pub null_page: u32,
    p_max: u32,
    next_fresh_id: u32,
    free_id_stack: Vec<u32>,
    free_pool: std::collections::VecDeque<u32>,
    pool_cap: usize,
    /// Per-class doubly-linked-list head, indexed by `class.heap_index()`.
    class_heads: Vec<u32>,
}

impl PageInfoTable {
    pub fn new(p_max: u32, num_classes: u32, pool_cap: usize) -> std::io::Result<PageInfoTable> {
        let prev_bytes = crate::bits::required_bytes(p_max as u64);
        let next_bytes = prev_bytes;
        let offset_bytes = crate::bits::required_bytes(os::page_size() as u64);
        let sc_bytes = crate::bits::required_bytes(num_classes as u64);
        let record_len = prev_bytes as usize + next_bytes as usize + offset_bytes as usize + sc_bytes as usize;

        let reserve_bytes = align_up((p_max as usize).max(1) * record_len, os::page_size());
        let base = os::reserve(reserve_bytes)?;
        let heap = PseudoHeap::new(base, reserve_bytes / os::page_size());

        Ok(PageInfoTable {
            heap,
            record_len,
            prev_bytes,
            next_bytes,
            offset_bytes,
            sc_bytes,
            null_page: p_max,
            p_max,
            next_fresh_id: 0,
            free_id_stack: Vec::new(),
            free_pool: std::collections::VecDeque::new(),
            pool_cap,
            class_heads: vec![p_max; num_classes as usize],
        })
    }

    /// Number of page ids currently retained in the still-mapped pool
    /// (diagnostics only; not consumed by allocation logic).
    pub fn pool_len(&self) -> usize {
        self.free_pool.len()
    }

    pub fn byte_len(&self) -> usize {
        self.heap.using_mem()
    }

    fn record_offset(&self, id: u32) -> usize {
        debug_assert!(id < self.next_fresh_id, "page id {id} never allocated");
        id as usize * self.record_len
    }

    fn slice(&self, upto_id: u32) -> &[u8] {
        let len = (upto_id as usize + 1) * self.record_len;
        unsafe { std::slice::from_raw_parts(self.heap.address(), len) }
    }

    fn slice_mut(&mut self, upto_id: u32) -> &mut [u8] {
        let len = (upto_id as usize + 1) * self.record_len;
        unsafe { std::slice::from_raw_parts_mut(self.heap.address(), len) }
    }

    pub fn get(&self, id: u32) -> PageRecord {
        let off = self.record_offset(id);
        let s = self.slice(id);
        let prev = get_field(s, off, self.prev_bytes) as u32;
        let next = get_field(s, off + self.prev_bytes as usize, self.next_bytes) as u32;
        let offset = get_field(s, off + self.prev_bytes as usize + self.next_bytes as usize, self.offset_bytes) as u32;
        let size_class = get_field(
            s,
            off + self.prev_bytes as usize + self.next_bytes as usize + self.offset_bytes as usize,
            self.sc_bytes,
        ) as u32;
        PageRecord {
            prev,
            next,
            offset,
            size_class,
        }
    }

    /// Writes all four fields of `id` in one packed burst.
    pub fn replace(&mut self, id: u32, rec: PageRecord) {
        let off = self.record_offset(id);
        let (prev_bytes, next_bytes, offset_bytes) = (self.prev_bytes, self.next_bytes, self.offset_bytes);
        let sc_bytes = self.sc_bytes;
        let s = self.slice_mut(id);
        put_field(s, off, prev_bytes, rec.prev as u64);
        put_field(s, off + prev_bytes as usize, next_bytes, rec.next as u64);
        put_field(s, off + prev_bytes as usize + next_bytes as usize, offset_bytes, rec.offset as u64);
        put_field(
            s,
            off + prev_bytes as usize + next_bytes as usize + offset_bytes as usize,
            sc_bytes,
            rec.size_class as u64,
        );
    }

    pub fn set_offset(&mut self, id: u32, offset: u32) {
        let mut rec = self.get(id);
        rec.offset = offset;
        self.replace(id, rec);
    }

    pub fn class_head(&self, class_heap_index: usize) -> u32 {
        self.class_heads[class_heap_index]
    }

    pub fn set_class_head(&mut self, class_heap_index: usize, page: u32) {
        self.class_heads[class_heap_index] = page;
    }

    /// `pop_free_id` (spec.md §4.6): prefer the still-mapped pool, then
    /// the plain id stack, then mint a fresh id and extend the table.
    /// Returns `(id, mapping_already_live)`.
    pub fn pop_free_id(&mut self) -> (u32, bool) {
        if let Some(id) = self.free_pool.pop_front() {
            return (id, true);
        }
        if let Some(id) = self.free_id_stack.pop() {
            return (id, false);
        }
        let id = self.next_fresh_id;
        assert!(id < self.p_max, "page-info table exhausted: P_max = {}", self.p_max);
        self.next_fresh_id += 1;
        let needed = (id as usize + 1) * self.record_len;
        self.heap
            .grow(needed)
            .unwrap_or_else(|e| panic!("failed to extend page-info table: {e}"));
        self.replace(
            id,
            PageRecord {
                prev: self.null_page,
                next: self.null_page,
                offset: 0,
                size_class: 0,
            },
        );
        (id, false)
    }

    /// `push_free_id` (spec.md §4.6). Returns `true` if `id` went to the
    /// retained-mapping pool (caller must NOT unmap it), `false` if it
    /// went to the plain id stack (caller MUST unmap and release it).
    pub fn push_free_id(&mut self, id: u32) -> bool {
        if self.free_pool.len() < self.pool_cap {
            self.free_pool.push_back(id);
            true
        } else {
            self.free_id_stack.push(id);
            false
        }
    }

    /// Like [`PageInfoTable::push_free_id`], but never places `id` in the
    /// retained-mapping pool — for ids that have no main-slot mapping of
    /// their own to retain (a straddle successor page, reachable only
    /// through another page's sub slot). A future `pop_free_id` for this
    /// id always reports `mapping_already_live = false`.
    pub fn push_free_id_no_pool(&mut self, id: u32) {
        self.free_id_stack.push(id);
    }
}

impl Drop for PageInfoTable {
    fn drop(&mut self) {
        let bytes = self.heap.capacity_pages() * os::page_size();
        if let Err(e) = os::release(self.heap.address(), bytes) {
            log::warn!("failed to release page-info table arena: {e}");
        }
    }
}
