//! Block-info table (spec.md §4.3).
//!
//! A single dense array indexed by block id; each entry is a fixed-width
//! packed record of `(size-class, location)`. `location` is interpreted
//! differently by the two engine variants: a bare slot index for the
//! physical engine, or a `(page_id, page_offset)` pair for the virtual
//! engine. Field widths are fixed once at construction from the declared
//! caps (`N_max`, the largest possible slot/page/offset value), using
//! [`crate::bits`] for the actual packing.

use crate::bits::{get_field, put_field, required_bytes};
use crate::types::{BlockId, SizeClass};

/// How the `location` half of each record is laid out.
#[derive(Debug, Clone, Copy)]
pub enum LocationLayout {
    /// Physical engine: a single slot-index field.
    Slot { offset_bytes: u8 },
    /// Virtual engine: a `(page_id, page_offset)` pair. `page_id ==
    /// all-ones` (within `page_bytes`) is the "null page" sentinel written
    /// at construction, per spec.md §4.3.
    Page { page_bytes: u8, page_offset_bytes: u8 },
}

#[derive(Debug, Clone)]
pub struct BlockInfoTable {
    records: Vec<u8>,
    record_len: usize,
    sc_bytes: u8,
    layout: LocationLayout,
    n_max: u32,
}

impl BlockInfoTable {
    /// Builds a table for `n_max` block ids, where `max_size_class` is the
    /// highest class index that will ever be written (used to size the
    /// size-class field).
    pub fn new(n_max: u32, max_size_class: u32, layout: LocationLayout) -> BlockInfoTable {
        let sc_bytes = required_bytes(max_size_class as u64);
        let location_bytes = match layout {
            LocationLayout::Slot { offset_bytes } => offset_bytes,
            LocationLayout::Page {
                page_bytes,
                page_offset_bytes,
            } => page_bytes + page_offset_bytes,
        };
        let record_len = sc_bytes as usize + location_bytes as usize;
        let mut records = vec![0u8; record_len * n_max as usize];

        if let LocationLayout::Page { page_bytes, .. } = layout {
            // null-page sentinel: page-id field all-ones, per spec.md §4.3
            let sentinel = if page_bytes == 8 {
                u64::MAX
            } else {
                (1u64 << (page_bytes as u32 * 8)) - 1
            };
            let mut table = BlockInfoTable {
                records: std::mem::take(&mut records),
                record_len,
                sc_bytes,
                layout,
                n_max,
            };
            for id in 0..n_max {
                table.set_page_sentinel(BlockId(id), sentinel);
            }
            return table;
        }

        BlockInfoTable {
            records,
            record_len,
            sc_bytes,
            layout,
            n_max,
        }
    }

    #[inline]
    fn record_offset(&self, id: BlockId) -> usize {
        debug_assert!(id.0 < self.n_max, "block id {} out of range [0, {})", id, self.n_max);
        id.index() * self.record_len
    }

    pub fn size_class(&self, id: BlockId) -> SizeClass {
        let off = self.record_offset(id);
        SizeClass(get_field(&self.records, off, self.sc_bytes) as u32)
    }

    pub fn set_size_class(&mut self, id: BlockId, class: SizeClass) {
        let off = self.record_offset(id);
        put_field(&mut self.records, off, self.sc_bytes, class.0 as u64);
    }

    fn set_page_sentinel(&mut self, id: BlockId, sentinel: u64) {
        let page_bytes = match self.layout {
            LocationLayout::Page { page_bytes, .. } => page_bytes,
            LocationLayout::Slot { .. } => unreachable!(),
        };
        let off = self.record_offset(id) + self.sc_bytes as usize;
        put_field(&mut self.records, off, page_bytes, sentinel);
    }

    /// Variant 1: the slot index within the block's class heap.
    pub fn slot(&self, id: BlockId) -> u32 {
        let LocationLayout::Slot { offset_bytes } = self.layout else {
            panic!("slot() called on a page-layout block-info table");
        };
        let off = self.record_offset(id) + self.sc_bytes as usize;
        get_field(&self.records, off, offset_bytes) as u32
    }

    pub fn set_slot(&mut self, id: BlockId, slot: u32) {
        let LocationLayout::Slot { offset_bytes } = self.layout else {
            panic!("set_slot() called on a page-layout block-info table");
        };
        let off = self.record_offset(id) + self.sc_bytes as usize;
        put_field(&mut self.records, off, offset_bytes, slot as u64);
    }

    /// Variant 2: the `(page_id, page_offset)` pair.
    pub fn page_location(&self, id: BlockId) -> (u32, u32) {
        let LocationLayout::Page {
            page_bytes,
            page_offset_bytes,
        } = self.layout
        else {
            panic!("page_location() called on a slot-layout block-info table");
        };
        let base = self.record_offset(id) + self.sc_bytes as usize;
        let page = get_field(&self.records, base, page_bytes) as u32;
        let offset = get_field(&self.records, base + page_bytes as usize, page_offset_bytes) as u32;
        (page, offset)
    }

    pub fn set_page_location(&mut self, id: BlockId, page: u32, page_offset: u32) {
        let LocationLayout::Page {
            page_bytes,
            page_offset_bytes,
        } = self.layout
        else {
            panic!("set_page_location() called on a slot-layout block-info table");
        };
        let base = self.record_offset(id) + self.sc_bytes as usize;
        put_field(&mut self.records, base, page_bytes, page as u64);
        put_field(
            &mut self.records,
            base + page_bytes as usize,
            page_offset_bytes,
            page_offset as u64,
        );
    }

    /// Bytes of backing storage this table occupies (for `using_mem`).
    pub fn byte_len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_table_is_all_free() {
        let t = BlockInfoTable::new(16, 5, LocationLayout::Slot { offset_bytes: 2 });
        for id in 0..16 {
            assert!(t.size_class(BlockId(id)).is_free());
        }
    }

    #[test]
    fn slot_layout_roundtrip() {
        let mut t = BlockInfoTable::new(8, 10, LocationLayout::Slot { offset_bytes: 2 });
        t.set_size_class(BlockId(3), SizeClass(7));
        t.set_slot(BlockId(3), 511);
        assert_eq!(t.size_class(BlockId(3)), SizeClass(7));
        assert_eq!(t.slot(BlockId(3)), 511);
        // other ids untouched
        assert!(t.size_class(BlockId(0)).is_free());
    }

    #[test]
    fn page_layout_starts_with_null_sentinel() {
        let t = BlockInfoTable::new(
            4,
            3,
            LocationLayout::Page {
                page_bytes: 2,
                page_offset_bytes: 2,
            },
        );
        for id in 0..4 {
            let (page, _) = t.page_location(BlockId(id));
            assert_eq!(page, 0xFFFF);
            assert!(t.size_class(BlockId(id)).is_free());
        }
    }

    #[test]
    fn page_layout_roundtrip() {
        let mut t = BlockInfoTable::new(
            4,
            3,
            LocationLayout::Page {
                page_bytes: 2,
                page_offset_bytes: 2,
            },
        );
        t.set_size_class(BlockId(1), SizeClass(2));
        t.set_page_location(BlockId(1), 42, 1000);
        assert_eq!(t.page_location(BlockId(1)), (42, 1000));
        assert_eq!(t.size_class(BlockId(1)), SizeClass(2));
    }
}
