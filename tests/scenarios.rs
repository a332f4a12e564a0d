//! End-to-end scenarios (spec.md §8's literal-input list), run against
//! the public crate API the way a real caller would use it, as opposed
//! to the inline unit tests living next to each engine's internals.

use multiheap_fit::engine::physical;
use multiheap_fit::engine::virtual_engine;
use multiheap_fit::kernel_service::InMemoryPageService;
use multiheap_fit::types::BlockId;
use multiheap_fit::Multiheap;
use serial_test::serial;

// Every scenario here that constructs a `physical::Allocator` takes the
// process-wide `ReservedArena` singleton, so it is tagged `#[serial]` to
// keep it from racing the others under `cargo test`'s default parallel
// execution; scenarios that only exercise `virtual_engine` don't touch
// that singleton and are left free to run concurrently.

#[test]
#[serial]
fn s1_hello_world_physical() {
    let mut a = physical::Allocator::init(1, 2048, 16, 32768).unwrap();
    a.allocate(BlockId(0), 1024);
    a.allocate(BlockId(1), 1024);
    unsafe {
        std::ptr::copy_nonoverlapping(b"Hello World\0".as_ptr(), a.dereference(BlockId(1)), 12);
    }
    a.deallocate(BlockId(0));
    let got = unsafe { std::slice::from_raw_parts(a.dereference(BlockId(1)), 11) };
    assert_eq!(got, b"Hello World");
}

#[test]
fn s1_hello_world_virtual() {
    let mut a = virtual_engine::Allocator::init(1, 2048, 16, 32768, InMemoryPageService::new()).unwrap();
    a.allocate(BlockId(0), 1024);
    a.allocate(BlockId(1), 1024);
    unsafe {
        std::ptr::copy_nonoverlapping(b"Hello World\0".as_ptr(), a.dereference(BlockId(1)), 12);
    }
    a.deallocate(BlockId(0));
    let got = unsafe { std::slice::from_raw_parts(a.dereference(BlockId(1)), 11) };
    assert_eq!(got, b"Hello World");
}

#[test]
#[serial]
fn s2_tail_swap_witness_both_variants() {
    let mut phys = physical::Allocator::init(1, 64, 4, 4096).unwrap();
    for id in 0..3u32 {
        phys.allocate(BlockId(id), 16);
    }
    let p1 = phys.dereference(BlockId(1));
    phys.deallocate(BlockId(1));
    assert_eq!(phys.dereference(BlockId(2)), p1);

    let mut virt = virtual_engine::Allocator::init(1, 64, 4, 4096, InMemoryPageService::new()).unwrap();
    for id in 0..3u32 {
        virt.allocate(BlockId(id), 16);
    }
    let p1 = virt.dereference(BlockId(1));
    virt.deallocate(BlockId(1));
    assert_eq!(virt.dereference(BlockId(2)), p1);
}

#[test]
#[serial]
fn s3_class_change_on_resize_both_variants() {
    let mut phys = physical::Allocator::init(1, 2048, 8, 32768).unwrap();
    phys.allocate(BlockId(0), 100);
    unsafe { std::ptr::write_bytes(phys.dereference(BlockId(0)), 0xA5, 100) };
    phys.reallocate(BlockId(0), 2000);
    let got = unsafe { std::slice::from_raw_parts(phys.dereference(BlockId(0)), 100) };
    assert!(got.iter().all(|&b| b == 0xA5));
    assert!(phys.length(BlockId(0)) >= 2000);

    let mut virt = virtual_engine::Allocator::init(1, 2048, 8, 32768, InMemoryPageService::new()).unwrap();
    virt.allocate(BlockId(0), 100);
    unsafe { std::ptr::write_bytes(virt.dereference(BlockId(0)), 0xA5, 100) };
    virt.reallocate(BlockId(0), 2000);
    let got = unsafe { std::slice::from_raw_parts(virt.dereference(BlockId(0)), 100) };
    assert!(got.iter().all(|&b| b == 0xA5));
    assert!(virt.length(BlockId(0)) >= 2000);
}

#[test]
#[serial]
fn s4_exhaustive_density_both_variants() {
    fn run<A: Multiheap>(mut a: A, n: u32) {
        let lengths = [16usize, 32];
        let mut live = std::collections::HashSet::new();
        for id in 0..n {
            a.allocate(BlockId(id), lengths[id as usize % 2]);
            live.insert(id);
        }
        for id in 0..n {
            if id % 3 != 0 {
                continue;
            }
            a.deallocate(BlockId(id));
            live.remove(&id);
        }
        for id in 0..n {
            let is_live = live.contains(&id);
            assert_eq!(a.length(BlockId(id)) > 0, is_live);
            assert_eq!(!a.dereference(BlockId(id)).is_null(), is_live);
        }
    }

    run(physical::Allocator::init(1, 64, 32, 4096).unwrap(), 32);
    run(
        virtual_engine::Allocator::init(1, 64, 32, 4096, InMemoryPageService::new()).unwrap(),
        32,
    );
}

#[test]
#[serial]
fn s5_steady_state_physical() {
    let mut a = physical::Allocator::init(16, 4096, 1024, 4 * 1024 * 1024).unwrap();
    let mut live: Vec<u32> = Vec::new();
    let mut peak = 0usize;
    // deterministic pseudo-random walk (no RNG crate needed): a simple
    // linear congruential sequence is enough to exercise varied sizes
    // and interleaved alloc/free without needing reproducible `rand`.
    let mut state: u64 = 0x9E3779B97F4A7C15;
    let mut next = || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        (state >> 33) as u32
    };

    for _ in 0..10_000u32 {
        let id = next() % 1024;
        if live.contains(&id) {
            a.deallocate(BlockId(id));
            live.retain(|&x| x != id);
        } else {
            let length = 16 + (next() as usize % (4096 - 16));
            a.allocate(BlockId(id), length);
            live.push(id);
        }
        peak = peak.max(a.using_mem());
    }

    for id in live {
        a.deallocate(BlockId(id));
    }
    let steady = a.using_mem();
    assert!(steady <= peak, "steady state {steady} must not exceed observed peak {peak}");
}

#[test]
fn s6_variant2_straddle() {
    // S_max sits well above MAX_PAGE_ORDER's 64 KiB page cap, so the top
    // class stays oversized no matter the host's page size — a
    // `host_page_size + 128` config instead just grows the chosen page
    // size to absorb it, and never reaches the straddle path at all.
    let mut a = virtual_engine::Allocator::init(1, 70_000, 4, 8 * 70_000, InMemoryPageService::new()).unwrap();
    let page = a.page_size();
    assert_eq!(page, 65536, "S_max should push the chosen page order to its cap");

    a.allocate(BlockId(0), 70_000);
    assert!(
        a.length(BlockId(0)) > page,
        "the allocated length alone exceeds one page, so this block must straddle"
    );
    let ptr = a.dereference(BlockId(0));
    unsafe {
        for i in 0..70_000 {
            *ptr.add(i) = (i % 241) as u8;
        }
        for i in 0..70_000 {
            assert_eq!(*ptr.add(i), (i % 241) as u8, "byte {i} did not round-trip across the straddle");
        }
    }

    let committed_live = a.stats().committed.current;
    a.deallocate(BlockId(0));
    assert!(a.dereference(BlockId(0)).is_null());
    let committed_after_free = a.stats().committed.current;
    assert_eq!(
        committed_live - committed_after_free,
        page as i64,
        "freeing a straddling block releases its overflow page even though the primary page is pooled"
    );
}
