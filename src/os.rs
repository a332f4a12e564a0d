//! Primitive OS memory operations: reserve, commit, decommit, release.
//!
//! Grounded on `mimalloc-rs`'s `os.rs` (the page-size probing, the
//! commit-is-liberal/decommit-is-conservative page alignment split, the
//! `madvise`/`mprotect` choice of mechanism) and on `XuHaoJun-rudo`'s
//! `sys_alloc` crate for the idiomatic `std::io::Result`-returning wrapper
//! shape — `mimalloc-rs`'s own `os.rs` is C transliterated almost verbatim
//! and does not compile as Rust (bare `fn os_init()` mutating module
//! statics without `unsafe`, `MAP_FAILED` comparisons against a raw
//! pointer, etc.); the mechanism is kept, the shape is rewritten to be
//! real, safe-at-the-boundary Rust.

use std::io;
use std::sync::OnceLock;

/// The OS page size, queried once and memoized.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(query_page_size)
}

#[cfg(unix)]
fn query_page_size() -> usize {
    let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if result > 0 {
        result as usize
    } else {
        4096
    }
}

#[cfg(windows)]
fn query_page_size() -> usize {
    use std::mem::MaybeUninit;
    use winapi::um::sysinfoapi::GetSystemInfo;
    unsafe {
        let mut si = MaybeUninit::zeroed().assume_init();
        GetSystemInfo(&mut si);
        let ps = si.dwPageSize as usize;
        if ps > 0 {
            ps
        } else {
            4096
        }
    }
}

/// Reserves `size` bytes of address space with no read/write access, at
/// whatever address the OS chooses. `size` must already be page-aligned.
pub fn reserve(size: usize) -> io::Result<*mut u8> {
    debug_assert!(size > 0 && size % page_size() == 0);
    reserve_at(std::ptr::null_mut(), size)
}

/// Reserves `size` bytes of no-access address space, optionally with a
/// placement hint. The OS is free to ignore the hint (the returned pointer
/// must be checked, never assumed to equal `addr`).
#[cfg(unix)]
pub fn reserve_at(addr: *mut u8, size: usize) -> io::Result<*mut u8> {
    debug_assert!(size > 0 && size % page_size() == 0);
    unsafe {
        let p = libc::mmap(
            addr as *mut libc::c_void,
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if p == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(p as *mut u8)
        }
    }
}

#[cfg(windows)]
pub fn reserve_at(addr: *mut u8, size: usize) -> io::Result<*mut u8> {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_RESERVE, PAGE_NOACCESS};
    unsafe {
        let p = VirtualAlloc(addr as _, size, MEM_RESERVE, PAGE_NOACCESS);
        if p.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(p as *mut u8)
        }
    }
}

/// Commits `[addr, addr+size)` inside a previously reserved region:
/// read/write becomes valid and touching the pages will not fault.
/// Commit is aligned liberally (rounds the requested range outward).
#[cfg(unix)]
pub fn commit(addr: *mut u8, size: usize) -> io::Result<()> {
    if size == 0 {
        return Ok(());
    }
    let (start, csize) = page_align_liberal(addr, size);
    unsafe {
        if libc::mprotect(start as *mut libc::c_void, csize, libc::PROT_READ | libc::PROT_WRITE) != 0
        {
            let err = io::Error::last_os_error();
            log::warn!("mprotect(commit) failed at {:p}, size {}: {}", start, csize, err);
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(windows)]
pub fn commit(addr: *mut u8, size: usize) -> io::Result<()> {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, PAGE_READWRITE};
    if size == 0 {
        return Ok(());
    }
    let (start, csize) = page_align_liberal(addr, size);
    unsafe {
        let p = VirtualAlloc(start as _, csize, MEM_COMMIT, PAGE_READWRITE);
        if p.is_null() {
            let err = io::Error::last_os_error();
            log::warn!("VirtualAlloc(commit) failed at {:p}, size {}: {}", start, csize, err);
            return Err(err);
        }
    }
    Ok(())
}

/// Decommits `[addr, addr+size)`: the pages become inaccessible and the OS
/// may reclaim the backing physical memory. Decommit is aligned
/// conservatively (keeps the range inside what was requested).
#[cfg(unix)]
pub fn decommit(addr: *mut u8, size: usize) -> io::Result<()> {
    if size == 0 {
        return Ok(());
    }
    let (start, csize) = page_align_conservative(addr, size);
    if csize == 0 {
        return Ok(());
    }
    unsafe {
        if libc::mprotect(start as *mut libc::c_void, csize, libc::PROT_NONE) != 0 {
            let err = io::Error::last_os_error();
            log::warn!("mprotect(decommit) failed at {:p}, size {}: {}", start, csize, err);
            return Err(err);
        }
        // MADV_DONTNEED actually drops the pages; failure here is not fatal
        // to correctness (the range is already inaccessible), just to the
        // memory being promptly reclaimed, so we only log it.
        if libc::madvise(start as *mut libc::c_void, csize, libc::MADV_DONTNEED) != 0 {
            log::warn!(
                "madvise(DONTNEED) failed at {:p}, size {}: {}",
                start,
                csize,
                io::Error::last_os_error()
            );
        }
    }
    Ok(())
}

#[cfg(windows)]
pub fn decommit(addr: *mut u8, size: usize) -> io::Result<()> {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_DECOMMIT;
    if size == 0 {
        return Ok(());
    }
    let (start, csize) = page_align_conservative(addr, size);
    if csize == 0 {
        return Ok(());
    }
    unsafe {
        if VirtualFree(start as _, csize, MEM_DECOMMIT) == 0 {
            let err = io::Error::last_os_error();
            log::warn!("VirtualFree(decommit) failed at {:p}, size {}: {}", start, csize, err);
            return Err(err);
        }
    }
    Ok(())
}

/// Releases a region obtained from [`reserve`]/[`reserve_at`] back to the
/// OS entirely. `addr`/`size` must match the original reservation exactly
/// on Windows (`VirtualFree` with `MEM_RELEASE` requires the base address).
#[cfg(unix)]
pub fn release(addr: *mut u8, size: usize) -> io::Result<()> {
    if addr.is_null() || size == 0 {
        return Ok(());
    }
    unsafe {
        if libc::munmap(addr as *mut libc::c_void, size) != 0 {
            let err = io::Error::last_os_error();
            log::warn!("munmap failed at {:p}, size {}: {}", addr, size, err);
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(windows)]
pub fn release(addr: *mut u8, _size: usize) -> io::Result<()> {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;
    if addr.is_null() {
        return Ok(());
    }
    unsafe {
        if VirtualFree(addr as _, 0, MEM_RELEASE) == 0 {
            let err = io::Error::last_os_error();
            log::warn!("VirtualFree(release) failed at {:p}: {}", addr, err);
            return Err(err);
        }
    }
    Ok(())
}

/// Replaces `[addr, addr+size)` — which must already lie inside a region
/// this process reserved — with a fresh no-access anonymous mapping at
/// that exact address. Used by the variant-2 address-mapping module to
/// restore a pseudo-page slot to "reserved but inaccessible" after
/// unmapping a kernel-service file-backed page from it.
#[cfg(unix)]
pub fn reserve_fixed(addr: *mut u8, size: usize) -> io::Result<()> {
    debug_assert!(!addr.is_null() && size % page_size() == 0);
    unsafe {
        let p = libc::mmap(
            addr as *mut libc::c_void,
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        );
        if p == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// Maps `size` bytes of `fd` starting at `file_offset` into this
/// process's address space at the exact address `addr` (which must lie
/// inside a region this process already reserved), read/write, shared
/// (writes are visible to any other mapping of the same file range).
/// This is what lets the variant-2 two-slot trick present two virtual
/// addresses backed by the same physical page.
#[cfg(unix)]
pub fn map_file_fixed(fd: std::os::unix::io::RawFd, file_offset: u64, addr: *mut u8, size: usize) -> io::Result<()> {
    debug_assert!(!addr.is_null() && size % page_size() == 0);
    unsafe {
        let p = libc::mmap(
            addr as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            file_offset as libc::off_t,
        );
        if p == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// Page-aligns `[addr, addr+size)` outward (the returned range is a
/// superset of the input). Used before operations where over-covering is
/// harmless (commit).
fn page_align_liberal(addr: *mut u8, size: usize) -> (*mut u8, usize) {
    let ps = page_size();
    let start = crate::types::align_down(addr as usize, ps);
    let end = crate::types::align_up(addr as usize + size, ps);
    (start as *mut u8, end - start)
}

/// Page-aligns `[addr, addr+size)` inward (the returned range is a subset
/// of the input, possibly empty). Used before operations where
/// over-covering would touch memory outside the caller's range (decommit).
fn page_align_conservative(addr: *mut u8, size: usize) -> (*mut u8, usize) {
    let ps = page_size();
    let start = crate::types::align_up(addr as usize, ps);
    let end_requested = addr as usize + size;
    let end = crate::types::align_down(end_requested, ps);
    if end <= start {
        (start as *mut u8, 0)
    } else {
        (start as *mut u8, end - start)
    }
}
