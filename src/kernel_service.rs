//! Kernel page-allocation service client (spec.md §6.2).
//!
//! The service itself — a character device driver — is an external
//! collaborator out of scope for this crate (spec.md §1). Only the
//! interface the virtual engine consumes is modeled here: a small
//! [`PageService`] trait, a real [`IoctlPageService`] client that talks
//! to the device over `ioctl` plus file-backed `mmap`, and an
//! [`InMemoryPageService`] mock (anonymous-memory-backed) used in tests
//! and wherever no such device is present.

use std::io;

/// What the virtual engine needs from the kernel page-allocation
/// service: the five `ioctl` request codes of spec.md §6.2, plus the
/// file-backed mapping operation that lets one physical page be mapped
/// at more than one virtual address simultaneously.
pub trait PageService {
    /// Allocates a physical page of the current order and binds it to
    /// `page_id` (ioctl code 0).
    fn allocate_page(&mut self, page_id: u32) -> io::Result<()>;
    /// Releases the physical page bound to `page_id` (ioctl code 1).
    fn release_page(&mut self, page_id: u32) -> io::Result<()>;
    /// Resizes the page-id fleet to at least `count` (ioctl code 2).
    fn resize_fleet(&mut self, count: u32) -> io::Result<()>;
    /// Total bytes currently used by the service (ioctl code 3).
    fn bytes_used(&self) -> io::Result<u64>;
    /// Sets the physical page order; `page_size = 2^(order+12)`. Must be
    /// called while the fleet is empty (ioctl code 4).
    fn set_page_order(&mut self, order: u8) -> io::Result<()>;
    /// Maps the physical page bound to `page_id` at the virtual address
    /// `at`, which must lie inside a region this process already owns.
    fn map_page(&mut self, page_id: u32, at: *mut u8) -> io::Result<()>;
    /// Unmaps `len` bytes at `at`; does not release the physical page
    /// (only [`PageService::release_page`] does).
    fn unmap(&mut self, at: *mut u8, len: usize) -> io::Result<()>;
}

/// Stable ABI magic byte for the device's ioctl numbering (spec.md
/// §6.2: "magic byte and numbering are stable ABI").
#[cfg(unix)]
const IOCTL_MAGIC: libc::c_ulong = 0x4D; // 'M'

#[cfg(unix)]
fn ioctl_request(code: u8) -> libc::c_ulong {
    (IOCTL_MAGIC << 8) | code as libc::c_ulong
}

/// Real client for the out-of-scope kernel character device.
#[cfg(unix)]
pub struct IoctlPageService {
    file: std::fs::File,
}

#[cfg(unix)]
impl IoctlPageService {
    pub fn open(path: &std::path::Path) -> io::Result<IoctlPageService> {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        Ok(IoctlPageService { file })
    }

    fn ioctl_write_u32(&self, code: u8, value: u32) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), ioctl_request(code), &value as *const u32) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(unix)]
impl PageService for IoctlPageService {
    fn allocate_page(&mut self, page_id: u32) -> io::Result<()> {
        self.ioctl_write_u32(0, page_id)
    }

    fn release_page(&mut self, page_id: u32) -> io::Result<()> {
        self.ioctl_write_u32(1, page_id)
    }

    fn resize_fleet(&mut self, count: u32) -> io::Result<()> {
        self.ioctl_write_u32(2, count)
    }

    fn bytes_used(&self) -> io::Result<u64> {
        use std::os::unix::io::AsRawFd;
        let mut out: u64 = 0;
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), ioctl_request(3), &mut out as *mut u64) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(out)
        }
    }

    fn set_page_order(&mut self, order: u8) -> io::Result<()> {
        self.ioctl_write_u32(4, order as u32)
    }

    fn map_page(&mut self, page_id: u32, at: *mut u8) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;
        let page_size = crate::os::page_size() as u64;
        crate::os::map_file_fixed(self.file.as_raw_fd(), page_id as u64 * page_size, at, page_size as usize)
    }

    fn unmap(&mut self, at: *mut u8, len: usize) -> io::Result<()> {
        crate::os::reserve_fixed(at, len)
    }
}

/// In-memory mock used by tests (and anywhere the real device isn't
/// present): backs every page id with a real anonymous page and fakes
/// "multiple virtual mappings of one physical page" by copying content
/// in and out on map/unmap. This preserves the one property the virtual
/// engine actually depends on — a write through one mapping of a page
/// id is visible through a later mapping of the same id — without a
/// real shared-memory object.
pub struct InMemoryPageService {
    page_size: usize,
    pages: std::collections::HashMap<u32, Vec<u8>>,
    /// `at` address -> page id currently mapped there, so `unmap` knows
    /// what to copy back out.
    live_mappings: std::collections::HashMap<usize, u32>,
    order: u8,
}

impl InMemoryPageService {
    pub fn new() -> InMemoryPageService {
        InMemoryPageService {
            page_size: crate::os::page_size(),
            pages: std::collections::HashMap::new(),
            live_mappings: std::collections::HashMap::new(),
            order: 0,
        }
    }
}

impl Default for InMemoryPageService {
    fn default() -> Self {
        Self::new()
    }
}

impl PageService for InMemoryPageService {
    fn allocate_page(&mut self, page_id: u32) -> io::Result<()> {
        self.pages.entry(page_id).or_insert_with(|| vec![0u8; self.page_size]);
        Ok(())
    }

    fn release_page(&mut self, page_id: u32) -> io::Result<()> {
        self.pages.remove(&page_id);
        Ok(())
    }

    fn resize_fleet(&mut self, _count: u32) -> io::Result<()> {
        Ok(())
    }

    fn bytes_used(&self) -> io::Result<u64> {
        Ok((self.pages.len() * self.page_size) as u64)
    }

    fn set_page_order(&mut self, order: u8) -> io::Result<()> {
        if !self.pages.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "set_page_order requires an empty fleet",
            ));
        }
        self.order = order;
        self.page_size = 1usize << (order as u32 + 12);
        Ok(())
    }

    fn map_page(&mut self, page_id: u32, at: *mut u8) -> io::Result<()> {
        crate::os::commit(at, self.page_size)?;
        let content = self
            .pages
            .get(&page_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "page id not allocated"))?;
        unsafe {
            std::ptr::copy_nonoverlapping(content.as_ptr(), at, self.page_size);
        }
        self.live_mappings.insert(at as usize, page_id);
        Ok(())
    }

    fn unmap(&mut self, at: *mut u8, len: usize) -> io::Result<()> {
        if let Some(page_id) = self.live_mappings.remove(&(at as usize)) {
            if let Some(backing) = self.pages.get_mut(&page_id) {
                unsafe {
                    std::ptr::copy_nonoverlapping(at, backing.as_mut_ptr(), self.page_size.min(len));
                }
            }
        }
        crate::os::decommit(at, len)
    }
}
