//! Page mapper
//!
//! Thin wrapper over anonymous page mappings. Cell pools and buffer arenas
//! are carved out of [`Mapping`]s; a mapping is returned to the OS when it
//! is dropped. Fresh mappings are always zero-filled.

use crate::defaults::FALLBACK_PAGE_SIZE;
use crate::{GcError, GcResult};
use once_cell::sync::Lazy;
use std::ptr::NonNull;

static PAGE_SIZE: Lazy<usize> = Lazy::new(query_page_size);

#[cfg(unix)]
fn query_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        FALLBACK_PAGE_SIZE
    }
}

#[cfg(not(unix))]
fn query_page_size() -> usize {
    FALLBACK_PAGE_SIZE
}

/// OS page size in bytes
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Round `size` up to a multiple of the page size
#[inline]
pub fn page_align(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

/// An owned range of mapped pages
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
    exec: bool,
}

// SAFETY: a mapping is plain memory owned by exactly one Mapping value.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Map `len` bytes (rounded up to whole pages) of read/write memory
    pub fn new(len: usize) -> GcResult<Self> {
        Self::map(len, false)
    }

    /// Map `len` bytes of read/write/execute memory
    pub fn new_exec(len: usize) -> GcResult<Self> {
        Self::map(len, true)
    }

    fn map(len: usize, exec: bool) -> GcResult<Self> {
        let len = page_align(len.max(1));
        match map_pages(len, exec) {
            Some(ptr) => {
                tracing::trace!(target: "ming::gc", len, exec, "mapped pages");
                Ok(Self { ptr, len, exec })
            }
            None => {
                tracing::error!(target: "ming::gc", len, exec, "page mapping failed");
                Err(GcError::OutOfMemory { requested: len })
            }
        }
    }

    /// Start of the mapping
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length of the mapping in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is executable
    #[inline]
    pub fn is_exec(&self) -> bool {
        self.exec
    }

    /// Check whether `addr` falls inside this mapping
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr.as_ptr() as usize;
        addr >= start && addr < start + self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        tracing::trace!(target: "ming::gc", len = self.len, "unmapped pages");
        // SAFETY: ptr/len came from map_pages and are unmapped exactly once.
        unsafe { unmap_pages(self.ptr, self.len) }
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("exec", &self.exec)
            .finish()
    }
}

#[cfg(unix)]
fn map_pages(len: usize, exec: bool) -> Option<NonNull<u8>> {
    let mut prot = libc::PROT_READ | libc::PROT_WRITE;
    if exec {
        prot |= libc::PROT_EXEC;
    }
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        None
    } else {
        NonNull::new(ptr as *mut u8)
    }
}

#[cfg(unix)]
unsafe fn unmap_pages(ptr: NonNull<u8>, len: usize) {
    libc::munmap(ptr.as_ptr() as *mut libc::c_void, len);
}

#[cfg(not(unix))]
fn map_pages(len: usize, _exec: bool) -> Option<NonNull<u8>> {
    let layout = std::alloc::Layout::from_size_align(len, page_size()).ok()?;
    NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
}

#[cfg(not(unix))]
unsafe fn unmap_pages(ptr: NonNull<u8>, len: usize) {
    let layout = std::alloc::Layout::from_size_align_unchecked(len, page_size());
    std::alloc::dealloc(ptr.as_ptr(), layout);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert!(page_size() >= 512);
    }

    #[test]
    fn test_page_align() {
        let page = page_size();
        assert_eq!(page_align(1), page);
        assert_eq!(page_align(page), page);
        assert_eq!(page_align(page + 1), 2 * page);
    }

    #[test]
    fn test_mapping_is_zeroed_and_writable() {
        let map = Mapping::new(100).unwrap();
        assert_eq!(map.len(), page_size());
        assert_eq!(map.as_ptr() as usize % page_size(), 0);

        let bytes = unsafe { std::slice::from_raw_parts_mut(map.as_ptr(), map.len()) };
        assert!(bytes.iter().all(|b| *b == 0));
        bytes[0] = 0xAB;
        bytes[map.len() - 1] = 0xCD;
        assert_eq!(bytes[0], 0xAB);
        assert!(map.contains(map.as_ptr() as usize));
        assert!(!map.contains(map.as_ptr() as usize + map.len()));
    }

    #[test]
    fn test_exec_mapping() {
        let map = Mapping::new_exec(page_size()).unwrap();
        assert!(map.is_exec());
    }
}
