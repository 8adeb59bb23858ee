//! # Memory Mapping
//!
//! ## Purpose
//!
//! This module provides the safe owner type for every `mmap` region the
//! library creates: the umem frame area and the four kernel ring mappings.
//!
//! ## How it works
//!
//! `OwnedMmap` encapsulates a raw pointer to a memory-mapped region and its
//! size, and calls `libc::munmap` in its `Drop` implementation. Ring
//! mappings are shared between cursor handles and per-queue contexts via
//! `Arc<OwnedMmap>`, so a region is unmapped exactly when its last holder
//! goes away.
//!
//! ## Main components
//!
//! - `OwnedMmap`: a struct that acts as the single owner of a mapped region.
//! - `OwnedMmap::anon()`: anonymous shared memory for the umem frame area.
//! - `OwnedMmap::map_fd()`: a shared mapping of a kernel ring.

use std::{io, ptr};

/// A safe wrapper for a memory-mapped region.
///
/// Owns the pointer and ensures that `munmap` is called when the value goes
/// out of scope.
pub struct OwnedMmap(*mut libc::c_void, usize);

// The region is plain shared memory; the kernel side is synchronized through
// the atomic ring counters, never through the mapping handle itself.
unsafe impl Send for OwnedMmap {}
unsafe impl Sync for OwnedMmap {}

impl OwnedMmap {
    /// Allocates an anonymous, shared, pre-faulted region suitable for use
    /// as a umem frame area. The size is rounded up to the page size.
    pub fn anon(size: usize) -> Result<Self, io::Error> {
        let page_size = page_size();
        let aligned_size = (size + page_size - 1) & !(page_size - 1);
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(OwnedMmap(ptr, aligned_size))
    }

    /// Maps `len` bytes of the object behind `fd` at page offset `pgoff`.
    ///
    /// This is how the kernel exposes the fill/completion/rx/tx rings of an
    /// AF_XDP socket; `pgoff` selects the ring.
    pub(crate) fn map_fd(fd: libc::c_int, len: usize, pgoff: u64) -> Result<Self, io::Error> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                pgoff as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(OwnedMmap(ptr, len))
    }

    /// Returns the raw pointer to the memory-mapped region.
    pub fn as_void_ptr(&self) -> *mut libc::c_void {
        self.0
    }

    /// Returns the raw pointer to the memory-mapped region as bytes.
    pub fn as_u8_ptr(&self) -> *mut u8 {
        self.0 as *mut u8
    }

    /// Returns the size of the memory-mapped region in bytes.
    pub fn len(&self) -> usize {
        self.1
    }

    /// Returns `true` if the memory-mapped region has a size of zero.
    pub fn is_empty(&self) -> bool {
        self.1 == 0
    }
}

impl Drop for OwnedMmap {
    fn drop(&mut self) {
        unsafe {
            if self.0 != libc::MAP_FAILED && !self.0.is_null() {
                let res = libc::munmap(self.0, self.1);
                if res < 0 {
                    log::error!("Failed to unmap memory: {}", io::Error::last_os_error());
                }
            }
        }
    }
}

/// The system page size.
pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_mapping_is_page_aligned_and_zeroed() {
        let map = OwnedMmap::anon(100).unwrap();
        assert_eq!(map.len() % page_size(), 0);
        assert!(map.len() >= 100);
        let bytes = unsafe { std::slice::from_raw_parts(map.as_u8_ptr(), map.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
