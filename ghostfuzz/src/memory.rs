//! Thin wrappers over the OS memory mapping calls.

use std::io;
use std::ptr;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
});

/// Returns the native page size.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Rounds `addr` down to the start of its page.
pub fn page_align_down(addr: usize) -> usize {
    addr & !(page_size() - 1)
}

pub fn is_page_aligned(value: usize) -> bool {
    value % page_size() == 0
}

/// An anonymous mapping owned by this process and released on drop.
#[derive(Debug)]
pub struct Mapping {
    base: *mut u8,
    len: usize,
}

impl Mapping {
    /// Maps `len` bytes anywhere in the address space with the given protection.
    pub fn anonymous(len: usize, prot: libc::c_int) -> Result<Self> {
        // SAFETY: no fixed address is requested, so no existing mapping is touched.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error()).with_context(|| format!("mmap of {len} bytes"));
        }
        Ok(Self {
            base: base.cast(),
            len,
        })
    }

    /// Changes the protection of `[offset, offset + len)` inside this mapping.
    pub fn protect(&mut self, offset: usize, len: usize, prot: libc::c_int) -> Result<()> {
        anyhow::ensure!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "out of bounds mprotect"
        );
        // SAFETY: the range lies inside this mapping.
        if unsafe { libc::mprotect(self.base.add(offset).cast(), len, prot) } != 0 {
            return Err(io::Error::last_os_error()).context("mprotect");
        }
        Ok(())
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address range covered by the mapping.
    pub fn range(&self) -> std::ops::Range<usize> {
        let start = self.base as usize;
        start..start + self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/len describe a mapping created by `anonymous`.
        unsafe {
            libc::munmap(self.base.cast(), self.len);
        }
    }
}

/// Maps `len` read/write bytes at exactly `addr`, refusing to replace anything
/// already mapped there.
///
/// Returns the address the kernel actually chose; kernels that predate
/// `MAP_FIXED_NOREPLACE` treat the address as a hint, so callers must compare.
pub fn map_fixed_noreplace(addr: usize, len: usize) -> io::Result<usize> {
    // SAFETY: MAP_FIXED_NOREPLACE never clobbers an existing mapping.
    let mapped = unsafe {
        libc::mmap(
            addr as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )
    };
    if mapped == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(mapped as usize)
}

/// Releases `[addr, addr + len)`.
///
/// # Safety
///
/// Nothing in the process may still reference the range.
pub unsafe fn unmap(addr: usize, len: usize) -> io::Result<()> {
    // SAFETY: guaranteed by the caller.
    if unsafe { libc::munmap(addr as *mut libc::c_void, len) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
