//! # Virtual Memory Primitives
//!
//! Thin wrappers over the OS calls the segment allocator is built on:
//! reserving address space, committing pages, and handing physical pages
//! back while keeping the reservation.
//!
//! Every failure is reported as a [`VmError`]. Callers on the C ABI treat
//! these as fatal; the library layer only propagates them.

use std::io;
use std::ptr;

use thiserror::Error;

/// Page size assumed by the allocator's per-page bookkeeping.
pub const PAGE_SIZE: usize = 4096;

/// Granule by which a segment's committed region grows.
///
/// Equal to the page size, so small objects never straddle a page and
/// every committed page begins with an object header.
pub const COMMIT_SIZE: usize = PAGE_SIZE;

/// Failure of an OS memory-management call.
#[derive(Debug, Error)]
pub enum VmError {
    /// `mmap` could not reserve the requested range.
    #[error("failed to reserve {len} bytes of address space: {source}")]
    Reserve {
        /// Requested reservation length.
        len: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// `mprotect` rejected a protection change.
    #[error("failed to change protection of {len} bytes at {addr:#x}: {source}")]
    Protect {
        /// Start of the range.
        addr: usize,
        /// Length of the range.
        len: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// `madvise` could not drop the physical backing.
    #[error("failed to release physical pages at {addr:#x} ({len} bytes): {source}")]
    Release {
        /// Start of the range.
        addr: usize,
        /// Length of the range.
        len: usize,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Reserve `len` bytes of inaccessible address space.
///
/// The range is never unmapped; segments live until process exit.
pub fn reserve(len: usize) -> Result<usize, VmError> {
    // SAFETY: a fresh anonymous mapping does not alias any existing memory.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(VmError::Reserve {
            len,
            source: io::Error::last_os_error(),
        });
    }
    Ok(addr as usize)
}

/// Make `[addr, addr + len)` readable and writable.
///
/// # Safety
/// The range must lie inside a reservation obtained from [`reserve`].
pub unsafe fn commit(addr: usize, len: usize) -> Result<(), VmError> {
    if libc::mprotect(addr as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_WRITE) != 0 {
        return Err(VmError::Protect {
            addr,
            len,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Revoke access to `[addr, addr + len)` and drop its physical pages.
///
/// A later [`commit`] of the same range observes zero-filled memory.
///
/// # Safety
/// The range must lie inside a reservation obtained from [`reserve`], and
/// nothing may hold a live reference into it.
pub unsafe fn decommit(addr: usize, len: usize) -> Result<(), VmError> {
    if libc::mprotect(addr as *mut libc::c_void, len, libc::PROT_NONE) != 0 {
        return Err(VmError::Protect {
            addr,
            len,
            source: io::Error::last_os_error(),
        });
    }
    if libc::madvise(addr as *mut libc::c_void, len, libc::MADV_DONTNEED) != 0 {
        return Err(VmError::Release {
            addr,
            len,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Highest address (exclusive) of the calling thread's stack.
#[cfg(target_os = "linux")]
pub fn current_stack_base() -> Option<usize> {
    // SAFETY: `attr` is initialized by pthread_getattr_np before any read and
    // destroyed exactly once.
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut base: *mut libc::c_void = ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut base, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 {
            return None;
        }
        Some(base as usize + size)
    }
}

/// Highest address (exclusive) of the calling thread's stack.
#[cfg(not(target_os = "linux"))]
pub fn current_stack_base() -> Option<usize> {
    None
}
