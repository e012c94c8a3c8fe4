use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{self, MapFlags, ProtFlags};

use crate::error::LsaError;

/// Queries the host page size. Called once, at process-wide init time.
///
/// SAFETY: `sysconf(_SC_PAGESIZE)` is always safe to call and cannot error.
pub(crate) fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).expect("sysconf(_SC_PAGESIZE) returned a negative value")
}

/// Creates one new anonymous, private, page-sized mapping with no access
/// permissions. A page is born protected.
pub(crate) fn map_page(len: usize) -> Result<NonNull<c_void>, LsaError> {
    let len = NonZeroUsize::new(len).expect("page length must be non-zero");
    // SAFETY: anonymous + private mappings have no aliasing requirements on
    // the caller beyond picking a sane length, which we just did.
    unsafe {
        mman::mmap_anonymous(
            None,
            len,
            ProtFlags::PROT_NONE,
            MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
        )
    }
    .map_err(LsaError::MapFailed)
}

/// Strips all access from one page.
pub(crate) fn protect_none(addr: NonNull<c_void>, len: usize) -> Result<(), LsaError> {
    // SAFETY: `addr`/`len` describe a page previously obtained from `map_page`
    // and still live; changing its protection does not invalidate any Rust
    // reference since the page is only ever touched through raw pointers.
    unsafe { mman::mprotect(addr, len, ProtFlags::PROT_NONE) }.map_err(LsaError::ProtectFailed)
}

/// Grants read+write access to one page.
pub(crate) fn protect_rw(addr: NonNull<c_void>, len: usize) -> Result<(), LsaError> {
    // SAFETY: see `protect_none`.
    unsafe { mman::mprotect(addr, len, ProtFlags::PROT_READ | ProtFlags::PROT_WRITE) }
        .map_err(LsaError::ProtectFailed)
}

/// Unmaps one page. Called exactly once per page, when its last reference
/// is dropped (see `Page`'s `Drop` impl).
pub(crate) fn unmap_page(addr: NonNull<c_void>, len: usize) {
    // SAFETY: by the time this runs, `Page::drop` guarantees no other
    // `Arc<Page>` exists, so nothing else can still be touching this mapping.
    if let Err(e) = unsafe { mman::munmap(addr, len) } {
        tracing::warn!(error = %e, "munmap of a released LSA page failed");
    }
}
