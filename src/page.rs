//! The page object: one OS page mapping, shareable between LSA descriptors.
//!
//! A `Page` owns exactly one OS page mapping. It is never copied; instead
//! it is wrapped in an `Arc` and shared between LSA descriptors, so that
//! `Arc::strong_count` doubles as the page's reference count — a page is
//! exclusive while its count is 1 and shared while it is greater, and the
//! mapping is unmapped the moment the last `Arc` is dropped.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::error::LsaError;
use crate::sys;

/// One page-sized, anonymous, private OS mapping.
///
/// Only ever touched through raw pointers: it is read and written by the
/// `read`/`write` API while unprotected, and is otherwise unreachable from
/// safe Rust — invisible to ordinary loads and stores by construction.
pub(crate) struct Page {
    base: NonNull<c_void>,
    len: usize,
    /// How many `unprotect()`/`protect()` brackets are currently open on
    /// this mapping. The OS mapping's protection changes only on a 0→1 or
    /// 1→0 transition of this count, not on every call — so when the same
    /// `Page` is shared (via `Arc`) between two descriptors, one thread's
    /// `read`/`write` unprotecting or reprotecting it does not clobber a
    /// concurrent `read`/`write` on the other descriptor that is still
    /// mid-access on the same mapping.
    open_count: Mutex<usize>,
}

// SAFETY: a `Page` is just an OS mapping address plus its length. Sharing
// and sending it between threads is exactly the point of this crate — the
// mapping itself is protected by `mprotect`, not by Rust's aliasing rules.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    /// Allocates one new, fully protected page of `len` bytes (normally the
    /// host page size).
    pub(crate) fn new(len: usize) -> Result<Self, LsaError> {
        let base = sys::map_page(len)?;
        Ok(Self { base, len, open_count: Mutex::new(0) })
    }

    /// Allocates a new exclusive page and copies `self`'s bytes into it.
    /// Used by the copy-on-write split in `Descriptor::write`.
    ///
    /// `self` must already be unprotected by the caller (`Descriptor::write`
    /// unprotects every page up front, before any split can happen); this
    /// opens its own bracket on `fresh` so the copy below is valid and the
    /// fresh page is immediately writable for the remainder of the caller's
    /// write. The caller's closing reprotect pass balances that bracket.
    pub(crate) fn cow_copy(&self) -> Result<Self, LsaError> {
        let fresh = Self::new(self.len)?;
        fresh.unprotect()?;
        // SAFETY: both ranges are `len` bytes, non-overlapping (distinct
        // mappings), `self` unprotected per the caller's contract above, and
        // `fresh` just unprotected.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.as_ptr().cast::<u8>(),
                fresh.base.as_ptr().cast::<u8>(),
                self.len,
            );
        }
        Ok(fresh)
    }

    /// Opens one more read+write bracket on this page. Only the 0→1
    /// transition actually calls `mprotect`; a page already unprotected by
    /// another holder of this same (possibly `Arc`-shared) `Page` just has
    /// its open count bumped, so neither holder's closing `protect()` can
    /// re-arm `PROT_NONE` out from under the other.
    pub(crate) fn unprotect(&self) -> Result<(), LsaError> {
        let mut count = self.open_count.lock().unwrap();
        if *count == 0 {
            sys::protect_rw(self.base, self.len)?;
        }
        *count += 1;
        Ok(())
    }

    /// Closes one read+write bracket on this page. Only the 1→0 transition
    /// actually calls `mprotect`; must be paired one-to-one with a prior
    /// `unprotect()`.
    pub(crate) fn protect(&self) -> Result<(), LsaError> {
        let mut count = self.open_count.lock().unwrap();
        debug_assert!(*count > 0, "protect() called without a matching unprotect()");
        *count = count.saturating_sub(1);
        if *count == 0 {
            sys::protect_none(self.base, self.len)?;
        }
        Ok(())
    }

    /// The page-aligned base address, used both as this page's identity in
    /// the fault index and as the anchor for intra-page byte offsets.
    pub(crate) fn base_addr(&self) -> usize {
        self.base.as_ptr().addr()
    }

    /// The current unprotect/protect bracket depth. Test-only: lets tests
    /// confirm a page actually returns to fully protected (count 0) rather
    /// than just checking it's still readable, which the open bracket would
    /// also satisfy.
    #[cfg(test)]
    pub(crate) fn open_count(&self) -> usize {
        *self.open_count.lock().unwrap()
    }

    /// Reads one byte at `offset` (which must be `< len`). The page must
    /// already be unprotected by the caller.
    pub(crate) fn read_byte(&self, offset: usize) -> u8 {
        debug_assert!(offset < self.len);
        // SAFETY: the page is `len` bytes and currently readable, per the
        // caller's contract (enforced by every call site holding the
        // descriptor's unprotect/reprotect bracket).
        unsafe { self.base.as_ptr().cast::<u8>().add(offset).read() }
    }

    /// Writes one byte at `offset` (which must be `< len`). The page must
    /// already be unprotected by the caller.
    pub(crate) fn write_byte(&self, offset: usize, value: u8) {
        debug_assert!(offset < self.len);
        // SAFETY: see `read_byte`.
        unsafe { self.base.as_ptr().cast::<u8>().add(offset).write(value) }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        sys::unmap_page(self.base, self.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_page_round_trips_a_byte() {
        let page = Page::new(4096).unwrap();
        page.unprotect().unwrap();
        page.write_byte(0, 0xAB);
        page.write_byte(4095, 0xCD);
        assert_eq!(page.read_byte(0), 0xAB);
        assert_eq!(page.read_byte(4095), 0xCD);
        page.protect().unwrap();
    }

    #[test]
    fn cow_copy_duplicates_content_into_a_distinct_mapping() {
        let page = Page::new(4096).unwrap();
        page.unprotect().unwrap();
        page.write_byte(10, 42);
        let copy = page.cow_copy().unwrap();
        assert_ne!(page.base_addr(), copy.base_addr());
        assert_eq!(copy.read_byte(10), 42);
        page.write_byte(10, 7);
        assert_eq!(copy.read_byte(10), 42, "the copy must not see later writes to the original");
        page.protect().unwrap();
        copy.protect().unwrap();
    }

    #[test]
    fn nested_unprotect_brackets_stay_open_until_the_last_protect() {
        // Models two descriptors sharing one `Page` (via `Arc`) each
        // bracketing their own `read`/`write` around it: the mapping must
        // stay readable until both brackets close, not just the first.
        let page = Page::new(4096).unwrap();
        page.unprotect().unwrap();
        page.write_byte(0, 1);
        page.unprotect().unwrap();
        page.protect().unwrap();
        // Still open once (outer bracket): the byte must still be reachable.
        assert_eq!(page.read_byte(0), 1);
        page.protect().unwrap();
    }
}
