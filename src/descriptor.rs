//! The LSA descriptor: one thread's byte-addressable view over its pages.

use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use crate::error::{LsaError, LsaResult};
use crate::fault;
use crate::page::Page;

/// One thread's Local Storage Area.
///
/// `owner` and `size` never change after construction (LSAs cannot be
/// resized); only the page slots themselves can change, on a CoW split,
/// which is why they alone sit behind a `Mutex`. Holding that mutex is also
/// what serializes a `write`'s CoW read-check-act against a concurrent
/// clone of this same descriptor.
pub(crate) struct Descriptor {
    pub(crate) owner: ThreadId,
    pub(crate) size: usize,
    pub(crate) pages: Mutex<Vec<Arc<Page>>>,
}

/// Splits a byte offset into `(page index, intra-page offset)`.
fn split(offset: usize, page_size: usize) -> (usize, usize) {
    (offset / page_size, offset % page_size)
}

impl Descriptor {
    /// Allocates a fresh, fully protected descriptor of `size` bytes.
    /// Rolls back every page already mapped if a later allocation fails.
    pub(crate) fn create(owner: ThreadId, size: usize, page_size: usize) -> LsaResult<Self> {
        if size == 0 {
            return Err(LsaError::ZeroSize);
        }
        let page_count = size.div_ceil(page_size);
        let mut pages = Vec::with_capacity(page_count);
        for _ in 0..page_count {
            match Page::new(page_size) {
                Ok(page) => pages.push(Arc::new(page)),
                Err(e) => {
                    // Partial failure: everything allocated so far is
                    // dropped here (unmapping each page), and we fail the
                    // whole operation. Nothing was published to the fault
                    // index yet, so there is nothing to unpublish.
                    return Err(e);
                }
            }
        }
        for page in &pages {
            fault::add_address(page.base_addr());
        }
        Ok(Self { owner, size, pages: Mutex::new(pages) })
    }

    /// Checks `[offset, offset + length)` against `size`, guarding against
    /// integer overflow in the addition itself.
    pub(crate) fn check_range(&self, offset: usize, length: usize) -> LsaResult<()> {
        let end = offset.checked_add(length).ok_or(LsaError::OutOfBounds)?;
        if end > self.size { Err(LsaError::OutOfBounds) } else { Ok(()) }
    }

    /// Unprotects every page, copies `length` bytes starting at `offset`
    /// into `out`, then reprotects every page. Not CoW-sensitive: shared
    /// pages are read in place.
    pub(crate) fn read(&self, offset: usize, length: usize, out: &mut [u8], page_size: usize) -> LsaResult<()> {
        self.check_range(offset, length)?;
        let pages = self.pages.lock().unwrap();
        for page in pages.iter() {
            page.unprotect()?;
        }
        for (i, slot) in out.iter_mut().enumerate() {
            let (page_idx, intra) = split(offset + i, page_size);
            *slot = pages[page_idx].read_byte(intra);
        }
        for page in pages.iter() {
            page.protect()?;
        }
        Ok(())
    }

    /// Unprotects every page, then walks `[offset, offset + length)`
    /// writing `input` byte by byte, breaking copy-on-write at every page
    /// boundary entered where the current page is shared.
    /// Reprotects every page once the whole range has been written, even if
    /// a CoW split partway through failed (pages already split stay split).
    pub(crate) fn write(&self, offset: usize, length: usize, input: &[u8], page_size: usize) -> LsaResult<()> {
        self.check_range(offset, length)?;
        let mut pages = self.pages.lock().unwrap();
        for page in pages.iter() {
            page.unprotect()?;
        }

        let mut last_page_idx: Option<usize> = None;
        let result = (|| -> LsaResult<()> {
            for (i, &byte) in input.iter().enumerate() {
                let (page_idx, intra) = split(offset + i, page_size);
                if last_page_idx != Some(page_idx) {
                    Self::break_share(&mut pages, page_idx)?;
                    last_page_idx = Some(page_idx);
                }
                pages[page_idx].write_byte(intra, byte);
            }
            Ok(())
        })();

        // Reprotect every page regardless of whether the loop above
        // succeeded, so a failed write never leaves pages unprotected.
        for page in pages.iter() {
            page.protect()?;
        }
        result
    }

    /// If `pages[page_idx]` is currently shared (`Arc::strong_count > 1`),
    /// allocates an exclusive copy and installs it in the slot, dropping
    /// this descriptor's reference to the old, shared page. Otherwise does
    /// nothing.
    fn break_share(pages: &mut [Arc<Page>], page_idx: usize) -> LsaResult<()> {
        if Arc::strong_count(&pages[page_idx]) > 1 {
            let old = Arc::clone(&pages[page_idx]);
            let fresh = old.cow_copy()?;
            fault::add_address(fresh.base_addr());
            pages[page_idx] = Arc::new(fresh);
            // The old `Arc` (dropped by the assignment above, modulo the
            // clone we took) was shared, so at least one other descriptor
            // still holds it; its address stays live in the fault index and
            // its mapping stays mapped. But the old page has left `pages`,
            // so the outer `write`'s closing reprotect loop will never see
            // it again — close the bracket that loop's opening pass put on
            // it here instead. This only decrements `old`'s open count; if
            // another descriptor still has its own bracket open on the same
            // `Page`, the mapping is not actually reprotected to
            // `PROT_NONE` until that descriptor closes its bracket too.
            old.protect()?;
        }
        Ok(())
    }

    /// Builds a new descriptor sharing every page with `self`, bumping each
    /// page's reference count by one. The address set is unchanged by a
    /// clone, so the fault index needs no update.
    pub(crate) fn share_for_clone(&self, new_owner: ThreadId) -> Self {
        let pages = self.pages.lock().unwrap();
        let shared = pages.iter().cloned().collect::<Vec<_>>();
        Self { owner: new_owner, size: self.size, pages: Mutex::new(shared) }
    }

    /// Drops this descriptor's reference to each of its pages, unpublishing
    /// from the fault index any page whose last reference this is, before
    /// that page's `Drop` impl actually unmaps it.
    pub(crate) fn release(self) {
        let mut pages = self.pages.lock().unwrap();
        for page in pages.drain(..) {
            if Arc::strong_count(&page) == 1 {
                fault::remove_address(page.base_addr());
            }
            drop(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid() -> ThreadId {
        std::thread::current().id()
    }

    #[test]
    fn create_rejects_zero_size() {
        assert!(matches!(Descriptor::create(tid(), 0, 4096), Err(LsaError::ZeroSize)));
    }

    #[test]
    fn range_check_rejects_overflow_and_out_of_bounds() {
        let d = Descriptor::create(tid(), 4096, 4096).unwrap();
        assert!(d.check_range(4096, 1).is_err());
        assert!(d.check_range(usize::MAX, 1).is_err());
        assert!(d.check_range(4095, 1).is_ok());
        d.release();
    }

    #[test]
    fn write_then_read_round_trips() {
        let d = Descriptor::create(tid(), 4096, 4096).unwrap();
        d.write(0, 5, b"hello", 4096).unwrap();
        let mut out = [0u8; 5];
        d.read(0, 5, &mut out, 4096).unwrap();
        assert_eq!(&out, b"hello");
        d.release();
    }

    #[test]
    fn clone_shares_pages_until_first_write() {
        let d = Descriptor::create(tid(), 4096, 4096).unwrap();
        d.write(0, 4, b"ABCD", 4096).unwrap();
        let cloned = d.share_for_clone(tid());
        assert_eq!(Arc::strong_count(&d.pages.lock().unwrap()[0]), 2);

        let mut out = [0u8; 4];
        cloned.read(0, 4, &mut out, 4096).unwrap();
        assert_eq!(&out, b"ABCD");

        cloned.write(0, 1, b"X", 4096).unwrap();
        let mut out1 = [0u8; 4];
        let mut out2 = [0u8; 4];
        d.read(0, 4, &mut out1, 4096).unwrap();
        cloned.read(0, 4, &mut out2, 4096).unwrap();
        assert_eq!(&out1, b"ABCD");
        assert_eq!(&out2, b"XBCD");

        d.release();
        cloned.release();
    }

    #[test]
    fn cow_split_fully_reprotects_the_donor_page_it_left_behind() {
        let d = Descriptor::create(tid(), 4096, 4096).unwrap();
        d.write(0, 4, b"ABCD", 4096).unwrap();
        let cloned = d.share_for_clone(tid());
        let donor = Arc::clone(&cloned.pages.lock().unwrap()[0]);

        // This write splits page 0 out of `d`'s slot; `donor` (still held by
        // `cloned`) must end up with its bracket fully closed again, not
        // left open just because it is no longer in `d`'s own page list.
        d.write(0, 1, b"Z", 4096).unwrap();
        assert_eq!(donor.open_count(), 0, "donor page must be back to fully protected, not left unprotected");

        // The clone's own read still works normally afterward.
        let mut out = [0u8; 4];
        cloned.read(0, 4, &mut out, 4096).unwrap();
        assert_eq!(&out, b"ABCD");

        d.release();
        cloned.release();
    }

    #[test]
    fn concurrent_brackets_on_a_shared_page_do_not_clobber_each_other() {
        // Two descriptors sharing a page: one's reprotect must not strip
        // access while the other is still mid-access on the same page.
        let d = Descriptor::create(tid(), 4096, 4096).unwrap();
        let cloned = d.share_for_clone(tid());
        let page = Arc::clone(&d.pages.lock().unwrap()[0]);

        page.unprotect().unwrap(); // simulates d's read/write opening its bracket
        page.unprotect().unwrap(); // simulates cloned's read/write opening its bracket
        page.protect().unwrap(); // d finishes first
        // cloned's bracket is still open: the page must still be accessible.
        assert_eq!(page.open_count(), 1);
        page.write_byte(0, 9);
        assert_eq!(page.read_byte(0), 9);
        page.protect().unwrap(); // cloned finishes
        assert_eq!(page.open_count(), 0);

        d.release();
        cloned.release();
    }
}
