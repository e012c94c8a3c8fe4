//! A per-thread, page-granular, memory-protected local storage area (LSA)
//! with copy-on-write cloning.
//!
//! Each OS thread may own at most one LSA: a byte region backed by one or
//! more full OS pages, invisible to ordinary loads and stores because its
//! pages sit at `PROT_NONE` outside of the narrow [`create`], [`destroy`],
//! [`read`], [`write`], and [`clone_from`] API below. Touching an LSA's
//! memory any other way raises `SIGSEGV`/`SIGBUS`, which this crate's fault
//! interceptor turns into the termination of just the offending thread.
//!
//! ```no_run
//! lsa::create(64).unwrap();
//! lsa::write(0, b"hello").unwrap();
//! let mut out = [0u8; 5];
//! lsa::read(0, &mut out).unwrap();
//! assert_eq!(&out, b"hello");
//! lsa::destroy().unwrap();
//! ```

mod descriptor;
mod error;
mod fault;
mod page;
mod registry;
mod runtime;
mod sys;

use std::thread::ThreadId;

pub use error::{LsaError, LsaResult};
pub use fault::faults_handled;

use descriptor::Descriptor;
use runtime::Runtime;

/// Creates the calling thread's LSA, `size` bytes long (rounded up to a
/// whole number of pages). Fails if the thread already owns one
/// ([`LsaError::AlreadyOwnsLsa`]) or if `size` is zero
/// ([`LsaError::ZeroSize`]).
pub fn create(size: usize) -> LsaResult<()> {
    let runtime = Runtime::get();
    let owner = std::thread::current().id();
    let descriptor = Descriptor::create(owner, size, runtime.page_size)?;
    let mut registry = runtime.registry.lock().unwrap();
    registry.insert(owner, descriptor)?;
    Ok(())
}

/// Destroys the calling thread's LSA, unmapping any page this was the last
/// reference to. Fails if the thread owns no LSA ([`LsaError::NoLsa`]).
pub fn destroy() -> LsaResult<()> {
    let runtime = Runtime::get();
    let owner = std::thread::current().id();
    let descriptor = {
        let mut registry = runtime.registry.lock().unwrap();
        registry.remove(owner)?
    };
    match std::sync::Arc::try_unwrap(descriptor) {
        Ok(descriptor) => descriptor.release(),
        Err(descriptor) => {
            // Some other thread is mid-`clone_from` and still holds a
            // reference to this same `Arc<Descriptor>` (not to its pages —
            // to the registry entry itself, briefly, while copying the page
            // list out). Dropping our reference here is enough; the pages
            // stay live until that clone finishes building its own copy.
            drop(descriptor);
        }
    }
    Ok(())
}

/// Reads `out.len()` bytes starting at `offset` from the calling thread's
/// LSA. Fails if the thread owns no LSA, or if the range is out of bounds.
pub fn read(offset: usize, out: &mut [u8]) -> LsaResult<()> {
    let runtime = Runtime::get();
    let owner = std::thread::current().id();
    let descriptor = {
        let registry = runtime.registry.lock().unwrap();
        registry.get(owner)?
    };
    descriptor.read(offset, out.len(), out, runtime.page_size)
}

/// Writes `input` starting at `offset` into the calling thread's LSA,
/// breaking copy-on-write sharing one page at a time as the write crosses
/// into each shared page. Fails if the thread owns no LSA, or if the range
/// is out of bounds.
pub fn write(offset: usize, input: &[u8]) -> LsaResult<()> {
    let runtime = Runtime::get();
    let owner = std::thread::current().id();
    let descriptor = {
        let registry = runtime.registry.lock().unwrap();
        registry.get(owner)?
    };
    descriptor.write(offset, input.len(), input, runtime.page_size)
}

/// Gives the calling thread its own LSA that shares every page, by
/// reference, with `source`'s LSA — a copy-on-write clone. Fails if the
/// calling thread already owns an LSA, or if `source` owns none.
pub fn clone_from(source: ThreadId) -> LsaResult<()> {
    let runtime = Runtime::get();
    let owner = std::thread::current().id();
    let mut registry = runtime.registry.lock().unwrap();
    let source_descriptor = registry.get_other(source)?;
    let cloned = source_descriptor.share_for_clone(owner);
    registry.insert(owner, cloned)?;
    Ok(())
}

/// Returns the raw base address of the calling thread's first LSA page.
///
/// This exists only so `lsa-demo --demonstrate-fault` can show the
/// interceptor terminating a thread that pokes its LSA outside the API —
/// there is deliberately no other way to get a pointer into LSA memory out
/// of this crate. Not part of the supported API surface.
#[cfg(feature = "demo")]
#[doc(hidden)]
pub fn debug_lsa_base_addr() -> LsaResult<usize> {
    let runtime = Runtime::get();
    let owner = std::thread::current().id();
    let registry = runtime.registry.lock().unwrap();
    let descriptor = registry.get(owner)?;
    let pages = descriptor.pages.lock().unwrap();
    Ok(pages[0].base_addr())
}
