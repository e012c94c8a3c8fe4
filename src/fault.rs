//! The fault interceptor: a process-wide `SIGSEGV`/`SIGBUS` handler.
//!
//! Installed once, for both signals. On entry it computes the page-aligned
//! base of the faulting address and checks it against a lock-free snapshot
//! of every page base address known to any LSA in the process. A match
//! means a thread touched LSA memory outside the API, and only that thread
//! is terminated (`pthread_exit`, not `process::exit`); no match means the
//! fault is unrelated and the OS's default disposition is restored before
//! re-raising, so the process dies with ordinary fault semantics.
//!
//! The handler runs in a signal-handler context and must stay
//! async-signal-safe: it takes no lock that user code might be holding and
//! performs no allocation. That rules out reading the `Mutex`-protected
//! registry directly, so page addresses are mirrored into a separate,
//! lock-free index that the handler reads via a single atomic load — a
//! `static` `AtomicPtr` swapped by ordinary code, read by the handler.

use std::ffi::c_int;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

/// How many times the interceptor has terminated a thread. Bumped from
/// inside the handler with a relaxed atomic (the one operation on the
/// match path besides the `pthread_exit` itself), so ordinary code can
/// observe and log it after the fact instead of logging from the handler.
static FAULTS_HANDLED: AtomicUsize = AtomicUsize::new(0);

/// The host page size, needed by the handler to align the faulting address.
/// Set once by `install` before any fault can occur.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// The lock-free snapshot of every live LSA page's base address, sorted for
/// binary search. Never null once `install` has run.
static PAGE_INDEX: AtomicPtr<Vec<usize>> = AtomicPtr::new(std::ptr::null_mut());

/// Installs the `SIGSEGV`/`SIGBUS` handlers and the (initially empty) page
/// index. Called exactly once, from `Runtime::get`'s `OnceLock`
/// initializer, which is itself single-run — so no extra guard is needed
/// here.
pub(crate) fn install(page_size: usize) {
    PAGE_SIZE.store(page_size, Ordering::Relaxed);
    publish(Vec::new());

    let action = SigAction::new(SigHandler::SigAction(handle_fault), SaFlags::empty(), SigSet::empty());
    // SAFETY: `handle_fault` only touches async-signal-safe state (atomics)
    // and either calls `pthread_exit` or resets the disposition and
    // re-raises; it never runs Rust unwinding or allocates.
    unsafe {
        sigaction(Signal::SIGSEGV, &action).expect("failed to install SIGSEGV handler");
        sigaction(Signal::SIGBUS, &action).expect("failed to install SIGBUS handler");
    }
}

/// How many threads the interceptor has terminated so far. Exposed so the
/// demo harness and tests can observe the protection-fault path without
/// joining the (terminated) victim thread — see SPEC_FULL.md §8.
pub fn faults_handled() -> usize {
    FAULTS_HANDLED.load(Ordering::Relaxed)
}

/// Publishes a brand new page-address snapshot, replacing whatever was
/// published before. Used by `create`/`destroy`/the CoW path in `write`
/// whenever the *set* of live page addresses changes.
fn publish(mut addrs: Vec<usize>) {
    addrs.sort_unstable();
    addrs.dedup();
    let new_ptr = Box::into_raw(Box::new(addrs));
    let _old_ptr = PAGE_INDEX.swap(new_ptr, Ordering::AcqRel);
    // `_old_ptr` (if non-null) is deliberately never turned back into a `Box`
    // and freed: the handler may run on another thread at any instant and
    // could be mid-read of the snapshot we just replaced. There is no
    // quiescence point at which we could safely free it, so old snapshots
    // are never reclaimed for the life of the process.
}

/// Adds one page's address to the index if it isn't already present.
/// Lock-free: a compare-exchange loop so concurrent CoW splits on
/// unrelated descriptors don't stomp on each other's publication.
pub(crate) fn add_address(addr: usize) {
    loop {
        let old_ptr = PAGE_INDEX.load(Ordering::Acquire);
        // SAFETY: never null after `install`, and always points at a fully
        // initialized `Vec` published by `publish`/`add_address`/`remove_address`.
        let old = unsafe { &*old_ptr };
        if old.binary_search(&addr).is_ok() {
            return;
        }
        let mut updated = old.clone();
        updated.push(addr);
        updated.sort_unstable();
        let new_ptr = Box::into_raw(Box::new(updated));
        match PAGE_INDEX.compare_exchange(old_ptr, new_ptr, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return, // `old_ptr` leaked on purpose, see `publish`.
            Err(_) => {
                // Lost the race; our new snapshot was never published, so it's
                // still exclusively ours and safe to actually free. Retry.
                unsafe { drop(Box::from_raw(new_ptr)) };
            }
        }
    }
}

/// Removes one page's address from the index. Called only once it is known
/// that no descriptor references the page anymore (see `Descriptor::destroy`).
pub(crate) fn remove_address(addr: usize) {
    loop {
        let old_ptr = PAGE_INDEX.load(Ordering::Acquire);
        // SAFETY: see `add_address`.
        let old = unsafe { &*old_ptr };
        if old.binary_search(&addr).is_err() {
            return;
        }
        let updated: Vec<usize> = old.iter().copied().filter(|a| *a != addr).collect();
        let new_ptr = Box::into_raw(Box::new(updated));
        match PAGE_INDEX.compare_exchange(old_ptr, new_ptr, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(_) => unsafe { drop(Box::from_raw(new_ptr)) },
        }
    }
}

/// The actual `SIGSEGV`/`SIGBUS` entry point.
///
/// # Safety contract
/// Must remain async-signal-safe: no allocation, no locks user code might
/// hold, no Rust panicking/unwinding.
extern "C" fn handle_fault(sig: c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let page_size = PAGE_SIZE.load(Ordering::Relaxed);
    if page_size == 0 {
        // Shouldn't happen: `install` always sets this before the handler
        // can be reached. Fail safe by falling through to the unrelated-fault path.
        restore_default_and_reraise(sig);
        return;
    }

    // SAFETY: `info` is valid for the duration of signal delivery, as
    // guaranteed by the kernel for an `SA_SIGINFO` handler.
    let addr = unsafe { (*info).si_addr() }.addr();
    let base = addr - (addr % page_size);

    let ptr = PAGE_INDEX.load(Ordering::Acquire);
    // SAFETY: see `add_address`.
    let is_lsa_page = !ptr.is_null() && unsafe { &*ptr }.binary_search(&base).is_ok();

    if is_lsa_page {
        FAULTS_HANDLED.fetch_add(1, Ordering::Relaxed);
        // SAFETY: terminates only the calling (faulting) thread. We are in a
        // signal handler so no ordinary unwinding may happen; `pthread_exit`
        // is the documented way to end just this thread from here, leaving
        // every other thread and the process itself running, which is the
        // key contract that distinguishes this from a plain segfault.
        unsafe { libc::pthread_exit(std::ptr::null_mut()) };
    } else {
        restore_default_and_reraise(sig);
    }
}

/// Resets the given signal to its OS default disposition and re-raises it,
/// so an unrelated fault kills the process exactly as it would without this
/// crate installed.
fn restore_default_and_reraise(sig: c_int) {
    // SAFETY: `SigDfl` and an empty mask are always valid; re-raising a
    // signal whose disposition we just reset to default cannot recurse into
    // this handler again.
    unsafe {
        let dfl = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        let Ok(signal) = Signal::try_from(sig) else {
            libc::abort();
        };
        if sigaction(signal, &dfl).is_err() {
            libc::abort();
        }
        libc::raise(sig);
    }
}
