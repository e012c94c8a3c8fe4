//! A small driver that exercises `lsa`'s public API from several threads: a
//! thin CLI shell around the library crate rather than a copy of its logic.

use std::thread::ThreadId;

use anyhow::{Context, Result};
use clap::Parser;

/// Spawn worker threads that create, write, read, clone, and destroy LSAs.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of worker threads to spawn.
    #[arg(long, default_value_t = 3)]
    workers: usize,

    /// Bytes to allocate per worker's LSA.
    #[arg(long, default_value_t = 4096)]
    size: usize,

    /// After the normal demo, have one extra thread poke its LSA directly
    /// (bypassing the API) to show the fault interceptor at work.
    #[arg(long)]
    demonstrate_fault: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    run(&args)
}

fn run(args: &Args) -> Result<()> {
    tracing::info!(workers = args.workers, size = args.size, "starting lsa demo");

    let first_owner = run_worker(args.size, None)?;

    let mut handles = Vec::new();
    for i in 1..args.workers {
        let size = args.size;
        handles.push(std::thread::spawn(move || run_worker(size, Some((i, first_owner)))));
    }
    for handle in handles {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("worker thread panicked"))??;
    }

    if args.demonstrate_fault {
        demonstrate_fault(args.size)?;
    }

    tracing::info!(faults_handled = lsa::faults_handled(), "demo complete");
    Ok(())
}

/// Creates an LSA (or clones `clone_of`'s, if given), writes an
/// index-specific pattern into it, reads it back, and tears it down.
fn run_worker(size: usize, clone_of: Option<(usize, ThreadId)>) -> Result<ThreadId> {
    let id = std::thread::current().id();

    match clone_of {
        Some((i, source)) => {
            lsa::clone_from(source).with_context(|| format!("worker {i} failed to clone"))?;
            let pattern = vec![i as u8; size.min(64)];
            lsa::write(0, &pattern)?;
        }
        None => {
            lsa::create(size).context("failed to create LSA")?;
            lsa::write(0, b"root worker")?;
        }
    }

    let mut out = vec![0u8; size.min(64)];
    lsa::read(0, &mut out)?;
    tracing::debug!(?id, first_bytes = ?&out[..8.min(out.len())], "worker read back its LSA");

    lsa::destroy().context("failed to destroy LSA")?;
    Ok(id)
}

/// Spawns a thread that creates an LSA and then, instead of calling
/// `lsa::read`/`lsa::write`, dereferences the LSA's memory directly. The
/// fault interceptor is expected to terminate that thread via
/// `pthread_exit`, which means its closure never returns — so this function
/// deliberately never joins it, and instead waits a moment and then checks
/// `lsa::faults_handled()` to observe the outcome.
fn demonstrate_fault(size: usize) -> Result<()> {
    let before = lsa::faults_handled();
    std::thread::spawn(move || {
        lsa::create(size).expect("failed to create LSA");
        lsa::write(0, b"x").expect("failed to write");
        let addr = lsa::debug_lsa_base_addr().expect("no LSA");
        tracing::warn!(addr, "dereferencing LSA memory directly, bypassing the API");
        // SAFETY: none, deliberately. `addr` is protected (`PROT_NONE`)
        // outside of `lsa::read`/`lsa::write`, so this read is expected to
        // raise SIGSEGV and be caught by the fault interceptor before
        // control ever returns here.
        unsafe {
            std::ptr::read_volatile(addr as *const u8);
        }
        unreachable!("the fault interceptor should have terminated this thread already");
    });

    std::thread::sleep(std::time::Duration::from_millis(200));
    let after = lsa::faults_handled();
    if after > before {
        tracing::info!(faults_before = before, faults_after = after, "interceptor terminated the offending thread");
    } else {
        tracing::warn!(faults_before = before, faults_after = after, "no fault observed yet");
    }
    Ok(())
}
