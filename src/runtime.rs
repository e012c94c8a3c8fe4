//! The process-wide runtime: page size plus the thread registry, created
//! lazily on first use and shared for the life of the process. There is no
//! separate explicit start-up API; the first call into the library from any
//! thread brings it up.

use std::sync::{Mutex, OnceLock};

use crate::fault;
use crate::registry::ThreadRegistry;
use crate::sys;

pub(crate) struct Runtime {
    pub(crate) page_size: usize,
    pub(crate) registry: Mutex<ThreadRegistry>,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

impl Runtime {
    /// Returns the process-wide runtime, initializing it on the first call
    /// from any thread. Initialization queries the host page size and
    /// installs the fault interceptor; both happen at most once, guarded by
    /// `OnceLock`, before any LSA can exist for the handler to protect.
    pub(crate) fn get() -> &'static Runtime {
        RUNTIME.get_or_init(|| {
            let page_size = sys::page_size();
            fault::install(page_size);
            Runtime { page_size, registry: Mutex::new(ThreadRegistry::default()) }
        })
    }
}
