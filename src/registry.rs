//! The thread registry: a process-wide map from thread identity to LSA.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;

use crate::descriptor::Descriptor;
use crate::error::{LsaError, LsaResult};

/// Maps each thread that currently owns an LSA to its descriptor.
///
/// Lives behind `Runtime`'s single `Mutex`, held only briefly for the
/// lookup/insert/remove itself; the expensive read/write/CoW work happens
/// after the caller has cloned out the `Arc<Descriptor>` it needs and
/// dropped this lock, so unrelated threads' registry lookups never wait on
/// another thread's in-flight `read`/`write`.
#[derive(Default)]
pub(crate) struct ThreadRegistry {
    descriptors: HashMap<ThreadId, Arc<Descriptor>>,
}

impl ThreadRegistry {
    pub(crate) fn insert(&mut self, owner: ThreadId, descriptor: Descriptor) -> LsaResult<Arc<Descriptor>> {
        if self.descriptors.contains_key(&owner) {
            return Err(LsaError::AlreadyOwnsLsa);
        }
        let descriptor = Arc::new(descriptor);
        self.descriptors.insert(owner, Arc::clone(&descriptor));
        Ok(descriptor)
    }

    pub(crate) fn get(&self, owner: ThreadId) -> LsaResult<Arc<Descriptor>> {
        self.descriptors.get(&owner).cloned().ok_or(LsaError::NoLsa)
    }

    pub(crate) fn get_other(&self, owner: ThreadId) -> LsaResult<Arc<Descriptor>> {
        self.descriptors.get(&owner).cloned().ok_or(LsaError::UnknownThread)
    }

    /// Removes and returns the caller's own descriptor, so its owning code
    /// can release the underlying pages after the registry lock is dropped.
    pub(crate) fn remove(&mut self, owner: ThreadId) -> LsaResult<Arc<Descriptor>> {
        self.descriptors.remove(&owner).ok_or(LsaError::NoLsa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid() -> ThreadId {
        std::thread::current().id()
    }

    #[test]
    fn insert_then_double_insert_fails() {
        let mut reg = ThreadRegistry::default();
        let d = Descriptor::create(tid(), 4096, 4096).unwrap();
        reg.insert(tid(), d).unwrap();
        let d2 = Descriptor::create(tid(), 4096, 4096).unwrap();
        assert!(matches!(reg.insert(tid(), d2), Err(LsaError::AlreadyOwnsLsa)));
    }

    #[test]
    fn get_on_unknown_thread_distinguishes_no_lsa_and_unknown_thread() {
        let reg = ThreadRegistry::default();
        assert!(matches!(reg.get(tid()), Err(LsaError::NoLsa)));
        assert!(matches!(reg.get_other(tid()), Err(LsaError::UnknownThread)));
    }

    #[test]
    fn remove_then_reinsert_succeeds() {
        let mut reg = ThreadRegistry::default();
        let d = Descriptor::create(tid(), 4096, 4096).unwrap();
        reg.insert(tid(), d).unwrap();
        let removed = reg.remove(tid()).unwrap();
        assert!(matches!(reg.remove(tid()), Err(LsaError::NoLsa)));
        Arc::try_unwrap(removed).unwrap_or_else(|_| panic!("no other owner")).release();

        let d2 = Descriptor::create(tid(), 4096, 4096).unwrap();
        assert!(reg.insert(tid(), d2).is_ok());
    }
}
