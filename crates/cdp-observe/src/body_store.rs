use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Append-only buffer for one request's captured response body. Buffers are
/// live: a later append is observable by a later read of the same entry.
pub type BodyEntry = Arc<Mutex<Vec<u8>>>;

/// Concurrent map from request id to captured body bytes. Entries are
/// created through `load_or_store` and never evicted for the process
/// lifetime.
#[derive(Debug, Default)]
pub struct BodyStore {
    entries: DashMap<String, BodyEntry>,
}

impl BodyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, request_id: &str) -> Option<BodyEntry> {
        self.entries
            .get(request_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Atomically inserts `candidate` when no entry exists for the id;
    /// otherwise returns the existing entry. The boolean reports whether an
    /// entry was already present.
    pub fn load_or_store(&self, request_id: &str, candidate: BodyEntry) -> (BodyEntry, bool) {
        match self.entries.entry(request_id.to_string()) {
            Entry::Occupied(existing) => (Arc::clone(existing.get()), true),
            Entry::Vacant(vacant) => {
                let inserted = vacant.insert(candidate);
                (Arc::clone(inserted.value()), false)
            }
        }
    }

    /// Copy of the bytes accumulated so far, up to the write cursor at the
    /// moment of the call.
    pub fn snapshot(&self, request_id: &str) -> Option<Vec<u8>> {
        self.load(request_id)
            .map(|entry| entry.lock().expect("body buffer lock poisoned").clone())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}
