use std::collections::HashMap;
use std::sync::Mutex;

use crate::key::Key;

/// Key-to-blob facade over whatever holds the node's values.
///
/// The reference deployment keeps a flat directory keyed by hex id; the
/// node only ever needs these two operations.
pub trait ValueStore: Send + Sync {
    fn put(&self, key: &Key, value: &[u8]);
    fn get(&self, key: &Key) -> Option<Vec<u8>>;
}

/// In-process store. Values live until the process terminates.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<Key, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

impl ValueStore for MemoryStore {
    fn put(&self, key: &Key, value: &[u8]) {
        self.values.lock().unwrap().insert(*key, value.to_vec());
    }

    fn get(&self, key: &Key) -> Option<Vec<u8>> {
        self.values.lock().unwrap().get(key).cloned()
    }
}
