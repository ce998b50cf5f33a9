//! Payload storage seam.
//!
//! The mesh only routes and locates objects; the bytes themselves live in a
//! payload store owned by each replica peer. The store is an external
//! collaborator behind a trait so deployments can plug in whatever engine
//! they run; the in-memory implementation here backs tests and the demo
//! binary.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Local key-value payload storage.
///
/// Implementations must be cheap to call from async context: these are
/// local operations and must never block on I/O for unbounded time.
pub trait BlobStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn put(&self, key: &str, value: Vec<u8>);
    fn remove(&self, key: &str) -> bool;
    /// Keys currently held; the owning peer re-announces these
    /// periodically.
    fn keys(&self) -> Vec<String>;
}

/// Simple in-memory payload store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.locked().get(key).cloned()
    }

    fn put(&self, key: &str, value: Vec<u8>) {
        self.locked().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) -> bool {
        self.locked().remove(key).is_some()
    }

    fn keys(&self) -> Vec<String> {
        self.locked().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove() {
        let store = MemoryBlobStore::new();
        assert_eq!(store.get("a"), None);
        store.put("a", b"payload".to_vec());
        assert_eq!(store.get("a"), Some(b"payload".to_vec()));
        assert_eq!(store.keys(), vec!["a".to_string()]);
        assert!(store.remove("a"));
        assert!(!store.remove("a"));
        assert_eq!(store.get("a"), None);
    }

    #[test]
    fn put_overwrites() {
        let store = MemoryBlobStore::new();
        store.put("a", b"one".to_vec());
        store.put("a", b"two".to_vec());
        assert_eq!(store.get("a"), Some(b"two".to_vec()));
        assert_eq!(store.keys().len(), 1);
    }
}
