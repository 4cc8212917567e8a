use std::collections::HashMap;
use std::sync::RwLock;

use sprig_types::ContentHash;

use crate::error::{StoreError, StoreResult};
use crate::traits::ContentStore;

/// In-memory, HashMap-based content store.
///
/// Intended for tests and embedding. Objects are held behind a `RwLock` and
/// cloned on read.
pub struct InMemoryContentStore {
    objects: RwLock<HashMap<ContentHash, Vec<u8>>>,
}

impl InMemoryContentStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> StoreResult<usize> {
        let map = self.objects.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(map.len())
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Replace the bytes under `id` without rehashing.
    ///
    /// Only useful to simulate corruption in tests of the layers above.
    #[doc(hidden)]
    pub fn overwrite_unchecked(&self, id: ContentHash, data: Vec<u8>) -> StoreResult<()> {
        let mut map = self.objects.write().map_err(|_| StoreError::LockPoisoned)?;
        map.insert(id, data);
        Ok(())
    }
}

impl Default for InMemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentStore for InMemoryContentStore {
    fn store(&self, data: &[u8]) -> StoreResult<ContentHash> {
        let id = ContentHash::of(data);
        let mut map = self.objects.write().map_err(|_| StoreError::LockPoisoned)?;
        if map.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        map.insert(id, data.to_vec());
        Ok(id)
    }

    fn fetch(&self, id: &ContentHash) -> StoreResult<Vec<u8>> {
        let map = self.objects.read().map_err(|_| StoreError::LockPoisoned)?;
        let data = map.get(id).ok_or(StoreError::NotFound(*id))?;
        let computed = ContentHash::of(data);
        if computed != *id {
            return Err(StoreError::HashMismatch { id: *id, computed });
        }
        Ok(data.clone())
    }

    fn exists(&self, id: &ContentHash) -> StoreResult<bool> {
        let map = self.objects.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(map.contains_key(id))
    }
}

impl std::fmt::Debug for InMemoryContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryContentStore")
            .field("object_count", &self.len().ok())
            .finish()
    }
}
