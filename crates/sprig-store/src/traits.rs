use sprig_types::ContentHash;

use crate::error::{StoreError, StoreResult};

/// Content-addressed blob store.
///
/// All implementations must satisfy these invariants:
/// - The key of an object is [`ContentHash::of`] its bytes.
/// - Objects are immutable once written.
/// - Storing bytes that are already present returns
///   [`StoreError::AlreadyExists`] carrying the hash, never a generic error.
/// - Concurrent writers of the same bytes both succeed or see `AlreadyExists`.
pub trait ContentStore: Send + Sync {
    /// Store `data` and return its hash.
    fn store(&self, data: &[u8]) -> StoreResult<ContentHash>;

    /// Fetch the bytes stored under `id`.
    ///
    /// Returns [`StoreError::NotFound`] if the object does not exist.
    fn fetch(&self, id: &ContentHash) -> StoreResult<Vec<u8>>;

    /// Check whether an object exists.
    fn exists(&self, id: &ContentHash) -> StoreResult<bool>;

    /// Store `data`, treating `AlreadyExists` as success.
    fn store_idempotent(&self, data: &[u8]) -> StoreResult<ContentHash> {
        match self.store(data) {
            Err(StoreError::AlreadyExists(id)) => Ok(id),
            other => other,
        }
    }
}
