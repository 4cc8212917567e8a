use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use sprig_types::ContentHash;

use crate::config::ContentStoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::traits::ContentStore;

/// Loose-object content store rooted at a directory.
///
/// Each object lives at `<root>/<first 2 hex>/<remaining 62 hex>`,
/// zstd-compressed. Writes go to a temporary file in the same directory and
/// are linked into place without clobbering, so a concurrent writer of the
/// same object sees [`StoreError::AlreadyExists`] instead of a torn file.
pub struct FsContentStore {
    root: PathBuf,
    config: ContentStoreConfig,
}

impl FsContentStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>, config: ContentStoreConfig) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        info!(root = %root.display(), "content store opened");
        Ok(Self { root, config })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &ContentHash) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }
}

impl ContentStore for FsContentStore {
    fn store(&self, data: &[u8]) -> StoreResult<ContentHash> {
        let id = ContentHash::of(data);
        let path = self.object_path(&id);
        if path.exists() {
            return Err(StoreError::AlreadyExists(id));
        }

        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        let compressed = zstd::encode_all(data, self.config.compression_level)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&compressed)?;
        tmp.as_file().sync_all()?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => {}
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(id));
            }
            Err(e) => return Err(StoreError::Io(e.error)),
        }

        debug!(object = %id.short_hex(), len = data.len(), "stored object");
        Ok(id)
    }

    fn fetch(&self, id: &ContentHash) -> StoreResult<Vec<u8>> {
        let compressed = match fs::read(self.object_path(id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(*id));
            }
            Err(e) => return Err(e.into()),
        };
        let data = zstd::decode_all(compressed.as_slice())?;
        let computed = ContentHash::of(&data);
        if computed != *id {
            return Err(StoreError::HashMismatch { id: *id, computed });
        }
        Ok(data)
    }

    fn exists(&self, id: &ContentHash) -> StoreResult<bool> {
        Ok(self.object_path(id).is_file())
    }
}

impl std::fmt::Debug for FsContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsContentStore")
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, FsContentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::open(dir.path().join("objects"), ContentStoreConfig::default())
            .unwrap();
        (dir, store)
    }

    #[test]
    fn store_and_fetch() {
        let (_dir, store) = temp_store();
        let id = store.store(b"on disk").unwrap();
        assert!(store.exists(&id).unwrap());
        assert_eq!(store.fetch(&id).unwrap(), b"on disk");
    }

    #[test]
    fn objects_are_fanned_out_by_prefix() {
        let (_dir, store) = temp_store();
        let id = store.store(b"layout").unwrap();
        let hex = id.to_hex();
        assert!(store.root().join(&hex[..2]).join(&hex[2..]).is_file());
    }

    #[test]
    fn second_store_reports_already_exists() {
        let (_dir, store) = temp_store();
        store.store(b"dup").unwrap();
        assert!(matches!(
            store.store(b"dup"),
            Err(StoreError::AlreadyExists(_))
        ));
        assert_eq!(
            store.store_idempotent(b"dup").unwrap(),
            ContentHash::of(b"dup")
        );
    }

    #[test]
    fn empty_object_is_storable() {
        let (_dir, store) = temp_store();
        let id = store.store(b"").unwrap();
        assert!(store.fetch(&id).unwrap().is_empty());
    }

    #[test]
    fn fetch_missing_is_not_found() {
        let (_dir, store) = temp_store();
        assert!(matches!(
            store.fetch(&ContentHash::of(b"nope")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn tampered_file_is_detected() {
        let (_dir, store) = temp_store();
        let id = store.store(b"original").unwrap();
        let tampered = zstd::encode_all(&b"tampered"[..], 3).unwrap();
        fs::write(store.object_path(&id), tampered).unwrap();
        assert!(matches!(
            store.fetch(&id),
            Err(StoreError::HashMismatch { .. })
        ));
    }

    #[test]
    fn reopen_sees_existing_objects() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = FsContentStore::open(dir.path(), ContentStoreConfig::default()).unwrap();
            store.store(b"persisted").unwrap()
        };
        let store = FsContentStore::open(dir.path(), ContentStoreConfig::default()).unwrap();
        assert_eq!(store.fetch(&id).unwrap(), b"persisted");
    }
}
