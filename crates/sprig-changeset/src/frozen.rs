use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde_json::Value;
use tracing::debug;

use sprig_dag::Dagnode;
use sprig_store::ContentStore;
use sprig_types::{ContentHash, DagNum, Generation};

use crate::content::{canonical_bytes, ChangesetContent};
use crate::error::{ChangesetError, ChangesetResult};
use crate::reftype::Reftype;

/// An immutable, stored changeset.
///
/// Holds the canonical tree and the id the content store assigned to its
/// bytes. Obtained by freezing a [`ChangesetBuilder`] or by loading a
/// stored changeset.
///
/// [`ChangesetBuilder`]: crate::ChangesetBuilder
#[derive(Clone, PartialEq, Eq)]
pub struct FrozenChangeset {
    id: ContentHash,
    tree: Value,
    content: ChangesetContent,
}

impl FrozenChangeset {
    /// Serialize `content` canonically and store it. An already stored
    /// identical changeset is not an error.
    pub(crate) fn store(content: ChangesetContent, store: &dyn ContentStore) -> ChangesetResult<Self> {
        let tree = content.to_tree();
        let bytes = canonical_bytes(&tree).map_err(|e| ChangesetError::Serialization(e.to_string()))?;
        let id = store.store_idempotent(&bytes)?;
        debug!(
            changeset = %id.short_hex(),
            dagnum = %content.dagnum,
            generation = content.generation,
            bytes = bytes.len(),
            "froze changeset"
        );
        Ok(Self { id, tree, content })
    }

    /// Load and validate a stored changeset.
    ///
    /// Any malformed input, including a document that is valid but not in
    /// canonical form, fails with
    /// [`ChangesetError::ChangesetValidationFailed`].
    pub fn load_from_repo(store: &dyn ContentStore, id: &ContentHash) -> ChangesetResult<Self> {
        let bytes = store.fetch(id)?;
        let raw: Value = serde_json::from_slice(&bytes).map_err(|e| invalid(id, e))?;
        let content = ChangesetContent::from_tree(&raw).map_err(|reason| invalid(id, reason))?;
        let tree = content.to_tree();
        let canonical =
            canonical_bytes(&tree).map_err(|e| ChangesetError::Serialization(e.to_string()))?;
        if canonical != bytes {
            return Err(invalid(id, "not in canonical form"));
        }
        Ok(Self {
            id: *id,
            tree,
            content,
        })
    }

    pub fn id(&self) -> &ContentHash {
        &self.id
    }

    /// The canonical tree.
    pub fn tree(&self) -> &Value {
        &self.tree
    }

    /// The exact bytes whose hash is [`id`](Self::id).
    pub fn to_canonical_bytes(&self) -> ChangesetResult<Vec<u8>> {
        canonical_bytes(&self.tree).map_err(|e| ChangesetError::Serialization(e.to_string()))
    }

    pub fn version(&self) -> u32 {
        self.content.version
    }

    pub fn dagnum(&self) -> DagNum {
        self.content.dagnum
    }

    pub fn root(&self) -> Option<&ContentHash> {
        self.content.root.as_ref()
    }

    pub fn generation(&self) -> Generation {
        self.content.generation
    }

    /// Parent ids in sorted order, absent for a root changeset.
    pub fn parents(&self) -> Option<&BTreeSet<ContentHash>> {
        self.content.parents.as_ref()
    }

    /// The blob list for one reftype, absent if the changeset carries none.
    pub fn blobs(&self, reftype: Reftype) -> Option<&BTreeMap<ContentHash, u64>> {
        self.content.blobs.get(&reftype).filter(|list| !list.is_empty())
    }

    /// Every non-empty blob list.
    pub fn blob_lists(&self) -> impl Iterator<Item = (Reftype, &BTreeMap<ContentHash, u64>)> {
        self.content
            .blobs
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(reftype, list)| (*reftype, list))
    }

    /// Stable object id to path. Always absent in database namespaces.
    pub fn treepaths(&self) -> Option<&BTreeMap<String, String>> {
        if self.content.dagnum.is_db() {
            return None;
        }
        self.content.treepaths.as_ref().filter(|t| !t.is_empty())
    }

    /// The graph record for this changeset: same id, generation and parents.
    pub fn create_dagnode(&self) -> Dagnode {
        Dagnode::new(
            self.id,
            self.content.generation,
            self.content.parents.clone().unwrap_or_default(),
        )
    }
}

impl fmt::Debug for FrozenChangeset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrozenChangeset")
            .field("id", &self.id)
            .field("dagnum", &self.content.dagnum)
            .field("generation", &self.content.generation)
            .field("parents", &self.content.parents)
            .finish_non_exhaustive()
    }
}

fn invalid(id: &ContentHash, reason: impl fmt::Display) -> ChangesetError {
    debug!(changeset = %id.short_hex(), %reason, "changeset validation failed");
    ChangesetError::ChangesetValidationFailed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::FORMAT_VERSION;
    use sprig_store::{InMemoryContentStore, StoreError};

    fn hid(byte: u8) -> ContentHash {
        ContentHash::from_hash([byte; 32])
    }

    fn content() -> ChangesetContent {
        ChangesetContent {
            version: FORMAT_VERSION,
            dagnum: DagNum::VERSION_CONTROL,
            generation: 2,
            root: Some(hid(7)),
            parents: Some([hid(1)].into()),
            blobs: BTreeMap::from([(Reftype::TreeNode, BTreeMap::from([(hid(8), 64)]))]),
            treepaths: Some([("g42".to_string(), "@/src/lib.rs".to_string())].into()),
        }
    }

    #[test]
    fn id_is_hash_of_canonical_bytes() {
        let store = InMemoryContentStore::new();
        let frozen = FrozenChangeset::store(content(), &store).unwrap();
        let bytes = frozen.to_canonical_bytes().unwrap();
        assert_eq!(*frozen.id(), ContentHash::of(&bytes));
        assert_eq!(store.fetch(frozen.id()).unwrap(), bytes);
    }

    #[test]
    fn storing_twice_is_idempotent() {
        let store = InMemoryContentStore::new();
        let a = FrozenChangeset::store(content(), &store).unwrap();
        let b = FrozenChangeset::store(content(), &store).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn load_round_trips_accessors() {
        let store = InMemoryContentStore::new();
        let saved = FrozenChangeset::store(content(), &store).unwrap();
        let loaded = FrozenChangeset::load_from_repo(&store, saved.id()).unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(loaded.version(), 1);
        assert_eq!(loaded.generation(), 2);
        assert_eq!(loaded.root(), Some(&hid(7)));
        assert_eq!(loaded.parents(), Some(&[hid(1)].into()));
        assert_eq!(loaded.blobs(Reftype::TreeNode), Some(&[(hid(8), 64)].into()));
        assert_eq!(loaded.blobs(Reftype::DbRecord), None);
        assert_eq!(loaded.treepaths().unwrap()["g42"], "@/src/lib.rs");
    }

    #[test]
    fn dagnode_mirrors_changeset() {
        let store = InMemoryContentStore::new();
        let frozen = FrozenChangeset::store(content(), &store).unwrap();
        let node = frozen.create_dagnode();
        assert_eq!(node.id(), frozen.id());
        assert_eq!(node.generation(), 2);
        assert_eq!(node.parents(), &[hid(1)].into());
    }

    #[test]
    fn malformed_documents_fail_validation() {
        let store = InMemoryContentStore::new();
        let docs: [&[u8]; 4] = [
            b"not json",
            br#"{"dagnum":1,"generation":1,"ver":7}"#,
            br#"{"dagnum":1,"generation":-3,"ver":1}"#,
            // Valid but not canonical.
            br#"{"ver":1,"dagnum":1,"generation":1}"#,
        ];
        for doc in docs {
            let id = store.store(doc).unwrap();
            assert!(matches!(
                FrozenChangeset::load_from_repo(&store, &id),
                Err(ChangesetError::ChangesetValidationFailed)
            ));
        }
    }

    #[test]
    fn canonical_document_loads() {
        let store = InMemoryContentStore::new();
        let id = store.store(br#"{"dagnum":1,"generation":1,"ver":1}"#).unwrap();
        let loaded = FrozenChangeset::load_from_repo(&store, &id).unwrap();
        assert_eq!(loaded.parents(), None);
        assert_eq!(loaded.root(), None);
        assert_eq!(loaded.create_dagnode(), Dagnode::root(id));
    }

    #[test]
    fn missing_changeset_is_a_store_error() {
        let store = InMemoryContentStore::new();
        assert!(matches!(
            FrozenChangeset::load_from_repo(&store, &hid(5)),
            Err(ChangesetError::Store(StoreError::NotFound(_)))
        ));
    }
}
