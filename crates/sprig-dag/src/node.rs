//! The immutable graph-structure record of one commit.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use sprig_types::{ContentHash, Generation};

/// A node in the commit graph.
///
/// A `Dagnode` carries only what the graph needs: the commit id, its
/// generation and the ids of its parents. The full commit payload lives in
/// the content store under the same id. Dagnodes are values: the store
/// hands out copies, and nothing mutates one after construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dagnode {
    id: ContentHash,
    generation: Generation,
    parents: BTreeSet<ContentHash>,
}

impl Dagnode {
    /// Create a node with an explicit generation.
    ///
    /// The generation is not checked here; [`GraphStore::store_node`]
    /// verifies it against the stored parents.
    ///
    /// [`GraphStore::store_node`]: crate::GraphStore::store_node
    pub fn new(id: ContentHash, generation: Generation, parents: BTreeSet<ContentHash>) -> Self {
        Self {
            id,
            generation,
            parents,
        }
    }

    /// A parentless node (generation 1).
    pub fn root(id: ContentHash) -> Self {
        Self::new(id, 1, BTreeSet::new())
    }

    /// A node whose generation is derived from its parent nodes.
    pub fn child_of<'a>(id: ContentHash, parents: impl IntoIterator<Item = &'a Dagnode>) -> Self {
        let mut generation = 0;
        let mut ids = BTreeSet::new();
        for parent in parents {
            generation = generation.max(parent.generation);
            ids.insert(parent.id);
        }
        Self::new(id, generation + 1, ids)
    }

    pub fn id(&self) -> &ContentHash {
        &self.id
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn parents(&self) -> &BTreeSet<ContentHash> {
        &self.parents
    }

    /// Returns `true` if this node has no parents.
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hid(byte: u8) -> ContentHash {
        ContentHash::from_hash([byte; 32])
    }

    #[test]
    fn root_has_generation_one() {
        let node = Dagnode::root(hid(1));
        assert!(node.is_root());
        assert_eq!(node.generation(), 1);
    }

    #[test]
    fn child_generation_follows_deepest_parent() {
        let a = Dagnode::root(hid(1));
        let b = Dagnode::child_of(hid(2), [&a]);
        let d = Dagnode::child_of(hid(4), [&a]);
        let e = Dagnode::child_of(hid(5), [&d]);
        let c = Dagnode::child_of(hid(3), [&b, &e]);
        assert_eq!(b.generation(), 2);
        assert_eq!(c.generation(), 4);
        assert_eq!(c.parents().len(), 2);
        assert!(!c.is_root());
    }

    #[test]
    fn duplicate_parents_collapse() {
        let a = Dagnode::root(hid(1));
        let b = Dagnode::child_of(hid(2), [&a, &a]);
        assert_eq!(b.parents().len(), 1);
    }

    #[test]
    fn serde_roundtrip() {
        let a = Dagnode::root(hid(1));
        let b = Dagnode::child_of(hid(2), [&a]);
        let json = serde_json::to_string(&b).unwrap();
        let back: Dagnode = serde_json::from_str(&json).unwrap();
        assert_eq!(b, back);
    }
}
