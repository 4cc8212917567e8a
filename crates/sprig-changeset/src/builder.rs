use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use sprig_dag::{Dagnode, GraphStore, LcaSolver};
use sprig_store::ContentStore;
use sprig_types::{ContentHash, DagNum};

use crate::content::{ChangesetContent, FORMAT_VERSION};
use crate::error::{ChangesetError, ChangesetResult};
use crate::frozen::FrozenChangeset;
use crate::normalize::Normalizer;
use crate::reftype::Reftype;

#[derive(Clone, Debug, PartialEq, Eq)]
enum RootState {
    Unset,
    Set(Option<ContentHash>),
}

/// A changeset under construction.
///
/// Collects the commit's content, then [`save_to_repo`] freezes it into a
/// [`FrozenChangeset`]. Containers are only allocated once something is
/// added to them.
///
/// [`save_to_repo`]: ChangesetBuilder::save_to_repo
#[derive(Clone, Debug)]
pub struct ChangesetBuilder {
    version: u32,
    dagnum: DagNum,
    root: RootState,
    parents: Option<BTreeSet<ContentHash>>,
    blobs: BTreeMap<Reftype, BTreeMap<ContentHash, u64>>,
    treepaths: Option<BTreeMap<String, String>>,
}

impl ChangesetBuilder {
    pub fn new(dagnum: DagNum) -> Self {
        Self {
            version: FORMAT_VERSION,
            dagnum,
            root: RootState::Unset,
            parents: None,
            blobs: BTreeMap::new(),
            treepaths: None,
        }
    }

    pub fn dagnum(&self) -> DagNum {
        self.dagnum
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    /// Set the root tree. `None` records an explicitly empty root. May be
    /// called once.
    pub fn set_root(&mut self, root: Option<ContentHash>) -> ChangesetResult<()> {
        if self.root != RootState::Unset {
            return Err(ChangesetError::RootAlreadySet);
        }
        self.root = RootState::Set(root);
        Ok(())
    }

    /// Add a parent. Adding the same parent twice is a no-op.
    pub fn add_parent(&mut self, id: ContentHash) {
        self.parents.get_or_insert_with(BTreeSet::new).insert(id);
    }

    pub fn parents(&self) -> Option<&BTreeSet<ContentHash>> {
        self.parents.as_ref()
    }

    /// Record the path of a stable object id. Not allowed in database
    /// namespaces.
    pub fn add_treepath(
        &mut self,
        stable_id: impl Into<String>,
        path: impl Into<String>,
    ) -> ChangesetResult<()> {
        if self.dagnum.is_db() {
            return Err(ChangesetError::TreepathsOnDatabase(self.dagnum));
        }
        self.treepaths
            .get_or_insert_with(BTreeMap::new)
            .insert(stable_id.into(), path.into());
        Ok(())
    }

    /// Reference a blob of `len` bytes from the `reftype` list.
    ///
    /// Zero-length blobs are only valid for user files.
    pub fn add_blob_to_list(&mut self, hash: ContentHash, reftype: Reftype, len: u64) -> ChangesetResult<()> {
        if len == 0 && !reftype.allows_empty() {
            return Err(ChangesetError::ZeroLengthBlob { hash, reftype });
        }
        self.blobs.entry(reftype).or_default().insert(hash, len);
        Ok(())
    }

    /// Freeze and store.
    ///
    /// Computes the generation from the stored parents, normalizes a merge
    /// against its parents' ancestry, writes the canonical form to `store`
    /// and returns the frozen changeset. The caller records the graph node
    /// (see [`FrozenChangeset::create_dagnode`]).
    pub fn save_to_repo(
        self,
        graph: &dyn GraphStore,
        lca: &dyn LcaSolver,
        store: &dyn ContentStore,
    ) -> ChangesetResult<FrozenChangeset> {
        self.freeze(graph, lca, store)
    }

    pub(crate) fn freeze(
        &self,
        graph: &dyn GraphStore,
        lca: &dyn LcaSolver,
        store: &dyn ContentStore,
    ) -> ChangesetResult<FrozenChangeset> {
        if self.version != FORMAT_VERSION {
            return Err(ChangesetError::UnsupportedVersion(self.version));
        }

        let parent_nodes: Vec<Dagnode> = self
            .parents
            .iter()
            .flatten()
            .map(|id| graph.fetch_node(self.dagnum, id))
            .collect::<Result<_, _>>()?;
        let generation = 1 + parent_nodes.iter().map(Dagnode::generation).max().unwrap_or(0);

        let mut blobs = self.blobs.clone();
        let mut treepaths = self.treepaths.clone();
        if parent_nodes.len() > 1 {
            let with_treepaths = !self.dagnum.is_db();
            let delta = Normalizer::new(graph, lca, store, self.dagnum)
                .merge_delta(&parent_nodes, with_treepaths)?;
            for (reftype, list) in delta.blobs {
                let own = blobs.entry(reftype).or_default();
                for (hash, len) in list {
                    own.entry(hash).or_insert(len);
                }
            }
            if with_treepaths && !delta.treepaths.is_empty() {
                let own = treepaths.get_or_insert_with(BTreeMap::new);
                for (id, path) in delta.treepaths {
                    own.entry(id).or_insert(path);
                }
            }
        }

        let root = match self.root {
            RootState::Unset => None,
            RootState::Set(root) => root,
        };
        debug!(
            dagnum = %self.dagnum,
            parents = parent_nodes.len(),
            generation,
            "freezing changeset"
        );
        let content = ChangesetContent {
            version: self.version,
            dagnum: self.dagnum,
            generation,
            root,
            parents: self.parents.clone().filter(|p| !p.is_empty()),
            blobs,
            treepaths,
        };
        FrozenChangeset::store(content, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{hid, Fixture};
    use proptest::prelude::*;
    use sprig_dag::{DagError, GraphLca};

    const NS: DagNum = DagNum::VERSION_CONTROL;

    #[test]
    fn root_is_settable_once() {
        let mut b = ChangesetBuilder::new(NS);
        b.set_root(None).unwrap();
        assert!(matches!(
            b.set_root(Some(hid(1))),
            Err(ChangesetError::RootAlreadySet)
        ));
    }

    #[test]
    fn parents_deduplicate() {
        let mut b = ChangesetBuilder::new(NS);
        assert_eq!(b.parents(), None);
        b.add_parent(hid(2));
        b.add_parent(hid(1));
        b.add_parent(hid(2));
        assert_eq!(b.parents(), Some(&[hid(1), hid(2)].into()));
    }

    #[test]
    fn database_namespaces_refuse_treepaths() {
        let mut b = ChangesetBuilder::new(DagNum::WORK_ITEMS);
        assert!(matches!(
            b.add_treepath("g1", "@/x"),
            Err(ChangesetError::TreepathsOnDatabase(_))
        ));
    }

    #[test]
    fn zero_length_only_for_user_files() {
        let mut b = ChangesetBuilder::new(NS);
        assert!(matches!(
            b.add_blob_to_list(hid(1), Reftype::TreeNode, 0),
            Err(ChangesetError::ZeroLengthBlob { .. })
        ));
        b.add_blob_to_list(hid(1), Reftype::TreeUserFile, 0).unwrap();
        b.add_blob_to_list(hid(1), Reftype::DbUserFile, 0).unwrap();
    }

    #[test]
    fn generation_follows_parents() {
        let fx = Fixture::new();
        let a = fx.commit(ChangesetBuilder::new(NS));

        let mut b = ChangesetBuilder::new(NS);
        b.add_parent(*a.id());
        b.set_root(Some(hid(0xb))).unwrap();
        let b = fx.commit(b);

        let mut d = ChangesetBuilder::new(NS);
        d.add_parent(*a.id());
        d.set_root(Some(hid(0xd))).unwrap();
        let d = fx.commit(d);

        let mut c = ChangesetBuilder::new(NS);
        c.add_parent(*b.id());
        c.add_parent(*d.id());
        let c = fx.commit(c);

        assert_eq!(a.generation(), 1);
        assert_eq!(b.generation(), 2);
        assert_eq!(d.generation(), 2);
        assert_eq!(c.generation(), 3);
        fx.graph.check_consistency(NS).unwrap();
    }

    #[test]
    fn unknown_parent_fails_freeze() {
        let fx = Fixture::new();
        let mut b = ChangesetBuilder::new(NS);
        b.add_parent(hid(0x77));
        let lca = GraphLca::new(&fx.graph);
        assert!(matches!(
            b.save_to_repo(&fx.graph, &lca, &fx.content),
            Err(ChangesetError::Dag(DagError::NotFound(_)))
        ));
        assert!(fx.content.is_empty().unwrap());
    }

    #[test]
    fn unsupported_version_is_refused() {
        let fx = Fixture::new();
        let mut b = ChangesetBuilder::new(NS);
        b.set_version(2);
        let lca = GraphLca::new(&fx.graph);
        assert!(matches!(
            b.save_to_repo(&fx.graph, &lca, &fx.content),
            Err(ChangesetError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn stored_changeset_reads_back_as_built() {
        let fx = Fixture::new();
        let parent = fx.commit(ChangesetBuilder::new(NS));

        let mut b = ChangesetBuilder::new(NS);
        b.set_root(Some(hid(0xaa))).unwrap();
        b.add_parent(*parent.id());
        b.add_blob_to_list(hid(1), Reftype::TreeNode, 300).unwrap();
        b.add_blob_to_list(hid(2), Reftype::TreeSymlink, 12).unwrap();
        b.add_treepath("g7", "@/docs/readme").unwrap();
        let saved = fx.commit(b);

        let loaded = FrozenChangeset::load_from_repo(&fx.content, saved.id()).unwrap();
        assert_eq!(loaded.version(), FORMAT_VERSION);
        assert_eq!(loaded.dagnum(), NS);
        assert_eq!(loaded.root(), Some(&hid(0xaa)));
        assert_eq!(loaded.generation(), 2);
        assert_eq!(loaded.parents(), Some(&[*parent.id()].into()));
        assert_eq!(
            loaded.blobs(Reftype::TreeNode),
            Some(&BTreeMap::from([(hid(1), 300)]))
        );
        assert_eq!(
            loaded.blobs(Reftype::TreeSymlink),
            Some(&BTreeMap::from([(hid(2), 12)]))
        );
        assert_eq!(loaded.blobs(Reftype::TreeAttribs), None);
        assert_eq!(
            loaded.treepaths(),
            Some(&BTreeMap::from([("g7".to_string(), "@/docs/readme".to_string())]))
        );
        assert_eq!(loaded.create_dagnode(), saved.create_dagnode());
    }

    type Blobs = BTreeMap<(usize, u8), u64>;
    type Paths = BTreeMap<String, String>;

    fn build(blobs: &[((usize, u8), u64)], paths: &[(String, String)], parents: &[ContentHash]) -> ChangesetBuilder {
        let mut b = ChangesetBuilder::new(NS);
        for id in parents {
            b.add_parent(*id);
        }
        for ((reftype, byte), len) in blobs {
            b.add_blob_to_list(hid(*byte), Reftype::ALL[*reftype], *len).unwrap();
        }
        for (id, path) in paths {
            b.add_treepath(id.clone(), path.clone()).unwrap();
        }
        b
    }

    proptest! {
        #[test]
        fn identity_ignores_insertion_order(
            blobs in prop::collection::btree_map((0usize..8, any::<u8>()), 1u64..10_000, 0..24),
            paths in prop::collection::btree_map("g[0-9]{1,3}", "@/[a-z]{1,8}", 0..8),
            merge in any::<bool>(),
        ) {
            let blobs: Blobs = blobs;
            let paths: Paths = paths;
            let fx = Fixture::new();
            let mut r1 = ChangesetBuilder::new(NS);
            r1.add_blob_to_list(hid(0xf1), Reftype::TreeNode, 1).unwrap();
            let r1 = fx.commit(r1);
            let mut r2 = ChangesetBuilder::new(NS);
            r2.add_blob_to_list(hid(0xf2), Reftype::TreeNode, 2).unwrap();
            let r2 = fx.commit(r2);
            let mut parents = vec![*r1.id()];
            if merge {
                parents.push(*r2.id());
            }

            let blob_list: Vec<_> = blobs.into_iter().collect();
            let path_list: Vec<_> = paths.into_iter().collect();
            let forward = build(&blob_list, &path_list, &parents);

            let mut blob_rev = blob_list.clone();
            blob_rev.reverse();
            let mut path_rev = path_list.clone();
            path_rev.reverse();
            let mut parents_rev = parents.clone();
            parents_rev.reverse();
            let backward = build(&blob_rev, &path_rev, &parents_rev);

            let lca = GraphLca::new(&fx.graph);
            let a = forward.save_to_repo(&fx.graph, &lca, &fx.content).unwrap();
            let b = backward.save_to_repo(&fx.graph, &lca, &fx.content).unwrap();
            prop_assert_eq!(a.id(), b.id());
            prop_assert_eq!(a.to_canonical_bytes().unwrap(), b.to_canonical_bytes().unwrap());
        }
    }
}
