//! Merge normalization.
//!
//! A merge changeset carries the blob references and treepaths that are
//! reachable from some, but not all, of its parents since their common
//! ancestor. Whatever every parent's lineage already implies is left out.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use sprig_dag::{DagError, Dagnode, GraphStore, LcaSolver};
use sprig_store::ContentStore;
use sprig_types::{ContentHash, DagNum};

use crate::error::ChangesetResult;
use crate::frozen::FrozenChangeset;
use crate::reftype::Reftype;

/// What a merge must add to its own lists.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct MergeDelta {
    pub blobs: BTreeMap<Reftype, BTreeMap<ContentHash, u64>>,
    pub treepaths: Vec<(String, String)>,
}

pub(crate) struct Normalizer<'a> {
    graph: &'a dyn GraphStore,
    lca: &'a dyn LcaSolver,
    store: &'a dyn ContentStore,
    dagnum: DagNum,
    loaded: BTreeMap<ContentHash, FrozenChangeset>,
}

impl<'a> Normalizer<'a> {
    pub fn new(
        graph: &'a dyn GraphStore,
        lca: &'a dyn LcaSolver,
        store: &'a dyn ContentStore,
        dagnum: DagNum,
    ) -> Self {
        Self {
            graph,
            lca,
            store,
            dagnum,
            loaded: BTreeMap::new(),
        }
    }

    /// Compute the delta for a merge of `parents`.
    ///
    /// Each parent's trail back to the LCA is collected, the trail
    /// changesets' entries are unioned per parent, and an entry is kept
    /// when fewer than all parents reach it.
    pub fn merge_delta(&mut self, parents: &[Dagnode], with_treepaths: bool) -> ChangesetResult<MergeDelta> {
        let ids: BTreeSet<ContentHash> = parents.iter().map(|p| *p.id()).collect();
        let lca = match self.lca.compute(self.dagnum, &ids)?.first() {
            Some(id) => Some(self.graph.fetch_node(self.dagnum, id)?),
            None => None,
        };

        let mut blob_tally: BTreeMap<(Reftype, ContentHash), (u64, usize)> = BTreeMap::new();
        let mut path_tally: BTreeMap<(String, String), usize> = BTreeMap::new();

        for parent in parents {
            let trail = self.trail(parent, lca.as_ref())?;

            let mut reachable: BTreeMap<(Reftype, ContentHash), u64> = BTreeMap::new();
            let mut paths: BTreeSet<(String, String)> = BTreeSet::new();
            for id in &trail {
                let changeset = self.load(id)?;
                for (reftype, list) in changeset.blob_lists() {
                    for (hash, len) in list {
                        reachable.entry((reftype, *hash)).or_insert(*len);
                    }
                }
                if with_treepaths {
                    if let Some(tp) = changeset.treepaths() {
                        paths.extend(tp.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                }
            }

            for (key, len) in reachable {
                blob_tally.entry(key).or_insert((len, 0)).1 += 1;
            }
            for pair in paths {
                *path_tally.entry(pair).or_default() += 1;
            }
        }

        let n = parents.len();
        let mut delta = MergeDelta::default();
        for ((reftype, hash), (len, count)) in blob_tally {
            if count < n {
                delta.blobs.entry(reftype).or_default().insert(hash, len);
            }
        }
        delta.treepaths = path_tally
            .into_iter()
            .filter(|(_, count)| *count < n)
            .map(|(pair, _)| pair)
            .collect();

        debug!(
            dagnum = %self.dagnum,
            parents = n,
            lca = ?lca.as_ref().map(|l| l.id().short_hex()),
            blobs = delta.blobs.values().map(BTreeMap::len).sum::<usize>(),
            treepaths = delta.treepaths.len(),
            "normalized merge"
        );
        Ok(delta)
    }

    /// Ids on the way from `from` back to `lca`: the parent itself and every
    /// ancestor with a parent path down to the LCA, excluding the LCA.
    /// Side history that joins above the LCA without reaching it is left
    /// out.
    ///
    /// Without an LCA the trail runs to the roots.
    fn trail(&self, from: &Dagnode, lca: Option<&Dagnode>) -> ChangesetResult<Vec<ContentHash>> {
        let is_lca = |id: &ContentHash| lca.is_some_and(|l| l.id() == id);
        if is_lca(from.id()) {
            return Ok(Vec::new());
        }
        let floor = lca.map_or(0, Dagnode::generation);

        let mut visited = BTreeSet::from([*from.id()]);
        let mut stack = vec![from.clone()];
        let mut walked = Vec::new();
        while let Some(node) = stack.pop() {
            for parent in node.parents() {
                if !is_lca(parent) && visited.insert(*parent) {
                    let parent_node = self.graph.fetch_node(self.dagnum, parent)?;
                    if parent_node.generation() > floor {
                        stack.push(parent_node);
                    }
                }
            }
            walked.push(node);
        }

        let Some(lca) = lca else {
            return Ok(walked.iter().map(|node| *node.id()).collect());
        };

        // Parents have lower generations, so one ascending pass settles
        // every node after its parents.
        let mut ascending: Vec<&Dagnode> = walked.iter().collect();
        ascending.sort_by_key(|node| node.generation());
        let mut on_path = BTreeSet::new();
        for node in ascending {
            if node.parents().iter().any(|p| is_lca(p) || on_path.contains(p)) {
                on_path.insert(*node.id());
            }
        }
        if !on_path.contains(from.id()) {
            return Err(DagError::AncestryGap {
                from: *from.id(),
                to: *lca.id(),
            }
            .into());
        }
        Ok(walked
            .iter()
            .map(|node| *node.id())
            .filter(|id| on_path.contains(id))
            .collect())
    }

    fn load(&mut self, id: &ContentHash) -> ChangesetResult<&FrozenChangeset> {
        if !self.loaded.contains_key(id) {
            let changeset = FrozenChangeset::load_from_repo(self.store, id)?;
            self.loaded.insert(*id, changeset);
        }
        Ok(&self.loaded[id])
    }
}
