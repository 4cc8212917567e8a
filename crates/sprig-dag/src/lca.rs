//! Common-ancestor queries over a [`GraphStore`].

use std::collections::{BTreeSet, HashMap, VecDeque};

use sprig_types::{ContentHash, DagNum, Generation};

use crate::error::DagResult;
use crate::node::Dagnode;
use crate::store::GraphStore;

/// Computes common ancestors of node sets.
pub trait LcaSolver {
    /// Common ancestors of every id in `ids`, best first.
    ///
    /// The lowest common ancestors (those that are not an ancestor of any
    /// other common ancestor) come first, deepest generation first; the
    /// remaining common ancestors follow in the same order. The first
    /// element, when there is one, is "the" LCA. An empty result means the
    /// nodes share no history.
    fn compute(&self, dagnum: DagNum, ids: &BTreeSet<ContentHash>) -> DagResult<Vec<ContentHash>>;

    /// Every ancestor of `id`, excluding `id`, children before parents.
    fn ancestors(&self, dagnum: DagNum, id: &ContentHash) -> DagResult<Vec<ContentHash>>;
}

/// [`LcaSolver`] that walks the graph store directly.
///
/// Uses the ancestor-set intersection approach. Fetched nodes are cached for
/// the duration of one call only; the store stays the single source of
/// truth.
pub struct GraphLca<'a> {
    graph: &'a dyn GraphStore,
}

impl<'a> GraphLca<'a> {
    pub fn new(graph: &'a dyn GraphStore) -> Self {
        Self { graph }
    }

    /// All ancestors of `id`, including `id` itself.
    fn closure(
        &self,
        dagnum: DagNum,
        id: &ContentHash,
        cache: &mut HashMap<ContentHash, Dagnode>,
    ) -> DagResult<BTreeSet<ContentHash>> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::new();
        visited.insert(*id);
        queue.push_back(*id);

        while let Some(current) = queue.pop_front() {
            let node = fetch_cached(self.graph, dagnum, &current, cache)?;
            for parent in node.parents() {
                if visited.insert(*parent) {
                    queue.push_back(*parent);
                }
            }
        }
        Ok(visited)
    }

    fn by_generation_desc(
        ids: impl IntoIterator<Item = ContentHash>,
        cache: &HashMap<ContentHash, Dagnode>,
    ) -> Vec<ContentHash> {
        let mut keyed: Vec<(Generation, ContentHash)> = ids
            .into_iter()
            .map(|id| (cache.get(&id).map_or(0, Dagnode::generation), id))
            .collect();
        keyed.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        keyed.into_iter().map(|(_, id)| id).collect()
    }
}

fn fetch_cached<'c>(
    graph: &dyn GraphStore,
    dagnum: DagNum,
    id: &ContentHash,
    cache: &'c mut HashMap<ContentHash, Dagnode>,
) -> DagResult<&'c Dagnode> {
    if !cache.contains_key(id) {
        let node = graph.fetch_node(dagnum, id)?;
        cache.insert(*id, node);
    }
    Ok(&cache[id])
}

impl LcaSolver for GraphLca<'_> {
    fn compute(&self, dagnum: DagNum, ids: &BTreeSet<ContentHash>) -> DagResult<Vec<ContentHash>> {
        let mut cache = HashMap::new();
        let mut common: Option<BTreeSet<ContentHash>> = None;
        for id in ids {
            let closure = self.closure(dagnum, id, &mut cache)?;
            common = Some(match common {
                None => closure,
                Some(acc) => acc.intersection(&closure).copied().collect(),
            });
        }
        let Some(common) = common else {
            return Ok(Vec::new());
        };

        // Any proper ancestor of a common ancestor is reached from it by a
        // parent chain that stays inside `common`, so it is a direct parent
        // of some member.
        let mut dominated = BTreeSet::new();
        for id in &common {
            if let Some(node) = cache.get(id) {
                dominated.extend(node.parents().iter().copied());
            }
        }
        let (lowest, rest): (Vec<_>, Vec<_>) =
            common.into_iter().partition(|id| !dominated.contains(id));

        let mut ordered = Self::by_generation_desc(lowest, &cache);
        ordered.extend(Self::by_generation_desc(rest, &cache));
        Ok(ordered)
    }

    fn ancestors(&self, dagnum: DagNum, id: &ContentHash) -> DagResult<Vec<ContentHash>> {
        let mut cache = HashMap::new();
        let mut closure = self.closure(dagnum, id, &mut cache)?;
        closure.remove(id);
        Ok(Self::by_generation_desc(closure, &cache))
    }
}
