//! Partial sub-graphs exchanged between peers, and the protocol that merges
//! one into a local graph store.
//!
//! ```text
//! Received --connectivity--> Connected    --insert members--> Done
//!                       \--> Disconnected                \--> PartiallyApplied
//! ```
//!
//! A fragment is *connected* when every id on its end fringe (parents named
//! by members but not themselves members) is already stored locally.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sprig_types::{ContentHash, DagNum, Generation};

use crate::error::{DagError, DagResult};
use crate::node::Dagnode;
use crate::store::GraphStore;

const WIRE_VERSION: u32 = 1;

/// A connected partial sub-graph of one namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    dagnum: DagNum,
    members: BTreeMap<ContentHash, Dagnode>,
    fringe: BTreeSet<ContentHash>,
}

/// Result of the connectivity check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Connectivity {
    Connected,
    Disconnected { missing: BTreeSet<ContentHash> },
}

/// What a completed insertion did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FragmentReport {
    /// Members that were not stored before and are now.
    pub absorbed: BTreeSet<ContentHash>,
    /// Members that were already stored.
    pub already_present: usize,
}

#[derive(Serialize, Deserialize)]
struct FragmentWire {
    version: u32,
    dagnum: DagNum,
    members: Vec<Dagnode>,
}

impl Fragment {
    pub fn new(dagnum: DagNum) -> Self {
        Self {
            dagnum,
            members: BTreeMap::new(),
            fringe: BTreeSet::new(),
        }
    }

    /// Add a member. Adding the same node twice is a no-op.
    pub fn add_dagnode(&mut self, node: Dagnode) {
        let id = *node.id();
        if self.members.contains_key(&id) {
            return;
        }
        self.fringe.remove(&id);
        for parent in node.parents() {
            if !self.members.contains_key(parent) {
                self.fringe.insert(*parent);
            }
        }
        self.members.insert(id, node);
    }

    /// Collect a fragment from a local graph: the `heads` and their
    /// ancestors, down to `depth` generations below the highest head.
    /// `None` takes the whole history.
    pub fn from_graph(
        graph: &dyn GraphStore,
        dagnum: DagNum,
        heads: &BTreeSet<ContentHash>,
        depth: Option<Generation>,
    ) -> DagResult<Self> {
        let mut fragment = Self::new(dagnum);
        let mut queue: VecDeque<Dagnode> = VecDeque::new();
        for head in heads {
            queue.push_back(graph.fetch_node(dagnum, head)?);
        }
        let top = queue.iter().map(Dagnode::generation).max().unwrap_or(0);
        let floor = depth.map_or(Generation::MIN, |d| top.saturating_sub(d));

        let mut seen: BTreeSet<ContentHash> = heads.clone();
        while let Some(node) = queue.pop_front() {
            for parent in node.parents() {
                if seen.insert(*parent) {
                    let parent_node = graph.fetch_node(dagnum, parent)?;
                    if parent_node.generation() > floor {
                        queue.push_back(parent_node);
                    }
                }
            }
            fragment.add_dagnode(node);
        }
        debug!(
            dagnum = %dagnum,
            members = fragment.len(),
            fringe = fragment.fringe.len(),
            "built fragment"
        );
        Ok(fragment)
    }

    pub fn dagnum(&self) -> DagNum {
        self.dagnum
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, id: &ContentHash) -> Option<&Dagnode> {
        self.members.get(id)
    }

    /// Parents named by members that are not members themselves.
    pub fn end_fringe(&self) -> &BTreeSet<ContentHash> {
        &self.fringe
    }

    /// Members in ancestor-first order.
    ///
    /// The order follows the parent edges between members, not the
    /// generations the members declare. Ties go to the lower declared
    /// generation, then the lower id. Members on a parent cycle come last.
    pub fn members_ancestor_first(&self) -> Vec<&Dagnode> {
        let mut pending: BTreeMap<&ContentHash, usize> = BTreeMap::new();
        let mut children: BTreeMap<&ContentHash, Vec<&Dagnode>> = BTreeMap::new();
        for (id, node) in &self.members {
            let mut count = 0;
            for parent in node.parents() {
                if let Some((parent_id, _)) = self.members.get_key_value(parent) {
                    children.entry(parent_id).or_default().push(node);
                    count += 1;
                }
            }
            pending.insert(id, count);
        }

        let mut ready: BTreeSet<(Generation, &ContentHash)> = self
            .members
            .iter()
            .filter(|(id, _)| pending.get(id) == Some(&0))
            .map(|(id, node)| (node.generation(), id))
            .collect();
        let mut order = Vec::with_capacity(self.members.len());
        while let Some((_, id)) = ready.pop_first() {
            order.push(&self.members[id]);
            for child in children.get(id).into_iter().flatten() {
                if let Some(count) = pending.get_mut(child.id()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert((child.generation(), child.id()));
                    }
                }
            }
        }

        if order.len() < self.members.len() {
            let placed: BTreeSet<&ContentHash> = order.iter().map(|node| node.id()).collect();
            order.extend(self.members.values().filter(|node| !placed.contains(node.id())));
        }
        order
    }

    /// Check whether every fringe id is known to `graph`.
    pub fn check_connectivity(&self, graph: &dyn GraphStore) -> DagResult<Connectivity> {
        let missing = graph.missing(self.dagnum, &self.fringe)?;
        if missing.is_empty() {
            Ok(Connectivity::Connected)
        } else {
            Ok(Connectivity::Disconnected { missing })
        }
    }

    /// Merge this fragment into `graph`.
    ///
    /// Fails with [`DagError::CannotCreateSparseGraph`] when disconnected,
    /// without touching the store. Members are then stored ancestor-first,
    /// each as its own atomic unit; members already present are counted and
    /// skipped. A member missing a parent from the end fringe at this stage
    /// means the connectivity check and the store disagree, and is reported
    /// as [`DagError::GraphNotConsistent`]. Any other failure stops insertion
    /// and is wrapped in [`DagError::PartiallyApplied`] together with the
    /// ids already absorbed.
    pub fn insert_into(&self, graph: &dyn GraphStore) -> DagResult<FragmentReport> {
        if let Connectivity::Disconnected { missing } = self.check_connectivity(graph)? {
            debug!(dagnum = %self.dagnum, missing = missing.len(), "fragment disconnected");
            return Err(DagError::CannotCreateSparseGraph { missing });
        }

        let mut report = FragmentReport::default();
        for node in self.members_ancestor_first() {
            match graph.store_node(self.dagnum, node) {
                Ok(()) => {
                    report.absorbed.insert(*node.id());
                }
                Err(DagError::AlreadyExists(_)) => report.already_present += 1,
                Err(DagError::SparseGraph { node, parent }) if self.fringe.contains(&parent) => {
                    return Err(DagError::GraphNotConsistent(format!(
                        "fragment passed connectivity check but {node} is missing parent {parent}"
                    )));
                }
                Err(e) => {
                    if report.absorbed.is_empty() {
                        return Err(e);
                    }
                    warn!(
                        dagnum = %self.dagnum,
                        absorbed = report.absorbed.len(),
                        error = %e,
                        "fragment partially applied"
                    );
                    return Err(DagError::PartiallyApplied {
                        absorbed: report.absorbed,
                        source: Box::new(e),
                    });
                }
            }
        }

        info!(
            dagnum = %self.dagnum,
            absorbed = report.absorbed.len(),
            already_present = report.already_present,
            "fragment inserted"
        );
        Ok(report)
    }

    /// JSON wire form.
    pub fn to_json(&self) -> DagResult<String> {
        let wire = FragmentWire {
            version: WIRE_VERSION,
            dagnum: self.dagnum,
            members: self.members_ancestor_first().into_iter().cloned().collect(),
        };
        serde_json::to_string(&wire).map_err(|e| DagError::Serialization(e.to_string()))
    }

    /// Parse the JSON wire form. The end fringe is recomputed from the
    /// members rather than trusted from the peer.
    pub fn from_json(json: &str) -> DagResult<Self> {
        let wire: FragmentWire =
            serde_json::from_str(json).map_err(|e| DagError::Serialization(e.to_string()))?;
        if wire.version != WIRE_VERSION {
            return Err(DagError::Serialization(format!(
                "unsupported fragment version {}",
                wire.version
            )));
        }
        let mut fragment = Self::new(wire.dagnum);
        for node in wire.members {
            fragment.add_dagnode(node);
        }
        Ok(fragment)
    }
}
