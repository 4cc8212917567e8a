use std::collections::{BTreeMap, BTreeSet};

use sprig_dag::{Dagnode, GraphStore, LcaSolver};
use sprig_store::ContentStore;
use sprig_types::{ContentHash, DagNum, Generation};

use crate::builder::ChangesetBuilder;
use crate::error::{ChangesetError, ChangesetResult};
use crate::frozen::FrozenChangeset;
use crate::reftype::Reftype;

/// A changeset in either lifecycle phase.
///
/// [`ChangesetBuilder`] and [`FrozenChangeset`] give the compile-time
/// checked API. This enum is for callers that hold a changeset across the
/// transition and need the phase checked at runtime: mutators fail with
/// [`ChangesetError::InvalidWhileFrozen`] once frozen, accessors with
/// [`ChangesetError::InvalidUnlessFrozen`] before.
#[derive(Clone, Debug)]
pub enum Changeset {
    Constructing(ChangesetBuilder),
    Frozen(FrozenChangeset),
}

impl Changeset {
    pub fn new(dagnum: DagNum) -> Self {
        Self::Constructing(ChangesetBuilder::new(dagnum))
    }

    /// Load a stored changeset. The result is frozen.
    pub fn load_from_repo(store: &dyn ContentStore, id: &ContentHash) -> ChangesetResult<Self> {
        FrozenChangeset::load_from_repo(store, id).map(Self::Frozen)
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self, Self::Frozen(_))
    }

    fn builder_mut(&mut self) -> ChangesetResult<&mut ChangesetBuilder> {
        match self {
            Self::Constructing(builder) => Ok(builder),
            Self::Frozen(_) => Err(ChangesetError::InvalidWhileFrozen),
        }
    }

    fn frozen(&self) -> ChangesetResult<&FrozenChangeset> {
        match self {
            Self::Frozen(frozen) => Ok(frozen),
            Self::Constructing(_) => Err(ChangesetError::InvalidUnlessFrozen),
        }
    }

    // ---- Constructing phase ----

    pub fn set_version(&mut self, version: u32) -> ChangesetResult<()> {
        self.builder_mut()?.set_version(version);
        Ok(())
    }

    pub fn set_root(&mut self, root: Option<ContentHash>) -> ChangesetResult<()> {
        self.builder_mut()?.set_root(root)
    }

    pub fn add_parent(&mut self, id: ContentHash) -> ChangesetResult<()> {
        self.builder_mut()?.add_parent(id);
        Ok(())
    }

    pub fn add_treepath(&mut self, stable_id: impl Into<String>, path: impl Into<String>) -> ChangesetResult<()> {
        self.builder_mut()?.add_treepath(stable_id, path)
    }

    pub fn add_blob_to_list(&mut self, hash: ContentHash, reftype: Reftype, len: u64) -> ChangesetResult<()> {
        self.builder_mut()?.add_blob_to_list(hash, reftype, len)
    }

    /// Freeze in place and return the new id.
    ///
    /// On failure the changeset stays in the constructing phase.
    pub fn save_to_repo(
        &mut self,
        graph: &dyn GraphStore,
        lca: &dyn LcaSolver,
        store: &dyn ContentStore,
    ) -> ChangesetResult<ContentHash> {
        let frozen = self.builder_mut()?.freeze(graph, lca, store)?;
        let id = *frozen.id();
        *self = Self::Frozen(frozen);
        Ok(id)
    }

    // ---- Frozen phase ----

    pub fn id(&self) -> ChangesetResult<&ContentHash> {
        Ok(self.frozen()?.id())
    }

    pub fn version(&self) -> ChangesetResult<u32> {
        Ok(self.frozen()?.version())
    }

    pub fn dagnum(&self) -> ChangesetResult<DagNum> {
        Ok(self.frozen()?.dagnum())
    }

    pub fn root(&self) -> ChangesetResult<Option<&ContentHash>> {
        Ok(self.frozen()?.root())
    }

    pub fn generation(&self) -> ChangesetResult<Generation> {
        Ok(self.frozen()?.generation())
    }

    pub fn parents(&self) -> ChangesetResult<Option<&BTreeSet<ContentHash>>> {
        Ok(self.frozen()?.parents())
    }

    pub fn blobs(&self, reftype: Reftype) -> ChangesetResult<Option<&BTreeMap<ContentHash, u64>>> {
        Ok(self.frozen()?.blobs(reftype))
    }

    pub fn treepaths(&self) -> ChangesetResult<Option<&BTreeMap<String, String>>> {
        Ok(self.frozen()?.treepaths())
    }

    pub fn create_dagnode(&self) -> ChangesetResult<Dagnode> {
        Ok(self.frozen()?.create_dagnode())
    }
}

impl From<ChangesetBuilder> for Changeset {
    fn from(builder: ChangesetBuilder) -> Self {
        Self::Constructing(builder)
    }
}

impl From<FrozenChangeset> for Changeset {
    fn from(frozen: FrozenChangeset) -> Self {
        Self::Frozen(frozen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{hid, Fixture};
    use sprig_dag::GraphLca;

    const NS: DagNum = DagNum::VERSION_CONTROL;

    fn frozen_changeset(fx: &Fixture) -> Changeset {
        let mut cs = Changeset::new(NS);
        cs.set_root(Some(hid(1))).unwrap();
        cs.add_blob_to_list(hid(2), Reftype::TreeNode, 5).unwrap();
        let lca = GraphLca::new(&fx.graph);
        cs.save_to_repo(&fx.graph, &lca, &fx.content).unwrap();
        cs
    }

    #[test]
    fn accessors_fail_while_constructing() {
        let cs = Changeset::new(NS);
        assert!(!cs.is_frozen());
        assert!(matches!(cs.id(), Err(ChangesetError::InvalidUnlessFrozen)));
        assert!(matches!(cs.version(), Err(ChangesetError::InvalidUnlessFrozen)));
        assert!(matches!(cs.dagnum(), Err(ChangesetError::InvalidUnlessFrozen)));
        assert!(matches!(cs.root(), Err(ChangesetError::InvalidUnlessFrozen)));
        assert!(matches!(cs.generation(), Err(ChangesetError::InvalidUnlessFrozen)));
        assert!(matches!(cs.parents(), Err(ChangesetError::InvalidUnlessFrozen)));
        assert!(matches!(
            cs.blobs(Reftype::TreeNode),
            Err(ChangesetError::InvalidUnlessFrozen)
        ));
        assert!(matches!(cs.treepaths(), Err(ChangesetError::InvalidUnlessFrozen)));
        assert!(matches!(
            cs.create_dagnode(),
            Err(ChangesetError::InvalidUnlessFrozen)
        ));
    }

    #[test]
    fn mutators_fail_once_frozen() {
        let fx = Fixture::new();
        let mut cs = frozen_changeset(&fx);
        assert!(cs.is_frozen());
        let id = *cs.id().unwrap();

        assert!(matches!(cs.set_version(1), Err(ChangesetError::InvalidWhileFrozen)));
        assert!(matches!(cs.set_root(None), Err(ChangesetError::InvalidWhileFrozen)));
        assert!(matches!(cs.add_parent(hid(9)), Err(ChangesetError::InvalidWhileFrozen)));
        assert!(matches!(
            cs.add_treepath("g", "@/p"),
            Err(ChangesetError::InvalidWhileFrozen)
        ));
        assert!(matches!(
            cs.add_blob_to_list(hid(3), Reftype::TreeNode, 1),
            Err(ChangesetError::InvalidWhileFrozen)
        ));
        let lca = GraphLca::new(&fx.graph);
        assert!(matches!(
            cs.save_to_repo(&fx.graph, &lca, &fx.content),
            Err(ChangesetError::InvalidWhileFrozen)
        ));

        // Nothing changed.
        assert_eq!(cs.id().unwrap(), &id);
        assert_eq!(cs.root().unwrap(), Some(&hid(1)));
        assert_eq!(cs.generation().unwrap(), 1);
    }

    #[test]
    fn failed_freeze_stays_constructing() {
        let fx = Fixture::new();
        let mut cs = Changeset::new(NS);
        cs.add_parent(hid(0x55)).unwrap();
        let lca = GraphLca::new(&fx.graph);
        assert!(cs.save_to_repo(&fx.graph, &lca, &fx.content).is_err());
        assert!(!cs.is_frozen());
        cs.add_blob_to_list(hid(1), Reftype::DbRecord, 4).unwrap();
    }

    #[test]
    fn loaded_changeset_is_frozen() {
        let fx = Fixture::new();
        let cs = frozen_changeset(&fx);
        let loaded = Changeset::load_from_repo(&fx.content, cs.id().unwrap()).unwrap();
        assert!(loaded.is_frozen());
        assert_eq!(loaded.id().unwrap(), cs.id().unwrap());
        assert_eq!(
            loaded.blobs(Reftype::TreeNode).unwrap(),
            Some(&BTreeMap::from([(hid(2), 5)]))
        );
    }
}
