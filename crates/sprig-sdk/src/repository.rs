use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use sprig_changeset::{ChangesetBuilder, ChangesetError, FrozenChangeset};
use sprig_dag::{
    DagError, Fragment, FragmentReport, GraphLca, GraphStore, LcaSolver, TableGraphStore,
};
use sprig_store::{ContentStore, FsContentStore, InMemoryContentStore};
use sprig_types::{ContentHash, DagNum, Generation};

use crate::config::RepoConfig;
use crate::error::{SdkError, SdkResult};

const CONFIG_FILE: &str = "config.toml";
const GRAPH_FILE: &str = "graph.tbl";
const OBJECTS_DIR: &str = "objects";

/// Outcome of [`Repository::fsck`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FsckReport {
    pub namespaces: usize,
    pub nodes: usize,
    /// One line per problem found. Empty means the repository is sound.
    pub problems: Vec<String>,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// A sprig repository: a graph store and a content store used together.
///
/// On disk a repository directory holds:
///
/// ```text
/// <dir>/config.toml   optional RepoConfig
/// <dir>/graph.tbl     graph node log
/// <dir>/objects/      changesets and blobs
/// ```
pub struct Repository {
    graph: TableGraphStore,
    content: Box<dyn ContentStore>,
    config: RepoConfig,
    dir: Option<PathBuf>,
}

impl Repository {
    /// Open (or create) a repository in `dir` with an explicit config.
    pub fn open(dir: impl AsRef<Path>, config: RepoConfig) -> SdkResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let content = FsContentStore::open(dir.join(OBJECTS_DIR), config.content.clone())?;
        let graph = TableGraphStore::open(dir.join(GRAPH_FILE), config.graph.clone())?;
        info!(dir = %dir.display(), "repository opened");
        Ok(Self {
            graph,
            content: Box::new(content),
            config,
            dir: Some(dir),
        })
    }

    /// Open (or create) a repository in `dir`, reading `config.toml` from
    /// it when present.
    pub fn open_dir(dir: impl AsRef<Path>) -> SdkResult<Self> {
        let config_path = dir.as_ref().join(CONFIG_FILE);
        let config = if config_path.exists() {
            RepoConfig::load(&config_path)?
        } else {
            RepoConfig::default()
        };
        Self::open(dir, config)
    }

    /// A repository that lives only in memory.
    pub fn in_memory(config: RepoConfig) -> Self {
        Self {
            graph: TableGraphStore::in_memory(config.graph.clone()),
            content: Box::new(InMemoryContentStore::new()),
            config,
            dir: None,
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn graph(&self) -> &dyn GraphStore {
        &self.graph
    }

    pub fn content(&self) -> &dyn ContentStore {
        self.content.as_ref()
    }

    /// Store a blob and return its hash. Storing known content is not an
    /// error.
    pub fn write_blob(&self, data: &[u8]) -> SdkResult<ContentHash> {
        Ok(self.content.store_idempotent(data)?)
    }

    pub fn read_blob(&self, id: &ContentHash) -> SdkResult<Vec<u8>> {
        Ok(self.content.fetch(id)?)
    }

    // ---- Commits ----

    /// Freeze `builder`, store the changeset and record its graph node.
    ///
    /// A busy graph store is retried per the configured [`RetryPolicy`].
    /// Committing content that is already committed returns the existing
    /// changeset.
    ///
    /// [`RetryPolicy`]: sprig_dag::RetryPolicy
    pub fn commit(&self, builder: ChangesetBuilder) -> SdkResult<FrozenChangeset> {
        let dagnum = builder.dagnum();
        let lca = GraphLca::new(&self.graph);
        let frozen = builder.save_to_repo(&self.graph, &lca, self.content.as_ref())?;
        let node = frozen.create_dagnode();

        match self.config.retry.run(|| self.graph.store_node(dagnum, &node)) {
            Ok(()) => {
                info!(
                    dagnum = %dagnum,
                    changeset = %frozen.id().short_hex(),
                    generation = frozen.generation(),
                    "committed"
                );
            }
            Err(DagError::AlreadyExists(id)) => {
                debug!(changeset = %id.short_hex(), "changeset already committed");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(frozen)
    }

    pub fn load_changeset(&self, id: &ContentHash) -> SdkResult<FrozenChangeset> {
        Ok(FrozenChangeset::load_from_repo(self.content.as_ref(), id)?)
    }

    // ---- Queries ----

    /// Resolve a short hex prefix to the one node it names.
    pub fn resolve_prefix(&self, dagnum: DagNum, prefix: &str) -> SdkResult<ContentHash> {
        if prefix.is_empty()
            || prefix.len() > ContentHash::HEX_LEN
            || !prefix.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(SdkError::InvalidPrefix(prefix.to_string()));
        }
        let matches = self.graph.find_by_prefix(dagnum, prefix)?;
        let mut iter = matches.iter();
        match (iter.next(), iter.next()) {
            (Some(id), None) => Ok(*id),
            (None, _) => Err(SdkError::PrefixNotFound(prefix.to_string())),
            (Some(_), Some(_)) => Err(SdkError::AmbiguousPrefix {
                prefix: prefix.to_string(),
                count: matches.len(),
            }),
        }
    }

    pub fn leaves(&self, dagnum: DagNum) -> SdkResult<BTreeSet<ContentHash>> {
        Ok(self.graph.fetch_leaves(dagnum)?)
    }

    /// The best common ancestor of `ids`, if they share history.
    pub fn lca(&self, dagnum: DagNum, ids: &BTreeSet<ContentHash>) -> SdkResult<Option<ContentHash>> {
        Ok(GraphLca::new(&self.graph)
            .compute(dagnum, ids)?
            .into_iter()
            .next())
    }

    /// Check every namespace: graph consistency, and that every node has a
    /// loadable changeset that agrees with it.
    pub fn fsck(&self) -> SdkResult<FsckReport> {
        let mut report = FsckReport::default();
        let lca = GraphLca::new(&self.graph);

        for dagnum in self.graph.list_namespaces()? {
            report.namespaces += 1;
            if let Err(e) = self.graph.check_consistency(dagnum) {
                report.problems.push(format!("{dagnum}: {e}"));
                continue;
            }

            let mut nodes = BTreeSet::new();
            for leaf in self.graph.fetch_leaves(dagnum)? {
                nodes.insert(leaf);
                nodes.extend(lca.ancestors(dagnum, &leaf)?);
            }
            report.nodes += nodes.len();

            for id in &nodes {
                let node = self.graph.fetch_node(dagnum, id)?;
                match FrozenChangeset::load_from_repo(self.content.as_ref(), id) {
                    Ok(changeset) if changeset.create_dagnode() == node && changeset.dagnum() == dagnum => {}
                    Ok(_) => report
                        .problems
                        .push(format!("{dagnum}: changeset {id} disagrees with its graph node")),
                    Err(e) => report.problems.push(format!("{dagnum}: changeset {id}: {e}")),
                }
            }
        }

        if report.is_clean() {
            info!(namespaces = report.namespaces, nodes = report.nodes, "fsck clean");
        } else {
            warn!(problems = report.problems.len(), "fsck found problems");
        }
        Ok(report)
    }

    // ---- Synchronization ----

    /// Collect `heads` and up to `depth` generations of their history for
    /// sending to a peer. `None` sends everything.
    pub fn export_fragment(
        &self,
        dagnum: DagNum,
        heads: &BTreeSet<ContentHash>,
        depth: Option<Generation>,
    ) -> SdkResult<Fragment> {
        Ok(Fragment::from_graph(&self.graph, dagnum, heads, depth)?)
    }

    /// Merge a fragment received from a peer.
    ///
    /// The changesets of all members must already be in the content store,
    /// and each member must be the node its changeset describes; otherwise
    /// nothing is inserted.
    pub fn import_fragment(&self, fragment: &Fragment) -> SdkResult<FragmentReport> {
        let mut missing = BTreeSet::new();
        let mut mismatched = BTreeSet::new();
        for node in fragment.members_ancestor_first() {
            let id = node.id();
            if !self.content.exists(id)? {
                missing.insert(*id);
                continue;
            }
            match FrozenChangeset::load_from_repo(self.content.as_ref(), id) {
                Ok(changeset)
                    if changeset.create_dagnode() == *node
                        && changeset.dagnum() == fragment.dagnum() => {}
                Ok(_) | Err(ChangesetError::ChangesetValidationFailed) => {
                    debug!(member = %id.short_hex(), "fragment member disagrees with its changeset");
                    mismatched.insert(*id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        if !missing.is_empty() {
            return Err(SdkError::MissingChangesets(missing));
        }
        if !mismatched.is_empty() {
            warn!(
                dagnum = %fragment.dagnum(),
                mismatched = mismatched.len(),
                "refusing fragment with forged members"
            );
            return Err(SdkError::MismatchedMembers(mismatched));
        }
        Ok(self.config.retry.run(|| fragment.insert_into(&self.graph))?)
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("dir", &self.dir)
            .field("graph", &self.graph)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprig_changeset::Reftype;
    use sprig_dag::Connectivity;

    const NS: DagNum = DagNum::VERSION_CONTROL;

    fn repo() -> Repository {
        Repository::in_memory(RepoConfig::default())
    }

    /// Commit a linear history of `n` changesets, each adding one file.
    fn linear(repo: &Repository, n: u8) -> Vec<ContentHash> {
        let mut ids = Vec::new();
        for i in 0..n {
            let blob = repo.write_blob(&[i; 16]).unwrap();
            let mut b = ChangesetBuilder::new(NS);
            if let Some(prev) = ids.last() {
                b.add_parent(*prev);
            }
            b.add_blob_to_list(blob, Reftype::TreeUserFile, 16).unwrap();
            ids.push(*repo.commit(b).unwrap().id());
        }
        ids
    }

    /// Copy the changesets of a fragment's members between repositories.
    fn copy_changesets(from: &Repository, to: &Repository, fragment: &Fragment) {
        for node in fragment.members_ancestor_first() {
            to.write_blob(&from.read_blob(node.id()).unwrap()).unwrap();
        }
    }

    #[test]
    fn commit_records_node_and_changeset() {
        let repo = repo();
        let ids = linear(&repo, 3);
        assert_eq!(repo.leaves(NS).unwrap(), [ids[2]].into());
        let tip = repo.load_changeset(&ids[2]).unwrap();
        assert_eq!(tip.generation(), 3);
        assert_eq!(tip.parents(), Some(&[ids[1]].into()));
        assert!(repo.fsck().unwrap().is_clean());
    }

    #[test]
    fn recommitting_is_absorbed() {
        let repo = repo();
        let first = repo.commit(ChangesetBuilder::new(NS)).unwrap();
        let again = repo.commit(ChangesetBuilder::new(NS)).unwrap();
        assert_eq!(first.id(), again.id());
        assert_eq!(repo.leaves(NS).unwrap().len(), 1);
    }

    #[test]
    fn prefix_resolution() {
        let repo = repo();
        let ids = linear(&repo, 2);
        let hex = ids[0].to_hex();
        assert_eq!(repo.resolve_prefix(NS, &hex[..12]).unwrap(), ids[0]);
        assert_eq!(repo.resolve_prefix(NS, &hex).unwrap(), ids[0]);

        let unused = (0..16u8)
            .map(|d| format!("{d:x}"))
            .find(|p| !ids.iter().any(|id| id.has_hex_prefix(p)))
            .unwrap();
        assert!(matches!(
            repo.resolve_prefix(NS, &unused),
            Err(SdkError::PrefixNotFound(_))
        ));
        assert!(matches!(
            repo.resolve_prefix(NS, "xyz"),
            Err(SdkError::InvalidPrefix(_))
        ));
        assert!(matches!(
            repo.resolve_prefix(NS, ""),
            Err(SdkError::InvalidPrefix(_))
        ));
    }

    #[test]
    fn ambiguous_prefix_is_reported() {
        let repo = repo();
        // Seventeen roots guarantee two share a first hex digit.
        for i in 0..17u8 {
            let mut b = ChangesetBuilder::new(NS);
            b.set_root(Some(ContentHash::of(&[i]))).unwrap();
            repo.commit(b).unwrap();
        }
        let ambiguous = (0..16u8).map(|d| format!("{d:x}")).any(|p| {
            matches!(
                repo.resolve_prefix(NS, &p),
                Err(SdkError::AmbiguousPrefix { count, .. }) if count > 1
            )
        });
        assert!(ambiguous);
    }

    #[test]
    fn lca_of_branches() {
        let repo = repo();
        let ids = linear(&repo, 2);
        let mut left = ChangesetBuilder::new(NS);
        left.add_parent(ids[1]);
        left.set_root(Some(ContentHash::of(b"left"))).unwrap();
        let left = repo.commit(left).unwrap();
        let mut right = ChangesetBuilder::new(NS);
        right.add_parent(ids[1]);
        right.set_root(Some(ContentHash::of(b"right"))).unwrap();
        let right = repo.commit(right).unwrap();

        let both: BTreeSet<_> = [*left.id(), *right.id()].into();
        assert_eq!(repo.lca(NS, &both).unwrap(), Some(ids[1]));
    }

    #[test]
    fn fsck_reports_missing_changeset() {
        let repo = repo();
        linear(&repo, 2);
        let orphan = ContentHash::of(b"never stored");
        repo.graph().store_node(NS, &sprig_dag::Dagnode::root(orphan)).unwrap();

        let report = repo.fsck().unwrap();
        assert_eq!(report.namespaces, 1);
        assert_eq!(report.nodes, 3);
        assert_eq!(report.problems.len(), 1);
        assert!(report.problems[0].contains(&orphan.to_hex()));
    }

    #[test]
    fn pull_through_fragments() {
        let origin = repo();
        let ids = linear(&origin, 5);

        let clone = repo();
        let base = origin.export_fragment(NS, &[ids[1]].into(), None).unwrap();
        copy_changesets(&origin, &clone, &base);
        clone.import_fragment(&base).unwrap();

        let update = origin.export_fragment(NS, &[ids[4]].into(), Some(3)).unwrap();
        assert_eq!(update.check_connectivity(clone.graph()).unwrap(), Connectivity::Connected);
        copy_changesets(&origin, &clone, &update);
        let report = clone.import_fragment(&update).unwrap();
        assert_eq!(report.absorbed, [ids[2], ids[3], ids[4]].into());

        assert_eq!(clone.leaves(NS).unwrap(), origin.leaves(NS).unwrap());
        assert!(clone.fsck().unwrap().is_clean());
    }

    #[test]
    fn fragment_without_changesets_is_refused() {
        let origin = repo();
        let ids = linear(&origin, 2);
        let clone = repo();
        let fragment = origin.export_fragment(NS, &[ids[1]].into(), None).unwrap();
        match clone.import_fragment(&fragment) {
            Err(SdkError::MissingChangesets(missing)) => {
                assert_eq!(missing, ids.iter().copied().collect::<BTreeSet<_>>());
            }
            other => panic!("expected MissingChangesets, got {other:?}"),
        }
        assert!(clone.leaves(NS).unwrap().is_empty());
    }

    #[test]
    fn fragment_member_must_match_its_changeset() {
        let origin = repo();
        let ids = linear(&origin, 3);
        let clone = repo();

        // ids[2] really has generation 3 and parent ids[1].
        let mut forged = Fragment::new(NS);
        forged.add_dagnode(origin.graph().fetch_node(NS, &ids[0]).unwrap());
        forged.add_dagnode(sprig_dag::Dagnode::new(ids[2], 2, [ids[0]].into()));
        copy_changesets(&origin, &clone, &forged);

        match clone.import_fragment(&forged) {
            Err(SdkError::MismatchedMembers(ids_seen)) => {
                assert_eq!(ids_seen, [ids[2]].into());
            }
            other => panic!("expected MismatchedMembers, got {other:?}"),
        }
        assert!(clone.leaves(NS).unwrap().is_empty());
        assert!(clone.fsck().unwrap().is_clean());
    }

    #[test]
    fn fragment_member_with_junk_changeset_is_refused() {
        let clone = repo();
        let junk = clone.write_blob(b"not a changeset").unwrap();
        let mut fragment = Fragment::new(NS);
        fragment.add_dagnode(sprig_dag::Dagnode::root(junk));
        assert!(matches!(
            clone.import_fragment(&fragment),
            Err(SdkError::MismatchedMembers(_))
        ));
        assert!(clone.leaves(NS).unwrap().is_empty());
    }

    #[test]
    fn on_disk_repository_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let ids = {
            let repo = Repository::open_dir(dir.path()).unwrap();
            linear(&repo, 3)
        };
        let repo = Repository::open_dir(dir.path()).unwrap();
        assert_eq!(repo.dir(), Some(dir.path()));
        assert_eq!(repo.leaves(NS).unwrap(), [ids[2]].into());
        assert_eq!(repo.load_changeset(&ids[0]).unwrap().generation(), 1);
        assert!(repo.fsck().unwrap().is_clean());
    }

    #[test]
    fn open_dir_reads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "[retry]\nmax_attempts = 9\n").unwrap();
        let repo = Repository::open_dir(dir.path()).unwrap();
        assert_eq!(repo.config().retry.max_attempts, 9);
    }
}
