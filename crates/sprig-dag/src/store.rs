//! Graph store trait and the table-backed implementation.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, TryLockError, TryLockResult};
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use sprig_types::{ContentHash, DagNum};

use crate::config::GraphStoreConfig;
use crate::error::{DagError, DagResult};
use crate::node::Dagnode;
use crate::tables::{GraphTables, LogLock, LogRecord, ParentRef, TableLog, Unit};

/// Persistent storage for commit graphs.
///
/// Implementations must satisfy these invariants:
/// - All row mutations for one [`store_node`] call form one atomic unit.
/// - Multi-row reads observe one consistent snapshot.
/// - Lock contention is reported as [`DagError::StoreBusy`], never by
///   blocking indefinitely.
///
/// [`store_node`]: GraphStore::store_node
pub trait GraphStore: Send + Sync {
    /// Insert one node.
    ///
    /// Fails with [`DagError::AlreadyExists`] if the id is already stored,
    /// with [`DagError::SparseGraph`] if any parent is unknown and with
    /// [`DagError::GenerationMismatch`] if the node's generation disagrees
    /// with its parents.
    fn store_node(&self, dagnum: DagNum, node: &Dagnode) -> DagResult<()>;

    /// Fetch a node. Fails with [`DagError::NotFound`] if unknown.
    fn fetch_node(&self, dagnum: DagNum, id: &ContentHash) -> DagResult<Dagnode>;

    /// Whether `id` is stored in the namespace.
    fn contains(&self, dagnum: DagNum, id: &ContentHash) -> DagResult<bool>;

    /// The subset of `ids` not stored in the namespace.
    fn missing(&self, dagnum: DagNum, ids: &BTreeSet<ContentHash>) -> DagResult<BTreeSet<ContentHash>> {
        let mut missing = BTreeSet::new();
        for id in ids {
            if !self.contains(dagnum, id)? {
                missing.insert(*id);
            }
        }
        Ok(missing)
    }

    /// Snapshot of the current leaf set.
    fn fetch_leaves(&self, dagnum: DagNum) -> DagResult<BTreeSet<ContentHash>>;

    /// Direct children of a stored node.
    fn fetch_children(&self, dagnum: DagNum, id: &ContentHash) -> DagResult<BTreeSet<ContentHash>>;

    /// Node ids whose hex form starts with `prefix`.
    fn find_by_prefix(&self, dagnum: DagNum, prefix: &str) -> DagResult<BTreeSet<ContentHash>>;

    /// Every namespace holding at least one node.
    fn list_namespaces(&self) -> DagResult<BTreeSet<DagNum>>;

    /// Verify the leaf set and the absence of holes.
    ///
    /// Any failure is [`DagError::GraphNotConsistent`].
    fn check_consistency(&self, dagnum: DagNum) -> DagResult<()>;
}

/// Graph store over in-process relations, optionally backed by a node log.
///
/// The relations sit behind one `RwLock`, which is the in-process
/// transaction boundary: a node insertion holds the write lock for its whole
/// unit, and multi-row reads hold the read lock for their whole snapshot.
///
/// With a log file, any number of handles (in this process or others) may
/// share it. An insertion takes the log's exclusive lock, replays records
/// other handles appended since it last looked, validates against the
/// result, and appends one record. A failed append rolls the unit back.
/// Reads replay new records under the shared lock first. Every lock wait is
/// bounded by [`GraphStoreConfig::busy_timeout_ms`].
pub struct TableGraphStore {
    replica: RwLock<Replica>,
    log: Option<TableLog>,
    config: GraphStoreConfig,
}

/// The relations as of some point in the log.
#[derive(Default)]
struct Replica {
    tables: GraphTables,
    /// Log offset up to which records have been applied. `0` means not even
    /// the file header has been read.
    log_end: u64,
}

/// Retry `attempt` until it yields a value or the deadline passes.
fn wait_until<T>(
    config: &GraphStoreConfig,
    deadline: Instant,
    mut attempt: impl FnMut() -> DagResult<Option<T>>,
) -> DagResult<T> {
    loop {
        if let Some(value) = attempt()? {
            return Ok(value);
        }
        if Instant::now() >= deadline {
            return Err(DagError::StoreBusy);
        }
        thread::sleep(config.busy_poll_interval());
    }
}

impl TableGraphStore {
    /// A store that lives only in memory.
    pub fn in_memory(config: GraphStoreConfig) -> Self {
        Self {
            replica: RwLock::new(Replica::default()),
            log: None,
            config,
        }
    }

    /// Open (or create) a store backed by the node log at `path`.
    ///
    /// Several handles may be open on one path at once, from any number of
    /// processes. A torn record left by a crashed writer is dropped here.
    pub fn open(path: impl AsRef<Path>, config: GraphStoreConfig) -> DagResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let log = TableLog::open(path)?;
        let mut replica = Replica::default();
        {
            let deadline = Instant::now() + config.busy_timeout();
            let lock = wait_until(&config, deadline, || log.try_lock(true))?;
            log.init(&lock, config.sync_on_commit)?;
            Self::catch_up_for_write(&mut replica, &log, &lock)?;
        }
        info!(
            path = %log.path().display(),
            namespaces = replica.tables.namespaces().len(),
            log_bytes = replica.log_end,
            "graph store opened"
        );
        Ok(Self {
            replica: RwLock::new(replica),
            log: Some(log),
            config,
        })
    }

    pub fn config(&self) -> &GraphStoreConfig {
        &self.config
    }

    fn acquire<G>(
        &self,
        deadline: Instant,
        mut try_lock: impl FnMut() -> TryLockResult<G>,
    ) -> DagResult<G> {
        wait_until(&self.config, deadline, || match try_lock() {
            Ok(guard) => Ok(Some(guard)),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Poisoned(_)) => Err(DagError::GraphNotConsistent(
                "graph table lock poisoned by a panicked writer".into(),
            )),
        })
    }

    /// A read snapshot that includes every record already in the log.
    fn read_replica(&self) -> DagResult<RwLockReadGuard<'_, Replica>> {
        let deadline = Instant::now() + self.config.busy_timeout();
        if let Some(log) = &self.log {
            let behind = {
                let replica = self.acquire(deadline, || self.replica.try_read())?;
                log.len()? > replica.log_end
            };
            if behind {
                let mut replica = self.acquire(deadline, || self.replica.try_write())?;
                let lock = wait_until(&self.config, deadline, || log.try_lock(false))?;
                Self::catch_up(&mut replica, log, &lock)?;
            }
        }
        self.acquire(deadline, || self.replica.try_read())
    }

    /// Apply the records appended past `replica.log_end`. Returns whether a
    /// torn record follows them.
    fn catch_up(replica: &mut Replica, log: &TableLog, lock: &LogLock) -> DagResult<bool> {
        let tail = log.read_from(lock, replica.log_end)?;
        let applied = tail.records.len();
        for record in tail.records {
            let mut unit = Unit::begin(&mut replica.tables);
            match Self::apply_store_node(&mut unit, record.dagnum, &record.node) {
                Ok(()) => unit.commit(),
                Err(DagError::AlreadyExists(_)) => unit.rollback(),
                Err(e) => {
                    unit.rollback();
                    return Err(DagError::CorruptTableFile(format!(
                        "log record for {} does not apply: {e}",
                        record.node.id()
                    )));
                }
            }
        }
        replica.log_end = tail.end;
        if applied > 0 {
            debug!(records = applied, log_end = tail.end, "replayed node log");
        }
        Ok(tail.torn)
    }

    /// [`Self::catch_up`] under the exclusive lock, dropping a torn tail so
    /// the next append lands on a record boundary.
    fn catch_up_for_write(replica: &mut Replica, log: &TableLog, lock: &LogLock) -> DagResult<()> {
        if Self::catch_up(replica, log, lock)? {
            warn!(
                path = %log.path().display(),
                log_end = replica.log_end,
                "dropping torn record at end of node log"
            );
            log.truncate(lock, replica.log_end)?;
        }
        Ok(())
    }

    fn apply_store_node(unit: &mut Unit<'_>, dagnum: DagNum, node: &Dagnode) -> DagResult<()> {
        let id = *node.id();

        let mut expected = 1;
        for parent in node.parents() {
            let generation = unit
                .tables()
                .generation(dagnum, parent)
                .ok_or(DagError::SparseGraph {
                    node: id,
                    parent: *parent,
                })?;
            expected = expected.max(generation + 1);
        }
        if node.generation() != expected {
            return Err(DagError::GenerationMismatch {
                node: id,
                declared: node.generation(),
                expected,
            });
        }

        if !unit.insert_info(dagnum, id, node.generation()) {
            return Err(DagError::AlreadyExists(id));
        }
        if node.is_root() {
            unit.insert_edge(dagnum, id, ParentRef::FakeRoot);
        } else {
            for parent in node.parents() {
                unit.insert_edge(dagnum, id, ParentRef::Node(*parent));
                unit.remove_leaf(dagnum, *parent);
            }
        }
        unit.insert_leaf(dagnum, id);
        Ok(())
    }
}

impl GraphStore for TableGraphStore {
    fn store_node(&self, dagnum: DagNum, node: &Dagnode) -> DagResult<()> {
        let deadline = Instant::now() + self.config.busy_timeout();
        let mut guard = self.acquire(deadline, || self.replica.try_write())?;
        let replica = &mut *guard;
        let lock = match &self.log {
            Some(log) => {
                let lock = wait_until(&self.config, deadline, || log.try_lock(true))?;
                Self::catch_up_for_write(replica, log, &lock)?;
                Some(lock)
            }
            None => None,
        };
        if replica.tables.contains(dagnum, node.id()) {
            return Err(DagError::AlreadyExists(*node.id()));
        }

        let mut unit = Unit::begin(&mut replica.tables);
        if let Err(e) = Self::apply_store_node(&mut unit, dagnum, node) {
            unit.rollback();
            return Err(e);
        }
        if let (Some(log), Some(lock)) = (&self.log, &lock) {
            let record = LogRecord {
                dagnum,
                node: node.clone(),
            };
            match log.append(lock, replica.log_end, &record, self.config.sync_on_commit) {
                Ok(end) => replica.log_end = end,
                Err(e) => {
                    unit.rollback();
                    if let Err(cut) = log.truncate(lock, replica.log_end) {
                        warn!(error = %cut, "could not drop partially appended record");
                    }
                    return Err(e);
                }
            }
        }
        unit.commit();

        debug!(
            dagnum = %dagnum,
            node = %node.id().short_hex(),
            generation = node.generation(),
            parents = node.parents().len(),
            "stored dagnode"
        );
        Ok(())
    }

    fn fetch_node(&self, dagnum: DagNum, id: &ContentHash) -> DagResult<Dagnode> {
        let replica = self.read_replica()?;
        let tables = &replica.tables;
        let generation = tables
            .generation(dagnum, id)
            .ok_or(DagError::NotFound(*id))?;

        let mut parents = BTreeSet::new();
        let mut fake_root = false;
        for parent in tables.parent_refs(dagnum, id) {
            match parent {
                ParentRef::FakeRoot => fake_root = true,
                ParentRef::Node(p) => {
                    parents.insert(p);
                }
            }
        }
        if fake_root && !parents.is_empty() {
            return Err(DagError::GraphNotConsistent(format!(
                "root node {id} also has {} parent edge(s)",
                parents.len()
            )));
        }
        if !fake_root && parents.is_empty() {
            return Err(DagError::GraphNotConsistent(format!(
                "node {id} has no edge rows"
            )));
        }
        Ok(Dagnode::new(*id, generation, parents))
    }

    fn contains(&self, dagnum: DagNum, id: &ContentHash) -> DagResult<bool> {
        Ok(self.read_replica()?.tables.contains(dagnum, id))
    }

    fn missing(&self, dagnum: DagNum, ids: &BTreeSet<ContentHash>) -> DagResult<BTreeSet<ContentHash>> {
        let replica = self.read_replica()?;
        let tables = &replica.tables;
        Ok(ids
            .iter()
            .filter(|id| !tables.contains(dagnum, id))
            .copied()
            .collect())
    }

    fn fetch_leaves(&self, dagnum: DagNum) -> DagResult<BTreeSet<ContentHash>> {
        Ok(self.read_replica()?.tables.leaves(dagnum).collect())
    }

    fn fetch_children(&self, dagnum: DagNum, id: &ContentHash) -> DagResult<BTreeSet<ContentHash>> {
        let replica = self.read_replica()?;
        let tables = &replica.tables;
        if !tables.contains(dagnum, id) {
            return Err(DagError::NotFound(*id));
        }
        Ok(tables.children(dagnum, id).collect())
    }

    fn find_by_prefix(&self, dagnum: DagNum, prefix: &str) -> DagResult<BTreeSet<ContentHash>> {
        let prefix = prefix.to_ascii_lowercase();
        Ok(self
            .read_replica()?
            .tables
            .nodes(dagnum)
            .map(|(id, _)| id)
            .filter(|id| id.has_hex_prefix(&prefix))
            .collect())
    }

    fn list_namespaces(&self) -> DagResult<BTreeSet<DagNum>> {
        Ok(self.read_replica()?.tables.namespaces())
    }

    fn check_consistency(&self, dagnum: DagNum) -> DagResult<()> {
        let replica = self.read_replica()?;
        let tables = &replica.tables;

        let nodes: BTreeSet<ContentHash> = tables.nodes(dagnum).map(|(id, _)| id).collect();
        let mut referenced = BTreeSet::new();
        for (child, parent) in tables.edges(dagnum) {
            if !nodes.contains(&child) {
                return Err(DagError::GraphNotConsistent(format!(
                    "edge row for unknown child {child}"
                )));
            }
            if let ParentRef::Node(p) = parent {
                referenced.insert(p);
            }
        }

        if let Some(hole) = referenced.difference(&nodes).next() {
            return Err(DagError::GraphNotConsistent(format!(
                "referenced parent {hole} is not stored"
            )));
        }

        let expected: BTreeSet<ContentHash> = nodes.difference(&referenced).copied().collect();
        let stored: BTreeSet<ContentHash> = tables.leaves(dagnum).collect();
        if expected != stored {
            return Err(DagError::GraphNotConsistent(format!(
                "stored leaf set ({} ids) differs from recomputed leaf set ({} ids)",
                stored.len(),
                expected.len()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for TableGraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableGraphStore")
            .field("path", &self.log.as_ref().map(TableLog::path))
            .finish()
    }
}
