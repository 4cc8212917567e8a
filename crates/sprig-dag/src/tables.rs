//! The three graph relations and their on-disk framing.
//!
//! ```text
//! edges(dagnum, child_id, parent_id)   primary key, also the child index
//! edges_by_parent(dagnum, parent_id, child_id)   secondary index
//! leaves(dagnum, child_id)
//! info(dagnum, child_id) -> generation
//! ```
//!
//! Mutations go through a [`Unit`], which records an undo log so a failed
//! node insertion (or a failed append) leaves the relations untouched.
//! On disk only the stored nodes are kept, one [`LogRecord`] each, and the
//! relations are rebuilt by replaying them.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use sprig_types::{ContentHash, DagNum, Generation};

use crate::error::{DagError, DagResult};
use crate::node::Dagnode;

pub(crate) const MIN_HASH: ContentHash = ContentHash::from_hash([0x00; 32]);
pub(crate) const MAX_HASH: ContentHash = ContentHash::from_hash([0xff; 32]);

/// Parent column of an edge row. `FakeRoot` is the sentinel recorded for
/// parentless nodes so that no edge row lacks a parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum ParentRef {
    FakeRoot,
    Node(ContentHash),
}

#[derive(Clone, Debug, Default)]
pub(crate) struct GraphTables {
    edges: BTreeSet<(DagNum, ContentHash, ParentRef)>,
    edges_by_parent: BTreeSet<(DagNum, ParentRef, ContentHash)>,
    leaves: BTreeSet<(DagNum, ContentHash)>,
    info: BTreeMap<(DagNum, ContentHash), Generation>,
}

impl GraphTables {
    pub(crate) fn generation(&self, dagnum: DagNum, id: &ContentHash) -> Option<Generation> {
        self.info.get(&(dagnum, *id)).copied()
    }

    pub(crate) fn contains(&self, dagnum: DagNum, id: &ContentHash) -> bool {
        self.info.contains_key(&(dagnum, *id))
    }

    /// Edge rows with `child` as the child, in parent order (sentinel first).
    pub(crate) fn parent_refs(
        &self,
        dagnum: DagNum,
        child: &ContentHash,
    ) -> impl Iterator<Item = ParentRef> + '_ {
        self.edges
            .range((dagnum, *child, ParentRef::FakeRoot)..=(dagnum, *child, ParentRef::Node(MAX_HASH)))
            .map(|&(_, _, parent)| parent)
    }

    pub(crate) fn children(
        &self,
        dagnum: DagNum,
        parent: &ContentHash,
    ) -> impl Iterator<Item = ContentHash> + '_ {
        let parent = ParentRef::Node(*parent);
        self.edges_by_parent
            .range((dagnum, parent, MIN_HASH)..=(dagnum, parent, MAX_HASH))
            .map(|&(_, _, child)| child)
    }

    pub(crate) fn leaves(&self, dagnum: DagNum) -> impl Iterator<Item = ContentHash> + '_ {
        self.leaves
            .range((dagnum, MIN_HASH)..=(dagnum, MAX_HASH))
            .map(|&(_, id)| id)
    }

    pub(crate) fn nodes(
        &self,
        dagnum: DagNum,
    ) -> impl Iterator<Item = (ContentHash, Generation)> + '_ {
        self.info
            .range((dagnum, MIN_HASH)..=(dagnum, MAX_HASH))
            .map(|(&(_, id), &generation)| (id, generation))
    }

    /// Every edge row of the namespace as `(child, parent)`.
    pub(crate) fn edges(
        &self,
        dagnum: DagNum,
    ) -> impl Iterator<Item = (ContentHash, ParentRef)> + '_ {
        self.edges
            .range((dagnum, MIN_HASH, ParentRef::FakeRoot)..=(dagnum, MAX_HASH, ParentRef::Node(MAX_HASH)))
            .map(|&(_, child, parent)| (child, parent))
    }

    pub(crate) fn namespaces(&self) -> BTreeSet<DagNum> {
        self.info.keys().map(|&(dagnum, _)| dagnum).collect()
    }
}

enum RowOp {
    InfoInserted(DagNum, ContentHash),
    EdgeInserted(DagNum, ContentHash, ParentRef),
    LeafInserted(DagNum, ContentHash),
    LeafRemoved(DagNum, ContentHash),
}

/// One atomic set of row mutations.
///
/// Dropping a unit without calling [`Unit::commit`] keeps its mutations;
/// callers roll back explicitly on every failure path.
pub(crate) struct Unit<'a> {
    tables: &'a mut GraphTables,
    undo: Vec<RowOp>,
}

impl<'a> Unit<'a> {
    pub(crate) fn begin(tables: &'a mut GraphTables) -> Self {
        Self {
            tables,
            undo: Vec::new(),
        }
    }

    pub(crate) fn tables(&self) -> &GraphTables {
        self.tables
    }

    /// Insert an info row. Returns `false` if the row already existed.
    pub(crate) fn insert_info(
        &mut self,
        dagnum: DagNum,
        id: ContentHash,
        generation: Generation,
    ) -> bool {
        if self.tables.info.contains_key(&(dagnum, id)) {
            return false;
        }
        self.tables.info.insert((dagnum, id), generation);
        self.undo.push(RowOp::InfoInserted(dagnum, id));
        true
    }

    pub(crate) fn insert_edge(&mut self, dagnum: DagNum, child: ContentHash, parent: ParentRef) {
        if self.tables.edges.insert((dagnum, child, parent)) {
            self.tables.edges_by_parent.insert((dagnum, parent, child));
            self.undo.push(RowOp::EdgeInserted(dagnum, child, parent));
        }
    }

    pub(crate) fn insert_leaf(&mut self, dagnum: DagNum, id: ContentHash) {
        if self.tables.leaves.insert((dagnum, id)) {
            self.undo.push(RowOp::LeafInserted(dagnum, id));
        }
    }

    pub(crate) fn remove_leaf(&mut self, dagnum: DagNum, id: ContentHash) {
        if self.tables.leaves.remove(&(dagnum, id)) {
            self.undo.push(RowOp::LeafRemoved(dagnum, id));
        }
    }

    pub(crate) fn commit(self) {}

    pub(crate) fn rollback(self) {
        for op in self.undo.into_iter().rev() {
            match op {
                RowOp::InfoInserted(dagnum, id) => {
                    self.tables.info.remove(&(dagnum, id));
                }
                RowOp::EdgeInserted(dagnum, child, parent) => {
                    self.tables.edges.remove(&(dagnum, child, parent));
                    self.tables.edges_by_parent.remove(&(dagnum, parent, child));
                }
                RowOp::LeafInserted(dagnum, id) => {
                    self.tables.leaves.remove(&(dagnum, id));
                }
                RowOp::LeafRemoved(dagnum, id) => {
                    self.tables.leaves.insert((dagnum, id));
                }
            }
        }
    }
}

/// One stored node, as appended to the log.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LogRecord {
    pub dagnum: DagNum,
    pub node: Dagnode,
}

/// Records read from the log past some offset.
#[derive(Debug, Default)]
pub(crate) struct LogTail {
    pub records: Vec<LogRecord>,
    /// Offset just past the last complete record.
    pub end: u64,
    /// Bytes after `end` that do not form a complete record.
    pub torn: bool,
}

/// Advisory lock on the log file. Released on drop.
pub(crate) struct LogLock {
    file: File,
}

/// Append-only node log.
///
/// ```text
/// [8 bytes: magic "SPRIGDAG"]
/// [4 bytes: format version (little-endian u32)]
/// then, once per stored node:
/// [4 bytes: record length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized LogRecord)]
/// ```
///
/// Writers hold the exclusive lock while they catch up and append; readers
/// catching up hold the shared lock. A record cut short by a crash is a torn
/// tail: readers stop in front of it and the next writer truncates it.
pub(crate) struct TableLog {
    path: PathBuf,
}

const MAGIC: &[u8; 8] = b"SPRIGDAG";
const FORMAT_VERSION: u32 = 2;
const FILE_HEADER_SIZE: u64 = 8 + 4;
const RECORD_HEADER_SIZE: usize = 4 + 4;

impl TableLog {
    /// Attach to the log at `path`, creating an empty file if needed.
    pub(crate) fn open(path: &Path) -> DagResult<Self> {
        OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn len(&self) -> DagResult<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Try to take the lock without waiting. `None` means another handle
    /// holds a conflicting lock.
    pub(crate) fn try_lock(&self, exclusive: bool) -> DagResult<Option<LogLock>> {
        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        let attempt = if exclusive {
            FileExt::try_lock_exclusive(&file)
        } else {
            FileExt::try_lock_shared(&file)
        };
        match attempt {
            Ok(()) => Ok(Some(LogLock { file })),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the file header into a log that has none yet.
    pub(crate) fn init(&self, lock: &LogLock, sync: bool) -> DagResult<()> {
        if lock.file.metadata()?.len() > 0 {
            return Ok(());
        }
        let mut file = &lock.file;
        file.write_all(MAGIC)?;
        file.write_all(&FORMAT_VERSION.to_le_bytes())?;
        if sync {
            lock.file.sync_all()?;
        }
        Ok(())
    }

    /// Read every complete record starting at `offset`. Offset `0` checks
    /// the file header first.
    pub(crate) fn read_from(&self, lock: &LogLock, offset: u64) -> DagResult<LogTail> {
        let mut file = &lock.file;
        let offset = if offset == 0 {
            let mut header = [0u8; FILE_HEADER_SIZE as usize];
            file.seek(SeekFrom::Start(0))?;
            match file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(DagError::CorruptTableFile("missing file header".into()));
                }
                Err(e) => return Err(e.into()),
            }
            if &header[..8] != MAGIC {
                return Err(DagError::CorruptTableFile("bad magic".into()));
            }
            let version = u32::from_le_bytes(slice_array(&header[8..12]));
            if version != FORMAT_VERSION {
                return Err(DagError::CorruptTableFile(format!(
                    "unsupported format version {version}"
                )));
            }
            FILE_HEADER_SIZE
        } else {
            offset
        };

        let mut bytes = Vec::new();
        file.seek(SeekFrom::Start(offset))?;
        file.read_to_end(&mut bytes)?;

        let mut tail = LogTail::default();
        let mut pos = 0usize;
        while bytes.len() - pos >= RECORD_HEADER_SIZE {
            let len = u32::from_le_bytes(slice_array(&bytes[pos..pos + 4])) as usize;
            let crc = u32::from_le_bytes(slice_array(&bytes[pos + 4..pos + 8]));
            let start = pos + RECORD_HEADER_SIZE;
            let Some(payload) = bytes.get(start..start + len).filter(|_| len > 0) else {
                break;
            };
            if crc32fast::hash(payload) != crc {
                if start + len == bytes.len() {
                    break;
                }
                return Err(DagError::CorruptTableFile(format!(
                    "checksum mismatch in record at offset {}",
                    offset + pos as u64
                )));
            }
            let record: LogRecord = bincode::deserialize(payload).map_err(|e| {
                DagError::CorruptTableFile(format!(
                    "undecodable record at offset {}: {e}",
                    offset + pos as u64
                ))
            })?;
            tail.records.push(record);
            pos = start + len;
        }
        tail.end = offset + pos as u64;
        tail.torn = pos < bytes.len();
        Ok(tail)
    }

    /// Append one record. The log must end at `at`; returns the new end.
    pub(crate) fn append(
        &self,
        lock: &LogLock,
        at: u64,
        record: &LogRecord,
        sync: bool,
    ) -> DagResult<u64> {
        let payload =
            bincode::serialize(record).map_err(|e| DagError::Serialization(e.to_string()))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| DagError::Serialization(format!("record of {} bytes", payload.len())))?;

        let mut frame = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        let mut file = &lock.file;
        file.write_all(&frame)?;
        if sync {
            lock.file.sync_data()?;
        }
        Ok(at + frame.len() as u64)
    }

    /// Cut the log back to `len` bytes.
    pub(crate) fn truncate(&self, lock: &LogLock, len: u64) -> DagResult<()> {
        lock.file.set_len(len)?;
        Ok(())
    }
}
fn slice_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut arr = [0u8; N];
    arr.copy_from_slice(bytes);
    arr
}
