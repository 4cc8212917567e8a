use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of history a DAG namespace holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DagKind {
    /// File-tree version control history. Changesets may carry treepaths.
    VersionControl,
    /// Record database history (work items and similar). No treepaths.
    Database,
}

/// Identifier of one independent DAG namespace.
///
/// The low 32 bits hold the namespace id, bit 32 flags database namespaces.
/// The full value is what appears under `dagnum` in a serialized changeset,
/// so the layout is part of the content-hash contract.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DagNum(u64);

impl DagNum {
    const DB_FLAG: u64 = 1 << 32;
    const ID_MASK: u64 = 0xffff_ffff;

    /// The repository's file-tree history.
    pub const VERSION_CONTROL: Self = Self::new(1, DagKind::VersionControl);
    /// The repository's work-item database.
    pub const WORK_ITEMS: Self = Self::new(2, DagKind::Database);

    pub const fn new(id: u32, kind: DagKind) -> Self {
        match kind {
            DagKind::VersionControl => Self(id as u64),
            DagKind::Database => Self(id as u64 | Self::DB_FLAG),
        }
    }

    /// Rebuild from the raw serialized value.
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn id(&self) -> u32 {
        (self.0 & Self::ID_MASK) as u32
    }

    pub const fn kind(&self) -> DagKind {
        if self.is_db() {
            DagKind::Database
        } else {
            DagKind::VersionControl
        }
    }

    pub const fn is_db(&self) -> bool {
        self.0 & Self::DB_FLAG != 0
    }
}

impl fmt::Debug for DagNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DagNum({:016x})", self.0)
    }
}

impl fmt::Display for DagNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
