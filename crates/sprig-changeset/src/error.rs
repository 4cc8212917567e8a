use sprig_dag::DagError;
use sprig_store::StoreError;
use sprig_types::{ContentHash, DagNum};

use crate::reftype::Reftype;

/// Errors from building, freezing and loading changesets.
#[derive(Debug, thiserror::Error)]
pub enum ChangesetError {
    /// A mutator was called on a frozen changeset.
    #[error("changeset is frozen")]
    InvalidWhileFrozen,

    /// A frozen-only accessor was called while still constructing.
    #[error("changeset is not frozen")]
    InvalidUnlessFrozen,

    /// `set_root` may only be called once.
    #[error("changeset root already set")]
    RootAlreadySet,

    /// Database namespaces carry no treepaths.
    #[error("treepaths are not allowed in database namespace {0}")]
    TreepathsOnDatabase(DagNum),

    #[error("blob {hash} in {reftype} list has zero length")]
    ZeroLengthBlob { hash: ContentHash, reftype: Reftype },

    #[error("unsupported changeset format version {0}")]
    UnsupportedVersion(u32),

    /// A stored changeset failed validation. The reason is logged, not
    /// returned.
    #[error("changeset validation failed")]
    ChangesetValidationFailed,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("graph error: {0}")]
    Dag(#[from] DagError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type ChangesetResult<T> = Result<T, ChangesetError>;
