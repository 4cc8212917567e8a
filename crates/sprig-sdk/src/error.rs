use std::collections::BTreeSet;

use thiserror::Error;

use sprig_types::ContentHash;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("invalid id prefix: {0:?}")]
    InvalidPrefix(String),

    #[error("no node matches prefix {0:?}")]
    PrefixNotFound(String),

    #[error("prefix {prefix:?} is ambiguous ({count} matches)")]
    AmbiguousPrefix { prefix: String, count: usize },

    #[error("{} fragment member(s) have no changeset in the content store", .0.len())]
    MissingChangesets(BTreeSet<ContentHash>),

    /// The changesets are present, but the graph nodes the peer sent for
    /// these members do not match them.
    #[error("{} fragment member(s) disagree with their changesets", .0.len())]
    MismatchedMembers(BTreeSet<ContentHash>),

    #[error("config error: {0}")]
    Config(String),

    #[error("changeset error: {0}")]
    Changeset(#[from] sprig_changeset::ChangesetError),

    #[error("graph error: {0}")]
    Dag(#[from] sprig_dag::DagError),

    #[error("store error: {0}")]
    Store(#[from] sprig_store::StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SdkResult<T> = Result<T, SdkError>;
