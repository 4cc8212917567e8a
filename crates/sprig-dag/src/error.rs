//! Error types for the commit graph.

use std::collections::BTreeSet;

use sprig_types::{ContentHash, Generation};

/// Errors that can occur during graph operations.
#[derive(Debug, thiserror::Error)]
pub enum DagError {
    /// No node with this id is stored in the namespace.
    #[error("node not found: {0}")]
    NotFound(ContentHash),

    /// The node is already stored. Expected whenever peers learn of the
    /// same commit independently; callers normally absorb it.
    #[error("node already exists: {0}")]
    AlreadyExists(ContentHash),

    /// A parent of the node being stored is unknown.
    #[error("sparse graph: node {node} references unknown parent {parent}")]
    SparseGraph {
        node: ContentHash,
        parent: ContentHash,
    },

    /// A fragment's boundary is not fully known locally.
    #[error("cannot create sparse graph: {} boundary node(s) missing", missing.len())]
    CannotCreateSparseGraph { missing: BTreeSet<ContentHash> },

    /// The declared generation of a node disagrees with its parents.
    #[error("generation mismatch for {node}: declared {declared}, parents imply {expected}")]
    GenerationMismatch {
        node: ContentHash,
        declared: Generation,
        expected: Generation,
    },

    /// The stored relations contradict each other. Indicates corruption or
    /// a bug, never an ordinary outcome.
    #[error("graph not consistent: {0}")]
    GraphNotConsistent(String),

    /// Fragment insertion stopped part-way. The absorbed nodes stay stored.
    #[error("fragment partially applied ({} node(s) absorbed): {source}", absorbed.len())]
    PartiallyApplied {
        absorbed: BTreeSet<ContentHash>,
        #[source]
        source: Box<DagError>,
    },

    /// No ancestry path leads from `from` back to `to`.
    #[error("no ancestry path from {from} to {to}")]
    AncestryGap { from: ContentHash, to: ContentHash },

    /// The store is locked by another writer. Retryable.
    #[error("graph store busy")]
    StoreBusy,

    /// The table file failed framing or checksum validation.
    #[error("corrupt table file: {0}")]
    CorruptTableFile(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Storage I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DagError {
    /// Whether the failed operation may succeed if simply retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreBusy)
    }
}

/// Convenience alias for graph results.
pub type DagResult<T> = Result<T, DagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_busy_is_retryable() {
        assert!(DagError::StoreBusy.is_retryable());
        assert!(!DagError::NotFound(ContentHash::of(b"x")).is_retryable());
        assert!(!DagError::GraphNotConsistent("x".into()).is_retryable());
    }

    #[test]
    fn cannot_create_sparse_graph_reports_count() {
        let missing: BTreeSet<_> = [ContentHash::of(b"a"), ContentHash::of(b"b")].into();
        let err = DagError::CannotCreateSparseGraph { missing };
        assert!(err.to_string().contains("2 boundary node(s)"));
    }
}
