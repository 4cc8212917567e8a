//! High-level API for sprig repositories.
//!
//! [`Repository`] ties a graph store and a content store together and is
//! the main entry point for applications embedding sprig: build a
//! [`ChangesetBuilder`], [`commit`](Repository::commit) it, query the graph,
//! and exchange [`Fragment`]s with peers.

pub mod config;
pub mod error;
pub mod repository;

pub use config::RepoConfig;
pub use error::{SdkError, SdkResult};
pub use repository::{FsckReport, Repository};

// Re-export key types
pub use sprig_changeset::{Changeset, ChangesetBuilder, FrozenChangeset, Reftype};
pub use sprig_dag::{Dagnode, Fragment, FragmentReport, GraphStoreConfig, RetryPolicy};
pub use sprig_store::ContentStoreConfig;
pub use sprig_types::{ContentHash, DagKind, DagNum, Generation};
