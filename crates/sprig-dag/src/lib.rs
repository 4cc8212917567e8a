//! Commit graph storage for sprig.
//!
//! Stores one append-only, content-addressed DAG per namespace ([`DagNum`]).
//! Every node is a [`Dagnode`]: an id, a generation and a set of parent ids.
//! The store keeps three relations per namespace (edges, leaves, per-node
//! info) and refuses any insertion that would leave a hole in the graph.
//!
//! On top of the store this crate provides common-ancestor queries
//! ([`GraphLca`]) and the insertion protocol for sub-graphs received from
//! peers ([`Fragment`]).
//!
//! # Invariants
//!
//! - Every parent of a stored node is itself stored (no sparse graph).
//! - `generation(n) == 1 + max(generation(p))`, or `1` for roots.
//! - The leaf set is exactly the set of nodes nothing names as a parent.
//!
//! [`DagNum`]: sprig_types::DagNum

pub mod config;
pub mod error;
pub mod fragment;
pub mod lca;
pub mod node;
pub mod store;
mod tables;

pub use config::{GraphStoreConfig, RetryPolicy};
pub use error::{DagError, DagResult};
pub use fragment::{Connectivity, Fragment, FragmentReport};
pub use lca::{GraphLca, LcaSolver};
pub use node::Dagnode;
pub use store::{GraphStore, TableGraphStore};
