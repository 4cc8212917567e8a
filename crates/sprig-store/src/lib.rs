//! Content-addressed blob storage for sprig.
//!
//! Every changeset and every blob a changeset references lives in a
//! [`ContentStore`], keyed by the [`ContentHash`] of its bytes. The store
//! never interprets what it holds.
//!
//! # Backends
//!
//! - [`InMemoryContentStore`] -- `HashMap`-based store for tests and embedding
//! - [`FsContentStore`] -- loose zstd-compressed objects under a directory
//!
//! # Rules
//!
//! 1. Objects are immutable once written.
//! 2. Writing bytes that are already present is reported as
//!    [`StoreError::AlreadyExists`], distinct from every other failure.
//! 3. Reads verify the hash of what comes back.
//!
//! [`ContentHash`]: sprig_types::ContentHash

pub mod config;
pub mod error;
pub mod fs;
pub mod memory;
pub mod traits;

pub use config::ContentStoreConfig;
pub use error::{StoreError, StoreResult};
pub use fs::FsContentStore;
pub use memory::InMemoryContentStore;
pub use traits::ContentStore;
