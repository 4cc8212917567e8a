//! Foundation types for sprig.
//!
//! Every other sprig crate depends on `sprig-types`.
//!
//! # Key Types
//!
//! - [`ContentHash`] -- content-addressed identifier (BLAKE3), rendered as lowercase hex
//! - [`DagNum`] -- identifies one independent DAG namespace and its kind
//! - [`Generation`] -- distance from the farthest root, roots are generation 1

pub mod dagnum;
pub mod error;
pub mod hash;

pub use dagnum::{DagKind, DagNum};
pub use error::TypeError;
pub use hash::ContentHash;

/// Generation number of a DAG node.
pub type Generation = i32;
