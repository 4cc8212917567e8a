//! Commit payloads for sprig.
//!
//! A changeset is the full content of one commit: root tree, parents,
//! referenced blobs per [`Reftype`] and, in version-control namespaces,
//! treepaths (stable object id to repository path). It is built with a
//! [`ChangesetBuilder`] and frozen into a [`FrozenChangeset`] whose id is
//! the content hash of its canonical JSON form.
//!
//! Freezing a merge normalizes it: entries that every parent's lineage
//! already implies are left out, entries reachable from only some parents
//! are carried.

pub mod builder;
pub mod changeset;
mod content;
pub mod error;
pub mod frozen;
mod normalize;
pub mod reftype;

pub use builder::ChangesetBuilder;
pub use changeset::Changeset;
pub use content::FORMAT_VERSION;
pub use error::{ChangesetError, ChangesetResult};
pub use frozen::FrozenChangeset;
pub use reftype::Reftype;
