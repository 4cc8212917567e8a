use std::fmt;

/// Classification of a blob reference carried by a changeset.
///
/// Each reftype owns one independent list in the changeset and one fixed
/// key under `blobs` in the canonical form. The mapping is extend-only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reftype {
    TreeNode,
    TreeUserFile,
    TreeSymlink,
    TreeAttribs,
    DbInfo,
    DbRecord,
    DbUserFile,
    DbTemplate,
}

impl Reftype {
    pub const ALL: [Reftype; 8] = [
        Reftype::TreeNode,
        Reftype::TreeUserFile,
        Reftype::TreeSymlink,
        Reftype::TreeAttribs,
        Reftype::DbInfo,
        Reftype::DbRecord,
        Reftype::DbUserFile,
        Reftype::DbTemplate,
    ];

    /// Serialization key under `blobs`.
    pub const fn key(&self) -> &'static str {
        match self {
            Reftype::TreeNode => "treenode",
            Reftype::TreeUserFile => "treeuserfile",
            Reftype::TreeSymlink => "treesymlink",
            Reftype::TreeAttribs => "treeattribs",
            Reftype::DbInfo => "dbinfo",
            Reftype::DbRecord => "dbrecord",
            Reftype::DbUserFile => "dbuserfile",
            Reftype::DbTemplate => "dbtemplate",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.key() == key)
    }

    /// User files may legitimately be empty; every other blob has content.
    pub const fn allows_empty(&self) -> bool {
        matches!(self, Reftype::TreeUserFile | Reftype::DbUserFile)
    }
}

impl fmt::Display for Reftype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}
