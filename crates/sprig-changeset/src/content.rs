//! Logical changeset content and its canonical JSON tree.
//!
//! The canonical form is a JSON object whose keys are sorted recursively.
//! Arrays are never reordered by the sort, so `parents` is emitted already
//! sorted. The bytes of this form are what the changeset id hashes.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use sprig_types::{ContentHash, DagNum, Generation};

use crate::reftype::Reftype;

/// Changeset format version written by this crate.
pub const FORMAT_VERSION: u32 = 1;

const KEY_VERSION: &str = "ver";
const KEY_DAGNUM: &str = "dagnum";
const KEY_GENERATION: &str = "generation";
const KEY_ROOT: &str = "root";
const KEY_PARENTS: &str = "parents";
const KEY_BLOBS: &str = "blobs";
const KEY_TREEPATHS: &str = "treepaths";

const KNOWN_KEYS: [&str; 7] = [
    KEY_VERSION,
    KEY_DAGNUM,
    KEY_GENERATION,
    KEY_ROOT,
    KEY_PARENTS,
    KEY_BLOBS,
    KEY_TREEPATHS,
];

/// Typed view of one changeset.
///
/// `parents` and `treepaths` are `None` rather than empty when there is
/// nothing to carry, matching their absence from the canonical form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ChangesetContent {
    pub version: u32,
    pub dagnum: DagNum,
    pub generation: Generation,
    pub root: Option<ContentHash>,
    pub parents: Option<BTreeSet<ContentHash>>,
    pub blobs: BTreeMap<Reftype, BTreeMap<ContentHash, u64>>,
    pub treepaths: Option<BTreeMap<String, String>>,
}

impl ChangesetContent {
    /// Build the canonical tree.
    pub fn to_tree(&self) -> Value {
        let mut obj = Map::new();
        obj.insert(KEY_VERSION.into(), Value::from(self.version));
        obj.insert(KEY_DAGNUM.into(), Value::from(self.dagnum.as_u64()));
        obj.insert(KEY_GENERATION.into(), Value::from(self.generation));
        if let Some(root) = &self.root {
            obj.insert(KEY_ROOT.into(), Value::String(root.to_hex()));
        }
        if let Some(parents) = self.parents.as_ref().filter(|p| !p.is_empty()) {
            let sorted = parents.iter().map(|p| Value::String(p.to_hex())).collect();
            obj.insert(KEY_PARENTS.into(), Value::Array(sorted));
        }

        let blobs: Map<String, Value> = self
            .blobs
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(reftype, list)| {
                let sub = list
                    .iter()
                    .map(|(hash, len)| (hash.to_hex(), Value::from(*len)))
                    .collect();
                (reftype.key().to_string(), Value::Object(sub))
            })
            .collect();
        if !blobs.is_empty() {
            obj.insert(KEY_BLOBS.into(), Value::Object(blobs));
        }

        if !self.dagnum.is_db() {
            if let Some(paths) = self.treepaths.as_ref().filter(|t| !t.is_empty()) {
                let sub = paths
                    .iter()
                    .map(|(id, path)| (id.clone(), Value::String(path.clone())))
                    .collect();
                obj.insert(KEY_TREEPATHS.into(), Value::Object(sub));
            }
        }

        sort_keys(Value::Object(obj))
    }

    /// Validate and read a tree. The error is a human-readable reason for
    /// the log; callers collapse it to one validation error.
    pub fn from_tree(tree: &Value) -> Result<Self, String> {
        let obj = tree.as_object().ok_or("changeset is not an object")?;
        if let Some(key) = obj.keys().find(|k| !KNOWN_KEYS.contains(&k.as_str())) {
            return Err(format!("unknown key {key:?}"));
        }

        let version = obj
            .get(KEY_VERSION)
            .and_then(Value::as_u64)
            .ok_or("missing or non-integer ver")?;
        if version != u64::from(FORMAT_VERSION) {
            return Err(format!("unsupported version {version}"));
        }

        let dagnum = obj
            .get(KEY_DAGNUM)
            .and_then(Value::as_u64)
            .map(DagNum::from_u64)
            .ok_or("missing or non-integer dagnum")?;

        let generation = obj
            .get(KEY_GENERATION)
            .and_then(Value::as_i64)
            .ok_or("missing or non-integer generation")?;
        let generation = Generation::try_from(generation)
            .ok()
            .filter(|g| *g > 0)
            .ok_or_else(|| format!("generation {generation} out of range"))?;

        let root = obj.get(KEY_ROOT).map(parse_hash).transpose()?;

        let parents = match obj.get(KEY_PARENTS) {
            None => None,
            Some(value) => {
                let items = value.as_array().ok_or("parents is not an array")?;
                let set = items
                    .iter()
                    .map(parse_hash)
                    .collect::<Result<BTreeSet<_>, _>>()?;
                if set.is_empty() || set.len() != items.len() {
                    return Err("parents empty or duplicated".into());
                }
                Some(set)
            }
        };

        let mut blobs = BTreeMap::new();
        if let Some(value) = obj.get(KEY_BLOBS) {
            let lists = value.as_object().ok_or("blobs is not an object")?;
            for (key, list) in lists {
                let reftype =
                    Reftype::from_key(key).ok_or_else(|| format!("unknown reftype {key:?}"))?;
                let entries = list
                    .as_object()
                    .ok_or_else(|| format!("{key} list is not an object"))?;
                let mut parsed = BTreeMap::new();
                for (hash, len) in entries {
                    let hash: ContentHash = hash.parse().map_err(|e| format!("{e}"))?;
                    let len = len
                        .as_u64()
                        .ok_or_else(|| format!("length of {hash} is not an integer"))?;
                    if len == 0 && !reftype.allows_empty() {
                        return Err(format!("zero-length {reftype} blob {hash}"));
                    }
                    parsed.insert(hash, len);
                }
                blobs.insert(reftype, parsed);
            }
        }

        let treepaths = match obj.get(KEY_TREEPATHS) {
            None => None,
            Some(_) if dagnum.is_db() => {
                return Err("treepaths in a database namespace".into());
            }
            Some(value) => {
                let entries = value.as_object().ok_or("treepaths is not an object")?;
                let mut parsed = BTreeMap::new();
                for (id, path) in entries {
                    let path = path
                        .as_str()
                        .ok_or_else(|| format!("treepath for {id:?} is not a string"))?;
                    parsed.insert(id.clone(), path.to_string());
                }
                Some(parsed)
            }
        };

        Ok(Self {
            version: FORMAT_VERSION,
            dagnum,
            generation,
            root,
            parents,
            blobs,
            treepaths,
        })
    }
}

fn parse_hash(value: &Value) -> Result<ContentHash, String> {
    value
        .as_str()
        .ok_or("hash is not a string")?
        .parse()
        .map_err(|e| format!("{e}"))
}

/// Recursively sort object keys. Array element order is preserved.
///
/// `serde_json::Map` is already sorted unless some crate in the build turns
/// on `preserve_order`; the explicit sort keeps the output stable either way.
pub(crate) fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Serialize a canonical tree to the bytes that get hashed.
pub(crate) fn canonical_bytes(tree: &Value) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(tree)
}
