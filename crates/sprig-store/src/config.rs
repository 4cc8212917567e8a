use serde::{Deserialize, Serialize};

/// Configuration for on-disk content stores.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentStoreConfig {
    /// zstd level used for loose objects. `0` selects zstd's default.
    pub compression_level: i32,
}

impl Default for ContentStoreConfig {
    fn default() -> Self {
        Self {
            compression_level: 3,
        }
    }
}
