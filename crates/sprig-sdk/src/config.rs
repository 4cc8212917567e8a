use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use sprig_dag::{GraphStoreConfig, RetryPolicy};
use sprig_store::ContentStoreConfig;

use crate::error::{SdkError, SdkResult};

/// Repository configuration, usually read from `config.toml` in the
/// repository directory.
///
/// ```toml
/// [graph]
/// busy_timeout_ms = 2000
///
/// [content]
/// compression_level = 9
///
/// [retry]
/// max_attempts = 8
/// ```
///
/// Every section and key is optional.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    pub graph: GraphStoreConfig,
    pub content: ContentStoreConfig,
    pub retry: RetryPolicy,
}

impl RepoConfig {
    pub fn from_toml_str(s: &str) -> SdkResult<Self> {
        toml::from_str(s).map_err(|e| SdkError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> SdkResult<String> {
        toml::to_string(self).map_err(|e| SdkError::Config(e.to_string()))
    }

    /// Read a config file.
    pub fn load(path: impl AsRef<Path>) -> SdkResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_default() {
        assert_eq!(RepoConfig::from_toml_str("").unwrap(), RepoConfig::default());
    }

    #[test]
    fn sections_override_independently() {
        let c = RepoConfig::from_toml_str(
            "[graph]\nbusy_timeout_ms = 250\n\n[retry]\nmax_attempts = 2\n",
        )
        .unwrap();
        assert_eq!(c.graph.busy_timeout_ms, 250);
        assert!(c.graph.sync_on_commit);
        assert_eq!(c.retry.max_attempts, 2);
        assert_eq!(c.content, ContentStoreConfig::default());
    }

    #[test]
    fn unparsable_config_is_a_config_error() {
        assert!(matches!(
            RepoConfig::from_toml_str("[graph\n"),
            Err(SdkError::Config(_))
        ));
    }

    #[test]
    fn toml_round_trip() {
        let mut c = RepoConfig::default();
        c.content.compression_level = 12;
        c.graph.sync_on_commit = false;
        let text = c.to_toml_string().unwrap();
        assert_eq!(RepoConfig::from_toml_str(&text).unwrap(), c);
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[content]\ncompression_level = 1\n").unwrap();
        assert_eq!(RepoConfig::load(&path).unwrap().content.compression_level, 1);
        assert!(matches!(
            RepoConfig::load(dir.path().join("absent.toml")),
            Err(SdkError::Io(_))
        ));
    }
}
