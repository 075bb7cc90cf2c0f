use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use lazyjoin_types::JoinPolicy;

/// Trampoline configuration, usually read from a `[join]` TOML table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LazyConfig {
    #[serde(default)]
    pub join: JoinConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinConfig {
    /// How the combined wait reports failed handles. Default: `first_error`.
    #[serde(default)]
    pub policy: JoinPolicy,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

impl LazyConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        load_toml(path)
    }
}

/// Read `path` as TOML into `C`.
///
/// Shared by [`LazyConfig::load`] and by applications that embed the `[join]`
/// table in a larger config file.
pub fn load_toml<C: DeserializeOwned>(path: &Path) -> Result<C, ConfigError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            tracing::warn!("Failed to read config at {:?}: {}", path, err);
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: err,
            });
        }
    };

    match toml::from_str(&content) {
        Ok(config) => Ok(config),
        Err(err) => {
            tracing::warn!("Failed to parse config at {:?}: {}", path, err);
            Err(ConfigError::Parse {
                path: path.to_path_buf(),
                source: err,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_empty_config() {
        let config = LazyConfig::from_toml_str("").unwrap();
        assert_eq!(config.join.policy, JoinPolicy::FirstError);
    }

    #[test]
    fn parse_join_policy() {
        let toml_str = r#"
[join]
policy = "collect_all"
"#;
        let config = LazyConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.join.policy, JoinPolicy::CollectAll);
    }

    #[test]
    fn parse_ignores_unrelated_tables() {
        let toml_str = r#"
[demo]
latency_ms = 5

[join]
"#;
        let config = LazyConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.join.policy, JoinPolicy::FirstError);
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[join]\npolicy = \"collect_all\"").unwrap();
        let config = LazyConfig::load(file.path()).unwrap();
        assert_eq!(config.join.policy, JoinPolicy::CollectAll);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let err = LazyConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert_eq!(err.path(), path.as_path());
    }

    #[test]
    fn load_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[join]\npolicy = \"sometimes\"").unwrap();
        let err = LazyConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[derive(Debug, Deserialize)]
    struct AppConfig {
        #[serde(flatten)]
        lazy: LazyConfig,
        name: String,
    }

    #[test]
    fn load_toml_embeds_join_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "name = \"demo\"\n\n[join]\npolicy = \"collect_all\"").unwrap();
        let config: AppConfig = load_toml(file.path()).unwrap();
        assert_eq!(config.name, "demo");
        assert_eq!(config.lazy.join.policy, JoinPolicy::CollectAll);
    }
}
