//! Compiler configuration, loaded from TOML.
//!
//! ```toml
//! dialect = "sqlserver"
//! parameter_prefix = "@"
//! server_affinity = false
//!
//! [policy]
//! include = ["Customer.Orders"]
//!
//! [cache]
//! enabled = true
//! ```

use crate::dialect::{dialect_by_name, DialectRef};
use crate::error::ConfigError;
use crate::policy::QueryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Dialect name: `sqlserver` or `sqlite`
    #[serde(default = "default_dialect")]
    pub dialect: String,
    /// Overrides the dialect's parameter prefix
    #[serde(default)]
    pub parameter_prefix: Option<String>,
    /// Compute eligible expressions on the server rather than the client
    #[serde(default)]
    pub server_affinity: bool,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Relationships included with every query, as `Entity.Member` paths
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub include: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_dialect() -> String {
    "sqlserver".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            dialect: default_dialect(),
            parameter_prefix: None,
            server_affinity: false,
            policy: PolicyConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl CompilerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a config file; an empty file gives the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "loading compiler config");
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.dialect()?;
        self.policy()?;
        Ok(())
    }

    /// The configured dialect descriptor
    pub fn dialect(&self) -> Result<DialectRef, ConfigError> {
        let prefix = self.parameter_prefix.as_deref();
        dialect_by_name(&self.dialect, prefix).ok_or_else(|| ConfigError::Invalid {
            key: "dialect".to_string(),
            message: format!("unknown dialect '{}'", self.dialect),
        })
    }

    pub fn policy(&self) -> Result<QueryPolicy, ConfigError> {
        QueryPolicy::from_paths(&self.policy.include).map_err(|e| ConfigError::Invalid {
            key: "policy.include".to_string(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = CompilerConfig::default();
        assert_eq!(config.dialect, "sqlserver");
        assert!(config.cache.enabled);
        assert!(!config.server_affinity);
        assert_eq!(config.dialect().unwrap().name(), "sqlserver");
        assert!(config.policy().unwrap().is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let config = CompilerConfig::from_toml_str(
            r#"
            dialect = "sqlite"
            parameter_prefix = "$"
            server_affinity = true

            [policy]
            include = ["Customer.Orders", "Order.Customer"]

            [cache]
            enabled = false
            "#,
        )
        .unwrap();

        assert!(config.server_affinity);
        assert!(!config.cache.enabled);
        let dialect = config.dialect().unwrap();
        assert_eq!(dialect.name(), "sqlite");
        assert_eq!(dialect.parameter_placeholder("p0"), "$p0");
        let policy = config.policy().unwrap();
        assert!(policy.is_included("Customer", "Orders"));
        assert!(policy.is_included("Order", "Customer"));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config =
            CompilerConfig::from_toml_str("[policy]\ninclude = [\"Customer.Orders\"]\n").unwrap();
        assert_eq!(config.dialect, "sqlserver");
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = CompilerConfig::from_toml_str("dialect = \"oracle\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "dialect"));

        let err = CompilerConfig::from_toml_str("[policy]\ninclude = [\"Orders\"]").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "policy.include"));

        let err = CompilerConfig::from_toml_str("dialect = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "dialect = \"sqlite\"").unwrap();
        let config = CompilerConfig::load(file.path()).unwrap();
        assert_eq!(config.dialect, "sqlite");

        let empty = NamedTempFile::new().unwrap();
        assert_eq!(CompilerConfig::load(empty.path()).unwrap(), CompilerConfig::default());

        let err = CompilerConfig::load("/nonexistent/quarry.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = CompilerConfig {
            dialect: "sqlite".to_string(),
            ..Default::default()
        };
        let text = toml::to_string(&config).unwrap();
        assert_eq!(CompilerConfig::from_toml_str(&text).unwrap(), config);
    }
}
