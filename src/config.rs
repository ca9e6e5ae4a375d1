use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("generate_column_lineage requires generate_lineage")]
    ColumnLineageWithoutLineage,
}

/// Aggregator configuration, loadable from a toml file.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    /// Data platform name baked into every urn (redshift, snowflake, ...).
    pub platform: String,
    #[serde(default = "default_env")]
    pub env: String,
    /// SQL dialect name understood by sqlparser's `dialect_from_str`.
    #[serde(default = "default_dialect")]
    pub dialect: String,
    /// Case-insensitive identifier handling: fold names before building urns.
    #[serde(default = "default_true")]
    pub lowercase_urns: bool,
    #[serde(default = "default_true")]
    pub generate_lineage: bool,
    #[serde(default = "default_true")]
    pub generate_column_lineage: bool,
    #[serde(default)]
    pub generate_usage_statistics: bool,
    #[serde(default)]
    pub generate_operations: bool,
    #[serde(default = "default_top_n")]
    pub usage_top_n_queries: usize,
    /// Directory for the durable query log; `None` disables it.
    #[serde(default)]
    pub query_log_dir: Option<PathBuf>,
}

fn default_env() -> String {
    "PROD".to_string()
}

fn default_dialect() -> String {
    "generic".to_string()
}

fn default_true() -> bool {
    true
}

fn default_top_n() -> usize {
    20
}

impl AggregatorConfig {
    pub fn new(platform: &str) -> Self {
        Self {
            platform: platform.to_string(),
            env: default_env(),
            dialect: default_dialect(),
            lowercase_urns: true,
            generate_lineage: true,
            generate_column_lineage: true,
            generate_usage_statistics: false,
            generate_operations: false,
            usage_top_n_queries: default_top_n(),
            query_log_dir: None,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generate_column_lineage && !self.generate_lineage {
            return Err(ConfigError::ColumnLineageWithoutLineage);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = AggregatorConfig::new("redshift");
        assert_eq!(config.env, "PROD");
        assert_eq!(config.dialect, "generic");
        assert!(config.generate_lineage);
        assert!(config.generate_column_lineage);
        assert!(!config.generate_usage_statistics);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_minimal_toml() -> Result<()> {
        let config: AggregatorConfig = toml::from_str(r#"platform = "snowflake""#)?;
        assert_eq!(config.platform, "snowflake");
        assert_eq!(config.usage_top_n_queries, 20);
        assert!(config.query_log_dir.is_none());
        Ok(())
    }

    #[test]
    fn test_column_lineage_requires_lineage() {
        let mut config = AggregatorConfig::new("redshift");
        config.generate_lineage = false;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ColumnLineageWithoutLineage)
        );
    }
}
