use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

use crate::session::PLACEHOLDER_NAME;

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ViewerConfig {
    /// Output pixels per page point.
    pub density: f32,
    /// How long a slot may show the loading placeholder before it is marked
    /// as timed out. No limit when unset.
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(rename = "render_timeout_ms")]
    pub render_timeout: Option<Duration>,
    pub coalesce_requests: bool,
    pub placeholder_name: String,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            density: 1.0,
            render_timeout: None,
            coalesce_requests: true,
            placeholder_name: PLACEHOLDER_NAME.to_owned(),
        }
    }
}

impl ViewerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("failed to parse viewer config")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path`, falling back to the defaults when the file does not
    /// exist.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw)
                .with_context(|| format!("invalid config file {:?}", path)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read config file {:?}", path))
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.density.is_finite() || self.density <= 0.0 {
            bail!("density must be a positive number, got {}", self.density);
        }
        if self.placeholder_name.trim().is_empty() {
            bail!("placeholder_name must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_config_uses_defaults() {
        assert_eq!(ViewerConfig::from_toml_str("").unwrap(), ViewerConfig::default());
    }

    #[test]
    fn parses_all_fields() {
        let config = ViewerConfig::from_toml_str(
            r#"
            density = 2.5
            render_timeout_ms = 1500
            coalesce_requests = false
            placeholder_name = "untitled"
            "#,
        )
        .unwrap();
        assert_eq!(config.density, 2.5);
        assert_eq!(config.render_timeout, Some(Duration::from_millis(1500)));
        assert!(!config.coalesce_requests);
        assert_eq!(config.placeholder_name, "untitled");
    }

    #[test]
    fn rejects_non_positive_density() {
        assert!(ViewerConfig::from_toml_str("density = 0.0").is_err());
        assert!(ViewerConfig::from_toml_str("density = -1.0").is_err());
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(ViewerConfig::from_toml_str("zoom = 3").is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = ViewerConfig::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, ViewerConfig::default());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "density = 3.0\n").unwrap();
        assert_eq!(ViewerConfig::load(&path).unwrap().density, 3.0);
    }
}
