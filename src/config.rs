// config.rs: generator configuration, loaded from TOML.
//
// Every field has a default, so an empty file (or no file) is valid:
//
//   model_id = "tiny"
//   asset_source = "models"
//   cache_dir = ".tierforge-cache"
//   tier_override = "Medium"      # never raises the detected tier
//   poll_interval_ms = 1
//
//   [probe]
//   low_power_markers = ["iPhone"]
//   ultra_low_below_mib = 64
//   low_below_mib = 128
//   medium_below_mib = 256
//   low_above_ms = 35.0
//   medium_above_ms = 20.0

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::profile::Tier;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid probe thresholds: {0}")]
    Thresholds(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneratorConfig {
    /// Model asset that must be cached before generation is allowed.
    pub model_id: String,
    /// Directory model files are fetched from.
    pub asset_source: PathBuf,
    /// Directory fetched model files are cached in.
    pub cache_dir: PathBuf,
    /// Requested tier; clamped to the detected tier.
    pub tier_override: Option<Tier>,
    /// Interval between non-blocking device polls while awaiting GPU work.
    pub poll_interval_ms: u64,
    pub probe: ProbeConfig,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            model_id: crate::assets::DEFAULT_MODEL_ID.to_string(),
            asset_source: PathBuf::from("models"),
            cache_dir: PathBuf::from(".tierforge-cache"),
            tier_override: None,
            poll_interval_ms: 1,
            probe: ProbeConfig::default(),
        }
    }
}

/// Thresholds for the default capability classifier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    /// Adapter-name substrings that force the lowest tier.
    pub low_power_markers: Vec<String>,
    pub ultra_low_below_mib: u64,
    pub low_below_mib: u64,
    pub medium_below_mib: u64,
    /// Benchmark times above this classify as Low.
    pub low_above_ms: f64,
    /// Benchmark times above this (and not above `low_above_ms`) classify as Medium.
    pub medium_above_ms: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            low_power_markers: vec!["iPhone".to_string()],
            ultra_low_below_mib: 64,
            low_below_mib: 128,
            medium_below_mib: 256,
            low_above_ms: 35.0,
            medium_above_ms: 20.0,
        }
    }
}

impl ProbeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.ultra_low_below_mib <= self.low_below_mib
            && self.low_below_mib <= self.medium_below_mib)
        {
            return Err(ConfigError::Thresholds(
                "buffer thresholds must be non-decreasing".to_string(),
            ));
        }
        if self.medium_above_ms > self.low_above_ms {
            return Err(ConfigError::Thresholds(
                "medium_above_ms must not exceed low_above_ms".to_string(),
            ));
        }
        Ok(())
    }
}

impl GeneratorConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: GeneratorConfig = toml::from_str(text)?;
        config.probe.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&text)
    }

    /// Load `path` if given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let c = GeneratorConfig::from_toml_str("").unwrap();
        assert_eq!(c, GeneratorConfig::default());
        assert_eq!(c.probe.low_power_markers, vec!["iPhone".to_string()]);
    }

    #[test]
    fn partial_file_overrides_fields() {
        let c = GeneratorConfig::from_toml_str(
            r#"
            model_id = "base"
            tier_override = "Low"

            [probe]
            low_above_ms = 50.0
            "#,
        )
        .unwrap();
        assert_eq!(c.model_id, "base");
        assert_eq!(c.tier_override, Some(Tier::Low));
        assert_eq!(c.probe.low_above_ms, 50.0);
        assert_eq!(c.probe.medium_above_ms, 20.0);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            GeneratorConfig::from_toml_str("colour = \"red\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let err = GeneratorConfig::from_toml_str("[probe]\nlow_below_mib = 32").unwrap_err();
        assert!(matches!(err, ConfigError::Thresholds(_)));
    }

    #[test]
    fn poll_interval_has_a_floor() {
        let c = GeneratorConfig { poll_interval_ms: 0, ..Default::default() };
        assert_eq!(c.poll_interval(), Duration::from_millis(1));
    }
}
