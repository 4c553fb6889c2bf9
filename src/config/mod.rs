//! Pipeline configuration
//!
//! Built-in defaults overlaid by an optional TOML file. The effective
//! config is validated once at load and then passed explicitly into each
//! component at construction; nothing reads configuration globally.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Effective pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root directory for all durable pipeline data
    pub data_root: PathBuf,
    /// Compile worker pool size
    pub compile_pool: usize,
    /// Test worker pool size
    pub test_pool: usize,
    /// Maximum compile/test attempts before terminal FAILED
    pub max_retries: u32,
    /// Base delay for exponential retry backoff
    pub backoff_base: Duration,
    /// Cap on the retry backoff delay
    pub backoff_cap: Duration,
    /// Queue lease visibility timeout
    pub visibility_timeout: Duration,
    /// How long terminal requests are retained before garbage collection
    pub retention: Duration,
    /// Known configuration profiles accepted at submission
    pub profiles: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("forgeline-data"),
            compile_pool: 2,
            test_pool: 2,
            max_retries: 3,
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(30),
            visibility_timeout: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 3600),
            profiles: vec!["debug".to_string(), "release".to_string()],
        }
    }
}

/// TOML overlay; every field optional, absent fields keep defaults.
#[derive(Debug, Default, Deserialize)]
struct ConfigOverlay {
    data_root: Option<PathBuf>,
    compile_pool: Option<usize>,
    test_pool: Option<usize>,
    max_retries: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_cap_ms: Option<u64>,
    visibility_timeout_ms: Option<u64>,
    retention_secs: Option<u64>,
    profiles: Option<Vec<String>>,
}

impl PipelineConfig {
    /// Load defaults overlaid by the given TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Apply a TOML overlay to the defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let overlay: ConfigOverlay = toml::from_str(text)?;
        let mut config = Self::default();

        if let Some(v) = overlay.data_root {
            config.data_root = v;
        }
        if let Some(v) = overlay.compile_pool {
            config.compile_pool = v;
        }
        if let Some(v) = overlay.test_pool {
            config.test_pool = v;
        }
        if let Some(v) = overlay.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = overlay.backoff_base_ms {
            config.backoff_base = Duration::from_millis(v);
        }
        if let Some(v) = overlay.backoff_cap_ms {
            config.backoff_cap = Duration::from_millis(v);
        }
        if let Some(v) = overlay.visibility_timeout_ms {
            config.visibility_timeout = Duration::from_millis(v);
        }
        if let Some(v) = overlay.retention_secs {
            config.retention = Duration::from_secs(v);
        }
        if let Some(v) = overlay.profiles {
            config.profiles = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate invariants the rest of the pipeline relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compile_pool == 0 || self.test_pool == 0 {
            return Err(ConfigError::Invalid("worker pools must be non-empty".into()));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".into()));
        }
        if self.backoff_base > self.backoff_cap {
            return Err(ConfigError::Invalid(
                "backoff_base must not exceed backoff_cap".into(),
            ));
        }
        if self.profiles.is_empty() {
            return Err(ConfigError::Invalid("profile list must be non-empty".into()));
        }
        Ok(())
    }

    /// Whether a submission's profile name is known.
    pub fn knows_profile(&self, profile: &str) -> bool {
        self.profiles.iter().any(|p| p == profile)
    }

    /// Directory for the artifact store.
    pub fn store_root(&self) -> PathBuf {
        self.data_root.join("store")
    }

    /// Directory for request records and journals.
    pub fn state_root(&self) -> PathBuf {
        self.data_root.join("state")
    }

    /// Directory for per-request worker scratch space.
    pub fn workspace_root(&self) -> PathBuf {
        self.data_root.join("work")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_overlay_applies_only_present_fields() {
        let config = PipelineConfig::from_toml_str(
            r#"
            compile_pool = 4
            backoff_base_ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.compile_pool, 4);
        assert_eq!(config.backoff_base, Duration::from_millis(100));
        assert_eq!(config.test_pool, PipelineConfig::default().test_pool);
        assert_eq!(config.max_retries, PipelineConfig::default().max_retries);
    }

    #[test]
    fn test_rejects_zero_pool() {
        assert!(PipelineConfig::from_toml_str("compile_pool = 0").is_err());
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let result = PipelineConfig::from_toml_str(
            r#"
            backoff_base_ms = 5000
            backoff_cap_ms = 100
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_knows_profile() {
        let config = PipelineConfig::default();
        assert!(config.knows_profile("debug"));
        assert!(config.knows_profile("release"));
        assert!(!config.knows_profile("anycpu"));
    }

    #[test]
    fn test_derived_paths() {
        let config = PipelineConfig::from_toml_str("data_root = \"/tmp/fl\"").unwrap();
        assert_eq!(config.store_root(), PathBuf::from("/tmp/fl/store"));
        assert_eq!(config.state_root(), PathBuf::from("/tmp/fl/state"));
        assert_eq!(config.workspace_root(), PathBuf::from("/tmp/fl/work"));
    }
}
