//! Engine configuration, persisted as TOML.
//!
//! ```toml
//! data_dir = "/var/lib/proficio"
//!
//! [propagation]
//! alpha_direct = 0.1
//! alpha_neighbor = 0.06
//! min_traversal_weight = 0.3
//!
//! [edge_weights]
//! mastery_threshold = 0.7
//! min_success_ratio = 0.99
//!
//! [retry]
//! max_attempts = 4
//! ```
//!
//! Every field is optional and falls back to its default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::propagation::PropagationConfig;
use crate::retry::RetryPolicy;
use crate::weights::WeightConfig;

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Configuration for [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Data directory for persistence. `None` for memory-only mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub propagation: PropagationConfig,
    #[serde(default)]
    pub edge_weights: WeightConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.into(),
    }
}

fn check_unit(field: &str, value: f64) -> ConfigResult<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, format!("{value} is outside [0, 1]")))
    }
}

fn check_rate(field: &str, value: f64) -> ConfigResult<()> {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(invalid(field, format!("{value} is outside (0, 1]")))
    }
}

impl EngineConfig {
    /// A memory-only configuration rooted at no data directory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// A persistent configuration storing data under `dir`.
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
            ..Default::default()
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        let p = &self.propagation;
        check_rate("propagation.alpha_direct", p.alpha_direct)?;
        check_rate("propagation.alpha_neighbor", p.alpha_neighbor)?;
        check_unit("propagation.min_traversal_weight", p.min_traversal_weight)?;
        check_unit("propagation.default_proficiency", p.default_proficiency)?;
        if p.max_depth == 0 {
            return Err(invalid("propagation.max_depth", "must be at least 1"));
        }
        if !p.sample_size_damping.is_finite() || p.sample_size_damping < 0.0 {
            return Err(invalid(
                "propagation.sample_size_damping",
                format!("{} must be a non-negative number", p.sample_size_damping),
            ));
        }
        if p.timeout_ms == Some(0) {
            return Err(invalid("propagation.timeout_ms", "must be positive when set"));
        }

        let w = &self.edge_weights;
        check_unit("edge_weights.mastery_threshold", w.mastery_threshold)?;
        check_unit("edge_weights.min_success_ratio", w.min_success_ratio)?;

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid(
                "retry.base_delay_ms",
                format!(
                    "{} exceeds retry.max_delay_ms ({})",
                    self.retry.base_delay_ms, self.retry.max_delay_ms
                ),
            ));
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str, origin: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml(&content, &path.display().to_string())
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }
}
