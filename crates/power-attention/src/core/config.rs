//! Configuration options shared by all power attention implementations.
//!
//! The [`Config`] struct captures the run-time knobs (degree, chunking,
//! stabilisation constants, scan determinism and backend selection) that
//! callers can tune without swapping implementations. Configurations are plain
//! values passed into every call; nothing here is process-global.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use super::AttentionError;

/// Stabilizer used when the caller does not provide one.
pub const DEFAULT_STABILIZER: f64 = 1.0;

/// Lower bound used inside logarithms and on output denominators.
pub const DEFAULT_EPS: f64 = 1e-5;

const BACKEND_ENV: &str = "POWER_ATTENTION_BACKEND";
const DETERMINISTIC_ENV: &str = "POWER_ATTENTION_DETERMINISTIC";

/// Which kernel provider the chunked path may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendSelection {
    /// Resolve through the static tuning table.
    #[default]
    Auto,
    /// Always use the fully materialised reference kernels.
    ReferenceOnly,
    /// Always use the blocked/streaming kernels.
    StreamingOnly,
}

impl BackendSelection {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "reference" | "reference_only" => Some(Self::ReferenceOnly),
            "streaming" | "streaming_only" => Some(Self::StreamingOnly),
            _ => None,
        }
    }
}

/// Configuration driving power attention behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Degree of the query-key similarity power. Must be at least one.
    pub deg: usize,
    /// Magnitude rescaling applied before the long-range merge.
    ///
    /// When `None`, [`DEFAULT_STABILIZER`] is used.
    pub stabilizer: Option<f64>,
    /// Small positive constant guarding logarithms and denominators.
    pub eps: f64,
    /// Chunk length for the recurrent path.
    ///
    /// `None`, or any value at least as long as the sequence, selects the
    /// whole-sequence quadratic path.
    pub chunk_size: Option<usize>,
    /// Forces the sequential chunk scan so reductions happen in a fixed order.
    pub deterministic: bool,
    /// Kernel provider selection for the chunked path.
    pub backend: BackendSelection,
    /// Recenter and variance-normalise the attention output (forward only).
    pub normalize_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            deg: 2,
            stabilizer: None,
            eps: DEFAULT_EPS,
            chunk_size: None,
            deterministic: true,
            backend: BackendSelection::Auto,
            normalize_output: false,
        }
    }
}

impl Config {
    /// Load a configuration from a `.json` or `.toml` file and validate it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, AttentionError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: Config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|err| AttentionError::ConfigFormat(err.to_string()))?,
            Some("toml") | None => toml::from_str(&contents)
                .map_err(|err| AttentionError::ConfigFormat(err.to_string()))?,
            Some(other) => {
                return Err(AttentionError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every field and report all violations at once.
    pub fn validate(&self) -> Result<(), AttentionError> {
        let mut errors = Vec::new();

        if self.deg == 0 {
            errors.push("deg must be a positive integer".to_string());
        }

        if !(self.eps.is_finite() && self.eps > 0.0) {
            errors.push(format!("eps must be finite and > 0, got {}", self.eps));
        }

        if let Some(stabilizer) = self.stabilizer {
            if !(stabilizer.is_finite() && stabilizer > 0.0) {
                errors.push(format!(
                    "stabilizer must be finite and > 0, got {stabilizer}"
                ));
            }
        }

        if self.chunk_size == Some(0) {
            errors.push("chunk_size must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AttentionError::InvalidConfig(errors))
        }
    }

    pub fn stabilizer_or_default(&self) -> f64 {
        self.stabilizer.unwrap_or(DEFAULT_STABILIZER)
    }

    /// Apply `POWER_ATTENTION_*` environment overrides.
    ///
    /// Never invoked implicitly; callers opt in per configuration value.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides resolved through `lookup`, ignoring unparsable values.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(BACKEND_ENV) {
            match BackendSelection::parse(&raw) {
                Some(backend) => self.backend = backend,
                None => log::warn!("ignoring {BACKEND_ENV}={raw:?}"),
            }
        }
        if let Some(raw) = lookup(DETERMINISTIC_ENV) {
            match raw.trim() {
                "1" | "true" => self.deterministic = true,
                "0" | "false" => self.deterministic = false,
                _ => log::warn!("ignoring {DETERMINISTIC_ENV}={raw:?}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stabilizer_or_default(), 1.0);
        assert_eq!(config.eps, 1e-5);
    }

    #[test]
    fn validate_collects_every_violation() {
        let config = Config {
            deg: 0,
            eps: 0.0,
            stabilizer: Some(-1.0),
            chunk_size: Some(0),
            ..Config::default()
        };
        match config.validate() {
            Err(AttentionError::InvalidConfig(messages)) => assert_eq!(messages.len(), 4),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn overrides_apply_from_lookup() {
        let mut config = Config::default();
        config.apply_overrides_from(|key| match key {
            "POWER_ATTENTION_BACKEND" => Some("streaming".to_string()),
            "POWER_ATTENTION_DETERMINISTIC" => Some("0".to_string()),
            _ => None,
        });
        assert_eq!(config.backend, BackendSelection::StreamingOnly);
        assert!(!config.deterministic);

        config.apply_overrides_from(|_| Some("nonsense".to_string()));
        assert_eq!(config.backend, BackendSelection::StreamingOnly);
        assert!(!config.deterministic);
    }

    #[test]
    fn loads_toml_and_json() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("attention.toml");
        let mut file = fs::File::create(&toml_path).unwrap();
        writeln!(file, "deg = 3\nchunk_size = 64\nbackend = \"reference_only\"").unwrap();
        let config = Config::from_path(&toml_path).unwrap();
        assert_eq!(config.deg, 3);
        assert_eq!(config.chunk_size, Some(64));
        assert_eq!(config.backend, BackendSelection::ReferenceOnly);
        assert!(config.deterministic);

        let json_path = dir.path().join("attention.json");
        fs::write(&json_path, r#"{"deg": 1, "stabilizer": 0.5}"#).unwrap();
        let config = Config::from_path(&json_path).unwrap();
        assert_eq!(config.deg, 1);
        assert_eq!(config.stabilizer_or_default(), 0.5);
    }

    #[test]
    fn rejects_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attention.toml");
        fs::write(&path, "deg = 0").unwrap();
        assert!(matches!(
            Config::from_path(&path),
            Err(AttentionError::InvalidConfig(_))
        ));

        let path = dir.path().join("attention.yaml");
        fs::write(&path, "deg: 2").unwrap();
        assert!(matches!(
            Config::from_path(&path),
            Err(AttentionError::ConfigFormat(_))
        ));
    }
}
