use medface_core::matcher::{DEFAULT_DISTANCE_THRESHOLD, DEFAULT_TIE_EPSILON};
use medface_core::pipeline::{DEFAULT_CONFIDENCE_FLOOR, DEFAULT_DESCRIPTOR_DIM};
use medface_core::PipelineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine configuration.
///
/// Base values come from the TOML file named by `MEDFACE_CONFIG` (if set);
/// `MEDFACE_*` environment variables override individual fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the SQLite enrollment database.
    pub db_path: PathBuf,
    /// Maximum Euclidean distance for a positive match.
    pub distance_threshold: f32,
    /// Minimum detection confidence for the face in a photo.
    pub confidence_floor: f32,
    /// Descriptor length produced by the extraction model.
    pub descriptor_dim: usize,
    /// Distances this close to the minimum count as a tie.
    pub tie_epsilon: f32,
    /// Timeout in seconds for a single enroll or verify request.
    pub verify_timeout_secs: u64,
    /// Number of engine worker threads.
    pub workers: usize,
    /// Extraction helper program followed by its arguments.
    pub extractor_command: Vec<String>,
    /// Passphrase for at-rest descriptor encryption. Plaintext when unset.
    pub store_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("enrollments.db"),
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            descriptor_dim: DEFAULT_DESCRIPTOR_DIM,
            tie_epsilon: DEFAULT_TIE_EPSILON,
            verify_timeout_secs: 10,
            workers: 2,
            extractor_command: vec!["medface-extract".to_string()],
            store_key: None,
        }
    }
}

impl Config {
    /// Load configuration from `MEDFACE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration using `lookup` in place of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("MEDFACE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };

        if let Some(path) = lookup("MEDFACE_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        override_parsed(&lookup, "MEDFACE_DISTANCE_THRESHOLD", &mut config.distance_threshold);
        override_parsed(&lookup, "MEDFACE_CONFIDENCE_FLOOR", &mut config.confidence_floor);
        override_parsed(&lookup, "MEDFACE_DESCRIPTOR_DIM", &mut config.descriptor_dim);
        override_parsed(&lookup, "MEDFACE_TIE_EPSILON", &mut config.tie_epsilon);
        override_parsed(&lookup, "MEDFACE_VERIFY_TIMEOUT_SECS", &mut config.verify_timeout_secs);
        override_parsed(&lookup, "MEDFACE_WORKERS", &mut config.workers);
        if let Some(cmd) = lookup("MEDFACE_EXTRACTOR_CMD") {
            config.extractor_command = cmd.split_whitespace().map(str::to_string).collect();
        }
        if let Some(key) = lookup("MEDFACE_STORE_KEY") {
            config.store_key = Some(key).filter(|k| !k.is_empty());
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.distance_threshold > 0.0 && self.distance_threshold.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "distance_threshold must be positive, got {}",
                self.distance_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_floor) {
            return Err(ConfigError::Invalid(format!(
                "confidence_floor must be within [0, 1], got {}",
                self.confidence_floor
            )));
        }
        if self.descriptor_dim == 0 {
            return Err(ConfigError::Invalid("descriptor_dim must be non-zero".into()));
        }
        if !(self.tie_epsilon >= 0.0 && self.tie_epsilon.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "tie_epsilon must be finite and non-negative, got {}",
                self.tie_epsilon
            )));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be non-zero".into()));
        }
        if self.extractor_command.is_empty() {
            return Err(ConfigError::Invalid("extractor_command is empty".into()));
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            distance_threshold: self.distance_threshold,
            confidence_floor: self.confidence_floor,
            descriptor_dim: self.descriptor_dim,
        }
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("medface")
}

/// Replace `target` with the parsed value of `key`, keeping the current
/// value (with a warning) when the variable does not parse.
fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable setting"),
    }
}
