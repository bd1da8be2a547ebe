//! Service configuration.
//!
//! Resolution order: built-in defaults, then the TOML file, then
//! `CONSENT_*` environment overrides. The file is taken from `--config`,
//! else `CONSENT_CONFIG`, else `~/.config/consentd/config.toml`; only an
//! explicitly named file has to exist.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use consent_core::ClassifierError;
use consent_core::CookieClassifier;
use consent_core::EvaluatorConfig;
use consent_core::RuleSpec;
use consent_core::StoreError;
use consent_core::evaluator::ReadinessMode;
use serde::Deserialize;

use crate::default_socket_path;

pub const ENV_CONFIG_PATH: &str = "CONSENT_CONFIG";
pub const ENV_SOCKET: &str = "CONSENT_SOCKET";
pub const ENV_EVALUATOR_PROGRAM: &str = "CONSENT_EVALUATOR_PROGRAM";
pub const ENV_RULES_PATH: &str = "CONSENT_RULES_PATH";
pub const ENV_READINESS: &str = "CONSENT_READINESS";
pub const ENV_STORE_PATH: &str = "CONSENT_STORE_PATH";
pub const ENV_MAX_RESTARTS: &str = "CONSENT_MAX_RESTARTS";

const CONFIG_DIR: &str = "consentd";
const CONFIG_FILENAME: &str = "config.toml";
const STORE_FILENAME: &str = "consent.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidEnvValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid classifier rules: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("failed to open consent store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Unix socket for the IPC listener.
    pub socket_path: Option<PathBuf>,
    pub evaluator: EvaluatorConfig,
    pub store: StoreConfig,
    pub cookies: CookieConfig,
    pub restart: RestartConfig,
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON consent file. Defaults to the platform data directory.
    pub path: Option<PathBuf>,
    /// Users created with an empty record on startup.
    pub seed_users: Vec<String>,
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        dirs::data_dir()
            .map(|dir| dir.join(CONFIG_DIR).join(STORE_FILENAME))
            .unwrap_or_else(|| PathBuf::from(STORE_FILENAME))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    /// Lifetime of granted cookies in categories that need consent.
    pub max_age_secs: u64,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self { max_age_secs: 3600 }
    }
}

impl CookieConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// Automatic restart of a crashed evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub enabled: bool,
    /// Restart attempts over the lifetime of the service.
    pub max_restarts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_restarts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Replaces the built-in rule table when set.
    pub rules: Option<Vec<RuleSpec>>,
}

impl ServiceConfig {
    /// Load from `path` (or the default location) and the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    /// Same as [`ServiceConfig::load`] with an explicit environment lookup.
    pub fn load_with_env<F>(path: Option<&Path>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| env(ENV_CONFIG_PATH).map(PathBuf::from));
        let mut config = match explicit {
            Some(path) => Self::load_from_path(&path)?,
            None => {
                let path = default_config_path();
                if path.exists() {
                    Self::load_from_path(&path)?
                } else {
                    tracing::debug!("No config at {}, using defaults", path.display());
                    Self::default()
                }
            }
        };
        config.apply_env(env)?;
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Loaded config from {}", path.display());
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(socket) = env(ENV_SOCKET) {
            self.socket_path = Some(PathBuf::from(socket));
        }
        if let Some(program) = env(ENV_EVALUATOR_PROGRAM) {
            self.evaluator.program = program;
        }
        if let Some(rules) = env(ENV_RULES_PATH) {
            self.evaluator.rules_path = PathBuf::from(rules);
        }
        if let Some(readiness) = env(ENV_READINESS) {
            self.evaluator.readiness = match readiness.trim().to_ascii_lowercase().as_str() {
                "probe" => ReadinessMode::Probe,
                "delay" => ReadinessMode::Delay,
                _ => {
                    return Err(ConfigError::InvalidEnvValue {
                        key: ENV_READINESS,
                        value: readiness,
                        reason: "expected `probe` or `delay`".to_string(),
                    });
                }
            };
        }
        if let Some(store) = env(ENV_STORE_PATH) {
            self.store.path = Some(PathBuf::from(store));
        }
        if let Some(max) = env(ENV_MAX_RESTARTS) {
            self.restart.max_restarts = max.trim().parse().map_err(
                |e: std::num::ParseIntError| ConfigError::InvalidEnvValue {
                    key: ENV_MAX_RESTARTS,
                    value: max.clone(),
                    reason: e.to_string(),
                },
            )?;
        }
        Ok(())
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(default_socket_path)
    }

    pub fn classifier(&self) -> Result<CookieClassifier, ConfigError> {
        match &self.classifier.rules {
            Some(rules) => Ok(CookieClassifier::from_rules(rules)?),
            None => Ok(CookieClassifier::with_default_rules()),
        }
    }

    /// How long one-shot commands and restarts wait for readiness.
    pub fn ready_timeout(&self) -> Duration {
        let readiness = Duration::from_millis(
            self.evaluator
                .readiness_timeout_ms
                .max(self.evaluator.readiness_delay_ms),
        );
        readiness + self.evaluator.stop_grace()
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILENAME))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILENAME))
}
