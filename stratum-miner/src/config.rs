//! Miner configuration, loaded from a JSON file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::pool::Endpoint;
use crate::stratum::AuthFailurePolicy;
use crate::work::{AlgoParams, DiffMode, DiffMultipliers, MerkleMode};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "STRATUM_MINER_CONFIG";

/// File used when neither an argument nor the environment names one.
pub const DEFAULT_CONFIG_FILE: &str = "minerd.json";

/// Name of the built-in algorithm.
pub const SHA256D: &str = "sha256d";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("No valid pool configs found")]
    NoPools,

    #[error("Pool {index} ({name}): invalid {field}: {reason}")]
    Pool {
        index: usize,
        name: String,
        field: &'static str,
        reason: String,
    },

    #[error("Unknown algorithm: \"{0}\"")]
    UnknownAlgorithm(String),

    #[error("Algorithm \"{0}\" cannot be mined here, only sha256d is supported")]
    UnsupportedAlgorithm(String),

    #[error("cpuWorkers must be at least 1")]
    NoWorkers,
}

/// One set of pool credentials.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub user: String,
    #[serde(default)]
    pub pass: String,
}

/// One pool entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub credentials: Vec<Credentials>,
    /// Shorthand for a single credential
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default = "default_algorithm")]
    pub algo: String,
    #[serde(default)]
    pub diff_multipliers: DiffMultipliers,
    #[serde(default)]
    pub merkle_mode: MerkleMode,
    #[serde(default)]
    pub diff_mode: DiffMode,
}

impl PoolConfig {
    /// Credentials from the list followed by the `user`/`pass` shorthand.
    pub fn all_credentials(&self) -> Vec<Credentials> {
        let mut all = self.credentials.clone();
        if let Some(user) = &self.user {
            all.push(Credentials {
                user: user.clone(),
                pass: self.pass.clone().unwrap_or_default(),
            });
        }
        all
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Algorithm activated at startup
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub auth_failure_policy: AuthFailurePolicy,
    #[serde(default = "default_cpu_workers")]
    pub cpu_workers: usize,
    #[serde(default)]
    pub algorithms: HashMap<String, AlgoParams>,
    pub pools: Vec<PoolConfig>,
}

fn default_algorithm() -> String {
    SHA256D.to_string()
}

fn default_reconnect_delay_secs() -> u64 {
    120
}

fn default_user_agent() -> String {
    concat!("stratum-miner/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_cpu_workers() -> usize {
    1
}

impl Config {
    /// Read, parse and validate the file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_json::from_str(text)?;
        if config.algo_params(SHA256D).is_none() {
            config
                .algorithms
                .insert(SHA256D.to_string(), AlgoParams::SHA256D);
        }
        config.validate()?;
        Ok(config)
    }

    /// Path from the first argument, the environment, or the default.
    pub fn path_from_args(mut args: impl Iterator<Item = String>) -> PathBuf {
        args.next()
            .or_else(|| std::env::var(CONFIG_ENV).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string())
            .into()
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Parameters for `name`, matched case-insensitively like pool activation.
    pub fn algo_params(&self, name: &str) -> Option<AlgoParams> {
        self.algorithms
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(name))
            .map(|(_, params)| *params)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pools.is_empty() {
            return Err(ConfigError::NoPools);
        }
        if self.cpu_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        let params = self
            .algo_params(&self.algorithm)
            .ok_or_else(|| ConfigError::UnknownAlgorithm(self.algorithm.clone()))?;
        // The CPU dispatcher and verifier hash BTC-layout double SHA-256 only
        if !self.algorithm.eq_ignore_ascii_case(SHA256D) || !params.big_endian {
            return Err(ConfigError::UnsupportedAlgorithm(self.algorithm.clone()));
        }

        for (index, pool) in self.pools.iter().enumerate() {
            let invalid = |field: &'static str, reason: String| ConfigError::Pool {
                index,
                name: pool.name.clone(),
                field,
                reason,
            };

            Endpoint::parse(&pool.url).map_err(|e| invalid("url", e.to_string()))?;
            if pool.all_credentials().is_empty() {
                return Err(invalid("credentials", "no user given".to_string()));
            }
            if self.algo_params(&pool.algo).is_none() {
                return Err(invalid("algo", format!("unknown algorithm \"{}\"", pool.algo)));
            }
            let mul = &pool.diff_multipliers;
            for (value, name) in [(mul.stratum, "stratum"), (mul.one, "one"), (mul.share, "share")] {
                if !(value > 0.0) {
                    return Err(invalid(
                        "diffMultipliers",
                        format!("{} must be positive, got {}", name, value),
                    ));
                }
            }
        }
        Ok(())
    }
}
