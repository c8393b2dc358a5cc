//! Service configuration.
//!
//! Loaded once: TOML file (every section optional), then `SENTINELX_*`
//! environment overrides, then [`SentinelConfig::validate`]. The signer key is
//! only ever taken from `SENTINELX_SIGNER_KEY`.
//!
//! ```toml
//! [chain]
//! rpc_url = "http://127.0.0.1:8545"
//! default_router = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
//!
//! [evaluator]
//! poll_interval_secs = 30
//! max_concurrency = 4
//! demo_mode = false
//!
//! [advisor]
//! url = "http://127.0.0.1:9100"
//!
//! [storage]
//! path = "sentinelx.sqlite"
//!
//! [server]
//! listen = "127.0.0.1:8787"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ethereum_types::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::abi::parse_address;
use crate::execution::LocalSigner;
use crate::oracle::DemoPolicy;

pub const SIGNER_KEY_ENV: &str = "SENTINELX_SIGNER_KEY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value in env var {name}: {value}")]
    InvalidEnv { name: String, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    pub chain: ChainConfig,
    pub evaluator: EvaluatorConfig,
    pub advisor: AdvisorConfig,
    pub execution: ExecutionConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// JSON-RPC endpoint. Without it only demo data is available.
    pub rpc_url: Option<String>,
    /// Router used by monitors that do not name their own.
    pub default_router: Option<String>,
    /// Fixed chain id for signing; read from the node when unset.
    pub chain_id: Option<u64>,
    pub rpc_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            default_router: None,
            chain_id: None,
            rpc_timeout_ms: 10_000,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub poll_interval_secs: u64,
    /// Monitors evaluated at once within a pass.
    pub max_concurrency: usize,
    /// Deadline for one router read, retries included.
    pub read_timeout_ms: u64,
    pub advisor_timeout_ms: u64,
    /// Recent telemetry points handed to the advisor.
    pub telemetry_window: usize,
    /// Recent incidents handed to the advisor.
    pub incident_window: usize,
    pub demo_mode: bool,
    pub force_demo_tenant: Option<String>,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            max_concurrency: 4,
            read_timeout_ms: 8_000,
            advisor_timeout_ms: 5_000,
            telemetry_window: 20,
            incident_window: 5,
            demo_mode: false,
            force_demo_tenant: None,
        }
    }
}

impl EvaluatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn advisor_timeout(&self) -> Duration {
        Duration::from_millis(self.advisor_timeout_ms)
    }

    pub fn demo_policy(&self) -> DemoPolicy {
        DemoPolicy {
            enabled: self.demo_mode,
            force_tenant: self.force_demo_tenant.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    /// Advisory service base URL. The rule-based advisor is used when unset.
    pub url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub receipt_timeout_secs: u64,
    pub receipt_poll_ms: u64,
    pub gas_headroom_percent: u64,
    #[serde(skip)]
    pub signer_key: Option<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            receipt_timeout_secs: 60,
            receipt_poll_ms: 2_000,
            gas_headroom_percent: 20,
            signer_key: None,
        }
    }
}

impl fmt::Debug for ExecutionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionConfig")
            .field("receipt_timeout_secs", &self.receipt_timeout_secs)
            .field("receipt_poll_ms", &self.receipt_poll_ms)
            .field("gas_headroom_percent", &self.gas_headroom_percent)
            .field("signer_key", &self.signer_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ExecutionConfig {
    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }

    pub fn receipt_poll(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sentinelx.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8787".to_owned(),
        }
    }
}

impl SentinelConfig {
    /// File (if any), then process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `SENTINELX_*` overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("SENTINELX_RPC_URL") {
            self.chain.rpc_url = Some(value);
        }
        if let Some(value) = lookup("SENTINELX_DEFAULT_ROUTER") {
            self.chain.default_router = Some(value);
        }
        if let Some(value) = read_parsed(&lookup, "SENTINELX_CHAIN_ID")? {
            self.chain.chain_id = Some(value);
        }
        if let Some(value) = read_parsed(&lookup, "SENTINELX_POLL_SECONDS")? {
            self.evaluator.poll_interval_secs = value;
        }
        if let Some(value) = read_parsed(&lookup, "SENTINELX_MAX_CONCURRENCY")? {
            self.evaluator.max_concurrency = value;
        }
        if let Some(value) = read_parsed(&lookup, "SENTINELX_DEMO_MODE")? {
            self.evaluator.demo_mode = value;
        }
        if let Some(value) = lookup("SENTINELX_FORCE_DEMO_TENANT") {
            self.evaluator.force_demo_tenant = Some(value).filter(|tenant| !tenant.is_empty());
        }
        if let Some(value) = lookup("SENTINELX_ADVISOR_URL") {
            self.advisor.url = Some(value);
        }
        if let Some(value) = lookup("SENTINELX_DB_PATH") {
            self.storage.path = PathBuf::from(value);
        }
        if let Some(value) = lookup("SENTINELX_LISTEN") {
            self.server.listen = value;
        }
        if let Some(value) = lookup(SIGNER_KEY_ENV) {
            self.execution.signer_key = Some(value).filter(|key| !key.is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::Invalid(reason));

        if self.evaluator.max_concurrency == 0 {
            return invalid("evaluator.max_concurrency must be > 0".to_owned());
        }
        if self.evaluator.poll_interval_secs == 0 {
            return invalid("evaluator.poll_interval_secs must be > 0".to_owned());
        }
        if self.evaluator.read_timeout_ms == 0 || self.evaluator.advisor_timeout_ms == 0 {
            return invalid("evaluator timeouts must be > 0".to_owned());
        }
        if let Some(url) = &self.chain.rpc_url {
            if !is_http_url(url) {
                return invalid(format!("chain.rpc_url must be an http(s) URL, got {url}"));
            }
        }
        if let Some(url) = &self.advisor.url {
            if !is_http_url(url) {
                return invalid(format!("advisor.url must be an http(s) URL, got {url}"));
            }
        }
        self.default_router()?;
        if self.execution.receipt_timeout_secs == 0 || self.execution.receipt_poll_ms == 0 {
            return invalid("execution receipt timeout and poll interval must be > 0".to_owned());
        }
        if let Some(key) = &self.execution.signer_key {
            if LocalSigner::from_hex(key).is_err() {
                return invalid(format!("{SIGNER_KEY_ENV} is not a valid secp256k1 secret key"));
            }
            if self.chain.rpc_url.is_none() {
                return invalid(format!("{SIGNER_KEY_ENV} is set but chain.rpc_url is not"));
            }
        }
        Ok(())
    }

    pub fn default_router(&self) -> Result<Option<Address>, ConfigError> {
        self.chain
            .default_router
            .as_deref()
            .map(|raw| {
                parse_address(raw).ok_or_else(|| {
                    ConfigError::Invalid(format!("chain.default_router is not an address: {raw}"))
                })
            })
            .transpose()
    }

    pub fn signer(&self) -> Result<Option<LocalSigner>, ConfigError> {
        self.execution
            .signer_key
            .as_deref()
            .map(|key| {
                LocalSigner::from_hex(key)
                    .map_err(|error| ConfigError::Invalid(format!("{SIGNER_KEY_ENV}: {error}")))
            })
            .transpose()
    }
}

fn is_http_url(raw: &str) -> bool {
    raw.starts_with("http://") || raw.starts_with("https://")
}

fn read_parsed<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| {
            value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnv {
                name: name.to_owned(),
                value,
            })
        })
        .transpose()
}
