use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};

use crate::retry::RetryConfig;
use crate::types::ChainSide;

/// Upper bound for any configured delay (30 days)
const MAX_DELAY_SECS: u64 = 30 * 24 * 60 * 60;

/// Main configuration for the relayer
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub chain_a: ChainConfig,
    pub chain_b: ChainConfig,
    pub validators: ValidatorsConfig,
    pub coordinator: CoordinatorConfig,
    pub submitter: SubmitterConfig,
    pub monitor: MonitorConfig,
    pub api: ApiConfig,
    /// Per-call timeout for chain RPC requests
    pub rpc_timeout_ms: u64,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// One side of the bridge
#[derive(Clone)]
pub struct ChainConfig {
    pub side: ChainSide,
    /// Human-readable name used in logs and metrics
    pub name: String,
    pub rpc_url: String,
    /// Additional RPC URLs for fallback (tried in order when primary fails)
    pub rpc_fallback_urls: Vec<String>,
    pub chain_id: u64,
    pub bridge_address: String,
    pub private_key: String,
    /// Blocks behind head before an event is treated as final
    pub finality_depth: u64,
    /// Blocks a destination transaction needs before it counts as confirmed
    pub confirmation_depth: u64,
    pub poll_interval_ms: u64,
    /// First block to scan when no checkpoint exists
    pub start_block: u64,
    pub max_block_range: u64,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainConfig")
            .field("side", &self.side)
            .field("name", &self.name)
            .field("rpc_url", &self.rpc_url)
            .field("rpc_fallback_urls", &self.rpc_fallback_urls)
            .field("chain_id", &self.chain_id)
            .field("bridge_address", &self.bridge_address)
            .field("private_key", &"<redacted>")
            .field("finality_depth", &self.finality_depth)
            .field("confirmation_depth", &self.confirmation_depth)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("start_block", &self.start_block)
            .field("max_block_range", &self.max_block_range)
            .finish()
    }
}

impl ChainConfig {
    /// All RPC URLs: primary followed by fallbacks.
    pub fn all_rpc_urls(&self) -> Vec<String> {
        let mut urls = vec![self.rpc_url.clone()];
        urls.extend(self.rpc_fallback_urls.iter().cloned());
        urls
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// A validator identity and the endpoint that signs for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorEntry {
    pub address: Address,
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub struct ValidatorsConfig {
    pub members: Vec<ValidatorEntry>,
    /// Signatures (M) required out of the validator set (N)
    pub quorum_threshold: usize,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub poll_interval_ms: u64,
    pub workers: usize,
    /// Collection cycles without quorum before a record times out
    pub max_signature_cycles: u32,
    /// Delay before a timed-out record is retried
    pub timeout_retry_ms: u64,
    pub batch_size: i64,
}

#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    pub poll_interval_ms: u64,
    pub workers: usize,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// How long an unseen destination transaction is waited for before resubmitting
    pub submission_timeout_secs: u64,
    pub batch_size: i64,
}

impl SubmitterConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            ..RetryConfig::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval_ms: u64,
    /// Age after which a non-terminal record is reported as stuck
    pub stuck_threshold_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_address: String,
}

/// Default functions
fn default_max_connections() -> u32 {
    10
}

fn default_finality_depth() -> u64 {
    12
}

fn default_chain_poll_interval() -> u64 {
    5000
}

fn default_max_block_range() -> u64 {
    2000
}

fn default_request_timeout() -> u64 {
    5000
}

fn default_coordinator_poll_interval() -> u64 {
    2000
}

fn default_max_signature_cycles() -> u32 {
    5
}

fn default_timeout_retry() -> u64 {
    60_000
}

fn default_coordinator_workers() -> usize {
    8
}

fn default_submitter_poll_interval() -> u64 {
    2000
}

fn default_submitter_workers() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    2000
}

fn default_max_backoff() -> u64 {
    60_000
}

fn default_submission_timeout() -> u64 {
    600
}

fn default_batch_size() -> i64 {
    100
}

fn default_rpc_timeout() -> u64 {
    15_000
}

fn default_bind_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_monitor_interval() -> u64 {
    30_000
}

fn default_stuck_threshold() -> u64 {
    3600
}

/// Default quorum: more than two thirds of the validator set
pub fn default_quorum(validator_count: usize) -> usize {
    validator_count * 2 / 3 + 1
}

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `0xaddress@endpoint` entries separated by commas
pub fn parse_validators(raw: &str) -> Result<Vec<ValidatorEntry>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (address, endpoint) = entry
                .split_once('@')
                .ok_or_else(|| eyre!("validator entry '{}' must be 0xaddress@url", entry))?;
            let address: Address = address
                .trim()
                .parse()
                .wrap_err_with(|| format!("Invalid validator address in '{}'", entry))?;
            let endpoint = endpoint.trim().trim_end_matches('/').to_string();
            if endpoint.is_empty() {
                return Err(eyre!("validator {} has an empty endpoint", address));
            }
            Ok(ValidatorEntry { address, endpoint })
        })
        .collect()
}

/// Reads settings from a key lookup so tests can avoid touching the process environment
struct Vars<F: Fn(&str) -> Option<String>> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn required(&self, key: &str) -> Result<String> {
        (self.lookup)(key).ok_or_else(|| eyre!("{} environment variable is required", key))
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T>
    where
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match (self.lookup)(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .wrap_err_with(|| format!("{} has an invalid value: {}", key, raw)),
            None => Ok(default),
        }
    }

    fn optional<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>>
    where
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        (self.lookup)(key)
            .map(|raw| {
                raw.trim()
                    .parse()
                    .wrap_err_with(|| format!("{} has an invalid value: {}", key, raw))
            })
            .transpose()
    }

    fn chain(&self, side: ChainSide) -> Result<ChainConfig> {
        let prefix = match side {
            ChainSide::A => "CHAIN_A_",
            ChainSide::B => "CHAIN_B_",
        };
        let key = |name: &str| format!("{}{}", prefix, name);

        let rpc_raw = self.required(&key("RPC_URL"))?;
        let rpc_urls = parse_rpc_urls(&rpc_raw);
        if rpc_urls.is_empty() {
            return Err(eyre!("{} cannot be empty", key("RPC_URL")));
        }

        let finality_depth = self.parsed(&key("FINALITY_DEPTH"), default_finality_depth())?;

        Ok(ChainConfig {
            side,
            name: (self.lookup)(&key("NAME")).unwrap_or_else(|| format!("chain-{}", side)),
            rpc_url: rpc_urls[0].clone(),
            rpc_fallback_urls: rpc_urls[1..].to_vec(),
            chain_id: self
                .required(&key("CHAIN_ID"))?
                .trim()
                .parse()
                .wrap_err_with(|| format!("{} must be a valid u64", key("CHAIN_ID")))?,
            bridge_address: self.required(&key("BRIDGE_ADDRESS"))?,
            private_key: self.required(&key("PRIVATE_KEY"))?,
            finality_depth,
            confirmation_depth: self.parsed(&key("CONFIRMATION_DEPTH"), finality_depth)?,
            poll_interval_ms: self
                .parsed(&key("POLL_INTERVAL_MS"), default_chain_poll_interval())?,
            start_block: self.parsed(&key("START_BLOCK"), 0)?,
            max_block_range: self.parsed(&key("MAX_BLOCK_RANGE"), default_max_block_range())?,
        })
    }
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env")
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an explicit key/value map
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self> {
        let vars = Vars { lookup };

        let database = DatabaseConfig {
            url: vars.required("DATABASE_URL")?,
            max_connections: vars.parsed("DATABASE_MAX_CONNECTIONS", default_max_connections())?,
        };

        let members = parse_validators(&vars.required("VALIDATORS")?)?;
        let quorum_threshold = vars
            .optional("QUORUM_THRESHOLD")?
            .unwrap_or_else(|| default_quorum(members.len()));
        let validators = ValidatorsConfig {
            members,
            quorum_threshold,
            request_timeout_ms: vars
                .parsed("SIGNATURE_REQUEST_TIMEOUT_MS", default_request_timeout())?,
        };

        let coordinator = CoordinatorConfig {
            poll_interval_ms: vars.parsed(
                "COORDINATOR_POLL_INTERVAL_MS",
                default_coordinator_poll_interval(),
            )?,
            workers: vars.parsed("COORDINATOR_WORKERS", default_coordinator_workers())?,
            max_signature_cycles: vars
                .parsed("MAX_SIGNATURE_CYCLES", default_max_signature_cycles())?,
            timeout_retry_ms: vars.parsed("SIGNATURE_TIMEOUT_RETRY_MS", default_timeout_retry())?,
            batch_size: vars.parsed("COORDINATOR_BATCH_SIZE", default_batch_size())?,
        };

        let submitter = SubmitterConfig {
            poll_interval_ms: vars
                .parsed("SUBMITTER_POLL_INTERVAL_MS", default_submitter_poll_interval())?,
            workers: vars.parsed("SUBMITTER_WORKERS", default_submitter_workers())?,
            max_attempts: vars.parsed("MAX_SUBMISSION_ATTEMPTS", default_max_attempts())?,
            initial_backoff_ms: vars
                .parsed("RETRY_INITIAL_BACKOFF_MS", default_initial_backoff())?,
            max_backoff_ms: vars.parsed("RETRY_MAX_BACKOFF_MS", default_max_backoff())?,
            submission_timeout_secs: vars
                .parsed("SUBMISSION_TIMEOUT_SECS", default_submission_timeout())?,
            batch_size: vars.parsed("SUBMITTER_BATCH_SIZE", default_batch_size())?,
        };

        let monitor = MonitorConfig {
            interval_ms: vars.parsed("MONITOR_INTERVAL_MS", default_monitor_interval())?,
            stuck_threshold_secs: vars.parsed("STUCK_THRESHOLD_SECS", default_stuck_threshold())?,
        };

        let config = Config {
            database,
            chain_a: vars.chain(ChainSide::A)?,
            chain_b: vars.chain(ChainSide::B)?,
            validators,
            coordinator,
            submitter,
            monitor,
            api: ApiConfig {
                bind_address: (vars.lookup)("API_BIND_ADDRESS")
                    .unwrap_or_else(default_bind_address),
            },
            rpc_timeout_ms: vars.parsed("RPC_TIMEOUT_MS", default_rpc_timeout())?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn chain(&self, side: ChainSide) -> &ChainConfig {
        match side {
            ChainSide::A => &self.chain_a,
            ChainSide::B => &self.chain_b,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        for chain in [&self.chain_a, &self.chain_b] {
            let side = chain.side;
            if chain.rpc_url.is_empty() {
                return Err(eyre!("chain {}: rpc_url cannot be empty", side));
            }
            if chain.bridge_address.len() != 42 || !chain.bridge_address.starts_with("0x") {
                return Err(eyre!(
                    "chain {}: bridge_address must be a valid hex address (42 chars with 0x prefix)",
                    side
                ));
            }
            if chain.private_key.len() != 66 || !chain.private_key.starts_with("0x") {
                return Err(eyre!(
                    "chain {}: private_key must be 66 chars (0x + 64 hex chars)",
                    side
                ));
            }
            if chain.max_block_range == 0 {
                return Err(eyre!("chain {}: max_block_range must be positive", side));
            }
        }

        if self.chain_a.chain_id == self.chain_b.chain_id {
            return Err(eyre!(
                "chain A and chain B share chain id {}; the signing domain would be ambiguous",
                self.chain_a.chain_id
            ));
        }

        let n = self.validators.members.len();
        if n == 0 {
            return Err(eyre!("at least one validator is required"));
        }
        let mut seen = std::collections::HashSet::new();
        for member in &self.validators.members {
            if !seen.insert(member.address) {
                return Err(eyre!("validator {} is listed twice", member.address));
            }
        }
        let m = self.validators.quorum_threshold;
        if m == 0 || m > n {
            return Err(eyre!(
                "quorum threshold must satisfy 1 <= M <= N (M = {}, N = {})",
                m,
                n
            ));
        }

        if self.coordinator.workers == 0 || self.submitter.workers == 0 {
            return Err(eyre!("worker pool sizes must be positive"));
        }
        if self.coordinator.max_signature_cycles == 0 {
            return Err(eyre!("max_signature_cycles must be positive"));
        }
        if self.submitter.max_attempts == 0 {
            return Err(eyre!("max_submission_attempts must be positive"));
        }

        let delays = [
            ("SIGNATURE_TIMEOUT_RETRY_MS", self.coordinator.timeout_retry_ms / 1000),
            ("RETRY_INITIAL_BACKOFF_MS", self.submitter.initial_backoff_ms / 1000),
            ("RETRY_MAX_BACKOFF_MS", self.submitter.max_backoff_ms / 1000),
            ("SUBMISSION_TIMEOUT_SECS", self.submitter.submission_timeout_secs),
            ("STUCK_THRESHOLD_SECS", self.monitor.stuck_threshold_secs),
        ];
        for (name, secs) in delays {
            if secs > MAX_DELAY_SECS {
                return Err(eyre!("{} exceeds the {}s ceiling", name, MAX_DELAY_SECS));
            }
        }

        Ok(())
    }
}
