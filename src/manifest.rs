//! Configuration file parsing for Skiff
//!
//! Parses `skiff.toml` using serde. Every section is optional; a missing
//! file yields the defaults, which reproduce the classic one-shot setup
//! (`one-shot` jail on `vnet0:bridge0` at 10.0.1.89/24).

use crate::error::{Error, Result};
use crate::network::InterfaceBinding;
use chrono_machines::ExponentialBackoff;
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Load configuration from a file
pub fn load(path: &Path) -> Result<SkiffConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: SkiffConfig = toml::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

/// Load configuration if the file exists, otherwise fall back to defaults
pub fn load_or_default(path: &Path) -> Result<SkiffConfig> {
    if path.exists() {
        load(path)
    } else {
        let config = SkiffConfig::default();
        config.validate()?;
        Ok(config)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct SkiffConfig {
    /// Web console settings
    #[serde(default)]
    pub server: ServerConfig,

    /// One-shot jail settings
    #[serde(default)]
    pub oneshot: OneShotConfig,

    /// Where jail roots live
    #[serde(default)]
    pub storage: StorageConfig,

    /// Base release bootstrap settings
    #[serde(default)]
    pub releases: ReleasesConfig,

    /// Retry/backoff for stop and destroy after a run
    #[serde(default = "default_cleanup_retry")]
    pub cleanup: RetryConfig,

    /// Retry/backoff for HTTP operations
    #[serde(default)]
    pub retry: RetryConfig,

    /// Launch rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for SkiffConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            oneshot: OneShotConfig::default(),
            storage: StorageConfig::default(),
            releases: ReleasesConfig::default(),
            cleanup: default_cleanup_retry(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl SkiffConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let oneshot = &self.oneshot;

        if oneshot.name.is_empty() {
            return Err(Error::ConfigValidation("Jail name must not be empty".into()));
        }
        if !oneshot
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::ConfigValidation(format!(
                "Invalid jail name '{}': use letters, digits, '-' or '_'",
                oneshot.name
            )));
        }

        if oneshot.release.trim().is_empty() {
            return Err(Error::ConfigValidation("Release must not be empty".into()));
        }

        if oneshot.max_output_bytes == 0 {
            return Err(Error::ConfigValidation(
                "max_output_bytes must be greater than zero".into(),
            ));
        }

        let network = &oneshot.network;
        let addr = network.address()?;
        network.gateway()?;
        network.binding()?;

        if oneshot.policy == LaunchPolicy::Unique {
            let pool = network.pool()?.ok_or_else(|| {
                Error::ConfigValidation(
                    "The 'unique' policy requires [oneshot.network] pool".into(),
                )
            })?;
            if !pool.contains(&network.gateway()?) {
                return Err(Error::ConfigValidation(format!(
                    "Default router {} is not in pool {}",
                    network.defaultrouter, pool
                )));
            }
        } else if let Some(pool) = network.pool()?
            && !pool.contains(&addr.addr())
        {
            return Err(Error::ConfigValidation(format!(
                "Jail address {} is not in pool {}",
                addr, pool
            )));
        }

        if self.storage.zfs_enabled && self.storage.zpool.is_none() {
            return Err(Error::ConfigValidation(
                "ZFS is enabled but no zpool specified".into(),
            ));
        }

        if self.rate_limit.capacity < 1.0 || self.rate_limit.refill_per_sec <= 0.0 {
            return Err(Error::ConfigValidation(
                "Rate limit needs capacity >= 1 and a positive refill rate".into(),
            ));
        }

        Ok(())
    }
}

/// Web console settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Serve plain HTTP instead of TLS
    #[serde(default)]
    pub insecure: bool,

    /// Directory with js/ and images/ assets (defaults to <home>/static)
    pub static_dir: Option<PathBuf>,
}

fn default_bind() -> String {
    "localhost".into()
}

fn default_port() -> u16 {
    7153
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            insecure: false,
            static_dir: None,
        }
    }
}

/// How concurrent runs share the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchPolicy {
    /// One run at a time under the fixed jail name
    #[default]
    Serialized,
    /// Per-run jail names and addresses drawn from the pool
    Unique,
}

/// One-shot jail settings
#[derive(Debug, Clone, Deserialize)]
pub struct OneShotConfig {
    /// Jail name (base name under the `unique` policy)
    #[serde(default = "default_jail_name")]
    pub name: String,

    /// Base release used to build the jail root
    #[serde(default = "default_release")]
    pub release: String,

    /// Execution timeout in seconds (0 = no timeout)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Largest command output kept, in bytes; the rest is drained and dropped
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Concurrency policy
    #[serde(default)]
    pub policy: LaunchPolicy,

    /// Jail network settings
    #[serde(default)]
    pub network: OneShotNetwork,
}

fn default_jail_name() -> String {
    "one-shot".into()
}

fn default_release() -> String {
    "14.2-RELEASE".into()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

impl OneShotConfig {
    /// Execution timeout, `None` when disabled
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl Default for OneShotConfig {
    fn default() -> Self {
        Self {
            name: default_jail_name(),
            release: default_release(),
            timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            policy: LaunchPolicy::default(),
            network: OneShotNetwork::default(),
        }
    }
}

/// Network settings of the one-shot jail
///
/// Field names follow the classic iocage property names.
#[derive(Debug, Clone, Deserialize)]
pub struct OneShotNetwork {
    /// Give the jail its own network stack
    #[serde(default = "default_vnet")]
    pub vnet: bool,

    /// Jail address with prefix (e.g., "10.0.1.89/24")
    #[serde(default = "default_ip4_addr")]
    pub ip4_addr: String,

    /// Default route inside the jail
    #[serde(default = "default_defaultrouter")]
    pub defaultrouter: String,

    /// Interface binding, "<jail-iface>:<bridge>"
    #[serde(default = "default_interfaces")]
    pub interfaces: String,

    /// Subnet to allocate addresses from under the `unique` policy
    pub pool: Option<String>,
}

fn default_vnet() -> bool {
    true
}

fn default_ip4_addr() -> String {
    "10.0.1.89/24".into()
}

fn default_defaultrouter() -> String {
    "10.0.1.1".into()
}

fn default_interfaces() -> String {
    "vnet0:bridge0".into()
}

impl OneShotNetwork {
    /// Parsed jail address
    pub fn address(&self) -> Result<Ipv4Net> {
        self.ip4_addr.parse().map_err(|e| {
            Error::ConfigValidation(format!("Invalid ip4_addr '{}': {}", self.ip4_addr, e))
        })
    }

    /// Parsed default router
    pub fn gateway(&self) -> Result<Ipv4Addr> {
        self.defaultrouter.parse().map_err(|e| {
            Error::ConfigValidation(format!(
                "Invalid defaultrouter '{}': {}",
                self.defaultrouter, e
            ))
        })
    }

    /// Parsed interface binding
    pub fn binding(&self) -> Result<InterfaceBinding> {
        self.interfaces.parse()
    }

    /// Parsed address pool, if configured
    pub fn pool(&self) -> Result<Option<Ipv4Net>> {
        self.pool
            .as_deref()
            .map(|p| {
                p.parse().map_err(|e| {
                    Error::ConfigValidation(format!("Invalid pool '{}': {}", p, e))
                })
            })
            .transpose()
    }
}

impl Default for OneShotNetwork {
    fn default() -> Self {
        Self {
            vnet: default_vnet(),
            ip4_addr: default_ip4_addr(),
            defaultrouter: default_defaultrouter(),
            interfaces: default_interfaces(),
            pool: None,
        }
    }
}

/// Storage settings for jail roots
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Enable ZFS dataset management
    #[serde(default)]
    pub zfs_enabled: bool,

    /// ZFS pool name (required if zfs_enabled is true)
    pub zpool: Option<String>,

    /// Base dataset name under the pool
    #[serde(default = "default_dataset")]
    pub dataset: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/skiff")
}

fn default_dataset() -> String {
    "skiff".into()
}

impl StorageConfig {
    /// Directory holding non-ZFS jail roots
    pub fn jails_dir(&self) -> PathBuf {
        self.data_dir.join("jails")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            zfs_enabled: false,
            zpool: None,
            dataset: default_dataset(),
        }
    }
}

/// Base release settings
#[derive(Debug, Clone, Deserialize)]
pub struct ReleasesConfig {
    /// Directory for FreeBSD releases
    #[serde(default = "default_releases_dir")]
    pub releases_dir: PathBuf,

    /// Cache directory for downloads
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// FreeBSD mirror URL
    #[serde(default = "default_mirror_url")]
    pub mirror_url: String,

    /// Archives to fetch (base, lib32, ...)
    #[serde(default = "default_archives")]
    pub archives: Vec<String>,
}

fn default_releases_dir() -> PathBuf {
    PathBuf::from("/var/skiff/releases")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/skiff/cache")
}

fn default_mirror_url() -> String {
    "https://download.freebsd.org/releases".into()
}

fn default_archives() -> Vec<String> {
    vec!["base".into()]
}

impl Default for ReleasesConfig {
    fn default() -> Self {
        Self {
            releases_dir: default_releases_dir(),
            cache_dir: default_cache_dir(),
            mirror_url: default_mirror_url(),
            archives: default_archives(),
        }
    }
}

fn default_capacity() -> f64 {
    3.0
}

fn default_refill_per_sec() -> f64 {
    1.0
}

/// Token bucket limiting how fast jails are launched
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Burst size
    #[serde(default = "default_capacity")]
    pub capacity: f64,

    /// Tokens added per second
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_sec: default_refill_per_sec(),
        }
    }
}

// Retry configuration defaults
fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u8 {
    5
}

fn default_jitter_factor() -> f64 {
    0.25
}

fn default_cleanup_retry() -> RetryConfig {
    RetryConfig {
        base_delay_ms: 250,
        max_delay_ms: 5000,
        max_attempts: 3,
        ..RetryConfig::default()
    }
}

/// Retry/backoff configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Base delay in milliseconds before first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds between retries
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Maximum number of retry attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,

    /// Jitter factor (0.0-1.0) to randomize delays
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl RetryConfig {
    /// Backoff strategy for these settings
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new()
            .base_delay_ms(self.base_delay_ms)
            .max_delay_ms(self.max_delay_ms)
            .multiplier(self.multiplier)
            .max_attempts(self.max_attempts)
            .jitter_factor(self.jitter_factor)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            jitter_factor: default_jitter_factor(),
        }
    }
}
