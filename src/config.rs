//! Configuration loading.
//!
//! Everything lives in one human-owned `gatekeeper.toml`. Every section has
//! defaults, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Filesystem locations.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Proof signing and verification keys.
    #[serde(default)]
    pub signing: SigningConfig,

    /// Admission chain tuning.
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Periodic drift scanning.
    #[serde(default)]
    pub drift: DriftConfig,

    /// Automatic remediation limits.
    #[serde(default)]
    pub remediation: RemediationConfig,

    /// Policy loading.
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Filesystem locations. Relative paths resolve against the config directory.
#[derive(Debug, Deserialize)]
pub struct PathsConfig {
    /// SQLite database file.
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Directory for rotated JSON logs.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// Directory of `<policy_set>.json` bundles to watch.
    #[serde(default)]
    pub policy_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            logs_dir: default_logs_dir(),
            policy_dir: None,
        }
    }
}

impl PathsConfig {
    /// Resolve `path` against `base` unless it is already absolute.
    pub fn resolve(base: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base.join(path)
        }
    }
}

/// Signing authority of this process and extra keys it trusts.
#[derive(Debug, Clone, Deserialize)]
pub struct SigningConfig {
    /// Authority written into issued proofs.
    #[serde(default = "default_authority")]
    pub authority: String,

    /// Environment variable holding the signing secret.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,

    /// Optional `.env` file consulted when the variable is unset.
    #[serde(default)]
    pub env_file: Option<PathBuf>,

    /// Other authorities whose proofs are accepted.
    #[serde(default)]
    pub trusted: Vec<TrustedSigner>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            authority: default_authority(),
            secret_env: default_secret_env(),
            env_file: None,
            trusted: Vec::new(),
        }
    }
}

/// A verify-only key.
#[derive(Debug, Clone, Deserialize)]
pub struct TrustedSigner {
    /// Authority name as it appears in proofs.
    pub authority: String,
    /// Environment variable holding that authority's secret.
    pub secret_env: String,
}

/// Admission chain tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Starts allowed per agent per window. 0 disables the rate limiter.
    #[serde(default)]
    pub max_starts_per_window: u32,

    /// Rate limit window in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Warn about sandbox expiry this many hours ahead.
    #[serde(default = "default_expiry_warning_hours")]
    pub expiry_warning_hours: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_starts_per_window: 0,
            window_secs: default_window_secs(),
            expiry_warning_hours: default_expiry_warning_hours(),
        }
    }
}

/// Periodic drift scanning.
#[derive(Debug, Deserialize)]
pub struct DriftConfig {
    /// Run the scheduler under `serve`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between scans.
    #[serde(default = "default_drift_interval")]
    pub interval_secs: u64,

    /// Reconcile drifted agents after each scan.
    #[serde(default = "default_true")]
    pub auto_reconcile: bool,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_drift_interval(),
            auto_reconcile: true,
        }
    }
}

/// Automatic remediation limits.
#[derive(Debug, Deserialize)]
pub struct RemediationConfig {
    /// Largest number of agents remediated in one batch.
    #[serde(default = "default_max_blast_radius")]
    pub max_blast_radius: usize,

    /// Apply all-safe plans during reconciliation.
    #[serde(default)]
    pub auto_apply_safe: bool,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            max_blast_radius: default_max_blast_radius(),
            auto_apply_safe: false,
        }
    }
}

/// Policy loading.
#[derive(Debug, Deserialize)]
pub struct PolicyConfig {
    /// Policy sets restored from the bundle store at startup.
    #[serde(default)]
    pub policy_sets: Vec<String>,

    /// Re-issue proofs for compliant agents after a reload.
    #[serde(default = "default_true")]
    pub reattest_on_reload: bool,

    /// Replaces the built-in capability allow-list.
    #[serde(default)]
    pub allowed_capabilities: Option<Vec<String>>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            policy_sets: Vec::new(),
            reattest_on_reload: true,
            allowed_capabilities: None,
        }
    }
}

// Default value functions for serde

fn default_database() -> PathBuf {
    PathBuf::from("gatekeeper.db")
}
fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_authority() -> String {
    "gatekeeper".to_owned()
}
fn default_secret_env() -> String {
    "GATEKEEPER_SIGNING_SECRET".to_owned()
}
fn default_window_secs() -> u64 {
    60
}
fn default_expiry_warning_hours() -> u32 {
    24
}
fn default_drift_interval() -> u64 {
    600
}
fn default_max_blast_radius() -> usize {
    10
}
fn default_true() -> bool {
    true
}

/// Load the config from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    Ok(config)
}

/// Load `path` if it exists, otherwise return the defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

/// Resolve the default config directory (`~/.gatekeeper/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".gatekeeper"))
}
