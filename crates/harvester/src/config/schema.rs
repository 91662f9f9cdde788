use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub accounts: AccountsConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            accounts: AccountsConfig::default(),
            dispatch: DispatchConfig::default(),
            logging: LoggingConfig::default(),
            secrets: SecretsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Falls back to `~/.harvester/data/harvester.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path
            .as_ref()
            .map(|p| crate::secrets::expand_tilde(&p.to_string_lossy()))
            .or_else(crate::db::default_database_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Only jobs that failed within this window are restarted automatically.
    #[serde(default = "default_failed_restart_window_mins")]
    pub failed_restart_window_mins: u64,
    #[serde(default = "default_failed_restart_limit")]
    pub failed_restart_limit: u32,
    #[serde(default = "default_max_auto_restarts")]
    pub max_auto_restarts: u32,
}

fn default_max_concurrent_jobs() -> usize {
    3
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_failed_restart_window_mins() -> u64 {
    60
}

fn default_failed_restart_limit() -> u32 {
    5
}

fn default_max_auto_restarts() -> u32 {
    1
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            poll_interval_secs: default_poll_interval_secs(),
            failed_restart_window_mins: default_failed_restart_window_mins(),
            failed_restart_limit: default_failed_restart_limit(),
            max_auto_restarts: default_max_auto_restarts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per URL, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Wait before reusing an account after an account failure with no
    /// alternate available.
    #[serde(default = "default_account_backoff_ms")]
    pub account_backoff_ms: u64,
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_account_backoff_ms() -> u64 {
    300_000
}

fn default_jitter_ratio() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            account_backoff_ms: default_account_backoff_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountsConfig {
    #[serde(default = "default_rate_limit_cooldown_mins")]
    pub rate_limit_cooldown_mins: u64,
    #[serde(default = "default_max_rate_limit_cooldown_mins")]
    pub max_rate_limit_cooldown_mins: u64,
    #[serde(default = "default_blocked_hours")]
    pub blocked_hours: u64,
    #[serde(default = "default_account_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_soft_cooldown_mins")]
    pub soft_cooldown_mins: u64,
    #[serde(default = "default_daily_limit")]
    pub default_daily_limit: u32,
}

fn default_rate_limit_cooldown_mins() -> u64 {
    15
}

fn default_max_rate_limit_cooldown_mins() -> u64 {
    60
}

fn default_blocked_hours() -> u64 {
    24
}

fn default_account_max_consecutive_failures() -> u32 {
    5
}

fn default_soft_cooldown_mins() -> u64 {
    10
}

fn default_daily_limit() -> u32 {
    100
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            rate_limit_cooldown_mins: default_rate_limit_cooldown_mins(),
            max_rate_limit_cooldown_mins: default_max_rate_limit_cooldown_mins(),
            blocked_hours: default_blocked_hours(),
            max_consecutive_failures: default_account_max_consecutive_failures(),
            soft_cooldown_mins: default_soft_cooldown_mins(),
            default_daily_limit: default_daily_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    /// Consecutive failed URLs after which a job pauses for manual review.
    #[serde(default = "default_job_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_max_eligibility_wait_secs")]
    pub max_eligibility_wait_secs: u64,
    #[serde(default = "default_max_eligibility_waits")]
    pub max_eligibility_waits: u32,
    #[serde(default = "default_failure_rate_window")]
    pub failure_rate_window: usize,
}

fn default_request_delay_ms() -> u64 {
    3_000
}

fn default_job_max_consecutive_failures() -> u32 {
    5
}

fn default_max_eligibility_wait_secs() -> u64 {
    900
}

fn default_max_eligibility_waits() -> u32 {
    12
}

fn default_failure_rate_window() -> usize {
    20
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_delay_ms: default_request_delay_ms(),
            max_consecutive_failures: default_job_max_consecutive_failures(),
            max_eligibility_wait_secs: default_max_eligibility_wait_secs(),
            max_eligibility_waits: default_max_eligibility_waits(),
            failure_rate_window: default_failure_rate_window(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Where the cookie encryption key comes from, in priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default)]
    pub cookie_key: Option<String>,
    #[serde(default)]
    pub cookie_key_file: Option<String>,
    #[serde(default = "default_cookie_key_env_var")]
    pub cookie_key_env_var: Option<String>,
}

fn default_cookie_key_env_var() -> Option<String> {
    Some("HARVESTER_COOKIE_KEY".to_string())
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            cookie_key: None,
            cookie_key_file: None,
            cookie_key_env_var: default_cookie_key_env_var(),
        }
    }
}
