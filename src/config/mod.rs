//! Configuration loading for the permissions sync service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `PERMSYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const ENV_PREFIX: &str = "PERMSYNC_";

/// Application configuration derived from `PERMSYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    /// Redis connection string; an in-process store is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    /// Global prefix prepended to every cache and mutex key.
    #[serde(default = "default_redis_key_prefix")]
    pub redis_key_prefix: String,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub gitlab: GitLabConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// GitHub code host connection. The provider is enabled when `url` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct GitHubConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Defaults to `https://api.github.com/` for github.com and `<url>/api/v3/` otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_github_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
}

impl GitHubConfig {
    /// Resolve the REST API base URL for the configured code host.
    pub fn resolved_api_url(&self) -> Result<Option<Url>, ConfigError> {
        let Some(base) = self.url.as_deref() else {
            return Ok(None);
        };
        if let Some(api) = self.api_url.as_deref() {
            return parse_url("GITHUB_API_URL", api).map(Some);
        }
        let base = parse_url("GITHUB_URL", base)?;
        let api = if base.host_str() == Some("github.com") {
            "https://api.github.com/".to_string()
        } else {
            format!("{}/api/v3/", base.as_str().trim_end_matches('/'))
        };
        parse_url("GITHUB_API_URL", &api).map(Some)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

/// GitLab code host connection. The provider is enabled when `url` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct GitLabConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Background sync worker parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct WorkerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_worker_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_worker_concurrency")]
    pub concurrency: usize,
    /// Failures after which a job is marked `failed` instead of `errored`.
    #[serde(default = "default_worker_max_attempts")]
    pub max_attempts: i32,
    #[serde(default = "default_worker_max_run_seconds")]
    pub max_run_seconds: u64,
    #[serde(default = "default_worker_backoff_base_seconds")]
    pub backoff_base_seconds: u64,
    #[serde(default = "default_worker_backoff_max_seconds")]
    pub backoff_max_seconds: u64,
    /// Processing jobs without a heartbeat for this long are requeued.
    #[serde(default = "default_worker_stalled_after_seconds")]
    pub stalled_after_seconds: u64,
}

/// Scheduler parameters for enqueuing jobs for subjects with missing or stale permissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_scheduler_tick_interval_seconds")]
    pub tick_interval_seconds: u64,
    #[serde(default = "default_scheduler_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_perms_stale_after_seconds")]
    pub perms_stale_after_seconds: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: String::new(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            operator_tokens: Vec::new(),
            redis_url: None,
            redis_key_prefix: default_redis_key_prefix(),
            github: GitHubConfig::default(),
            gitlab: GitLabConfig::default(),
            worker: WorkerConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_url: None,
            token: None,
            cache_ttl_seconds: default_github_cache_ttl_seconds(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: default_worker_poll_interval_ms(),
            concurrency: default_worker_concurrency(),
            max_attempts: default_worker_max_attempts(),
            max_run_seconds: default_worker_max_run_seconds(),
            backoff_base_seconds: default_worker_backoff_base_seconds(),
            backoff_max_seconds: default_worker_backoff_max_seconds(),
            stalled_after_seconds: default_worker_stalled_after_seconds(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_seconds: default_scheduler_tick_interval_seconds(),
            batch_size: default_scheduler_batch_size(),
            perms_stale_after_seconds: default_perms_stale_after_seconds(),
        }
    }
}

impl WorkerConfig {
    /// Validate worker configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 || self.concurrency > 64 {
            return Err(ConfigError::InvalidWorkerConcurrency {
                value: self.concurrency,
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidWorkerPollInterval {
                value: self.poll_interval_ms,
            });
        }
        if self.max_attempts < 1 {
            return Err(ConfigError::InvalidWorkerMaxAttempts {
                value: self.max_attempts,
            });
        }
        if self.backoff_base_seconds > self.backoff_max_seconds {
            return Err(ConfigError::InvalidBackoffBounds {
                base: self.backoff_base_seconds,
                max: self.backoff_max_seconds,
            });
        }
        Ok(())
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_seconds < 1 || self.tick_interval_seconds > 3600 {
            return Err(ConfigError::InvalidSchedulerTickInterval {
                value: self.tick_interval_seconds,
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidSchedulerBatchSize {
                value: self.batch_size,
            });
        }
        Ok(())
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.perms_stale_after_seconds as i64)
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    fn is_local_profile(&self) -> bool {
        matches!(self.profile.as_str(), "local" | "test")
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec!["[REDACTED]".to_string()];
        }
        if config.redis_url.is_some() {
            config.redis_url = Some("[REDACTED]".to_string());
        }
        if !config.database_url.is_empty() {
            config.database_url = "[REDACTED]".to_string();
        }
        if config.github.token.is_some() {
            config.github.token = Some("[REDACTED]".to_string());
        }
        if config.gitlab.token.is_some() {
            config.gitlab.token = Some("[REDACTED]".to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_bind_addr.trim().is_empty() {
            return Err(ConfigError::MissingBindAddr);
        }

        if !self.is_local_profile() {
            if self.database_url.is_empty() {
                return Err(ConfigError::MissingDatabaseUrl);
            }
            if self.operator_tokens.is_empty() {
                return Err(ConfigError::MissingOperatorTokens);
            }
            if self.redis_url.is_none() {
                return Err(ConfigError::MissingRedisUrl);
            }
        }

        if let Some(redis_url) = self.redis_url.as_deref() {
            parse_url("REDIS_URL", redis_url)?;
        }

        if self.github.cache_ttl_seconds == 0 {
            return Err(ConfigError::InvalidCacheTtl {
                value: self.github.cache_ttl_seconds,
            });
        }
        self.github.resolved_api_url()?;
        if let Some(url) = self.gitlab.url.as_deref() {
            parse_url("GITLAB_URL", url)?;
        }

        self.worker.validate()?;
        self.scheduler.validate()?;

        Ok(())
    }
}

pub(crate) fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
        source,
    })
}

fn default_true() -> bool {
    true
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_redis_key_prefix() -> String {
    "v2".to_string()
}

fn default_github_cache_ttl_seconds() -> u64 {
    10800 // 3 hours
}

fn default_worker_poll_interval_ms() -> u64 {
    1000
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_worker_max_attempts() -> i32 {
    3
}

fn default_worker_max_run_seconds() -> u64 {
    300
}

fn default_worker_backoff_base_seconds() -> u64 {
    5
}

fn default_worker_backoff_max_seconds() -> u64 {
    900 // 15 minutes
}

fn default_worker_stalled_after_seconds() -> u64 {
    600
}

fn default_scheduler_tick_interval_seconds() -> u64 {
    60
}

fn default_scheduler_batch_size() -> u64 {
    100
}

fn default_perms_stale_after_seconds() -> u64 {
    259200 // 3 days
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("api bind address must not be empty")]
    MissingBindAddr,
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("database URL is missing; set PERMSYNC_DATABASE_URL")]
    MissingDatabaseUrl,
    #[error("no operator tokens configured; set PERMSYNC_OPERATOR_TOKEN or PERMSYNC_OPERATOR_TOKENS")]
    MissingOperatorTokens,
    #[error("redis URL is missing; set PERMSYNC_REDIS_URL")]
    MissingRedisUrl,
    #[error("invalid {field} '{value}': {source}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        source: url::ParseError,
    },
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("authz cache TTL must be positive, got {value}")]
    InvalidCacheTtl { value: u64 },
    #[error("worker concurrency must be between 1 and 64, got {value}")]
    InvalidWorkerConcurrency { value: usize },
    #[error("worker poll interval must be positive, got {value}")]
    InvalidWorkerPollInterval { value: u64 },
    #[error("worker max attempts must be at least 1, got {value}")]
    InvalidWorkerMaxAttempts { value: i32 },
    #[error("worker backoff base seconds ({base}) cannot be greater than max seconds ({max})")]
    InvalidBackoffBounds { base: u64, max: u64 },
    #[error("scheduler tick interval must be between 1 and 3600 seconds, got {value}")]
    InvalidSchedulerTickInterval { value: u64 },
    #[error("scheduler batch size must be positive, got {value}")]
    InvalidSchedulerBatchSize { value: u64 },
}

/// Loads configuration using layered `.env` files and `PERMSYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration. Process environment wins over files.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);

        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            split_list(&tokens)
        } else if let Some(token) = take_string(&mut layered, "OPERATOR_TOKEN") {
            vec![token]
        } else {
            Vec::new()
        };

        let github = GitHubConfig {
            url: take_string(&mut layered, "GITHUB_URL"),
            api_url: take_string(&mut layered, "GITHUB_API_URL"),
            token: take_string(&mut layered, "GITHUB_TOKEN"),
            cache_ttl_seconds: take_parsed(&mut layered, "GITHUB_CACHE_TTL_SECONDS")?
                .unwrap_or_else(default_github_cache_ttl_seconds),
        };

        let gitlab = GitLabConfig {
            url: take_string(&mut layered, "GITLAB_URL"),
            token: take_string(&mut layered, "GITLAB_TOKEN"),
        };

        let worker = WorkerConfig {
            enabled: take_parsed(&mut layered, "WORKER_ENABLED")?.unwrap_or(true),
            poll_interval_ms: take_parsed(&mut layered, "WORKER_POLL_INTERVAL_MS")?
                .unwrap_or_else(default_worker_poll_interval_ms),
            concurrency: take_parsed(&mut layered, "WORKER_CONCURRENCY")?
                .unwrap_or_else(default_worker_concurrency),
            max_attempts: take_parsed(&mut layered, "WORKER_MAX_ATTEMPTS")?
                .unwrap_or_else(default_worker_max_attempts),
            max_run_seconds: take_parsed(&mut layered, "WORKER_MAX_RUN_SECONDS")?
                .unwrap_or_else(default_worker_max_run_seconds),
            backoff_base_seconds: take_parsed(&mut layered, "WORKER_BACKOFF_BASE_SECONDS")?
                .unwrap_or_else(default_worker_backoff_base_seconds),
            backoff_max_seconds: take_parsed(&mut layered, "WORKER_BACKOFF_MAX_SECONDS")?
                .unwrap_or_else(default_worker_backoff_max_seconds),
            stalled_after_seconds: take_parsed(&mut layered, "WORKER_STALLED_AFTER_SECONDS")?
                .unwrap_or_else(default_worker_stalled_after_seconds),
        };

        let scheduler = SchedulerConfig {
            enabled: take_parsed(&mut layered, "SCHEDULER_ENABLED")?.unwrap_or(true),
            tick_interval_seconds: take_parsed(&mut layered, "SCHEDULER_TICK_INTERVAL_SECONDS")?
                .unwrap_or_else(default_scheduler_tick_interval_seconds),
            batch_size: take_parsed(&mut layered, "SCHEDULER_BATCH_SIZE")?
                .unwrap_or_else(default_scheduler_batch_size),
            perms_stale_after_seconds: take_parsed(&mut layered, "PERMS_STALE_AFTER_SECONDS")?
                .unwrap_or_else(default_perms_stale_after_seconds),
        };

        let config = AppConfig {
            profile,
            api_bind_addr: take_string(&mut layered, "API_BIND_ADDR")
                .unwrap_or_else(default_api_bind_addr),
            log_level: take_string(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level),
            log_format: take_string(&mut layered, "LOG_FORMAT")
                .unwrap_or_else(default_log_format),
            database_url: take_string(&mut layered, "DATABASE_URL").unwrap_or_default(),
            db_max_connections: take_parsed(&mut layered, "DB_MAX_CONNECTIONS")?
                .unwrap_or_else(default_db_max_connections),
            db_acquire_timeout_ms: take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")?
                .unwrap_or_else(default_db_acquire_timeout_ms),
            operator_tokens,
            redis_url: take_string(&mut layered, "REDIS_URL"),
            redis_key_prefix: take_string(&mut layered, "REDIS_KEY_PREFIX")
                .unwrap_or_else(default_redis_key_prefix),
            github,
            gitlab,
            worker,
            scheduler,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(values: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    values
        .remove(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn take_parsed<T: std::str::FromStr>(
    values: &mut BTreeMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match take_string(values, key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}{key}"),
                value: raw,
            }),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
