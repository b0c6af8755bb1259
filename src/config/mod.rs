//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{num::NonZeroUsize, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::DependencyScope;

pub use cli::{CliArgs, Command, GlobalOverrides, InvalidateArgs, RefreshArgs, RunArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "whisper";
const DEFAULT_SERVICE: &str = "whisper";
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_POOL_SIZE: u64 = 16;
const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_TTL_INSTANT_SECS: u64 = 30;
const DEFAULT_TTL_SHORT_SECS: u64 = 300;
const DEFAULT_TTL_MEDIUM_SECS: u64 = 1_800;
const DEFAULT_TTL_DEFAULT_SECS: u64 = 3_600;
const DEFAULT_TTL_LONG_SECS: u64 = 86_400;
const DEFAULT_TTL_FOREVER_SECS: u64 = 0;
const DEFAULT_TTL_NULL_VALUE_SECS: u64 = 60;
const DEFAULT_TTL_LOCK_SECS: u64 = 10;
const DEFAULT_JITTER_RATIO: f64 = 0.1;
const DEFAULT_JITTER_CAP_SECS: u64 = 300;
const DEFAULT_STATS_SAMPLE_RATE: f64 = 0.1;
const DEFAULT_STATS_PERSIST_EVERY: u64 = 100;
const DEFAULT_STATS_HOT_KEYS: u64 = 10;
const DEFAULT_LOCK_WAIT_MS: u64 = 50;
const DEFAULT_LOCK_RETRIES: u32 = 20;
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 300;
const DEFAULT_REFRESH_HIT_THRESHOLD: u64 = 10;
const DEFAULT_REFRESH_PRELOAD_THRESHOLD: f64 = 0.8;
const DEFAULT_REFRESH_PARALLELISM: u64 = 5;
const DEFAULT_REFRESH_MAX_CANDIDATES: u64 = 100;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub backend: BackendSettings,
    pub cache: CacheSettings,
    pub refresh: RefreshSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Redis,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown backend kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub url: String,
    pub pool_size: usize,
    pub timeout: Duration,
}

/// TTL tiers. A zero duration means "no expiry".
#[derive(Debug, Clone)]
pub struct TtlSettings {
    pub instant: Duration,
    pub short: Duration,
    pub medium: Duration,
    pub default: Duration,
    pub long: Duration,
    pub forever: Duration,
    pub null_value: Duration,
    pub lock: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub service: String,
    pub ttl: TtlSettings,
    pub jitter_ratio: f64,
    pub jitter_cap: Duration,
    pub stats_sample_rate: f64,
    pub stats_persist_every: u64,
    pub stats_hot_keys: usize,
    pub penetration_protection: bool,
    pub lock_wait: Duration,
    pub lock_retries: u32,
    pub dependency_scope: DependencyScope,
}

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub hit_threshold: u64,
    pub preload_threshold: f64,
    pub parallelism: NonZeroUsize,
    pub max_candidates: usize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("WHISPER").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_global_overrides(&cli.overrides);
    if let Some(Command::Run(args)) = cli.command.as_ref() {
        raw.apply_run_overrides(args);
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

impl Default for Settings {
    fn default() -> Self {
        // Every raw field is optional and every default is valid.
        match Settings::from_raw(RawSettings::default()) {
            Ok(settings) => settings,
            Err(err) => unreachable!("default settings must validate: {err}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    backend: RawBackendSettings,
    cache: RawCacheSettings,
    refresh: RawRefreshSettings,
}

impl RawSettings {
    fn apply_global_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(kind) = overrides.backend_kind.as_ref() {
            self.backend.kind = Some(kind.clone());
        }
        if let Some(url) = overrides.backend_url.as_ref() {
            self.backend.url = Some(url.clone());
        }
        if let Some(service) = overrides.cache_service.as_ref() {
            self.cache.service = Some(service.clone());
        }
    }

    fn apply_run_overrides(&mut self, overrides: &RunArgs) {
        if let Some(enabled) = overrides.refresh_enabled {
            self.refresh.enabled = Some(enabled);
        }
        if let Some(seconds) = overrides.refresh_interval_seconds {
            self.refresh.interval_seconds = Some(seconds);
        }
        if let Some(threshold) = overrides.refresh_hit_threshold {
            self.refresh.hit_threshold = Some(threshold);
        }
        if let Some(parallelism) = overrides.refresh_parallelism {
            self.refresh.parallelism = Some(parallelism);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            backend,
            cache,
            refresh,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            backend: build_backend_settings(backend)?,
            cache: build_cache_settings(cache)?,
            refresh: build_refresh_settings(refresh)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_backend_settings(backend: RawBackendSettings) -> Result<BackendSettings, LoadError> {
    let kind = match backend.kind {
        Some(kind) => {
            BackendKind::from_str(&kind).map_err(|reason| LoadError::invalid("backend.kind", reason))?
        }
        None => BackendKind::Memory,
    };

    let url = backend
        .url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());

    let pool_size = non_zero_usize(
        backend.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
        "backend.pool_size",
    )?
    .get();

    let timeout_ms = backend.timeout_ms.unwrap_or(DEFAULT_BACKEND_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "backend.timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(BackendSettings {
        kind,
        url,
        pool_size,
        timeout: Duration::from_millis(timeout_ms),
    })
}

fn build_ttl_settings(ttl: RawTtlSettings) -> Result<TtlSettings, LoadError> {
    let seconds = |value: Option<u64>, default: u64| Duration::from_secs(value.unwrap_or(default));

    let null_value = seconds(ttl.null_value, DEFAULT_TTL_NULL_VALUE_SECS);
    if null_value.is_zero() {
        return Err(LoadError::invalid(
            "cache.ttl.null_value",
            "null markers must expire",
        ));
    }

    let lock = seconds(ttl.lock, DEFAULT_TTL_LOCK_SECS);
    if lock.is_zero() {
        return Err(LoadError::invalid("cache.ttl.lock", "locks must expire"));
    }

    Ok(TtlSettings {
        instant: seconds(ttl.instant, DEFAULT_TTL_INSTANT_SECS),
        short: seconds(ttl.short, DEFAULT_TTL_SHORT_SECS),
        medium: seconds(ttl.medium, DEFAULT_TTL_MEDIUM_SECS),
        default: seconds(ttl.default, DEFAULT_TTL_DEFAULT_SECS),
        long: seconds(ttl.long, DEFAULT_TTL_LONG_SECS),
        forever: seconds(ttl.forever, DEFAULT_TTL_FOREVER_SECS),
        null_value,
        lock,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let service = cache
        .service
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_SERVICE.to_string());
    if service.is_empty() || service.contains(':') || service.contains('*') {
        return Err(LoadError::invalid(
            "cache.service",
            "must be non-empty and contain neither `:` nor `*`",
        ));
    }

    let jitter_ratio = unit_interval(
        cache.jitter_ratio.unwrap_or(DEFAULT_JITTER_RATIO),
        "cache.jitter_ratio",
    )?;
    let stats_sample_rate = unit_interval(
        cache.stats_sample_rate.unwrap_or(DEFAULT_STATS_SAMPLE_RATE),
        "cache.stats_sample_rate",
    )?;

    let stats_persist_every = cache
        .stats_persist_every
        .unwrap_or(DEFAULT_STATS_PERSIST_EVERY);
    if stats_persist_every == 0 {
        return Err(LoadError::invalid(
            "cache.stats_persist_every",
            "must be greater than zero",
        ));
    }

    let stats_hot_keys = non_zero_usize(
        cache.stats_hot_keys.unwrap_or(DEFAULT_STATS_HOT_KEYS),
        "cache.stats_hot_keys",
    )?
    .get();

    let lock_wait_ms = cache.lock_wait_ms.unwrap_or(DEFAULT_LOCK_WAIT_MS);
    if lock_wait_ms == 0 {
        return Err(LoadError::invalid(
            "cache.lock_wait_ms",
            "must be greater than zero",
        ));
    }

    let dependency_scope = match cache.dependency_scope {
        Some(scope) => DependencyScope::from_str(&scope)
            .map_err(|reason| LoadError::invalid("cache.dependency_scope", reason))?,
        None => DependencyScope::Shared,
    };

    Ok(CacheSettings {
        service,
        ttl: build_ttl_settings(cache.ttl)?,
        jitter_ratio,
        jitter_cap: Duration::from_secs(cache.jitter_cap_seconds.unwrap_or(DEFAULT_JITTER_CAP_SECS)),
        stats_sample_rate,
        stats_persist_every,
        stats_hot_keys,
        penetration_protection: cache.penetration_protection.unwrap_or(true),
        lock_wait: Duration::from_millis(lock_wait_ms),
        lock_retries: cache.lock_retries.unwrap_or(DEFAULT_LOCK_RETRIES),
        dependency_scope,
    })
}

fn build_refresh_settings(refresh: RawRefreshSettings) -> Result<RefreshSettings, LoadError> {
    let interval_seconds = refresh
        .interval_seconds
        .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS);
    if interval_seconds == 0 {
        return Err(LoadError::invalid(
            "refresh.interval_seconds",
            "must be greater than zero",
        ));
    }

    let preload_threshold = refresh
        .preload_threshold
        .unwrap_or(DEFAULT_REFRESH_PRELOAD_THRESHOLD);
    if !(preload_threshold > 0.0 && preload_threshold <= 1.0) {
        return Err(LoadError::invalid(
            "refresh.preload_threshold",
            "must be within (0, 1]",
        ));
    }

    let parallelism = non_zero_usize(
        refresh.parallelism.unwrap_or(DEFAULT_REFRESH_PARALLELISM),
        "refresh.parallelism",
    )?;

    let max_candidates = non_zero_usize(
        refresh
            .max_candidates
            .unwrap_or(DEFAULT_REFRESH_MAX_CANDIDATES),
        "refresh.max_candidates",
    )?
    .get();

    Ok(RefreshSettings {
        enabled: refresh.enabled.unwrap_or(true),
        interval: Duration::from_secs(interval_seconds),
        hit_threshold: refresh.hit_threshold.unwrap_or(DEFAULT_REFRESH_HIT_THRESHOLD),
        preload_threshold,
        parallelism,
        max_candidates,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackendSettings {
    kind: Option<String>,
    url: Option<String>,
    pool_size: Option<u64>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTtlSettings {
    instant: Option<u64>,
    short: Option<u64>,
    medium: Option<u64>,
    default: Option<u64>,
    long: Option<u64>,
    forever: Option<u64>,
    null_value: Option<u64>,
    lock: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    service: Option<String>,
    ttl: RawTtlSettings,
    jitter_ratio: Option<f64>,
    jitter_cap_seconds: Option<u64>,
    stats_sample_rate: Option<f64>,
    stats_persist_every: Option<u64>,
    stats_hot_keys: Option<u64>,
    penetration_protection: Option<bool>,
    lock_wait_ms: Option<u64>,
    lock_retries: Option<u32>,
    dependency_scope: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRefreshSettings {
    enabled: Option<bool>,
    interval_seconds: Option<u64>,
    hit_threshold: Option<u64>,
    preload_threshold: Option<f64>,
    parallelism: Option<u64>,
    max_candidates: Option<u64>,
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn unit_interval(value: f64, key: &'static str) -> Result<f64, LoadError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(LoadError::invalid(key, "must be within [0, 1]"))
    }
}

#[cfg(test)]
mod tests;
