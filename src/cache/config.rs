//! Cache configuration.
//!
//! Runtime knobs for the store, read-through adapter and refresh scheduler,
//! resolved from `[cache]` and `[refresh]` in `whisper.toml`.

use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use super::keys::Module;

const DEFAULT_SERVICE: &str = "whisper";
const DEFAULT_JITTER_RATIO: f64 = 0.1;
const DEFAULT_JITTER_CAP: Duration = Duration::from_secs(300);
const DEFAULT_STATS_SAMPLE_RATE: f64 = 0.1;
const DEFAULT_STATS_PERSIST_EVERY: u64 = 100;
const DEFAULT_STATS_HOT_KEYS: usize = 10;
const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(50);
const DEFAULT_LOCK_RETRIES: u32 = 20;
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_REFRESH_HIT_THRESHOLD: u64 = 10;
const DEFAULT_REFRESH_PRELOAD_THRESHOLD: f64 = 0.8;
const DEFAULT_REFRESH_PARALLELISM: NonZeroUsize = match NonZeroUsize::new(5) {
    Some(parallelism) => parallelism,
    None => NonZeroUsize::MIN,
};
const DEFAULT_REFRESH_MAX_CANDIDATES: usize = 100;

/// Named TTL classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TtlTier {
    Instant,
    Short,
    Medium,
    Default,
    Long,
    Forever,
    NullValue,
    Lock,
}

/// Concrete durations for every [`TtlTier`]. Zero means no expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlTiers {
    pub instant: Duration,
    pub short: Duration,
    pub medium: Duration,
    pub default: Duration,
    pub long: Duration,
    pub forever: Duration,
    pub null_value: Duration,
    pub lock: Duration,
}

impl Default for TtlTiers {
    fn default() -> Self {
        Self {
            instant: Duration::from_secs(30),
            short: Duration::from_secs(300),
            medium: Duration::from_secs(1_800),
            default: Duration::from_secs(3_600),
            long: Duration::from_secs(86_400),
            forever: Duration::ZERO,
            null_value: Duration::from_secs(60),
            lock: Duration::from_secs(10),
        }
    }
}

impl TtlTiers {
    pub fn get(&self, tier: TtlTier) -> Duration {
        match tier {
            TtlTier::Instant => self.instant,
            TtlTier::Short => self.short,
            TtlTier::Medium => self.medium,
            TtlTier::Default => self.default,
            TtlTier::Long => self.long,
            TtlTier::Forever => self.forever,
            TtlTier::NullValue => self.null_value,
            TtlTier::Lock => self.lock,
        }
    }
}

impl From<&crate::config::TtlSettings> for TtlTiers {
    fn from(settings: &crate::config::TtlSettings) -> Self {
        Self {
            instant: settings.instant,
            short: settings.short,
            medium: settings.medium,
            default: settings.default,
            long: settings.long,
            forever: settings.forever,
            null_value: settings.null_value,
            lock: settings.lock,
        }
    }
}

/// How a caller expresses the lifetime of a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlHint {
    Tier(TtlTier),
    Exact(Duration),
    /// Use the default tier of the module the value belongs to.
    Module(Module),
    Default,
}

impl TtlHint {
    pub fn resolve(&self, tiers: &TtlTiers) -> Duration {
        match self {
            TtlHint::Tier(tier) => tiers.get(*tier),
            TtlHint::Exact(ttl) => *ttl,
            TtlHint::Module(module) => tiers.get(module_tier(*module)),
            TtlHint::Default => tiers.default,
        }
    }
}

impl From<Duration> for TtlHint {
    fn from(ttl: Duration) -> Self {
        TtlHint::Exact(ttl)
    }
}

impl From<TtlTier> for TtlHint {
    fn from(tier: TtlTier) -> Self {
        TtlHint::Tier(tier)
    }
}

impl From<Module> for TtlHint {
    fn from(module: Module) -> Self {
        TtlHint::Module(module)
    }
}

fn module_tier(module: Module) -> TtlTier {
    match module {
        Module::User | Module::Confession | Module::Statistics => TtlTier::Medium,
        Module::Chat | Module::Notification => TtlTier::Short,
        Module::Lock => TtlTier::Lock,
        Module::System => TtlTier::Forever,
    }
}

/// Where dependency edges live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependencyScope {
    /// In this process only; lost on restart.
    Local,
    /// In the backing store, visible to every process sharing it.
    #[default]
    Shared,
}

impl DependencyScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyScope::Local => "local",
            DependencyScope::Shared => "shared",
        }
    }
}

impl fmt::Display for DependencyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyScope {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "shared" => Ok(Self::Shared),
            other => Err(format!("unknown dependency scope `{other}`")),
        }
    }
}

/// Store and read-through settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Key prefix shared by every entry of this deployment.
    pub service: String,
    pub ttl: TtlTiers,
    /// Fraction of a TTL used as the jitter bound.
    pub jitter_ratio: f64,
    /// Absolute upper bound on the jitter offset.
    pub jitter_cap: Duration,
    /// Disables jitter and statistics sampling randomness.
    pub deterministic: bool,
    pub stats_sample_rate: f64,
    /// Persist the statistics snapshot after this many samples.
    pub stats_persist_every: u64,
    pub stats_hot_keys: usize,
    pub penetration_protection: bool,
    /// Pause between attempts while another caller holds the key lock.
    pub lock_wait: Duration,
    pub lock_retries: u32,
    pub dependency_scope: DependencyScope,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE.to_string(),
            ttl: TtlTiers::default(),
            jitter_ratio: DEFAULT_JITTER_RATIO,
            jitter_cap: DEFAULT_JITTER_CAP,
            deterministic: false,
            stats_sample_rate: DEFAULT_STATS_SAMPLE_RATE,
            stats_persist_every: DEFAULT_STATS_PERSIST_EVERY,
            stats_hot_keys: DEFAULT_STATS_HOT_KEYS,
            penetration_protection: true,
            lock_wait: DEFAULT_LOCK_WAIT,
            lock_retries: DEFAULT_LOCK_RETRIES,
            dependency_scope: DependencyScope::default(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            service: settings.service.clone(),
            ttl: TtlTiers::from(&settings.ttl),
            jitter_ratio: settings.jitter_ratio,
            jitter_cap: settings.jitter_cap,
            deterministic: false,
            stats_sample_rate: settings.stats_sample_rate,
            stats_persist_every: settings.stats_persist_every,
            stats_hot_keys: settings.stats_hot_keys,
            penetration_protection: settings.penetration_protection,
            lock_wait: settings.lock_wait,
            lock_retries: settings.lock_retries,
            dependency_scope: settings.dependency_scope,
        }
    }
}

impl CacheConfig {
    /// Configuration for tests: no jitter, every statistics sample recorded.
    pub fn deterministic() -> Self {
        Self {
            deterministic: true,
            stats_sample_rate: 1.0,
            ..Self::default()
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_dependency_scope(mut self, scope: DependencyScope) -> Self {
        self.dependency_scope = scope;
        self
    }
}

/// Refresh scheduler settings.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Minimum hit count before an entry is worth refreshing.
    pub hit_threshold: u64,
    /// Refresh once remaining/original TTL drops to `1 - preload_threshold`.
    pub preload_threshold: f64,
    pub parallelism: NonZeroUsize,
    pub max_candidates: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_REFRESH_INTERVAL,
            hit_threshold: DEFAULT_REFRESH_HIT_THRESHOLD,
            preload_threshold: DEFAULT_REFRESH_PRELOAD_THRESHOLD,
            parallelism: DEFAULT_REFRESH_PARALLELISM,
            max_candidates: DEFAULT_REFRESH_MAX_CANDIDATES,
        }
    }
}

impl From<&crate::config::RefreshSettings> for RefreshConfig {
    fn from(settings: &crate::config::RefreshSettings) -> Self {
        Self {
            enabled: settings.enabled,
            interval: settings.interval,
            hit_threshold: settings.hit_threshold,
            preload_threshold: settings.preload_threshold,
            parallelism: settings.parallelism,
            max_candidates: settings.max_candidates,
        }
    }
}

impl RefreshConfig {
    /// Largest remaining/original TTL ratio that still qualifies for refresh.
    pub fn remaining_ratio_limit(&self) -> f64 {
        1.0 - self.preload_threshold
    }
}
