use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the whisper-cache binary.
#[derive(Debug, Parser)]
#[command(
    name = "whisper-cache",
    version,
    about = "Read-through cache tier administration"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "WHISPER_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the background refresh scheduler until interrupted.
    Run(Box<RunArgs>),
    /// Print live and persisted cache statistics as JSON.
    Stats,
    /// Invalidate a key (with dependents), a glob pattern, or a whole module.
    Invalidate(InvalidateArgs),
    /// Run one refresh cycle, or refresh every entry matching a pattern.
    Refresh(RefreshArgs),
    /// Remove every entry in the service namespace except protected keys.
    Clear,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the backing store kind (memory|redis).
    #[arg(long = "backend-kind", value_name = "KIND")]
    pub backend_kind: Option<String>,

    /// Override the backing store URL.
    #[arg(long = "backend-url", value_name = "URL")]
    pub backend_url: Option<String>,

    /// Override the service prefix used in cache keys.
    #[arg(long = "cache-service", value_name = "NAME")]
    pub cache_service: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RunArgs {
    /// Override whether the refresh scheduler runs.
    #[arg(
        long = "refresh-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub refresh_enabled: Option<bool>,

    /// Override the refresh interval.
    #[arg(long = "refresh-interval-seconds", value_name = "SECONDS")]
    pub refresh_interval_seconds: Option<u64>,

    /// Override the hit count an entry needs before it is refreshed.
    #[arg(long = "refresh-hit-threshold", value_name = "COUNT")]
    pub refresh_hit_threshold: Option<u64>,

    /// Override how many entries are refreshed concurrently.
    #[arg(long = "refresh-parallelism", value_name = "COUNT")]
    pub refresh_parallelism: Option<u64>,
}

#[derive(Debug, Args, Clone)]
#[group(required = true, multiple = false)]
pub struct InvalidateArgs {
    /// Cache key to invalidate together with its registered dependents.
    #[arg(long, value_name = "KEY")]
    pub key: Option<String>,

    /// Glob pattern of keys to delete.
    #[arg(long, value_name = "GLOB")]
    pub pattern: Option<String>,

    /// Module to invalidate (user|chat|confession|notification).
    #[arg(long, value_name = "MODULE")]
    pub module: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RefreshArgs {
    /// Refresh every entry matching this glob regardless of thresholds.
    #[arg(long, value_name = "GLOB")]
    pub pattern: Option<String>,
}
