use std::process;

use serde::Serialize;
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use whisper_cache::{
    cache::{CacheError, CacheState, Module, StatsSnapshot},
    config::{self, InvalidateArgs, LoadError, RefreshArgs},
    infra::{error::InfraError, telemetry},
};

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Run(Box::<config::RunArgs>::default()));

    telemetry::init(&settings.logging)?;

    let state = CacheState::connect(&settings).await;
    state.store.ensure_format_version().await?;

    match command {
        config::Command::Run(_) => run_scheduler(state).await,
        config::Command::Stats => print_stats(&state).await,
        config::Command::Invalidate(args) => run_invalidate(&state, args).await,
        config::Command::Refresh(args) => run_refresh(&state, args).await,
        config::Command::Clear => {
            let removed = state.invalidation.clear_all().await;
            print_json(&serde_json::json!({ "removed": removed }))
        }
    }
}

async fn run_scheduler(state: CacheState) -> Result<(), AppError> {
    let handle = if state.refresh.config().enabled {
        Some(state.refresh.spawn())
    } else {
        warn!("Cache refresh disabled, waiting for shutdown only");
        None
    };

    tokio::signal::ctrl_c().await.map_err(InfraError::signal)?;
    info!("Shutdown signal received");

    if let Some(handle) = handle {
        handle.stop().await;
    }
    state.store.flush_statistics().await;
    Ok(())
}

#[derive(Serialize)]
struct StatsReport {
    live: StatsSnapshot,
    persisted: Option<StatsSnapshot>,
}

async fn print_stats(state: &CacheState) -> Result<(), AppError> {
    let report = StatsReport {
        live: state.store.statistics(),
        persisted: state.store.persisted_statistics().await,
    };
    print_json(&report)
}

async fn run_invalidate(state: &CacheState, args: InvalidateArgs) -> Result<(), AppError> {
    let removed = match (args.key, args.pattern, args.module) {
        (Some(key), None, None) => state.invalidation.invalidate(&key).await,
        (None, Some(pattern), None) => state.invalidation.invalidate_by_pattern(&pattern).await,
        (None, None, Some(module)) => {
            let module: Module = module
                .parse()
                .map_err(|err| AppError::validation(format!("{err}")))?;
            if module.is_internal() {
                return Err(AppError::validation(format!(
                    "module `{module}` is internal and cannot be invalidated"
                )));
            }
            state.invalidation.invalidate_module(module).await
        }
        _ => {
            return Err(AppError::validation(
                "invalidate requires exactly one of --key, --pattern or --module",
            ));
        }
    };
    print_json(&serde_json::json!({ "removed": removed }))
}

async fn run_refresh(state: &CacheState, args: RefreshArgs) -> Result<(), AppError> {
    let report = match args.pattern {
        Some(pattern) => state.refresh.refresh_pattern(&pattern).await,
        None => state.refresh.run_cycle().await,
    };
    print_json(&report)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
