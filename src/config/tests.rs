use std::io::Write;

use super::*;

#[test]
fn defaults_are_valid() {
    let settings = Settings::default();

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.backend.kind, BackendKind::Memory);
    assert_eq!(settings.backend.url, DEFAULT_REDIS_URL);
    assert_eq!(settings.cache.service, "whisper");
    assert_eq!(settings.cache.ttl.short, Duration::from_secs(300));
    assert_eq!(settings.cache.ttl.forever, Duration::ZERO);
    assert_eq!(settings.cache.lock_wait, Duration::from_millis(50));
    assert_eq!(settings.cache.lock_retries, 20);
    assert_eq!(settings.cache.dependency_scope, DependencyScope::Shared);
    assert!(settings.cache.penetration_protection);
    assert!(settings.refresh.enabled);
    assert_eq!(settings.refresh.interval, Duration::from_secs(300));
    assert_eq!(settings.refresh.parallelism.get(), 5);
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("info".to_string());
    raw.cache.service = Some("from-file".to_string());

    let overrides = GlobalOverrides {
        log_level: Some("debug".to_string()),
        cache_service: Some("from-cli".to_string()),
        backend_kind: Some("redis".to_string()),
        ..Default::default()
    };

    raw.apply_global_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.cache.service, "from-cli");
    assert_eq!(settings.backend.kind, BackendKind::Redis);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = GlobalOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_global_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn run_overrides_apply_to_refresh() {
    let mut raw = RawSettings::default();
    raw.apply_run_overrides(&RunArgs {
        refresh_enabled: Some(false),
        refresh_interval_seconds: Some(60),
        refresh_hit_threshold: Some(3),
        refresh_parallelism: Some(2),
    });
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(!settings.refresh.enabled);
    assert_eq!(settings.refresh.interval, Duration::from_secs(60));
    assert_eq!(settings.refresh.hit_threshold, 3);
    assert_eq!(settings.refresh.parallelism.get(), 2);
}

#[test]
fn service_prefix_must_not_break_key_grammar() {
    for service in ["", "a:b", "we*rd"] {
        let mut raw = RawSettings::default();
        raw.cache.service = Some(service.to_string());
        let err = Settings::from_raw(raw).expect_err("invalid service");
        assert!(matches!(err, LoadError::Invalid { key: "cache.service", .. }));
    }
}

#[test]
fn null_markers_and_locks_must_expire() {
    let mut raw = RawSettings::default();
    raw.cache.ttl.null_value = Some(0);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.ttl.null_value", .. })
    ));

    let mut raw = RawSettings::default();
    raw.cache.ttl.lock = Some(0);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.ttl.lock", .. })
    ));
}

#[test]
fn ratios_are_range_checked() {
    let mut raw = RawSettings::default();
    raw.cache.jitter_ratio = Some(1.5);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.jitter_ratio", .. })
    ));

    let mut raw = RawSettings::default();
    raw.refresh.preload_threshold = Some(0.0);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "refresh.preload_threshold", .. })
    ));
}

#[test]
fn zero_parallelism_is_rejected() {
    let mut raw = RawSettings::default();
    raw.refresh.parallelism = Some(0);
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "refresh.parallelism", .. })
    ));
}

#[test]
fn unknown_backend_and_scope_are_rejected() {
    let mut raw = RawSettings::default();
    raw.backend.kind = Some("memcached".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "backend.kind", .. })
    ));

    let mut raw = RawSettings::default();
    raw.cache.dependency_scope = Some("global".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid { key: "cache.dependency_scope", .. })
    ));
}

#[test]
fn no_subcommand_leaves_command_empty() {
    let args = CliArgs::parse_from(["whisper-cache"]);
    assert!(args.command.is_none());
}

#[test]
fn parse_run_arguments() {
    let args = CliArgs::parse_from([
        "whisper-cache",
        "--backend-kind",
        "redis",
        "run",
        "--refresh-enabled",
        "false",
        "--refresh-parallelism",
        "3",
    ]);

    assert_eq!(args.overrides.backend_kind.as_deref(), Some("redis"));
    match args.command.expect("run command") {
        Command::Run(run) => {
            assert_eq!(run.refresh_enabled, Some(false));
            assert_eq!(run.refresh_parallelism, Some(3));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn invalidate_requires_exactly_one_target() {
    let args = CliArgs::parse_from(["whisper-cache", "invalidate", "--module", "user"]);
    match args.command.expect("invalidate command") {
        Command::Invalidate(invalidate) => {
            assert_eq!(invalidate.module.as_deref(), Some("user"));
            assert!(invalidate.key.is_none());
        }
        _ => panic!("wrong command parsed"),
    }

    assert!(CliArgs::try_parse_from(["whisper-cache", "invalidate"]).is_err());
    assert!(
        CliArgs::try_parse_from([
            "whisper-cache",
            "invalidate",
            "--key",
            "a",
            "--pattern",
            "b*"
        ])
        .is_err()
    );
}

#[test]
fn parse_refresh_pattern() {
    let args = CliArgs::parse_from(["whisper-cache", "refresh", "--pattern", "whisper:user:*"]);
    match args.command.expect("refresh command") {
        Command::Refresh(refresh) => {
            assert_eq!(refresh.pattern.as_deref(), Some("whisper:user:*"));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn config_file_is_layered_under_cli() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp file");
    writeln!(
        file,
        r#"
[logging]
level = "warn"

[cache]
service = "whisper-test"
lock_retries = 3
dependency_scope = "local"

[cache.ttl]
short = 120

[refresh]
interval_seconds = 30
hit_threshold = 2
"#
    )
    .expect("write config");

    let path = file.path().to_str().expect("utf-8 path").to_string();
    let args = CliArgs::parse_from([
        "whisper-cache",
        "--config-file",
        path.as_str(),
        "--log-level",
        "error",
        "run",
        "--refresh-interval-seconds",
        "45",
    ]);
    let settings = load(&args).expect("settings");

    assert_eq!(settings.logging.level, LevelFilter::ERROR);
    assert_eq!(settings.cache.service, "whisper-test");
    assert_eq!(settings.cache.lock_retries, 3);
    assert_eq!(settings.cache.dependency_scope, DependencyScope::Local);
    assert_eq!(settings.cache.ttl.short, Duration::from_secs(120));
    assert_eq!(settings.cache.ttl.medium, Duration::from_secs(1_800));
    assert_eq!(settings.refresh.interval, Duration::from_secs(45));
    assert_eq!(settings.refresh.hit_threshold, 2);
}

#[test]
fn missing_config_file_is_an_error() {
    let args = CliArgs::parse_from([
        "whisper-cache",
        "--config-file",
        "/nonexistent/whisper-cache.toml",
    ]);
    assert!(matches!(load(&args), Err(LoadError::Build(_))));
}
