use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::DebuggingRecorder;
use whisper_cache::cache::{CacheConfig, CacheState, MemoryBackend, RefreshConfig, TtlTier};

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let state = CacheState::new(
        Arc::new(MemoryBackend::new()),
        CacheConfig::deterministic(),
        RefreshConfig::default(),
    );
    let key = state.store.keys().user_profile("metrics");

    // Miss, populate, then hit
    for _ in 0..2 {
        state
            .read_through
            .get_or_fetch_registered(
                &key,
                || async { Ok::<_, std::io::Error>(Some("profile".to_string())) },
                TtlTier::Medium,
            )
            .await
            .expect("fetch");
    }

    // Refresh cycle with one revalidated entry
    state.store.set(&key, &"profile", Duration::from_secs(60)).await;
    state.refresh.refresh_pattern(&key).await;
    state.refresh.run_cycle().await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "whisper_cache_hit_total",
        "whisper_cache_miss_total",
        "whisper_cache_get_ms",
        "whisper_cache_fetch_total",
        "whisper_cache_refresh_total",
        "whisper_cache_refresh_cycle_ms",
        "whisper_cache_fetchers",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
