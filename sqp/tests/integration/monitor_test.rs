use std::sync::Arc;

use chrono::{Duration, Utc};
use sqp::error::{ErrorKind, SyncError};
use sqp::monitor::{
    AlertSeverity, AlertType, ErrorContext, PipelineMonitor, RunMetrics, RunStatus, StepMetrics,
};
use sqp::store::both::memory::MemoryStore;
use sqp::store::monitor::MonitorStore;
use sqp::test_utils::channel::{FailingChannel, RecordingChannel};
use sqp::test_utils::pipeline::three_step_config;
use sqp_config::shared::{LogLevel, MonitorConfig, PipelineConfig};
use sqp_telemetry::tracing::init_test_tracing;
use uuid::Uuid;

fn alerting_config(pipeline_id: &str, error_rate: f64, channels: &[&str]) -> PipelineConfig {
    let mut config = three_step_config(pipeline_id);
    config.alert_thresholds.error_rate = error_rate;
    config.alert_channels = channels.iter().map(|channel| channel.to_string()).collect();

    config
}

/// Stores `runs` finished runs of ten steps each, `failed_steps` of which failed in total.
async fn seed_runs(store: &MemoryStore, pipeline_id: &str, runs: usize, failed_steps: usize) {
    let mut failures_left = failed_steps;

    for index in 0..runs {
        let mut run = RunMetrics::started(Uuid::new_v4(), pipeline_id);
        run.start_time = Utc::now() - Duration::minutes(index as i64 + 1);

        for step in 0..10 {
            let error = (failures_left > 0).then(|| "boom".to_string());
            failures_left = failures_left.saturating_sub(1);
            run.upsert_step(StepMetrics::finished(
                format!("step_{step}"),
                run.start_time,
                1,
                5,
                error,
            ));
        }

        run.status = if run.failed_steps() > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };
        run.end_time = Some(run.start_time + Duration::seconds(30));
        run.duration_ms = Some(30_000);
        store.save_run_metrics(&run).await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn error_rate_at_threshold_raises_critical_alert() {
    init_test_tracing();
    let store = MemoryStore::new();
    let config = alerting_config("error_rate_hit", 0.05, &["recording"]);
    let monitor = PipelineMonitor::new(&config, MonitorConfig::default(), store.clone());
    let channel = Arc::new(RecordingChannel::new());
    monitor.register_alert_channel("recording", channel.clone());

    seed_runs(&store, &config.id, 10, 5).await;

    assert_eq!(monitor.get_error_rate().await.unwrap(), 0.05);
    let alerts = monitor.check_alerts().await;

    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::ErrorRate);
    assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    assert_eq!(channel.alerts(), alerts);

    let logs = store.logs(&config.id).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, LogLevel::Error);
    assert_eq!(logs[0].metadata["alert_type"], "error_rate");
}

#[tokio::test(flavor = "multi_thread")]
async fn error_rate_below_threshold_raises_nothing() {
    init_test_tracing();
    let store = MemoryStore::new();
    let config = alerting_config("error_rate_miss", 0.05, &["recording"]);
    let monitor = PipelineMonitor::new(&config, MonitorConfig::default(), store.clone());
    let channel = Arc::new(RecordingChannel::new());
    monitor.register_alert_channel("recording", channel.clone());

    seed_runs(&store, &config.id, 10, 4).await;

    assert!(monitor.check_alerts().await.is_empty());
    assert!(channel.alerts().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn error_rate_only_considers_recent_window() {
    init_test_tracing();
    let store = MemoryStore::new();
    let config = alerting_config("error_rate_window", 0.05, &[]);
    let monitor = PipelineMonitor::new(
        &config,
        MonitorConfig {
            error_rate_window: 2,
            ..MonitorConfig::default()
        },
        store.clone(),
    );

    // Ten failed steps in the newest run, none in the older ones.
    seed_runs(&store, &config.id, 5, 10).await;

    assert_eq!(monitor.get_error_rate().await.unwrap(), 0.5);
}

#[tokio::test(flavor = "multi_thread")]
async fn dispatch_failures_are_logged_not_raised() {
    init_test_tracing();
    let store = MemoryStore::new();
    let config = alerting_config("dispatch", 0.05, &["failing", "missing", "recording"]);
    let monitor = PipelineMonitor::new(&config, MonitorConfig::default(), store.clone());
    let channel = Arc::new(RecordingChannel::new());
    monitor.register_alert_channel("failing", Arc::new(FailingChannel));
    monitor.register_alert_channel("recording", channel.clone());

    seed_runs(&store, &config.id, 1, 10).await;
    let alerts = monitor.check_alerts().await;

    assert_eq!(alerts.len(), 1);
    assert_eq!(channel.alerts().len(), 1);

    let failures = store
        .logs(&config.id)
        .await
        .into_iter()
        .filter(|log| {
            log.metadata.get("error_kind").and_then(|kind| kind.as_str())
                == Some("alert_dispatch_failed")
        })
        .map(|log| log.metadata["channel"].as_str().unwrap_or_default().to_string())
        .collect::<Vec<_>>();
    assert_eq!(failures.len(), 2);
    assert!(failures.contains(&"failing".to_string()));
    assert!(failures.contains(&"missing".to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_data_raises_freshness_warning() {
    init_test_tracing();
    let store = MemoryStore::new();
    let mut config = alerting_config("freshness", 0.05, &[]);
    config.alert_thresholds.data_freshness_ms = Some(60 * 60 * 1000);
    let monitor = PipelineMonitor::new(&config, MonitorConfig::default(), store);

    monitor.record_data_freshness(Utc::now() - Duration::days(3));
    monitor.record_data_freshness(Utc::now() - Duration::days(5));

    let alerts = monitor.check_alerts().await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::DataFreshness);
    assert_eq!(alerts[0].severity, AlertSeverity::Warning);

    monitor.record_data_freshness(Utc::now());
    assert!(monitor.check_alerts().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn run_lifecycle_is_persisted() {
    init_test_tracing();
    let store = MemoryStore::new();
    let config = three_step_config("lifecycle");
    let monitor = PipelineMonitor::new(&config, MonitorConfig::default(), store.clone());

    let run_id = monitor.start_pipeline().await;
    assert_eq!(monitor.current_run_id(), Some(run_id));

    let started = Utc::now();
    monitor
        .record_step_metrics(StepMetrics::finished("extract", started, 1, 0, Some("timeout".into())))
        .await;
    monitor
        .record_step_metrics(StepMetrics::finished("extract", started, 2, 40, None))
        .await;
    let err = SyncError::from((ErrorKind::NetworkError, "Connection reset"));
    monitor
        .record_error(&err, ErrorContext::step("extract").with_attempt(1))
        .await;
    monitor.end_pipeline(RunStatus::Success, None).await;

    assert_eq!(monitor.current_run_id(), None);

    let runs = store.get_recent_runs(&config.id, 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.run_id, run_id);
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.records_processed, 40);
    assert_eq!(run.steps.len(), 1);
    assert_eq!(run.steps[0].attempts, 2);
    assert!(run.duration_ms.is_some());

    let errors = store.errors(&config.id).await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].run_id, Some(run_id));
    assert_eq!(errors[0].step.as_deref(), Some("extract"));
    assert_eq!(errors[0].error_kind, "network_error");
    assert_eq!(errors[0].context["attempt"], 1);

    let dashboard = monitor.get_dashboard_metrics().await.unwrap();
    assert_eq!(dashboard.total_runs, 1);
    assert_eq!(dashboard.successful_runs, 1);
    assert_eq!(dashboard.success_rate, 1.0);
    assert_eq!(dashboard.recent_errors, 1);
    assert_eq!(dashboard.current_run_id, None);
    assert_eq!(dashboard.last_run.map(|run| run.run_id), Some(run_id));
}

#[tokio::test(flavor = "multi_thread")]
async fn log_entries_are_filtered_and_persisted_by_level() {
    init_test_tracing();
    let store = MemoryStore::new();
    let config = three_step_config("logging");
    let monitor = PipelineMonitor::new(
        &config,
        MonitorConfig {
            log_level: LogLevel::Error,
            ..MonitorConfig::default()
        },
        store.clone(),
    );

    monitor.log(LogLevel::Info, "info", Default::default()).await;
    monitor.log(LogLevel::Warning, "warning", Default::default()).await;
    monitor.log(LogLevel::Error, "error", Default::default()).await;

    let logs = store.logs(&config.id).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].message, "error");
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_run_is_flagged_as_anomaly() {
    init_test_tracing();
    let store = MemoryStore::new();
    let config = three_step_config("anomaly");
    let monitor = PipelineMonitor::new(&config, MonitorConfig::default(), store.clone());

    for (index, duration_ms) in [1_000u64, 1_100, 900, 1_050, 950].into_iter().enumerate() {
        let mut run = RunMetrics::started(Uuid::new_v4(), config.id.clone());
        run.start_time = Utc::now() - Duration::hours(index as i64 + 1);
        run.status = RunStatus::Success;
        run.end_time = Some(run.start_time + Duration::milliseconds(duration_ms as i64));
        run.duration_ms = Some(duration_ms);
        store.save_run_metrics(&run).await.unwrap();
    }

    let mut slow = RunMetrics::started(Uuid::new_v4(), config.id.clone());
    slow.start_time = Utc::now() - Duration::minutes(1);
    slow.status = RunStatus::Success;
    slow.end_time = Some(slow.start_time + Duration::seconds(10));
    slow.duration_ms = Some(10_000);
    store.save_run_metrics(&slow).await.unwrap();

    let analysis = monitor.analyze_performance().await.unwrap();

    assert_eq!(analysis.baseline_runs, 5);
    assert_eq!(analysis.average_duration_ms, 1_000.0);
    assert_eq!(analysis.current_duration_ms, Some(10_000.0));
    assert!(analysis.is_anomaly);
}

#[tokio::test(flavor = "multi_thread")]
async fn long_run_raises_execution_time_warning() {
    init_test_tracing();
    let store = MemoryStore::new();
    let mut config = alerting_config("execution_time", 0.05, &["recording"]);
    config.alert_thresholds.execution_time_ms = Some(20);
    let monitor = PipelineMonitor::new(&config, MonitorConfig::default(), store.clone());
    let channel = Arc::new(RecordingChannel::new());
    monitor.register_alert_channel("recording", channel.clone());

    monitor.start_pipeline().await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let alerts = monitor.check_alerts().await;

    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::ExecutionTime);
    assert_eq!(alerts[0].severity, AlertSeverity::Warning);
    assert_eq!(alerts[0].metadata["threshold_ms"], 20);
    assert_eq!(channel.alerts(), alerts);

    let mut config = alerting_config("execution_time_fast", 0.05, &[]);
    config.alert_thresholds.execution_time_ms = Some(60_000);
    let monitor = PipelineMonitor::new(&config, MonitorConfig::default(), store);

    monitor.start_pipeline().await;
    assert!(monitor.check_alerts().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn memory_above_threshold_raises_warning() {
    init_test_tracing();
    let store = MemoryStore::new();
    let mut config = alerting_config("memory", 0.05, &[]);
    config.alert_thresholds.memory_usage_bytes = Some(1);
    let monitor = PipelineMonitor::new(&config, MonitorConfig::default(), store.clone());

    let alerts = monitor.check_alerts().await;

    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::MemoryUsage);
    assert_eq!(alerts[0].severity, AlertSeverity::Warning);
    assert!(alerts[0].metadata["memory_usage_bytes"].as_u64().unwrap() > 1);

    config.alert_thresholds.memory_usage_bytes = Some(u64::MAX);
    let monitor = PipelineMonitor::new(&config, MonitorConfig::default(), store);
    assert!(monitor.check_alerts().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn throughput_prefers_current_run_over_last_persisted_one() {
    init_test_tracing();
    let store = MemoryStore::new();
    let config = three_step_config("throughput");
    let monitor = PipelineMonitor::new(&config, MonitorConfig::default(), store.clone());

    assert_eq!(monitor.get_throughput().await.unwrap(), 0.0);

    let mut run = RunMetrics::started(Uuid::new_v4(), config.id.clone());
    run.status = RunStatus::Success;
    run.records_processed = 500;
    run.end_time = Some(run.start_time + Duration::seconds(2));
    run.duration_ms = Some(2_000);
    store.save_run_metrics(&run).await.unwrap();

    assert_eq!(monitor.get_throughput().await.unwrap(), 250.0);

    monitor.start_pipeline().await;
    assert_eq!(monitor.get_throughput().await.unwrap(), 0.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn cleanup_deletes_only_old_monitoring_data() {
    init_test_tracing();
    let store = MemoryStore::new();
    let config = three_step_config("cleanup");
    let monitor = PipelineMonitor::new(&config, MonitorConfig::default(), store.clone());

    for days_ago in [40, 35, 1] {
        let mut run = RunMetrics::started(Uuid::new_v4(), config.id.clone());
        run.start_time = Utc::now() - Duration::days(days_ago);
        run.status = RunStatus::Success;
        run.end_time = Some(run.start_time + Duration::seconds(30));
        run.duration_ms = Some(30_000);
        store.save_run_metrics(&run).await.unwrap();
    }
    monitor
        .log(LogLevel::Warning, "recent warning", Default::default())
        .await;

    let deleted = monitor.cleanup_old_data(30).await.unwrap();

    assert_eq!(deleted, 2);
    assert_eq!(store.get_recent_runs(&config.id, 10).await.unwrap().len(), 1);
    assert_eq!(store.logs(&config.id).await.len(), 1);
}
