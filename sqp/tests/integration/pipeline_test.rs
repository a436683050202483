use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqp::error::ErrorKind;
use sqp::monitor::{AlertType, RunStatus};
use sqp::pipeline::{ALREADY_RUNNING_MESSAGE, ExecuteOptions, StepCapabilities};
use sqp::state::{PipelineStatus, StepStatus};
use sqp::store::both::memory::MemoryStore;
use sqp::test_utils::channel::RecordingChannel;
use sqp::test_utils::pipeline::{create_orchestrator, sample_records, three_step_config};
use sqp::test_utils::steps::{PassthroughTransformer, RecordingSyncer, ScriptedExtractor};
use sqp_config::shared::{PipelineStepConfig, StepType};
use sqp_telemetry::tracing::init_test_tracing;

struct Steps {
    extractor: Arc<ScriptedExtractor>,
    transformer: Arc<PassthroughTransformer>,
    syncer: Arc<RecordingSyncer>,
}

impl Steps {
    fn new(extractor: ScriptedExtractor, syncer: RecordingSyncer) -> Self {
        Self {
            extractor: Arc::new(extractor),
            transformer: Arc::new(PassthroughTransformer::new()),
            syncer: Arc::new(syncer),
        }
    }

    fn healthy() -> Self {
        Self::new(ScriptedExtractor::new(sample_records()), RecordingSyncer::new())
    }

    fn capabilities(&self) -> StepCapabilities {
        StepCapabilities::new()
            .with_extractor(self.extractor.clone())
            .with_transformer(self.transformer.clone())
            .with_syncer(self.syncer.clone())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn successful_run_syncs_records_and_releases_lock() {
    init_test_tracing();
    let store = MemoryStore::new();
    let config = three_step_config("happy_path");
    let steps = Steps::healthy();
    let orchestrator = create_orchestrator(config.clone(), store.clone(), steps.capabilities());

    let result = orchestrator.execute(ExecuteOptions::default()).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.steps_completed, 3);
    assert_eq!(result.total_steps, 3);
    assert_eq!(result.error, None);
    assert!(result.warnings.is_empty());

    let batches = steps.syncer.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].0, "search_query_weekly");
    assert_eq!(batches[0].1, sample_records());

    let metrics = result.metrics.unwrap();
    assert_eq!(Some(metrics.run_id), result.run_id);
    assert_eq!(metrics.status, RunStatus::Success);
    assert_eq!(metrics.steps.len(), 3);

    let state = orchestrator.state_manager().get_state().await.unwrap();
    assert_eq!(state.status, PipelineStatus::Idle);
    assert_eq!(state.lock_id, None);
    assert!(state.last_success_time.is_some());
    assert_eq!(state.step_data.len(), 3);

    let freshness = orchestrator.monitor().data_freshness().unwrap();
    assert_eq!(freshness.date_naive().to_string(), "2024-01-15");
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_extract_failures_are_retried() {
    init_test_tracing();
    let store = MemoryStore::new();
    let config = three_step_config("flaky_extract");
    let steps = Steps::new(
        ScriptedExtractor::new(sample_records()).failing(2, ErrorKind::NetworkError),
        RecordingSyncer::new(),
    );
    let orchestrator = create_orchestrator(config.clone(), store.clone(), steps.capabilities());

    let result = orchestrator.execute(ExecuteOptions::default()).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(steps.extractor.invocations(), 3);
    assert_eq!(steps.transformer.invocations(), 1);
    assert_eq!(steps.syncer.invocations(), 1);

    let errors = store.errors(&config.id).await;
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|error| error.step.as_deref() == Some("extract")));
    assert_eq!(errors[0].context["attempt"], 1);
    assert_eq!(errors[1].context["attempt"], 2);

    let metrics = result.metrics.unwrap();
    let extract = &metrics.steps[0];
    assert!(extract.success);
    assert_eq!(extract.attempts, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_extract_never_runs_later_steps() {
    init_test_tracing();
    let store = MemoryStore::new();
    let config = three_step_config("broken_extract");
    let steps = Steps::new(
        ScriptedExtractor::new(sample_records()).always_failing(ErrorKind::NetworkError),
        RecordingSyncer::new(),
    );
    let orchestrator = create_orchestrator(config.clone(), store.clone(), steps.capabilities());

    let result = orchestrator.execute(ExecuteOptions::default()).await;

    assert!(!result.success);
    assert_eq!(result.steps_completed, 0);
    assert_eq!(result.error_kind, Some(ErrorKind::StepFailed));
    assert!(result.error.unwrap().contains("after 4 attempt(s)"));
    assert_eq!(steps.extractor.invocations(), 4);
    assert_eq!(steps.transformer.invocations(), 0);
    assert_eq!(steps.syncer.invocations(), 0);
    assert_eq!(store.errors(&config.id).await.len(), 4);

    assert!(
        result
            .alerts
            .iter()
            .any(|alert| alert.alert_type == AlertType::ErrorRate)
    );
    assert_eq!(result.metrics.unwrap().status, RunStatus::Failed);

    let state = orchestrator.state_manager().get_state().await.unwrap();
    assert_eq!(state.status, PipelineStatus::Idle);
    assert_eq!(state.lock_id, None);
    assert_eq!(state.step_data["extract"].status, StepStatus::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_errors_are_not_retried() {
    init_test_tracing();
    let store = MemoryStore::new();
    let steps = Steps::new(
        ScriptedExtractor::new(sample_records()).always_failing(ErrorKind::AuthenticationError),
        RecordingSyncer::new(),
    );
    let orchestrator = create_orchestrator(
        three_step_config("fatal_extract"),
        store,
        steps.capabilities(),
    );

    let result = orchestrator.execute(ExecuteOptions::default()).await;

    assert!(!result.success);
    assert_eq!(steps.extractor.invocations(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn non_retryable_step_gets_one_attempt() {
    init_test_tracing();
    let mut config = three_step_config("single_attempt");
    config.steps[0].retryable = false;
    let steps = Steps::new(
        ScriptedExtractor::new(sample_records()).failing(1, ErrorKind::NetworkError),
        RecordingSyncer::new(),
    );
    let orchestrator = create_orchestrator(config, MemoryStore::new(), steps.capabilities());

    let result = orchestrator.execute(ExecuteOptions::default()).await;

    assert!(!result.success);
    assert_eq!(steps.extractor.invocations(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_runs_are_single_flight() {
    init_test_tracing();
    let store = MemoryStore::new();
    let config = three_step_config("single_flight");
    let first_steps = Steps::new(
        ScriptedExtractor::new(sample_records()).with_delay(Duration::from_millis(300)),
        RecordingSyncer::new(),
    );
    let second_steps = Steps::new(
        ScriptedExtractor::new(sample_records()).with_delay(Duration::from_millis(300)),
        RecordingSyncer::new(),
    );
    let first = Arc::new(create_orchestrator(
        config.clone(),
        store.clone(),
        first_steps.capabilities(),
    ));
    let second = Arc::new(create_orchestrator(
        config.clone(),
        store.clone(),
        second_steps.capabilities(),
    ));

    let (first_result, second_result) = tokio::join!(
        {
            let first = first.clone();
            tokio::spawn(async move { first.execute(ExecuteOptions::default()).await })
        },
        {
            let second = second.clone();
            tokio::spawn(async move { second.execute(ExecuteOptions::default()).await })
        }
    );
    let results = [first_result.unwrap(), second_result.unwrap()];

    assert_eq!(results.iter().filter(|result| result.success).count(), 1);
    let loser = results.iter().find(|result| !result.success).unwrap();
    assert_eq!(loser.error.as_deref(), Some(ALREADY_RUNNING_MESSAGE));
    assert_eq!(loser.error_kind, Some(ErrorKind::LockConflict));
    assert_eq!(loser.run_id, None);
    assert_eq!(
        first_steps.extractor.invocations() + second_steps.extractor.invocations(),
        1
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn overlapping_runs_of_one_orchestrator_fail_fast() {
    init_test_tracing();
    let steps = Steps::new(
        ScriptedExtractor::new(sample_records()).with_delay(Duration::from_millis(200)),
        RecordingSyncer::new(),
    );
    let orchestrator = create_orchestrator(
        three_step_config("overlap"),
        MemoryStore::new(),
        steps.capabilities(),
    );

    let (first, second) = tokio::join!(
        orchestrator.execute(ExecuteOptions::default()),
        orchestrator.execute(ExecuteOptions::default())
    );

    assert!(first.success);
    assert_eq!(second.error.as_deref(), Some(ALREADY_RUNNING_MESSAGE));
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_run_resumes_from_last_checkpoint() {
    init_test_tracing();
    let store = MemoryStore::new();
    let mut config = three_step_config("resume");
    config.max_retries = 0;

    let failing = Steps::new(
        ScriptedExtractor::new(sample_records()),
        RecordingSyncer::rejecting(),
    );
    let orchestrator = create_orchestrator(config.clone(), store.clone(), failing.capabilities());
    let result = orchestrator.execute(ExecuteOptions::default()).await;
    assert!(!result.success);
    assert_eq!(result.steps_completed, 2);
    assert!(result.error.unwrap().contains("did not succeed"));

    let recovery = orchestrator
        .state_manager()
        .get_recovery_point()
        .await
        .unwrap();
    assert!(recovery.can_recover);
    assert_eq!(recovery.next_step.as_deref(), Some("load"));

    let healthy = Steps::healthy();
    let orchestrator = create_orchestrator(config, store, healthy.capabilities());
    let result = orchestrator.execute(ExecuteOptions::resume()).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.steps_completed, 3);
    assert_eq!(healthy.extractor.invocations(), 0);
    assert_eq!(healthy.transformer.invocations(), 0);
    assert_eq!(healthy.syncer.invocations(), 1);
    assert_eq!(healthy.syncer.batches()[0].1, sample_records());
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_run_ignores_previous_checkpoints() {
    init_test_tracing();
    let store = MemoryStore::new();
    let mut config = three_step_config("fresh");
    config.max_retries = 0;

    let failing = Steps::new(
        ScriptedExtractor::new(sample_records()),
        RecordingSyncer::rejecting(),
    );
    let orchestrator = create_orchestrator(config.clone(), store.clone(), failing.capabilities());
    assert!(!orchestrator.execute(ExecuteOptions::default()).await.success);

    let healthy = Steps::healthy();
    let orchestrator = create_orchestrator(config, store, healthy.capabilities());
    let result = orchestrator.execute(ExecuteOptions::default()).await;

    assert!(result.success);
    assert_eq!(healthy.extractor.invocations(), 1);
    assert_eq!(healthy.transformer.invocations(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn quality_violations_fail_the_run() {
    init_test_tracing();
    let records = json!([
        {"query": "running shoes", "asin": "B0001", "date": "2024-01-15", "impressions": -5},
        {"query": "", "asin": "B0002", "date": "2024-01-15", "impressions": 5},
    ]);
    let steps = Steps::new(ScriptedExtractor::new(records), RecordingSyncer::new());
    let orchestrator = create_orchestrator(
        three_step_config("quality"),
        MemoryStore::new(),
        steps.capabilities(),
    );

    let result = orchestrator.execute(ExecuteOptions::default()).await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ValidationError));
    assert_eq!(result.steps_completed, 3);
    let error = result.error.unwrap();
    assert!(error.contains("negative `impressions`"));
    assert!(error.contains("missing `query`"));
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_records_are_reported_as_warnings() {
    init_test_tracing();
    let mut config = three_step_config("stale_records");
    config.alert_thresholds.data_freshness_ms = Some(24 * 60 * 60 * 1000);
    let steps = Steps::healthy();
    let orchestrator = create_orchestrator(config, MemoryStore::new(), steps.capabilities());

    let result = orchestrator.execute(ExecuteOptions::default()).await;

    assert!(result.success);
    assert_eq!(result.warnings.len(), 1);
    assert!(
        result
            .alerts
            .iter()
            .any(|alert| alert.alert_type == AlertType::DataFreshness)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_capability_fails_without_retry() {
    init_test_tracing();
    let mut config = three_step_config("missing_capability");
    config
        .steps
        .push(PipelineStepConfig::new("notify", StepType::Custom));
    let steps = Steps::healthy();
    let orchestrator = create_orchestrator(config, MemoryStore::new(), steps.capabilities());

    let result = orchestrator.execute(ExecuteOptions::default()).await;

    assert!(!result.success);
    assert_eq!(result.steps_completed, 3);
    assert!(result.error.unwrap().contains("No capability registered"));
}

#[tokio::test(flavor = "multi_thread")]
async fn alerts_are_dispatched_to_configured_channels() {
    init_test_tracing();
    let mut config = three_step_config("alerting");
    config.alert_channels = vec!["recording".to_string()];
    let steps = Steps::new(
        ScriptedExtractor::new(sample_records()).always_failing(ErrorKind::PermissionDenied),
        RecordingSyncer::new(),
    );
    let orchestrator = create_orchestrator(config, MemoryStore::new(), steps.capabilities());
    let channel = Arc::new(RecordingChannel::new());
    orchestrator
        .monitor()
        .register_alert_channel("recording", channel.clone());

    let result = orchestrator.execute(ExecuteOptions::default()).await;

    assert!(!result.success);
    assert!(!result.alerts.is_empty());
    assert_eq!(channel.alerts(), result.alerts);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_stops_run_at_next_step_boundary() {
    init_test_tracing();
    let store = MemoryStore::new();
    let steps = Steps::new(
        ScriptedExtractor::new(sample_records()).with_delay(Duration::from_millis(200)),
        RecordingSyncer::new(),
    );
    let orchestrator = Arc::new(create_orchestrator(
        three_step_config("shutdown"),
        store,
        steps.capabilities(),
    ));

    let run = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.execute(ExecuteOptions::default()).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    orchestrator.shutdown().await;
    orchestrator.shutdown().await;
    let result = run.await.unwrap();

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::PipelineCancelled));
    assert_eq!(result.steps_completed, 1);
    assert_eq!(steps.transformer.invocations(), 0);
    assert_eq!(result.metrics.unwrap().status, RunStatus::Cancelled);
    assert!(orchestrator.pool().is_closed());

    let state = orchestrator.state_manager().get_state().await.unwrap();
    assert_eq!(state.status, PipelineStatus::Idle);
    assert_eq!(state.lock_id, None);

    let result = orchestrator.execute(ExecuteOptions::default()).await;
    assert_eq!(result.error_kind, Some(ErrorKind::PipelineCancelled));
    assert_eq!(result.run_id, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn next_run_uses_the_injected_calculator() {
    init_test_tracing();
    let orchestrator = create_orchestrator(
        three_step_config("schedule"),
        MemoryStore::new(),
        Steps::healthy().capabilities(),
    );
    let from: DateTime<Utc> = "2024-01-15T03:00:00Z".parse().unwrap();

    assert_eq!(orchestrator.get_schedule(), "0 3 * * *");
    assert_eq!(
        orchestrator.calculate_next_run(from).unwrap(),
        from + chrono::Duration::seconds(60)
    );
}
