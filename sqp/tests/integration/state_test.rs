use std::time::Duration;

use serde_json::json;
use sqp::error::ErrorKind;
use sqp::state::{HistoryQuery, PipelineStateManager, PipelineStatus, StateUpdate};
use sqp::store::both::memory::MemoryStore;
use sqp::test_utils::pipeline::three_step_config;
use sqp_telemetry::tracing::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn second_lock_on_fresh_lock_fails_fast() {
    init_test_tracing();
    let store = MemoryStore::new();
    let config = three_step_config("fresh_lock");
    let first = PipelineStateManager::new(&config, store.clone());
    let second = PipelineStateManager::new(&config, store.clone());

    assert!(first.lock_pipeline().await.unwrap());
    assert!(!second.lock_pipeline().await.unwrap());
    assert_eq!(second.held_lock(), None);

    let state = first.get_state().await.unwrap();
    assert_eq!(state.status, PipelineStatus::Locked);
    assert_eq!(state.lock_id, first.held_lock());
    assert!(state.last_run_time.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_lock_is_taken_over() {
    init_test_tracing();
    let store = MemoryStore::new();
    let mut config = three_step_config("stale_lock");
    config.stale_lock_timeout_ms = 50;
    let crashed = PipelineStateManager::new(&config, store.clone());
    let next = PipelineStateManager::new(&config, store.clone());

    assert!(crashed.lock_pipeline().await.unwrap());
    crashed
        .update_state(StateUpdate::status(PipelineStatus::Running))
        .await
        .unwrap();
    let stale_lock_id = crashed.held_lock().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(next.lock_pipeline().await.unwrap());
    let state = next.get_state().await.unwrap();
    assert_eq!(state.status, PipelineStatus::Locked);
    assert_ne!(state.lock_id, Some(stale_lock_id));
    assert_eq!(state.lock_id, next.held_lock());

    let history = next.get_history(HistoryQuery::default()).await.unwrap();
    let takeover = &history[0];
    assert!(takeover.forced);
    assert_eq!(takeover.from_status, Some(PipelineStatus::Running));
    assert_eq!(takeover.to_status, PipelineStatus::Locked);
    assert_eq!(
        takeover.metadata["previous_lock_id"],
        json!(stale_lock_id.to_string())
    );

    // The previous holder can neither write nor release the new lock.
    let err = crashed
        .save_step_data("extract", json!([]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockConflict);
    assert!(!crashed.unlock_pipeline().await.unwrap());
    assert_eq!(next.get_state().await.unwrap().lock_id, next.held_lock());
}

#[tokio::test(flavor = "multi_thread")]
async fn illegal_transition_is_rejected() {
    init_test_tracing();
    let store = MemoryStore::new();
    let manager = PipelineStateManager::new(&three_step_config("illegal"), store);

    let err = manager
        .update_state(StateUpdate::status(PipelineStatus::Running))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);

    assert!(manager.lock_pipeline().await.unwrap());
    let err = manager
        .update_state(StateUpdate::status(PipelineStatus::Completed))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    assert_eq!(
        manager.get_state().await.unwrap().status,
        PipelineStatus::Locked
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_point_follows_checkpoints() {
    init_test_tracing();
    let store = MemoryStore::new();
    let manager = PipelineStateManager::new(&three_step_config("recovery"), store);

    assert!(manager.lock_pipeline().await.unwrap());
    manager
        .update_state(StateUpdate::status(PipelineStatus::Running))
        .await
        .unwrap();
    manager
        .save_step_data("extract", json!([{"query": "shoes"}]))
        .await
        .unwrap();
    manager
        .mark_step_failed("transform", "boom")
        .await
        .unwrap();
    manager
        .update_state(StateUpdate::status(PipelineStatus::Failed))
        .await
        .unwrap();
    assert!(manager.unlock_pipeline().await.unwrap());

    let recovery = manager.get_recovery_point().await.unwrap();
    assert!(recovery.can_recover);
    assert_eq!(recovery.last_completed_step.as_deref(), Some("extract"));
    assert_eq!(recovery.next_step.as_deref(), Some("transform"));
    assert_eq!(recovery.step_data["extract"], json!([{"query": "shoes"}]));

    assert_eq!(
        manager.get_step_data("extract").await.unwrap(),
        Some(json!([{"query": "shoes"}]))
    );
    assert_eq!(manager.get_step_data("transform").await.unwrap(), None);

    let state = manager.get_state().await.unwrap();
    assert_eq!(state.status, PipelineStatus::Idle);
    assert_eq!(state.lock_id, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn unlock_while_running_records_cancellation() {
    init_test_tracing();
    let store = MemoryStore::new();
    let manager = PipelineStateManager::new(&three_step_config("interrupted"), store);

    assert!(manager.lock_pipeline().await.unwrap());
    manager
        .update_state(StateUpdate::status(PipelineStatus::Running))
        .await
        .unwrap();
    assert!(manager.unlock_pipeline().await.unwrap());
    assert!(!manager.unlock_pipeline().await.unwrap());

    let statuses = manager
        .get_history(HistoryQuery::default())
        .await
        .unwrap()
        .into_iter()
        .map(|transition| transition.to_status)
        .collect::<Vec<_>>();
    assert_eq!(
        statuses,
        vec![
            PipelineStatus::Idle,
            PipelineStatus::Cancelled,
            PipelineStatus::Running,
            PipelineStatus::Locked,
        ]
    );

    let page = manager
        .get_history(HistoryQuery {
            limit: 2,
            offset: 1,
        })
        .await
        .unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].to_status, PipelineStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn reset_and_cleanup_history() {
    init_test_tracing();
    let store = MemoryStore::new();
    let manager = PipelineStateManager::new(&three_step_config("reset"), store);

    assert!(manager.lock_pipeline().await.unwrap());
    manager
        .save_step_data("extract", json!([]))
        .await
        .unwrap();
    manager.reset().await.unwrap();

    let state = manager.get_state().await.unwrap();
    assert_eq!(state.status, PipelineStatus::Idle);
    assert_eq!(state.lock_id, None);
    assert!(state.step_data.is_empty());
    assert!(state.last_run_time.is_some());
    assert_eq!(manager.held_lock(), None);

    let history = manager.get_history(HistoryQuery::default()).await.unwrap();
    assert!(history[0].forced);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let deleted = manager.cleanup_history(0).await.unwrap();
    assert_eq!(deleted, history.len() as u64);
    assert!(
        manager
            .get_history(HistoryQuery::default())
            .await
            .unwrap()
            .is_empty()
    );
}
