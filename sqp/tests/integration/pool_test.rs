use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sqp::error::ErrorKind;
use sqp::pool::ConnectionPool;
use sqp::test_utils::client::MockClientFactory;
use sqp_config::shared::PoolConfig;
use sqp_telemetry::tracing::init_test_tracing;

fn pool_config(min_clients: u32, max_clients: u32, acquire_timeout_ms: u64) -> PoolConfig {
    PoolConfig {
        min_clients,
        max_clients,
        acquire_timeout_ms,
        idle_timeout_ms: 60_000,
        idle_check_interval_ms: 60_000,
    }
}

fn sweeping_pool_config(min_clients: u32, max_clients: u32) -> PoolConfig {
    PoolConfig {
        idle_timeout_ms: 50,
        idle_check_interval_ms: 20,
        ..pool_config(min_clients, max_clients, 1_000)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn acquire_beyond_max_clients_times_out() {
    init_test_tracing();
    let pool = ConnectionPool::new(MockClientFactory::new(), pool_config(0, 2, 100));

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    assert_eq!(pool.in_use_count(), 2);
    assert_ne!(first.identity(), second.identity());

    let err = pool.acquire().await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::ConnectionTimeout);
    assert_eq!(pool.in_use_count(), 2);

    drop(first);
    assert_eq!(pool.in_use_count(), 1);
    let third = pool.acquire().await.unwrap();
    assert_eq!(pool.in_use_count(), 2);

    drop((second, third));
}

#[tokio::test(flavor = "multi_thread")]
async fn released_client_is_reused() {
    init_test_tracing();
    let factory = MockClientFactory::new();
    let pool = ConnectionPool::new(factory.clone(), pool_config(0, 1, 100));

    let client = pool.acquire().await.unwrap();
    let identity = client.identity();
    let id = client.id();
    pool.release(client);
    assert_eq!(pool.idle_count(), 1);

    let client = pool.acquire().await.unwrap();
    assert_eq!(client.identity(), identity);
    assert_eq!(client.id(), id);
    assert_eq!(factory.created(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unhealthy_idle_client_is_replaced() {
    init_test_tracing();
    let factory = MockClientFactory::new();
    let pool = ConnectionPool::new(factory.clone(), pool_config(0, 1, 500));

    let client = pool.acquire().await.unwrap();
    let identity = client.identity();
    drop(client);

    factory.set_healthy(false);
    let client = pool.acquire().await.unwrap();

    assert_ne!(client.identity(), identity);
    assert_eq!(factory.created(), 2);
    assert_eq!(factory.closed(), 1);
    assert_eq!(pool.size(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn waiting_acquire_is_served_by_release() {
    init_test_tracing();
    let pool = ConnectionPool::new(MockClientFactory::new(), pool_config(0, 1, 2_000));

    let held = pool.acquire().await.unwrap();
    let identity = held.identity();

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await.map(|client| client.identity()) }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    drop(held);

    assert_eq!(waiter.await.unwrap().unwrap(), identity);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_acquires_never_exceed_max_clients() {
    init_test_tracing();
    let pool = ConnectionPool::new(MockClientFactory::new(), pool_config(0, 3, 5_000));
    let in_use = Arc::new(AtomicUsize::new(0));
    let max_in_use = Arc::new(AtomicUsize::new(0));

    let tasks = (0..12)
        .map(|_| {
            let pool = pool.clone();
            let in_use = in_use.clone();
            let max_in_use = max_in_use.clone();
            tokio::spawn(async move {
                let client = pool.acquire().await.unwrap();
                let current = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_use.fetch_max(current, Ordering::SeqCst);
                assert!(pool.in_use_count() <= 3);

                tokio::time::sleep(Duration::from_millis(10)).await;

                in_use.fetch_sub(1, Ordering::SeqCst);
                drop(client);
            })
        })
        .collect::<Vec<_>>();

    for task in tasks {
        task.await.unwrap();
    }

    assert!(max_in_use.load(Ordering::SeqCst) <= 3);
    assert_eq!(pool.in_use_count(), 0);
    assert!(pool.size() <= 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_pool_rejects_acquire_and_closes_idle_clients() {
    init_test_tracing();
    let factory = MockClientFactory::new();
    let pool = ConnectionPool::new(factory.clone(), pool_config(2, 2, 100));
    pool.warm_up().await.unwrap();
    assert_eq!(pool.idle_count(), 2);

    pool.close().await;
    pool.close().await;

    assert!(pool.is_closed());
    assert_eq!(factory.closed(), 2);
    let err = pool.acquire().await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::PoolClosed);
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_client_creation_times_out() {
    init_test_tracing();
    let factory = MockClientFactory::new();
    factory.set_fail_creation(true);
    let pool = ConnectionPool::new(factory, pool_config(0, 1, 150));

    let err = pool.acquire().await.err().unwrap();

    assert_eq!(err.kind(), ErrorKind::ConnectionTimeout);
    assert_eq!(pool.in_use_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn with_client_releases_after_use() {
    init_test_tracing();
    let pool = ConnectionPool::new(MockClientFactory::new(), pool_config(0, 1, 100));

    let identity = pool
        .with_client(|client| async move { Ok(client.identity()) })
        .await
        .unwrap();

    assert_eq!(identity, 1);
    assert_eq!(pool.in_use_count(), 0);
    assert_eq!(pool.idle_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn acquire_cancelled_during_health_check_frees_its_slot() {
    init_test_tracing();
    let factory = MockClientFactory::new();
    let pool = ConnectionPool::new(factory.clone(), pool_config(1, 1, 1_000));
    factory.set_health_check_delay(Duration::from_millis(200));

    for _ in 0..3 {
        pool.warm_up().await.unwrap();
        assert_eq!(pool.idle_count(), 1);

        let result = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(result.is_err());

        assert_eq!(pool.size(), 0);
        assert_eq!(pool.in_use_count(), 0);
    }

    factory.set_health_check_delay(Duration::ZERO);
    pool.warm_up().await.unwrap();
    let client = pool.acquire().await.unwrap();
    assert_eq!(pool.size(), 1);
    assert_eq!(pool.in_use_count(), 1);
    drop(client);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(factory.created(), 4);
    assert_eq!(factory.closed(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_sweep_evicts_down_to_min_clients() {
    init_test_tracing();
    let factory = MockClientFactory::new();
    let pool = ConnectionPool::new(factory.clone(), sweeping_pool_config(1, 3));

    let clients = vec![
        pool.acquire().await.unwrap(),
        pool.acquire().await.unwrap(),
        pool.acquire().await.unwrap(),
    ];
    drop(clients);
    assert_eq!(pool.idle_count(), 3);

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(pool.size(), 1);
    assert_eq!(pool.idle_count(), 1);
    assert_eq!(factory.closed(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_sweep_never_evicts_clients_in_use() {
    init_test_tracing();
    let factory = MockClientFactory::new();
    let pool = ConnectionPool::new(factory.clone(), sweeping_pool_config(0, 2));

    let held = pool.acquire().await.unwrap();
    let identity = held.identity();
    drop(pool.acquire().await.unwrap());

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(pool.size(), 1);
    assert_eq!(pool.in_use_count(), 1);
    assert_eq!(factory.closed(), 1);
    assert_eq!(held.identity(), identity);

    drop(held);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(pool.size(), 0);
    assert_eq!(factory.closed(), 2);
}
