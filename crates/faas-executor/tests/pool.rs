mod support;

use faas_common::{FaasError, Priority};
use faas_executor::config::PoolConfig;
use faas_executor::container_pool::{ContainerPool, ContainerState};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use support::{signature, standard_adapter, MockBackend};

fn pool_with(backend: Arc<MockBackend>, config: PoolConfig) -> Arc<ContainerPool> {
    Arc::new(ContainerPool::new(standard_adapter(backend), config))
}

fn config(max_per_signature: usize, max_total: usize) -> PoolConfig {
    PoolConfig {
        max_per_signature,
        max_total,
        acquire_wait: Duration::from_millis(100),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_warm_container_is_reused_without_creation() {
    let backend = MockBackend::standard();
    let pool = pool_with(backend.clone(), config(4, 8));
    let sig = signature("hello", Priority::Normal);

    assert_eq!(pool.warm(&sig, 1).await.unwrap().len(), 1);
    assert_eq!(backend.created(), 1);

    let container = pool.acquire(&sig).await.unwrap();
    assert_eq!(container.state, ContainerState::InUse);
    assert!(container.cold_start.is_none());
    assert_eq!(backend.created(), 1);

    let stats = pool.stats().await;
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 0);
    assert_eq!(stats.in_use, 1);
}

#[tokio::test]
async fn test_miss_creates_and_reports_cold_start() {
    let backend = MockBackend::standard();
    let pool = pool_with(backend.clone(), config(4, 8));
    let sig = signature("hello", Priority::Normal);

    let container = pool.acquire(&sig).await.unwrap();
    assert!(container.cold_start.is_some());
    assert_eq!(container.use_count, 1);
    assert_eq!(backend.created(), 1);
    assert_eq!(pool.stats().await.misses, 1);
}

#[tokio::test]
async fn test_most_recently_released_is_preferred() {
    let backend = MockBackend::standard();
    let pool = pool_with(backend, config(4, 8));
    let sig = signature("hello", Priority::Normal);

    let first = pool.acquire(&sig).await.unwrap();
    let second = pool.acquire(&sig).await.unwrap();
    pool.release(&first, true).await;
    pool.release(&second, true).await;

    let next = pool.acquire(&sig).await.unwrap();
    assert_eq!(next.id(), second.id());
}

#[tokio::test]
async fn test_double_release_is_a_noop() {
    let backend = MockBackend::standard();
    let pool = pool_with(backend, config(4, 8));
    let sig = signature("hello", Priority::Normal);

    let container = pool.acquire(&sig).await.unwrap();
    pool.release(&container, true).await;
    pool.release(&container, true).await;
    pool.release(&container, false).await;

    let stats = pool.stats().await;
    assert_eq!(stats.total, 1);
    assert_eq!(stats.warm, 1);
    assert_eq!(stats.destroyed, 0);
}

#[tokio::test]
async fn test_unhealthy_release_destroys() {
    let backend = MockBackend::standard();
    let pool = pool_with(backend.clone(), config(4, 8));
    let sig = signature("hello", Priority::Normal);

    let container = pool.acquire(&sig).await.unwrap();
    pool.release(&container, false).await;

    assert_eq!(backend.destroyed(), 1);
    let stats = pool.stats().await;
    assert_eq!(stats.total, 0);
    assert_eq!(stats.warm, 0);
}

#[tokio::test]
async fn test_worn_out_container_is_retired() {
    let backend = MockBackend::standard();
    let pool = pool_with(
        backend.clone(),
        PoolConfig {
            max_use_count: 2,
            ..config(4, 8)
        },
    );
    let sig = signature("hello", Priority::Normal);

    let c = pool.acquire(&sig).await.unwrap();
    pool.release(&c, true).await;
    let c = pool.acquire(&sig).await.unwrap();
    assert_eq!(c.use_count, 2);
    pool.release(&c, true).await;

    assert_eq!(backend.destroyed(), 1);
    assert_eq!(pool.stats().await.total, 0);
}

#[tokio::test(start_paused = true)]
async fn test_per_signature_cap_exhausts_after_wait() {
    let backend = MockBackend::standard();
    let pool = pool_with(backend.clone(), config(2, 8));
    let sig = signature("hello", Priority::Normal);

    let _a = pool.acquire(&sig).await.unwrap();
    let _b = pool.acquire(&sig).await.unwrap();
    let err = pool.acquire(&sig).await.unwrap_err();
    assert!(matches!(err, FaasError::ResourceExhausted(_)));
    assert!(err.is_retriable());

    let stats = pool.signature_stats(&sig).await;
    assert_eq!(stats.in_use, 2);
    assert_eq!(stats.total, 2);
    assert_eq!(backend.created(), 2);
}

#[tokio::test]
async fn test_waiter_takes_released_container() {
    let backend = MockBackend::standard();
    let pool = pool_with(
        backend.clone(),
        PoolConfig {
            acquire_wait: Duration::from_secs(5),
            ..config(1, 8)
        },
    );
    let sig = signature("hello", Priority::Normal);

    let held = pool.acquire(&sig).await.unwrap();
    let waiter = {
        let pool = pool.clone();
        let sig = sig.clone();
        tokio::spawn(async move { pool.acquire(&sig).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.release(&held, true).await;

    let reused = waiter.await.unwrap().unwrap();
    assert_eq!(reused.id(), held.id());
    assert_eq!(backend.created(), 1);
}

#[tokio::test]
async fn test_cancelled_waiter_stops_before_acquire_wait() {
    let backend = MockBackend::standard();
    let pool = pool_with(
        backend.clone(),
        PoolConfig {
            acquire_wait: Duration::from_secs(30),
            ..config(1, 8)
        },
    );
    let sig = signature("hello", Priority::Normal);
    let _held = pool.acquire(&sig).await.unwrap();

    let cancel = CancellationToken::new();
    let waiter = {
        let pool = pool.clone();
        let sig = sig.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.acquire_until(&sig, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should stop promptly")
        .unwrap();
    assert!(matches!(result, Err(FaasError::Cancelled)));
    // Nothing was reserved for the cancelled request.
    assert_eq!(pool.signature_stats(&sig).await.total, 1);
    assert_eq!(backend.create_attempts(), 1);
}

#[tokio::test]
async fn test_global_cap_evicts_lru_of_lower_priority() {
    let backend = MockBackend::standard();
    let pool = pool_with(backend.clone(), config(2, 2));
    let low = signature("batch", Priority::Low);
    let normal = signature("api", Priority::Normal);

    let a = pool.acquire(&low).await.unwrap();
    let b = pool.acquire(&low).await.unwrap();
    pool.release(&a, true).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    pool.release(&b, true).await;

    let fresh = pool.acquire(&normal).await.unwrap();
    assert!(fresh.cold_start.is_some());

    let stats = pool.stats().await;
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.total, 2);
    // `a` was released first, so it was the least recently used.
    let survivor = pool.acquire(&low).await.unwrap();
    assert_eq!(survivor.id(), b.id());
    assert_eq!(backend.live(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_higher_priority_warm_containers_are_not_evicted() {
    let backend = MockBackend::standard();
    let pool = pool_with(backend, config(2, 2));
    let high = signature("critical", Priority::High);
    let low = signature("batch", Priority::Low);

    pool.warm(&high, 2).await.unwrap();
    let err = pool.acquire(&low).await.unwrap_err();
    assert!(matches!(err, FaasError::ResourceExhausted(_)));
    assert_eq!(pool.stats().await.evictions, 0);
}

#[tokio::test]
async fn test_warm_is_bounded_by_caps() {
    let backend = MockBackend::standard();
    let pool = pool_with(backend.clone(), config(3, 4));
    let sig = signature("hello", Priority::Normal);

    assert_eq!(pool.warm(&sig, 10).await.unwrap().len(), 3);
    assert_eq!(backend.created(), 3);
    assert_eq!(pool.stats().await.warm, 3);
}

#[tokio::test]
async fn test_failed_creation_releases_its_slot() {
    let backend = MockBackend::standard();
    let pool = pool_with(backend.clone(), config(1, 1));
    let sig = signature("hello", Priority::Normal);

    backend.fail_next_creates(1);
    let err = pool.acquire(&sig).await.unwrap_err();
    assert!(matches!(err, FaasError::RuntimeUnavailable(_)));
    assert_eq!(pool.stats().await.total, 0);

    pool.acquire(&sig).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_idle_reaper_destroys_expired_containers() {
    let backend = MockBackend::standard();
    let pool = pool_with(
        backend.clone(),
        PoolConfig {
            idle_ttl: Duration::from_secs(60),
            ..config(4, 8)
        },
    );
    let sig = signature("hello", Priority::Normal);
    pool.warm(&sig, 2).await.unwrap();

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(pool.reap_idle().await, 0);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(pool.reap_idle().await, 2);
    assert_eq!(backend.destroyed(), 2);
    assert_eq!(pool.stats().await.total, 0);
}

#[tokio::test(start_paused = true)]
async fn test_reaper_task_runs_on_interval() {
    let backend = MockBackend::standard();
    let pool = pool_with(
        backend.clone(),
        PoolConfig {
            idle_ttl: Duration::from_secs(10),
            reap_interval: Duration::from_secs(5),
            ..config(4, 8)
        },
    );
    let sig = signature("hello", Priority::Normal);
    pool.warm(&sig, 1).await.unwrap();

    let token = tokio_util::sync::CancellationToken::new();
    let reaper = pool.spawn_reaper(token.clone());
    tokio::time::sleep(Duration::from_secs(16)).await;
    assert_eq!(backend.destroyed(), 1);

    token.cancel();
    reaper.await.unwrap();
}

#[tokio::test]
async fn test_drain_destroys_warm_and_retires_on_release() {
    let backend = MockBackend::standard();
    let pool = pool_with(backend.clone(), config(4, 8));
    let sig = signature("hello", Priority::Normal);

    pool.warm(&sig, 2).await.unwrap();
    let borrowed = pool.acquire(&sig).await.unwrap();
    assert_eq!(pool.drain().await, 1);

    pool.release(&borrowed, true).await;
    assert_eq!(backend.live(), 0);
    assert!(matches!(
        pool.acquire(&sig).await,
        Err(FaasError::ShuttingDown)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_caps_hold_under_concurrency() {
    let backend = Arc::new(MockBackend::new(faas_common::SandboxKind::Standard).with_create_delay(Duration::from_millis(2)));
    let pool = pool_with(
        backend.clone(),
        PoolConfig {
            acquire_wait: Duration::from_secs(5),
            ..config(2, 3)
        },
    );
    let signatures = [
        signature("a", Priority::Normal),
        signature("b", Priority::Normal),
        signature("c", Priority::Normal),
    ];

    let tasks: Vec<_> = (0..24)
        .map(|i| {
            let pool = pool.clone();
            let sig = signatures[i % signatures.len()].clone();
            tokio::spawn(async move {
                for _ in 0..5 {
                    let container = pool.acquire(&sig).await.unwrap();
                    let stats = pool.signature_stats(&sig).await;
                    assert!(stats.in_use <= 2);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    pool.release(&container, true).await;
                }
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    assert!(backend.max_live() <= 3, "max live {}", backend.max_live());
    let stats = pool.stats().await;
    assert!(stats.total <= 3);
    assert_eq!(stats.in_use, 0);
}
