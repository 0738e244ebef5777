mod test_harness;

use std::time::{Duration, Instant};

use browser_pool::PoolError;
use test_harness::*;

const DRAIN: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_wait_blocks_until_everything_is_done() {
    let site = demo_site();
    let pool = start_pool(test_config(2), &site).await;
    let collector = collector();

    let started = Instant::now();
    pool.queue(hold_job(&collector, 300), hold_cb()).await.unwrap();
    pool.queue(hold_job(&collector, 300), hold_cb()).await.unwrap();
    assert!(!pool.done().unwrap());

    wait_with_timeout(&pool, DRAIN).await;

    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(leases(&collector).len(), 2);
    assert!(pool.done().unwrap());

    pool.shutdown(false).await;
}

#[tokio::test]
async fn test_wait_returns_at_once_when_idle() {
    let site = demo_site();
    let pool = start_pool(test_config(1), &site).await;

    tokio::time::timeout(Duration::from_millis(100), pool.wait())
        .await
        .expect("idle pool should not block")
        .unwrap();

    pool.shutdown(false).await;
}

/// Test that shutdown without waiting does not block on in-flight jobs.
#[tokio::test]
async fn test_shutdown_without_wait_returns_promptly() {
    let site = demo_site();
    let pool = start_pool(test_config(1), &site).await;
    let collector = collector();

    pool.queue(hold_job(&collector, 5_000), hold_cb()).await.unwrap();
    assert!(eventually(DRAIN, || async { pool.queue_size() == 0 }).await);

    let started = Instant::now();
    assert!(pool.shutdown(false).await);
    assert!(started.elapsed() < Duration::from_secs(1));

    assert!(leases(&collector).is_empty());
    assert_eq!(pool.pending_job_counter(), 0);
}

/// Test that shutdown with waiting lets the in-flight job finish.
#[tokio::test]
async fn test_shutdown_with_wait_finishes_in_flight_jobs() {
    let site = demo_site();
    let pool = start_pool(test_config(1), &site).await;
    let collector = collector();

    pool.queue(hold_job(&collector, 400), hold_cb()).await.unwrap();
    assert!(eventually(DRAIN, || async { pool.queue_size() == 0 }).await);

    assert!(pool.shutdown(true).await);

    assert_eq!(leases(&collector).len(), 1);
    assert_eq!(pool.pending_job_counter(), 0);
}

/// Test that shutdown drops queued jobs instead of running them.
#[tokio::test]
async fn test_shutdown_drops_queued_jobs() {
    let site = demo_site();
    let pool = start_pool(test_config(1), &site).await;
    let collector = collector();

    pool.queue(hold_job(&collector, 300), hold_cb()).await.unwrap();
    assert!(eventually(DRAIN, || async { pool.queue_size() == 0 }).await);
    for _ in 0..5 {
        pool.with_browser(collector_args(&collector), lease_cb())
            .await
            .unwrap();
    }
    assert_eq!(pool.queue_size(), 5);

    pool.shutdown(true).await;

    assert_eq!(leases(&collector).len(), 1);
    assert_eq!(pool.queue_size(), 0);
    assert_eq!(pool.pending_job_counter(), 0);
}

#[tokio::test]
async fn test_waiters_are_released_by_shutdown() {
    let site = demo_site();
    let pool = start_pool(test_config(1), &site).await;
    let collector = collector();

    pool.queue(hold_job(&collector, 5_000), hold_cb()).await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.wait().await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    pool.shutdown(false).await;

    let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should be released")
        .unwrap();
    assert!(matches!(outcome, Err(PoolError::AlreadyShutdown)));
}

#[tokio::test]
async fn test_shutdown_kills_engines() {
    let site = demo_site();
    let pool = start_pool(test_config(2), &site).await;
    let pids: Vec<u32> = pool
        .workers()
        .await
        .into_iter()
        .filter_map(|w| w.pid)
        .collect();
    assert_eq!(pids.len(), 2);

    pool.shutdown(true).await;

    for pid in pids {
        assert!(!process_exists(pid), "engine {} should be dead", pid);
    }
}

/// Whether `pid` names a live, unreaped process.
fn process_exists(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .map(|stat| !stat.contains(") Z "))
        .unwrap_or(false)
}
