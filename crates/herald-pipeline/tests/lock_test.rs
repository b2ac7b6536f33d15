//! Worker lock: mutual exclusion, lease expiry and loss detection.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::{sync::Arc, time::Duration};

use herald_core::{Clock, TestClock};
use herald_pipeline::{lock::mock::MemoryLeaseStore, LockConfig, WorkerLock};

fn contenders(clock: &TestClock, count: usize) -> (MemoryLeaseStore, Vec<WorkerLock>) {
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let store = MemoryLeaseStore::new(shared.clone());
    let locks = (0..count)
        .map(|_| WorkerLock::new(Arc::new(store.clone()), LockConfig::default(), shared.clone()))
        .collect();
    (store, locks)
}

#[tokio::test]
async fn exactly_one_contender_wins() {
    let clock = TestClock::new();
    let (_store, locks) = contenders(&clock, 2);

    let (first, second) = tokio::join!(locks[0].acquire(), locks[1].acquire());
    let guards: Vec<_> = [first.unwrap(), second.unwrap()].into_iter().flatten().collect();

    assert_eq!(guards.len(), 1);
    let owned: Vec<_> = futures::future::join_all(locks.iter().map(WorkerLock::status)).await;
    assert_eq!(owned.iter().filter(|s| s.as_ref().unwrap().owned_by_this_process).count(), 1);

    for guard in guards {
        guard.release().await.unwrap();
    }
}

#[tokio::test]
async fn released_lock_is_free_immediately() {
    let clock = TestClock::new();
    let (_store, locks) = contenders(&clock, 2);

    let guard = locks[0].acquire().await.unwrap().expect("lock should be free");
    assert!(locks[1].acquire().await.unwrap().is_none());

    assert!(guard.release().await.unwrap());

    let next = locks[1].acquire().await.unwrap().expect("released lock should be free");
    next.release().await.unwrap();
}

#[tokio::test]
async fn crashed_holder_lapses_after_ttl() {
    let clock = TestClock::new();
    let (_store, locks) = contenders(&clock, 2);

    let guard = locks[0].acquire().await.unwrap().expect("lock should be free");
    // Dropping stops the refresh loop without deleting the lease.
    drop(guard);

    assert!(locks[1].acquire().await.unwrap().is_none());

    clock.advance(Duration::from_secs(61));
    let next = locks[1].acquire().await.unwrap().expect("expired lease should be free");
    assert!(locks[1].status().await.unwrap().owned_by_this_process);
    next.release().await.unwrap();
}

#[tokio::test]
async fn refresh_keeps_the_lease_past_its_ttl() {
    let clock = TestClock::new();
    let (_store, locks) = contenders(&clock, 2);

    let guard = locks[0].acquire().await.unwrap().expect("lock should be free");
    while clock.elapsed() < Duration::from_secs(300) {
        tokio::task::yield_now().await;
    }

    assert!(!guard.is_lost());
    assert!(locks[1].acquire().await.unwrap().is_none());
    guard.release().await.unwrap();
}

#[tokio::test]
async fn stolen_lease_is_reported_lost() {
    let clock = TestClock::new();
    let (store, locks) = contenders(&clock, 1);

    let guard = locks[0].acquire().await.unwrap().expect("lock should be free");
    store.steal(&locks[0].key(), "another-process", Duration::from_secs(600)).await;

    tokio::time::timeout(Duration::from_secs(5), guard.lost().cancelled())
        .await
        .expect("refresh should notice the stolen lease");

    assert!(guard.is_lost());
    let status = locks[0].status().await.unwrap();
    assert!(status.exists);
    assert!(!status.owned_by_this_process);
    assert!(!guard.release().await.unwrap());
}

#[tokio::test]
async fn unreachable_store_gives_up_the_lease_after_its_ttl() {
    let clock = TestClock::new();
    let (store, locks) = contenders(&clock, 2);

    let guard = locks[0].acquire().await.unwrap().expect("lock should be free");
    store.set_unreachable(true);

    tokio::time::timeout(Duration::from_secs(5), guard.lost().cancelled())
        .await
        .expect("refresh failures past the ttl should drop the lease");

    assert!(clock.elapsed() >= Duration::from_secs(60));
    assert!(!locks[0].status().await.unwrap().owned_by_this_process);
    assert!(locks[1].acquire().await.unwrap().is_some());
}

#[tokio::test]
async fn brief_store_outage_keeps_the_lease() {
    let clock = TestClock::new();
    let (store, locks) = contenders(&clock, 1);

    let guard = locks[0].acquire().await.unwrap().expect("lock should be free");
    store.set_unreachable(true);
    while clock.elapsed() < Duration::from_secs(30) {
        tokio::task::yield_now().await;
    }
    store.set_unreachable(false);
    while clock.elapsed() < Duration::from_secs(300) {
        tokio::task::yield_now().await;
    }

    assert!(!guard.is_lost());
    assert!(locks[0].status().await.unwrap().owned_by_this_process);
    guard.release().await.unwrap();
}
