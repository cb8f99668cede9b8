use super::*;
use tokio::task::yield_now;
use tokio::time::advance;

async fn drain_timers() {
    for _ in 0..10 {
        yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn accepts_a_key_exactly_once_per_window() {
    let cache = DedupCache::new(Duration::from_secs(10));
    assert!(cache.should_process("new:1").await);
    assert!(!cache.should_process("new:1").await);

    advance(Duration::from_secs(5)).await;
    assert!(!cache.should_process("new:1").await);
}

#[tokio::test(start_paused = true)]
async fn evicts_entries_after_the_window() {
    let cache = DedupCache::new(Duration::from_secs(10));
    assert!(cache.should_process("new:1").await);

    advance(Duration::from_secs(11)).await;
    drain_timers().await;

    assert_eq!(cache.len().await, 0);
    assert!(cache.should_process("new:1").await);
}

#[tokio::test(start_paused = true)]
async fn repeats_do_not_extend_the_window() {
    let cache = DedupCache::new(Duration::from_secs(10));
    assert!(cache.should_process("update:7:true").await);

    advance(Duration::from_secs(6)).await;
    assert!(!cache.should_process("update:7:true").await);

    // The repeat at t=6 must not reset the eviction deadline.
    advance(Duration::from_secs(5)).await;
    drain_timers().await;
    assert!(cache.should_process("update:7:true").await);
}

#[tokio::test(start_paused = true)]
async fn distinct_keys_are_independent() {
    let cache = DedupCache::new(Duration::from_secs(10));
    assert!(cache.should_process("new:1").await);
    assert!(cache.should_process("new:2").await);
    assert!(cache.should_process("update:1:true").await);
    assert_eq!(cache.len().await, 3);
}
