use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    sync::Mutex,
    time::{sleep, Instant},
};
use tracing::trace;

/// Short-lived set of seen event keys.
///
/// The upstream transport may redeliver an event on reconnect, and a
/// row-level update notification can land right after the insert
/// notification for the same logical action; both must collapse to a single
/// processing pass. Entries are evicted by a removal task scheduled at
/// insertion time, so memory is bounded by recent event volume rather than
/// wall-clock accumulation.
pub struct DedupCache {
    window: Duration,
    seen: Arc<Mutex<HashMap<String, Instant>>>,
}

impl DedupCache {
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns `true` and records the key the first time it is seen;
    /// `false` on any repeat within the eviction window. Repeats have no
    /// side effects.
    pub async fn should_process(&self, key: &str) -> bool {
        let inserted_at = {
            let mut seen = self.seen.lock().await;
            if seen.contains_key(key) {
                trace!(key, "duplicate event key suppressed");
                return false;
            }
            let now = Instant::now();
            seen.insert(key.to_string(), now);
            now
        };

        let seen = Arc::clone(&self.seen);
        let key = key.to_string();
        let eviction = sleep(self.window);
        tokio::spawn(async move {
            eviction.await;
            let mut seen = seen.lock().await;
            // Only evict our own generation; a key re-inserted after a
            // prior eviction is owned by its own removal task.
            if seen.get(&key) == Some(&inserted_at) {
                seen.remove(&key);
            }
        });
        true
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

#[cfg(test)]
#[path = "tests/dedup_tests.rs"]
mod tests;
