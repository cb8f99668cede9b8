use std::{collections::HashMap, sync::Arc, time::Duration};

use shared::protocol::RealtimeEvent;
use tokio::{
    sync::{broadcast, Mutex},
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{RealtimeService, SubscriptionId};

const CHANNEL_FANOUT_CAPACITY: usize = 256;

struct ChannelRegistration {
    sink: broadcast::Sender<RealtimeEvent>,
    upstream: Option<SubscriptionId>,
    subscribers: usize,
    last_active_at: Instant,
}

/// Ref-counted registry mapping a logical topic key to one live upstream
/// subscription.
///
/// Any number of screens may acquire the same topic; the upstream stream is
/// subscribed once and fanned out through a broadcast channel. The upstream
/// subscription is torn down exactly when the subscriber count reaches zero
/// or the registration is evicted as stale.
pub struct ChannelManager {
    service: Arc<dyn RealtimeService>,
    inner: Mutex<HashMap<String, ChannelRegistration>>,
}

impl ChannelManager {
    pub fn new(service: Arc<dyn RealtimeService>) -> Self {
        Self {
            service,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to a topic, reusing the existing upstream subscription when
    /// one is live.
    ///
    /// An upstream subscribe failure does not fail the acquire: the
    /// registration is kept without a live handle and the caller receives no
    /// events until a later `recover_all` succeeds.
    pub async fn acquire(&self, topic: &str) -> broadcast::Receiver<RealtimeEvent> {
        let mut inner = self.inner.lock().await;
        if let Some(registration) = inner.get_mut(topic) {
            registration.subscribers += 1;
            registration.last_active_at = Instant::now();
            debug!(
                topic,
                subscribers = registration.subscribers,
                "reusing channel registration"
            );
            return registration.sink.subscribe();
        }

        let (sink, receiver) = broadcast::channel(CHANNEL_FANOUT_CAPACITY);
        let upstream = match self.service.subscribe(topic, sink.clone()).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(topic, "upstream subscribe failed, awaiting recovery: {err:#}");
                None
            }
        };
        inner.insert(
            topic.to_string(),
            ChannelRegistration {
                sink,
                upstream,
                subscribers: 1,
                last_active_at: Instant::now(),
            },
        );
        receiver
    }

    /// Decrement the subscriber count for a topic; tears the upstream
    /// subscription down when the count reaches zero. Releasing a topic with
    /// no registration is a no-op.
    pub async fn release(&self, topic: &str) {
        let removed = {
            let mut inner = self.inner.lock().await;
            let Some(registration) = inner.get_mut(topic) else {
                return;
            };
            registration.subscribers = registration.subscribers.saturating_sub(1);
            registration.last_active_at = Instant::now();
            if registration.subscribers > 0 {
                debug!(
                    topic,
                    subscribers = registration.subscribers,
                    "channel released, registration still active"
                );
                return;
            }
            inner.remove(topic)
        };

        if let Some(registration) = removed {
            if let Some(upstream) = registration.upstream {
                if let Err(err) = self.service.unsubscribe(upstream).await {
                    warn!(topic, "upstream unsubscribe failed: {err:#}");
                }
            }
            debug!(topic, "channel registration removed");
        }
    }

    /// Re-issue the upstream subscribe for every live registration. Safe to
    /// call when the transport is already connected; used after connectivity
    /// loss or app resume.
    pub async fn recover_all(&self) {
        let mut inner = self.inner.lock().await;
        for (topic, registration) in inner.iter_mut() {
            match self.service.subscribe(topic, registration.sink.clone()).await {
                Ok(id) => {
                    registration.upstream = Some(id);
                    registration.last_active_at = Instant::now();
                }
                Err(err) => {
                    warn!(topic, "recovery subscribe failed: {err:#}");
                }
            }
        }
    }

    /// Remove registrations idle longer than `max_idle`, unsubscribing
    /// first. Bounds memory growth from topics whose screens never released.
    pub async fn evict_stale(&self, max_idle: Duration) {
        let now = Instant::now();
        let evicted: Vec<(String, Option<SubscriptionId>)> = {
            let mut inner = self.inner.lock().await;
            let stale: Vec<String> = inner
                .iter()
                .filter(|(_, registration)| {
                    now.duration_since(registration.last_active_at) > max_idle
                })
                .map(|(topic, _)| topic.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|topic| {
                    inner
                        .remove(&topic)
                        .map(|registration| (topic, registration.upstream))
                })
                .collect()
        };

        for (topic, upstream) in evicted {
            if let Some(upstream) = upstream {
                if let Err(err) = self.service.unsubscribe(upstream).await {
                    warn!(topic, "unsubscribe during stale eviction failed: {err:#}");
                }
            }
            info!(topic, "evicted stale channel registration");
        }
    }

    pub async fn registration_count(&self) -> usize {
        self.inner.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn subscriber_count(&self, topic: &str) -> Option<usize> {
        self.inner
            .lock()
            .await
            .get(topic)
            .map(|registration| registration.subscribers)
    }
}

#[cfg(test)]
#[path = "tests/channels_tests.rs"]
mod tests;
