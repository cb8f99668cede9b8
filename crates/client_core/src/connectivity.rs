use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, warn};

use crate::{channels::ChannelManager, RealtimeService};

const CONNECTIVITY_EVENT_CAPACITY: usize = 16;

/// User-facing connectivity signal, consumed by banner/toast presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

struct MonitorState {
    reachable: bool,
    foregrounded: bool,
}

/// Observes network reachability and app foreground/background transitions
/// and drives subscription recovery.
///
/// The embedding platform feeds transitions in via `set_reachable` /
/// `set_foreground`; a polling health check covers transport drops that
/// produce no platform signal.
pub struct ConnectivityMonitor {
    service: Arc<dyn RealtimeService>,
    channels: Arc<ChannelManager>,
    state: Mutex<MonitorState>,
    events: broadcast::Sender<ConnectivityEvent>,
    health_interval: Duration,
}

impl ConnectivityMonitor {
    pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

    pub fn new(service: Arc<dyn RealtimeService>, channels: Arc<ChannelManager>) -> Self {
        Self::with_health_interval(service, channels, Self::DEFAULT_HEALTH_INTERVAL)
    }

    pub fn with_health_interval(
        service: Arc<dyn RealtimeService>,
        channels: Arc<ChannelManager>,
        health_interval: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(CONNECTIVITY_EVENT_CAPACITY);
        Self {
            service,
            channels,
            state: Mutex::new(MonitorState {
                reachable: true,
                foregrounded: true,
            }),
            events,
            health_interval,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    /// Report a network reachability change. A transition to reachable
    /// triggers subscription recovery.
    pub async fn set_reachable(&self, reachable: bool) {
        let became_reachable = {
            let mut state = self.state.lock().await;
            let changed = state.reachable != reachable;
            state.reachable = reachable;
            changed && reachable
        };

        if became_reachable {
            let _ = self.events.send(ConnectivityEvent::Online);
            self.recover().await;
        } else if !reachable {
            let _ = self.events.send(ConnectivityEvent::Offline);
        }
    }

    /// Report an app lifecycle transition. Returning to the foreground while
    /// reachable triggers subscription recovery.
    pub async fn set_foreground(&self, foregrounded: bool) {
        let should_recover = {
            let mut state = self.state.lock().await;
            let entered_foreground = foregrounded && !state.foregrounded;
            state.foregrounded = foregrounded;
            entered_foreground && state.reachable
        };

        if should_recover {
            self.recover().await;
        }
    }

    /// Reconnect the transport if needed, then re-issue every live
    /// subscription idempotently.
    pub async fn recover(&self) {
        if !self.service.is_connected().await {
            if let Err(err) = self.service.reconnect().await {
                warn!("transport reconnect failed: {err:#}");
            }
        }
        self.channels.recover_all().await;
    }

    /// Periodic health check, active only while foregrounded. Polling is
    /// deliberate: the transport does not expose connection-state callbacks
    /// on every platform.
    pub fn spawn_health_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let first_tick = sleep(self.health_interval);
        tokio::spawn(async move {
            let mut timer = first_tick;
            loop {
                timer.await;
                timer = sleep(monitor.health_interval);
                let foregrounded = monitor.state.lock().await.foregrounded;
                if !foregrounded {
                    continue;
                }
                if !monitor.service.is_connected().await {
                    debug!("health check found transport disconnected, recovering");
                    monitor.recover().await;
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/connectivity_tests.rs"]
mod tests;
