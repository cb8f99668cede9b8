use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{normalize_pair, ConversationId, UserId},
    protocol::{ConversationRecord, MessageRecord, RealtimeEvent, SendMessageRequest},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};

pub mod backend;
pub mod channels;
pub mod connectivity;
pub mod conversation;
pub mod dedup;
pub mod error;
pub mod read_state;

pub use backend::HostedBackend;
pub use channels::ChannelManager;
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor};
pub use conversation::{ChatMessage, ConversationEvent, ConversationSession};
pub use dedup::DedupCache;
pub use error::{classify_send_error, SyncError};
pub use read_state::ReadStateSynchronizer;

const DEDUP_WINDOW: Duration = Duration::from_secs(10);
const CHANNEL_EVICTION_INTERVAL: Duration = Duration::from_secs(30 * 60);
const CHANNEL_MAX_IDLE: Duration = Duration::from_secs(30 * 60);

/// Opaque handle to one upstream subscription, issued by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Contract of the hosted realtime/query backend.
///
/// `subscribe` must be idempotent per topic: re-subscribing an
/// already-subscribed topic replaces the sink and keeps a single upstream
/// stream, which is what makes `recover_all` safe to call while connected.
#[async_trait]
pub trait RealtimeService: Send + Sync {
    async fn subscribe(
        &self,
        topic: &str,
        sink: broadcast::Sender<RealtimeEvent>,
    ) -> Result<SubscriptionId>;
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
    async fn get_or_create_conversation(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> Result<ConversationRecord>;
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<MessageRecord>>;
    async fn insert_message(&self, request: SendMessageRequest) -> Result<MessageRecord>;
    async fn mark_messages_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<()>;
    async fn unread_count(&self, conversation_id: ConversationId, user_id: UserId) -> Result<u64>;
    async fn upload_media(&self, local_ref: &str) -> Result<String>;
    async fn is_connected(&self) -> bool;
    async fn reconnect(&self) -> Result<()>;
}

/// Default backend used by bare constructors; every operation fails until a
/// real backend is injected.
pub struct MissingRealtimeService;

#[async_trait]
impl RealtimeService for MissingRealtimeService {
    async fn subscribe(
        &self,
        topic: &str,
        _sink: broadcast::Sender<RealtimeEvent>,
    ) -> Result<SubscriptionId> {
        Err(anyhow!("realtime backend unavailable for topic {topic}"))
    }

    async fn unsubscribe(&self, _id: SubscriptionId) -> Result<()> {
        Err(anyhow!("realtime backend unavailable"))
    }

    async fn get_or_create_conversation(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> Result<ConversationRecord> {
        Err(anyhow!(
            "realtime backend unavailable for users {} and {}",
            user_a.0,
            user_b.0
        ))
    }

    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        _limit: u32,
    ) -> Result<Vec<MessageRecord>> {
        Err(anyhow!(
            "realtime backend unavailable for conversation {}",
            conversation_id.0
        ))
    }

    async fn insert_message(&self, request: SendMessageRequest) -> Result<MessageRecord> {
        Err(anyhow!(
            "realtime backend unavailable for conversation {}",
            request.conversation_id.0
        ))
    }

    async fn mark_messages_read(
        &self,
        conversation_id: ConversationId,
        _user_id: UserId,
    ) -> Result<()> {
        Err(anyhow!(
            "realtime backend unavailable for conversation {}",
            conversation_id.0
        ))
    }

    async fn unread_count(&self, conversation_id: ConversationId, _user_id: UserId) -> Result<u64> {
        Err(anyhow!(
            "realtime backend unavailable for conversation {}",
            conversation_id.0
        ))
    }

    async fn upload_media(&self, _local_ref: &str) -> Result<String> {
        Err(anyhow!("realtime backend unavailable"))
    }

    async fn is_connected(&self) -> bool {
        false
    }

    async fn reconnect(&self) -> Result<()> {
        Err(anyhow!("realtime backend unavailable"))
    }
}

struct ClientState {
    user_id: Option<UserId>,
}

/// Root object of the synchronization core.
///
/// Owns the process-wide channel registry and dedup cache as constructed,
/// injected services rather than module-level globals, so tests build
/// isolated instances.
pub struct ChatClient {
    service: Arc<dyn RealtimeService>,
    channels: Arc<ChannelManager>,
    dedup: Arc<DedupCache>,
    read_state: Arc<ReadStateSynchronizer>,
    connectivity: Arc<ConnectivityMonitor>,
    inner: Mutex<ClientState>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new() -> Arc<Self> {
        Self::new_with_service(Arc::new(MissingRealtimeService))
    }

    pub fn new_with_service(service: Arc<dyn RealtimeService>) -> Arc<Self> {
        let channels = Arc::new(ChannelManager::new(Arc::clone(&service)));
        let connectivity = Arc::new(ConnectivityMonitor::new(
            Arc::clone(&service),
            Arc::clone(&channels),
        ));
        Arc::new(Self {
            read_state: Arc::new(ReadStateSynchronizer::new(Arc::clone(&service))),
            dedup: Arc::new(DedupCache::new(DEDUP_WINDOW)),
            channels,
            connectivity,
            service,
            inner: Mutex::new(ClientState { user_id: None }),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Record the authenticated user. Session mechanics live outside this
    /// core; the pipeline only needs the identity for reconciliation and
    /// read marks.
    pub async fn set_local_user(&self, user_id: UserId) {
        self.inner.lock().await.user_id = Some(user_id);
    }

    pub async fn local_user(&self) -> Result<UserId> {
        self.inner
            .lock()
            .await
            .user_id
            .ok_or_else(|| anyhow!("not signed in: missing user_id"))
    }

    /// Resolve the conversation between two users, creating it lazily on
    /// first contact. The pair is order-normalized, so `(a, b)` and `(b, a)`
    /// resolve to the same record.
    pub async fn get_or_create_conversation(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> Result<ConversationRecord> {
        let (user_a, user_b) = normalize_pair(user_a, user_b);
        self.service.get_or_create_conversation(user_a, user_b).await
    }

    /// Open the optimistic pipeline for one conversation screen. The session
    /// holds the channel subscription until `close` is called.
    pub async fn open_conversation(
        self: &Arc<Self>,
        conversation: ConversationRecord,
    ) -> Result<Arc<ConversationSession>> {
        let local_user = self.local_user().await?;
        Ok(ConversationSession::open(
            Arc::clone(&self.service),
            Arc::clone(&self.channels),
            Arc::clone(&self.dedup),
            Arc::clone(&self.read_state),
            conversation,
            local_user,
        )
        .await)
    }

    pub async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<()> {
        self.read_state
            .mark_conversation_read(conversation_id, user_id)
            .await
    }

    pub async fn unread_count(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<u64> {
        self.read_state.unread_count(conversation_id, user_id).await
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn subscribe_connectivity(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.connectivity.subscribe_events()
    }

    /// Spawn the connectivity health loop and the periodic stale-channel
    /// eviction. Call once at startup; a second call stacks duplicate tasks.
    pub async fn start(self: &Arc<Self>) {
        let health = self.connectivity.spawn_health_loop();
        let channels = Arc::clone(&self.channels);
        let eviction = tokio::spawn(async move {
            loop {
                tokio::time::sleep(CHANNEL_EVICTION_INTERVAL).await;
                channels.evict_stale(CHANNEL_MAX_IDLE).await;
            }
        });
        let mut background = self.background.lock().await;
        background.push(health);
        background.push(eviction);
    }

    pub async fn shutdown(&self) {
        for task in self.background.lock().await.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
