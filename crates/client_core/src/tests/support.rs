use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{normalize_pair, ConversationId, UserId},
    error::{ApiException, ErrorCode},
    protocol::{conversation_topic, ConversationRecord, MessageRecord, RealtimeEvent, SendMessageRequest},
};
use tokio::sync::{broadcast, Mutex};

use crate::{RealtimeService, SubscriptionId};

/// Call-recording backend fake. Tests drive the event stream either by
/// pushing events into the registered sink directly or by enabling
/// `auto_echo`, which mirrors the hosted backend's behavior of echoing every
/// confirmed insert back through the stream.
pub(crate) struct FakeRealtimeService {
    pub subscribe_calls: Mutex<Vec<String>>,
    pub unsubscribe_calls: Mutex<Vec<SubscriptionId>>,
    pub sinks: Mutex<HashMap<String, broadcast::Sender<RealtimeEvent>>>,
    next_subscription_id: AtomicU64,
    pub fail_subscribes: AtomicUsize,
    pub inserted: Mutex<Vec<SendMessageRequest>>,
    pub send_failure: Mutex<Option<(ErrorCode, String)>>,
    pub auto_echo: AtomicBool,
    pub echo_client_ref: AtomicBool,
    next_message_id: AtomicI64,
    pub store: Mutex<Vec<MessageRecord>>,
    pub mark_read_calls: AtomicUsize,
    pub upload_result: Mutex<Option<String>>,
    pub connected: AtomicBool,
    pub reconnect_calls: AtomicUsize,
}

impl FakeRealtimeService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribe_calls: Mutex::new(Vec::new()),
            unsubscribe_calls: Mutex::new(Vec::new()),
            sinks: Mutex::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(0),
            fail_subscribes: AtomicUsize::new(0),
            inserted: Mutex::new(Vec::new()),
            send_failure: Mutex::new(None),
            auto_echo: AtomicBool::new(false),
            echo_client_ref: AtomicBool::new(true),
            next_message_id: AtomicI64::new(100),
            store: Mutex::new(Vec::new()),
            mark_read_calls: AtomicUsize::new(0),
            upload_result: Mutex::new(Some("remote://media/1".to_string())),
            connected: AtomicBool::new(true),
            reconnect_calls: AtomicUsize::new(0),
        })
    }

    pub async fn push(&self, topic: &str, event: RealtimeEvent) {
        let sinks = self.sinks.lock().await;
        let sink = sinks.get(topic).expect("no sink registered for topic");
        let _ = sink.send(event);
    }

    pub async fn subscribe_count(&self, topic: &str) -> usize {
        self.subscribe_calls
            .lock()
            .await
            .iter()
            .filter(|t| t.as_str() == topic)
            .count()
    }

    pub fn confirm(&self, request: &SendMessageRequest) -> MessageRecord {
        MessageRecord {
            message_id: shared::domain::MessageId(
                self.next_message_id.fetch_add(1, Ordering::SeqCst),
            ),
            conversation_id: request.conversation_id,
            sender_id: request.sender_id,
            receiver_id: request.receiver_id,
            body: request.body.clone(),
            read: false,
            sent_at: Utc::now(),
            client_ref: self
                .echo_client_ref
                .load(Ordering::SeqCst)
                .then_some(request.client_ref),
        }
    }
}

pub(crate) fn sample_conversation(user_a: UserId, user_b: UserId) -> ConversationRecord {
    let (user_a, user_b) = normalize_pair(user_a, user_b);
    ConversationRecord {
        conversation_id: ConversationId(1),
        user_a,
        user_b,
        last_activity_at: Utc::now(),
    }
}

#[async_trait]
impl RealtimeService for FakeRealtimeService {
    async fn subscribe(
        &self,
        topic: &str,
        sink: broadcast::Sender<RealtimeEvent>,
    ) -> Result<SubscriptionId> {
        self.subscribe_calls.lock().await.push(topic.to_string());
        if self.fail_subscribes.load(Ordering::SeqCst) > 0 {
            self.fail_subscribes.fetch_sub(1, Ordering::SeqCst);
            return Err(anyhow!("subscribe refused for topic {topic}"));
        }
        self.sinks.lock().await.insert(topic.to_string(), sink);
        Ok(SubscriptionId(
            self.next_subscription_id.fetch_add(1, Ordering::SeqCst),
        ))
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.unsubscribe_calls.lock().await.push(id);
        Ok(())
    }

    async fn get_or_create_conversation(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> Result<ConversationRecord> {
        Ok(sample_conversation(user_a, user_b))
    }

    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<MessageRecord>> {
        let store = self.store.lock().await;
        Ok(store
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn insert_message(&self, request: SendMessageRequest) -> Result<MessageRecord> {
        if let Some((code, message)) = self.send_failure.lock().await.clone() {
            return Err(ApiException::new(code, message).into());
        }
        self.inserted.lock().await.push(request.clone());
        let record = self.confirm(&request);
        self.store.lock().await.push(record.clone());
        if self.auto_echo.load(Ordering::SeqCst) {
            self.push(
                &conversation_topic(record.conversation_id),
                RealtimeEvent::MessageInserted {
                    message: record.clone(),
                },
            )
            .await;
        }
        Ok(record)
    }

    async fn mark_messages_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<()> {
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        let mut store = self.store.lock().await;
        for message in store
            .iter_mut()
            .filter(|m| m.conversation_id == conversation_id && m.receiver_id == user_id)
        {
            message.read = true;
        }
        Ok(())
    }

    async fn unread_count(&self, conversation_id: ConversationId, user_id: UserId) -> Result<u64> {
        let store = self.store.lock().await;
        Ok(store
            .iter()
            .filter(|m| {
                m.conversation_id == conversation_id && m.receiver_id == user_id && !m.read
            })
            .count() as u64)
    }

    async fn upload_media(&self, local_ref: &str) -> Result<String> {
        self.upload_result
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow!("upload failed for {local_ref}"))
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
}
