use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, DeliveryState, MessageBody, MessageId, UserId},
    protocol::{conversation_topic, ConversationRecord, MessageRecord, RealtimeEvent, SendMessageRequest},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    channels::ChannelManager,
    dedup::DedupCache,
    error::{classify_send_error, SyncError},
    read_state::ReadStateSynchronizer,
    RealtimeService,
};

/// Maximum clock skew between a provisional entry and its confirmed echo for
/// the heuristic fallback match.
const RECONCILE_WINDOW_SECS: i64 = 60;
const CONVERSATION_EVENT_CAPACITY: usize = 256;
const HISTORY_FETCH_LIMIT: u32 = 50;

/// One entry of a conversation screen's message list.
///
/// `local_id` is assigned at send time and stays stable across
/// reconciliation so the UI row identity never changes; `message_id` is
/// filled in once the server confirms the row.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub local_id: Uuid,
    pub message_id: Option<MessageId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: MessageBody,
    pub read: bool,
    pub sent_at: DateTime<Utc>,
    pub state: DeliveryState,
}

impl ChatMessage {
    fn provisional(request: &SendMessageRequest, sent_at: DateTime<Utc>) -> Self {
        Self {
            local_id: request.client_ref,
            message_id: None,
            conversation_id: request.conversation_id,
            sender_id: request.sender_id,
            receiver_id: request.receiver_id,
            body: request.body.clone(),
            read: false,
            sent_at,
            state: DeliveryState::Pending,
        }
    }

    fn from_record(record: &MessageRecord) -> Self {
        Self {
            local_id: record.client_ref.unwrap_or_else(Uuid::new_v4),
            message_id: Some(record.message_id),
            conversation_id: record.conversation_id,
            sender_id: record.sender_id,
            receiver_id: record.receiver_id,
            body: record.body.clone(),
            read: record.read,
            sent_at: record.sent_at,
            state: DeliveryState::Confirmed,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConversationEvent {
    MessageAppended(ChatMessage),
    MessageConfirmed { index: usize, message: ChatMessage },
    MessageFailed { index: usize, message: ChatMessage },
    MessageRead { index: usize, message: ChatMessage },
    MessageDismissed { local_id: Uuid },
}

/// Optimistic message pipeline for one open conversation screen.
///
/// Owns the in-memory message list, feeds it from the deduplicated event
/// stream, and reconciles provisional sends against their confirmed echoes.
/// State machine per outgoing message: `Pending -> Confirmed | Failed`; a
/// failed entry stays in place until dismissed, and resending creates a
/// brand-new provisional entry.
pub struct ConversationSession {
    service: Arc<dyn RealtimeService>,
    channels: Arc<ChannelManager>,
    dedup: Arc<DedupCache>,
    read_state: Arc<ReadStateSynchronizer>,
    conversation: ConversationRecord,
    local_user: UserId,
    topic: String,
    messages: Mutex<Vec<ChatMessage>>,
    events: broadcast::Sender<ConversationEvent>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSession")
            .field("conversation", &self.conversation)
            .field("local_user", &self.local_user)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl ConversationSession {
    pub(crate) async fn open(
        service: Arc<dyn RealtimeService>,
        channels: Arc<ChannelManager>,
        dedup: Arc<DedupCache>,
        read_state: Arc<ReadStateSynchronizer>,
        conversation: ConversationRecord,
        local_user: UserId,
    ) -> Arc<Self> {
        let topic = conversation_topic(conversation.conversation_id);
        let receiver = channels.acquire(&topic).await;

        let history = match service
            .fetch_messages(conversation.conversation_id, HISTORY_FETCH_LIMIT)
            .await
        {
            Ok(records) => records.iter().map(ChatMessage::from_record).collect(),
            Err(err) => {
                warn!(
                    conversation_id = conversation.conversation_id.0,
                    "history fetch failed, starting from an empty list: {err:#}"
                );
                Vec::new()
            }
        };

        let (events, _) = broadcast::channel(CONVERSATION_EVENT_CAPACITY);
        let session = Arc::new(Self {
            service,
            channels,
            dedup,
            read_state,
            conversation,
            local_user,
            topic,
            messages: Mutex::new(history),
            events,
            event_task: Mutex::new(None),
        });

        let task = session.spawn_event_loop(receiver);
        *session.event_task.lock().await = Some(task);
        session
    }

    pub fn conversation(&self) -> &ConversationRecord {
        &self.conversation
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the message list in display order.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().await.clone()
    }

    /// Locally-derived unread counter: inbound messages not yet flagged read.
    pub async fn unread_count(&self) -> usize {
        self.messages
            .lock()
            .await
            .iter()
            .filter(|message| message.sender_id != self.local_user && !message.read)
            .count()
    }

    /// Insert a provisional text message at the list tail and dispatch the
    /// real send asynchronously. Returns the provisional identifier.
    pub async fn send_text_message(self: &Arc<Self>, text: impl Into<String>) -> Uuid {
        let request = self.build_request(MessageBody::Text { text: text.into() });
        self.push_provisional(&request).await;
        let client_ref = request.client_ref;

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.dispatch_send(request).await;
        });
        client_ref
    }

    /// Audio variant: the provisional entry shows the local recording so the
    /// sender can play it back immediately; the remote media reference is
    /// substituted when the confirmed record arrives.
    pub async fn send_audio_message(
        self: &Arc<Self>,
        local_media_ref: impl Into<String>,
        duration_ms: u32,
    ) -> Uuid {
        let local_media_ref = local_media_ref.into();
        let request = self.build_request(MessageBody::Audio {
            media_ref: local_media_ref.clone(),
            duration_ms,
        });
        self.push_provisional(&request).await;
        let client_ref = request.client_ref;

        let session = Arc::clone(self);
        tokio::spawn(async move {
            match session.service.upload_media(&local_media_ref).await {
                Ok(remote_ref) => {
                    let mut request = request;
                    request.body = MessageBody::Audio {
                        media_ref: remote_ref,
                        duration_ms,
                    };
                    session.dispatch_send(request).await;
                }
                Err(err) => {
                    warn!("audio upload failed: {err:#}");
                    session.mark_failed(request.client_ref).await;
                }
            }
        });
        client_ref
    }

    /// Drop a failed entry from the list. Returns false when no failed entry
    /// with that identifier exists.
    pub async fn dismiss_failed(&self, local_id: Uuid) -> bool {
        let removed = {
            let mut messages = self.messages.lock().await;
            match messages
                .iter()
                .position(|m| m.local_id == local_id && m.state == DeliveryState::Failed)
            {
                Some(index) => {
                    messages.remove(index);
                    true
                }
                None => false,
            }
        };
        if removed {
            let _ = self
                .events
                .send(ConversationEvent::MessageDismissed { local_id });
        }
        removed
    }

    /// Propagate a read receipt for everything addressed to the local user.
    pub async fn mark_read(&self) -> anyhow::Result<()> {
        self.read_state
            .mark_conversation_read(self.conversation.conversation_id, self.local_user)
            .await
    }

    /// Stop the event loop and release the channel registration.
    pub async fn close(&self) {
        if let Some(task) = self.event_task.lock().await.take() {
            task.abort();
        }
        self.channels.release(&self.topic).await;
    }

    fn build_request(&self, body: MessageBody) -> SendMessageRequest {
        SendMessageRequest {
            conversation_id: self.conversation.conversation_id,
            sender_id: self.local_user,
            receiver_id: self.conversation.other_participant(self.local_user),
            body,
            client_ref: Uuid::new_v4(),
        }
    }

    async fn push_provisional(&self, request: &SendMessageRequest) {
        let provisional = ChatMessage::provisional(request, Utc::now());
        self.messages.lock().await.push(provisional.clone());
        let _ = self
            .events
            .send(ConversationEvent::MessageAppended(provisional));
    }

    async fn dispatch_send(&self, request: SendMessageRequest) {
        match self.service.insert_message(request.clone()).await {
            // The confirmed record arrives back through the event stream;
            // nothing to do here.
            Ok(_) => {}
            Err(err) => {
                match classify_send_error(&err) {
                    SyncError::TransportUnavailable(reason) => {
                        warn!(reason, "send failed while transport unavailable");
                    }
                    other => warn!("send rejected: {other}"),
                }
                self.mark_failed(request.client_ref).await;
            }
        }
    }

    async fn mark_failed(&self, local_id: Uuid) {
        let update = {
            let mut messages = self.messages.lock().await;
            match messages
                .iter()
                .position(|m| m.local_id == local_id && m.state == DeliveryState::Pending)
            {
                Some(index) => {
                    messages[index].state = DeliveryState::Failed;
                    Some((index, messages[index].clone()))
                }
                None => None,
            }
        };
        if let Some((index, message)) = update {
            let _ = self
                .events
                .send(ConversationEvent::MessageFailed { index, message });
        }
    }

    fn spawn_event_loop(
        self: &Arc<Self>,
        mut receiver: broadcast::Receiver<RealtimeEvent>,
    ) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => session.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "conversation event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn handle_event(self: &Arc<Self>, event: RealtimeEvent) {
        let Some(key) = event.dedup_key() else {
            if let RealtimeEvent::Error(err) = &event {
                warn!(code = ?err.code, message = %err.message, "backend error event");
            }
            return;
        };
        if !self.dedup.should_process(&key).await {
            return;
        }
        match event {
            RealtimeEvent::MessageInserted { message } => self.handle_inserted(message).await,
            RealtimeEvent::MessageUpdated { message } => self.handle_updated(message).await,
            RealtimeEvent::Error(_) => {}
        }
    }

    async fn handle_inserted(self: &Arc<Self>, record: MessageRecord) {
        if record.conversation_id != self.conversation.conversation_id {
            debug!(
                conversation_id = record.conversation_id.0,
                "ignoring event routed to the wrong conversation"
            );
            return;
        }

        if record.sender_id == self.local_user {
            self.reconcile_confirmed(record).await;
            return;
        }

        let message = ChatMessage::from_record(&record);
        {
            let mut messages = self.messages.lock().await;
            messages.push(message.clone());
        }
        let _ = self.events.send(ConversationEvent::MessageAppended(message));

        // The conversation is on screen, so anything addressed to us is
        // read the moment it lands. Fire and forget; failures self-heal on
        // the next explicit mark.
        if record.receiver_id == self.local_user && !record.read {
            let session = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = session
                    .read_state
                    .mark_conversation_read(session.conversation.conversation_id, session.local_user)
                    .await
                {
                    warn!("auto read-mark failed: {err:#}");
                }
            });
        }
    }

    /// Match a confirmed echo of our own send against a pending entry and
    /// replace it in place, preserving list position. Exact `client_ref`
    /// match first; for echoes without a ref, fall back to the
    /// sender+content+time-window heuristic.
    async fn reconcile_confirmed(&self, record: MessageRecord) {
        let outcome = {
            let mut messages = self.messages.lock().await;

            if messages
                .iter()
                .any(|m| m.message_id == Some(record.message_id))
            {
                debug!(
                    message_id = record.message_id.0,
                    "confirmed record already present, skipping"
                );
                return;
            }

            let matched = match record.client_ref {
                Some(client_ref) => messages.iter().position(|m| {
                    m.state == DeliveryState::Pending && m.local_id == client_ref
                }),
                None => heuristic_match(&messages, &record),
            };

            match matched {
                Some(index) => {
                    let mut confirmed = ChatMessage::from_record(&record);
                    confirmed.local_id = messages[index].local_id;
                    messages[index] = confirmed.clone();
                    Some((index, confirmed))
                }
                None => {
                    warn!(
                        message_id = record.message_id.0,
                        "reconciliation miss, appending confirmed message"
                    );
                    let message = ChatMessage::from_record(&record);
                    messages.push(message.clone());
                    let _ = self.events.send(ConversationEvent::MessageAppended(message));
                    None
                }
            }
        };

        if let Some((index, message)) = outcome {
            let _ = self
                .events
                .send(ConversationEvent::MessageConfirmed { index, message });
        }
    }

    /// Apply an inbound read-state change to the local list. Never triggers
    /// a read-mark round trip, which is what prevents update loops between
    /// the two participants.
    async fn handle_updated(&self, record: MessageRecord) {
        let update = {
            let mut messages = self.messages.lock().await;
            match messages
                .iter()
                .position(|m| m.message_id == Some(record.message_id))
            {
                Some(index) => {
                    messages[index].read = record.read;
                    Some((index, messages[index].clone()))
                }
                None => {
                    debug!(
                        message_id = record.message_id.0,
                        "update event for unknown message ignored"
                    );
                    None
                }
            }
        };
        if let Some((index, message)) = update {
            let _ = self
                .events
                .send(ConversationEvent::MessageRead { index, message });
        }
    }
}

fn heuristic_match(messages: &[ChatMessage], record: &MessageRecord) -> Option<usize> {
    messages.iter().position(|m| {
        m.state == DeliveryState::Pending
            && m.sender_id == record.sender_id
            && body_matches(&m.body, &record.body)
            && (record.sent_at - m.sent_at).num_seconds().abs() <= RECONCILE_WINDOW_SECS
    })
}

/// Payload equivalence for the heuristic fallback. A provisional audio entry
/// still carries the local media reference, so audio matches on duration.
fn body_matches(pending: &MessageBody, confirmed: &MessageBody) -> bool {
    match (pending, confirmed) {
        (MessageBody::Text { text: a }, MessageBody::Text { text: b }) => a == b,
        (
            MessageBody::Audio {
                duration_ms: a, ..
            },
            MessageBody::Audio {
                duration_ms: b, ..
            },
        ) => a == b,
        _ => false,
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
