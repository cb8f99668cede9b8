use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use shared::{
    domain::{ConversationId, UserId},
    error::{ApiError, ApiException},
    protocol::{
        ClientFrame, ConversationRecord, MarkReadRequest, MessageRecord, RealtimeEvent,
        SendMessageRequest,
    },
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::{RealtimeService, SubscriptionId};

struct TopicRegistration {
    id: SubscriptionId,
    sink: broadcast::Sender<RealtimeEvent>,
}

struct WsState {
    frame_tx: Option<mpsc::UnboundedSender<ClientFrame>>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

/// Production `RealtimeService` over the hosted backend: REST for
/// query/insert/update, one WebSocket for the push event stream.
///
/// The reader task routes incoming JSON event frames to per-topic sinks;
/// `reconnect` re-dials and replays subscribe frames for every registered
/// topic, which gives the subscribe contract its per-topic idempotence.
pub struct HostedBackend {
    http: Client,
    base_url: String,
    connected: Arc<AtomicBool>,
    topics: Arc<Mutex<HashMap<String, TopicRegistration>>>,
    next_subscription_id: AtomicU64,
    ws: Mutex<WsState>,
}

impl HostedBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        Url::parse(&base_url).with_context(|| format!("invalid backend url: {base_url}"))?;
        Ok(Self {
            http: Client::new(),
            base_url,
            connected: Arc::new(AtomicBool::new(false)),
            topics: Arc::new(Mutex::new(HashMap::new())),
            next_subscription_id: AtomicU64::new(0),
            ws: Mutex::new(WsState {
                frame_tx: None,
                reader_task: None,
                writer_task: None,
            }),
        })
    }

    fn ws_url(&self) -> Result<String> {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(anyhow!("backend url must start with http:// or https://"));
        };
        Ok(format!("{ws_base}/realtime"))
    }

    /// Dial the event stream and replay subscribe frames for registered
    /// topics. Replaces any previous connection.
    pub async fn connect(&self) -> Result<()> {
        let mut ws = self.ws.lock().await;
        if let Some(task) = ws.reader_task.take() {
            task.abort();
        }
        if let Some(task) = ws.writer_task.take() {
            task.abort();
        }

        let ws_url = self.ws_url()?;
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("failed to encode client frame: {err}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let topics = Arc::clone(&self.topics);
        let connected = Arc::clone(&self.connected);
        let reader_task = tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<RealtimeEvent>(&text) {
                            Ok(event) => {
                                let Some(topic) = event.topic() else {
                                    if let RealtimeEvent::Error(err) = &event {
                                        warn!(
                                            code = ?err.code,
                                            message = %err.message,
                                            "backend error frame"
                                        );
                                    }
                                    continue;
                                };
                                let topics = topics.lock().await;
                                match topics.get(&topic) {
                                    Some(registration) => {
                                        let _ = registration.sink.send(event);
                                    }
                                    None => debug!(topic, "event for unregistered topic dropped"),
                                }
                            }
                            Err(err) => warn!("invalid realtime event frame: {err}"),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("websocket receive failed: {err}");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
        });

        {
            let topics = self.topics.lock().await;
            for topic in topics.keys() {
                let _ = frame_tx.send(ClientFrame::Subscribe {
                    topic: topic.clone(),
                });
            }
        }

        ws.frame_tx = Some(frame_tx);
        ws.reader_task = Some(reader_task);
        ws.writer_task = Some(writer_task);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct LookupConversationRequest {
    user_a: UserId,
    user_b: UserId,
}

#[derive(Debug, Deserialize)]
struct UnreadCountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct MediaUploadResponse {
    media_ref: String,
}

/// Decode a success body, or surface the backend's typed rejection as an
/// `ApiException` so the send pipeline can classify it.
async fn parse_or_reject<T: DeserializeOwned>(response: reqwest::Response, what: &str) -> Result<T> {
    if response.status().is_success() {
        return response
            .json()
            .await
            .with_context(|| format!("invalid {what} response"));
    }
    let status = response.status();
    match response.json::<ApiError>().await {
        Ok(api) => Err(ApiException::new(api.code, api.message).into()),
        Err(_) => Err(anyhow!("{what} failed with status {status}")),
    }
}

async fn expect_ok(response: reqwest::Response, what: &str) -> Result<()> {
    if response.status().is_success() {
        return Ok(());
    }
    let status = response.status();
    match response.json::<ApiError>().await {
        Ok(api) => Err(ApiException::new(api.code, api.message).into()),
        Err(_) => Err(anyhow!("{what} failed with status {status}")),
    }
}

#[async_trait]
impl RealtimeService for HostedBackend {
    async fn subscribe(
        &self,
        topic: &str,
        sink: broadcast::Sender<RealtimeEvent>,
    ) -> Result<SubscriptionId> {
        if !self.connected.load(Ordering::SeqCst) {
            self.connect().await?;
        }
        let frame_tx = self
            .ws
            .lock()
            .await
            .frame_tx
            .clone()
            .ok_or_else(|| anyhow!("websocket not connected"))?;

        let id = {
            let mut topics = self.topics.lock().await;
            match topics.get_mut(topic) {
                Some(registration) => {
                    registration.sink = sink;
                    registration.id
                }
                None => {
                    let id =
                        SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::SeqCst) + 1);
                    topics.insert(topic.to_string(), TopicRegistration { id, sink });
                    id
                }
            }
        };

        frame_tx
            .send(ClientFrame::Subscribe {
                topic: topic.to_string(),
            })
            .map_err(|_| anyhow!("websocket writer closed"))?;
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let topic = {
            let mut topics = self.topics.lock().await;
            let Some(topic) = topics
                .iter()
                .find(|(_, registration)| registration.id == id)
                .map(|(topic, _)| topic.clone())
            else {
                return Ok(());
            };
            topics.remove(&topic);
            topic
        };

        if let Some(frame_tx) = self.ws.lock().await.frame_tx.clone() {
            let _ = frame_tx.send(ClientFrame::Unsubscribe { topic });
        }
        Ok(())
    }

    async fn get_or_create_conversation(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> Result<ConversationRecord> {
        let response = self
            .http
            .post(format!("{}/conversations", self.base_url))
            .json(&LookupConversationRequest { user_a, user_b })
            .send()
            .await?;
        parse_or_reject(response, "conversation lookup").await
    }

    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<Vec<MessageRecord>> {
        let response = self
            .http
            .get(format!(
                "{}/conversations/{}/messages",
                self.base_url, conversation_id.0
            ))
            .query(&[("limit", limit)])
            .send()
            .await?;
        parse_or_reject(response, "message history").await
    }

    async fn insert_message(&self, request: SendMessageRequest) -> Result<MessageRecord> {
        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .json(&request)
            .send()
            .await?;
        parse_or_reject(response, "message insert").await
    }

    async fn mark_messages_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<()> {
        let response = self
            .http
            .post(format!(
                "{}/conversations/{}/read",
                self.base_url, conversation_id.0
            ))
            .json(&MarkReadRequest {
                conversation_id,
                user_id,
            })
            .send()
            .await?;
        expect_ok(response, "read mark").await
    }

    async fn unread_count(&self, conversation_id: ConversationId, user_id: UserId) -> Result<u64> {
        let response = self
            .http
            .get(format!(
                "{}/conversations/{}/unread",
                self.base_url, conversation_id.0
            ))
            .query(&[("user_id", user_id.0)])
            .send()
            .await?;
        let body: UnreadCountResponse = parse_or_reject(response, "unread count").await?;
        Ok(body.count)
    }

    async fn upload_media(&self, local_ref: &str) -> Result<String> {
        let bytes = tokio::fs::read(local_ref)
            .await
            .with_context(|| format!("failed to read local media {local_ref}"))?;
        let response = self
            .http
            .post(format!("{}/media", self.base_url))
            .body(bytes)
            .send()
            .await?;
        let body: MediaUploadResponse = parse_or_reject(response, "media upload").await?;
        Ok(body.media_ref)
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn reconnect(&self) -> Result<()> {
        self.connect().await
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
