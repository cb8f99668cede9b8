use std::sync::Arc;

use anyhow::{Context, Result};
use shared::domain::{ConversationId, UserId};
use tracing::debug;

use crate::RealtimeService;

/// Propagates read receipts to the backend and answers unread-counter
/// queries.
///
/// Inbound read-state update events never pass through here — the
/// conversation pipeline applies them to its local list directly, which is
/// what keeps a remote read receipt from re-triggering a mark round trip.
pub struct ReadStateSynchronizer {
    service: Arc<dyn RealtimeService>,
}

impl ReadStateSynchronizer {
    pub fn new(service: Arc<dyn RealtimeService>) -> Self {
        Self { service }
    }

    /// Mark every unread message addressed to `user_id` in the conversation
    /// as read. Idempotent: the backend update matches only rows that are
    /// still unread, so repeated calls converge on the same state.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<()> {
        debug!(
            conversation_id = conversation_id.0,
            user_id = user_id.0,
            "marking conversation read"
        );
        self.service
            .mark_messages_read(conversation_id, user_id)
            .await
            .with_context(|| {
                format!(
                    "failed to mark conversation {} read for user {}",
                    conversation_id.0, user_id.0
                )
            })
    }

    /// Server-confirmed unread counter for badge display.
    pub async fn unread_count(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<u64> {
        self.service
            .unread_count(conversation_id, user_id)
            .await
            .with_context(|| {
                format!(
                    "failed to fetch unread count for conversation {}",
                    conversation_id.0
                )
            })
    }
}

#[cfg(test)]
#[path = "tests/read_state_tests.rs"]
mod tests;
