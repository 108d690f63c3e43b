use anyhow::Result;
use async_trait::async_trait;

use crate::state::{Conversation, IdentityRecord, Message};

/// Guard for a live feed subscription. Dropping it unsubscribes: the backend
/// stops pushing snapshots into the sink it was given.
pub struct SubscriptionHandle(Option<Box<dyn FnOnce() + Send>>);

impl SubscriptionHandle {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(unsubscribe)))
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.0.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SubscriptionHandle")
    }
}

#[derive(Clone, Debug, Default)]
pub struct BlockStatus {
    pub is_blocked: bool,
    pub message: Option<String>,
}

/// Remote collaborator surface: the real-time document store plus the REST
/// layer, reduced to the calls the chat core actually makes. Feeds follow a
/// snapshot-push model: the full current result set is redelivered into the
/// sink on every upstream change.
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    /// Live feed of every conversation `user_id` participates in.
    async fn subscribe_conversations(
        &self,
        user_id: &str,
        sink: flume::Sender<Vec<Conversation>>,
    ) -> Result<SubscriptionHandle>;

    /// Live feed of the messages in one conversation.
    async fn subscribe_messages(
        &self,
        conversation_id: &str,
        sink: flume::Sender<Vec<Message>>,
    ) -> Result<SubscriptionHandle>;

    /// Must reject when either side has blocked the other.
    async fn send_message(&self, conversation_id: &str, content: &str) -> Result<Message>;

    /// Idempotent: clears the unread count and stamps read receipts for
    /// `user_id` in `conversation_id`.
    async fn mark_read(&self, conversation_id: &str, user_id: &str) -> Result<()>;

    async fn get_user_details(&self, user_id: &str) -> Result<Option<IdentityRecord>>;

    /// Idempotent by participant pair, in either order.
    async fn create_or_get_conversation(
        &self,
        participant_id: &str,
        display_name: &str,
        avatar_url: Option<&str>,
    ) -> Result<Conversation>;

    async fn check_block_status(
        &self,
        conversation_id: &str,
        sender_id: &str,
        receiver_id: &str,
    ) -> Result<BlockStatus>;
}
