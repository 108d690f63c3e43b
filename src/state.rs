use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

pub type UserId = String;
pub type ConversationId = String;

/// Locally generated message ids carry this prefix until the server-confirmed
/// counterpart arrives through the feed.
pub const TEMP_ID_PREFIX: &str = "temp-";

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    /// Logical send time in milliseconds. Monotonic per sender; used for
    /// display ordering and optimistic matching.
    pub timestamp: i64,
    #[serde(default)]
    pub kind: MessageKind,
    /// User id -> millis at which that user read the message.
    #[serde(default)]
    pub read_status: HashMap<UserId, i64>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub edited_at: Option<i64>,
    // Opaque pass-through; the core never interprets these.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub mentions: Vec<UserId>,
    #[serde(default)]
    pub reactions: Option<serde_json::Value>,
}

impl Message {
    /// Derived, never persisted: true until a server-confirmed counterpart
    /// replaces this message in the reconciled view.
    pub fn is_optimistic(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ParticipantState {
    pub role: Option<String>,
    pub last_seen_at: Option<i64>,
    pub typing: bool,
    pub unread_count: u32,
    pub blocked_users: HashSet<UserId>,
}

/// Denormalized preview of the newest message in a conversation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LastMessage {
    pub message_id: String,
    pub sender_id: UserId,
    pub content: String,
    pub timestamp: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    /// Authoritative membership list (2+, no duplicates).
    pub participant_ids: Vec<UserId>,
    #[serde(default)]
    pub participant_data: HashMap<UserId, ParticipantState>,
    #[serde(default)]
    pub last_message: Option<LastMessage>,
    #[serde(default)]
    pub is_group_chat: bool,
    #[serde(default)]
    pub is_reported: bool,
}

impl Conversation {
    pub fn unread_count_for(&self, user_id: &str) -> u32 {
        self.participant_data
            .get(user_id)
            .map(|p| p.unread_count)
            .unwrap_or(0)
    }
}

/// Cached display identity for a user id. Entries live for the session and
/// are never evicted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityRecord {
    pub user_id: UserId,
    pub name: String,
    pub business_name: String,
    pub avatar_url: Option<String>,
}

impl IdentityRecord {
    /// Synthesized identity for an unresolvable user id, so the UI never
    /// renders an empty name.
    pub fn fallback(user_id: &str, is_current_user: bool) -> Self {
        let (name, business_name) = if is_current_user {
            ("You", "Your Business")
        } else {
            ("User", "Business")
        };
        Self {
            user_id: user_id.to_string(),
            name: name.to_string(),
            business_name: business_name.to_string(),
            avatar_url: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageDeliveryState {
    Pending,
    Sent,
    Failed { reason: String },
}

/// Reconciled view of the currently selected conversation.
#[derive(Clone, Debug, Default)]
pub struct ConversationViewState {
    pub conversation_id: ConversationId,
    /// Confirmed messages ascending by timestamp, then any unmatched
    /// optimistic messages appended after them (never interleaved).
    pub messages: Vec<Message>,
    /// Delivery overrides for locally originated messages; anything absent
    /// from this map is server-confirmed.
    pub delivery: HashMap<String, MessageDeliveryState>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthState {
    Disconnected,
    Connected { user_id: UserId },
}

impl AuthState {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            AuthState::Connected { user_id } => Some(user_id),
            AuthState::Disconnected => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppState {
    pub rev: u64,
    pub auth: AuthState,
    /// Held until the first non-empty conversation snapshot, or until the
    /// empty-feed debounce elapses.
    pub conversations_loading: bool,
    pub conversations: Vec<Conversation>,
    /// Session-wide identity cache; additive merges only.
    pub identities: HashMap<UserId, IdentityRecord>,
    pub current: Option<ConversationViewState>,
    pub total_unread: u32,
    /// User-visible error, kept until the host explicitly clears it.
    pub toast: Option<String>,
    /// Last background failure (subscription setup, mark-read); non-fatal.
    pub last_error: Option<String>,
}

impl AppState {
    pub fn empty() -> Self {
        Self {
            rev: 0,
            auth: AuthState::Disconnected,
            conversations_loading: false,
            conversations: vec![],
            identities: HashMap::new(),
            current: None,
            total_unread: 0,
            toast: None,
            last_error: None,
        }
    }
}

/// Sum of the current user's unread counts across all conversations; missing
/// participant entries count as 0. Pure, no side effects.
pub fn total_unread_count(conversations: &[Conversation], user_id: &str) -> u32 {
    conversations
        .iter()
        .map(|c| c.unread_count_for(user_id))
        .sum()
}

pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
