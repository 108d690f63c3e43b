use crate::actions::AppAction;
use crate::backend::SubscriptionHandle;
use crate::state::{AppState, Conversation, IdentityRecord, Message};

#[derive(Clone, Debug)]
pub enum AppUpdate {
    FullState(AppState),
}

impl AppUpdate {
    pub fn rev(&self) -> u64 {
        match self {
            AppUpdate::FullState(s) => s.rev,
        }
    }
}

#[derive(Debug)]
pub enum CoreMsg {
    Action(AppAction),
    Internal(Box<InternalEvent>),
}

/// Results of async side effects, fed back into the actor. Every variant
/// carries the epoch or token it was issued under so results that complete
/// after a session change or feed re-subscribe are discarded, not applied.
#[derive(Debug)]
pub enum InternalEvent {
    // Feed attach results. A handle arriving under a stale epoch is dropped,
    // which unsubscribes it immediately.
    ConversationFeedSubscribed {
        epoch: u64,
        handle: SubscriptionHandle,
    },
    MessageFeedSubscribed {
        epoch: u64,
        handle: SubscriptionHandle,
    },
    SubscribeFailed {
        what: &'static str,
        error: String,
    },

    // Snapshot pushes forwarded from the feeds.
    ConversationsSnapshot {
        epoch: u64,
        conversations: Vec<Conversation>,
    },
    MessagesSnapshot {
        epoch: u64,
        conversation_id: String,
        messages: Vec<Message>,
    },
    /// Loading-indicator debounce for an initially empty conversation feed.
    EmptyFeedDebounce {
        epoch: u64,
    },

    // Async results
    IdentitiesResolved {
        /// Conversation-feed epoch the batch was issued under; a mismatch
        /// means the session changed and the records belong to dead keys.
        session_epoch: u64,
        /// When set, gates publication of the conversation snapshot that
        /// requested this resolution batch.
        publish_token: Option<u64>,
        records: Vec<IdentityRecord>,
    },
    ConversationCreated {
        conversation: Option<Conversation>,
        error: Option<String>,
    },
    SendResult {
        conversation_id: String,
        temp_id: String,
        ok: bool,
        blocked: bool,
        error: Option<String>,
    },
    MarkReadFailed {
        conversation_id: String,
        error: String,
    },
}
