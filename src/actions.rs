#[derive(Debug, Clone)]
pub enum AppAction {
    // Session
    Connect {
        user_id: String,
    },
    Disconnect,

    // Conversations
    StartConversation {
        participant_id: String,
        display_name: String,
        avatar_url: Option<String>,
    },
    SelectConversation {
        conversation_id: String,
    },
    CloseConversation,

    // Messages
    SendMessage {
        conversation_id: String,
        content: String,
    },
    RetryMessage {
        conversation_id: String,
        message_id: String,
    },

    // UI
    ClearToast,
}

impl AppAction {
    /// Log-safe action tag (never includes message content).
    pub fn tag(&self) -> &'static str {
        match self {
            AppAction::Connect { .. } => "Connect",
            AppAction::Disconnect => "Disconnect",
            AppAction::StartConversation { .. } => "StartConversation",
            AppAction::SelectConversation { .. } => "SelectConversation",
            AppAction::CloseConversation => "CloseConversation",
            AppAction::SendMessage { .. } => "SendMessage",
            AppAction::RetryMessage { .. } => "RetryMessage",
            AppAction::ClearToast => "ClearToast",
        }
    }
}
