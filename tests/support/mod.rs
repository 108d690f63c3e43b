// Shared test harness: an in-memory ChatBackend with scriptable feeds, a
// state-collecting reconciler, and polling helpers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tempfile::TempDir;

use vendora_chat::backend::{BlockStatus, ChatBackend, SubscriptionHandle};
use vendora_chat::state::{
    now_millis, AppState, Conversation, IdentityRecord, LastMessage, Message, MessageKind,
    ParticipantState,
};
use vendora_chat::updates::AppUpdate;
use vendora_chat::{ChatApp, Reconciler};

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Reconciler that records every snapshot it receives, so tests can assert
/// on intermediate states as well as the final one.
#[derive(Default)]
pub struct Collector {
    states: Mutex<Vec<AppState>>,
}

impl Collector {
    pub fn states(&self) -> Vec<AppState> {
        self.states.lock().unwrap().clone()
    }
}

impl Reconciler for Collector {
    fn reconcile(&self, update: AppUpdate) {
        let AppUpdate::FullState(state) = update;
        self.states.lock().unwrap().push(state);
    }
}

pub fn conversation(id: &str, participants: &[&str], unread: &[(&str, u32)]) -> Conversation {
    let mut participant_data = HashMap::new();
    for p in participants {
        participant_data.insert(p.to_string(), ParticipantState::default());
    }
    for (user, count) in unread {
        participant_data.entry(user.to_string()).or_default().unread_count = *count;
    }
    Conversation {
        id: id.to_string(),
        participant_ids: participants.iter().map(|p| p.to_string()).collect(),
        participant_data,
        last_message: None,
        is_group_chat: false,
        is_reported: false,
    }
}

pub fn confirmed(id: &str, conversation_id: &str, sender: &str, content: &str, ts: i64) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender.to_string(),
        content: content.to_string(),
        timestamp: ts,
        kind: MessageKind::Text,
        read_status: HashMap::new(),
        is_deleted: false,
        is_edited: false,
        edited_at: None,
        metadata: None,
        mentions: vec![],
        reactions: None,
    }
}

pub fn identity(user_id: &str, name: &str, business_name: &str) -> IdentityRecord {
    IdentityRecord {
        user_id: user_id.to_string(),
        name: name.to_string(),
        business_name: business_name.to_string(),
        avatar_url: None,
    }
}

#[derive(Default)]
struct MockState {
    authed_user: Option<String>,
    conversations: Vec<Conversation>,
    messages: HashMap<String, Vec<Message>>,
    identities: HashMap<String, IdentityRecord>,
    identity_delay: Option<Duration>,
    blocked_pairs: HashSet<(String, String)>,
    fail_sends: bool,

    next_sink_id: u64,
    next_msg_id: u64,
    conv_sinks: HashMap<u64, (String, flume::Sender<Vec<Conversation>>)>,
    msg_sinks: HashMap<u64, (String, flume::Sender<Vec<Message>>)>,

    identity_fetches: HashMap<String, u32>,
    mark_read_calls: Vec<(String, String)>,
    send_calls: Vec<(String, String)>,
}

/// In-memory stand-in for the real-time store + REST layer. Feeds never push
/// on their own; tests drive delivery explicitly via `push_conversations` /
/// `deliver_messages` so ordering stays deterministic.
#[derive(Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_authed_user(&self, user_id: &str) {
        self.state.lock().unwrap().authed_user = Some(user_id.to_string());
    }

    pub fn add_conversation(&self, conv: Conversation) {
        self.state.lock().unwrap().conversations.push(conv);
    }

    pub fn remove_conversation(&self, conversation_id: &str) {
        self.state
            .lock()
            .unwrap()
            .conversations
            .retain(|c| c.id != conversation_id);
    }

    pub fn add_identity(&self, record: IdentityRecord) {
        let mut s = self.state.lock().unwrap();
        s.identities.insert(record.user_id.clone(), record);
    }

    /// Make every subsequent identity lookup stall, so tests can interleave
    /// feed snapshots with an in-flight resolution batch.
    pub fn set_identity_delay(&self, delay: Duration) {
        self.state.lock().unwrap().identity_delay = Some(delay);
    }

    pub fn block_pair(&self, blocker: &str, blocked: &str) {
        self.state
            .lock()
            .unwrap()
            .blocked_pairs
            .insert((blocker.to_string(), blocked.to_string()));
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.state.lock().unwrap().fail_sends = fail;
    }

    /// Push the current conversation set to every subscribed user feed.
    pub fn push_conversations(&self) {
        let s = self.state.lock().unwrap();
        for (user_id, sink) in s.conv_sinks.values() {
            let snapshot: Vec<Conversation> = s
                .conversations
                .iter()
                .filter(|c| c.participant_ids.iter().any(|p| p == user_id))
                .cloned()
                .collect();
            let _ = sink.send(snapshot);
        }
    }

    /// Replace the stored messages of one conversation and push the snapshot
    /// to its subscribers.
    pub fn deliver_messages(&self, conversation_id: &str, messages: Vec<Message>) {
        let mut s = self.state.lock().unwrap();
        s.messages
            .insert(conversation_id.to_string(), messages.clone());
        for (conv_id, sink) in s.msg_sinks.values() {
            if conv_id == conversation_id {
                let _ = sink.send(messages.clone());
            }
        }
    }

    /// Push whatever the store currently holds for one conversation.
    pub fn push_messages(&self, conversation_id: &str) {
        let s = self.state.lock().unwrap();
        let messages = s.messages.get(conversation_id).cloned().unwrap_or_default();
        for (conv_id, sink) in s.msg_sinks.values() {
            if conv_id == conversation_id {
                let _ = sink.send(messages.clone());
            }
        }
    }

    pub fn identity_fetch_count(&self, user_id: &str) -> u32 {
        *self
            .state
            .lock()
            .unwrap()
            .identity_fetches
            .get(user_id)
            .unwrap_or(&0)
    }

    pub fn mark_read_count(&self, conversation_id: &str, user_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .mark_read_calls
            .iter()
            .filter(|(c, u)| c == conversation_id && u == user_id)
            .count()
    }

    pub fn send_call_count(&self) -> usize {
        self.state.lock().unwrap().send_calls.len()
    }

    pub fn conv_sink_count(&self) -> usize {
        self.state.lock().unwrap().conv_sinks.len()
    }

    pub fn msg_sink_count(&self, conversation_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .msg_sinks
            .values()
            .filter(|(c, _)| c == conversation_id)
            .count()
    }

    fn pair_blocked(s: &MockState, a: &str, b: &str) -> bool {
        s.blocked_pairs.contains(&(a.to_string(), b.to_string()))
            || s.blocked_pairs.contains(&(b.to_string(), a.to_string()))
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn subscribe_conversations(
        &self,
        user_id: &str,
        sink: flume::Sender<Vec<Conversation>>,
    ) -> Result<SubscriptionHandle> {
        let mut s = self.state.lock().unwrap();
        s.next_sink_id += 1;
        let id = s.next_sink_id;
        s.conv_sinks.insert(id, (user_id.to_string(), sink));
        let state = self.state.clone();
        Ok(SubscriptionHandle::new(move || {
            state.lock().unwrap().conv_sinks.remove(&id);
        }))
    }

    async fn subscribe_messages(
        &self,
        conversation_id: &str,
        sink: flume::Sender<Vec<Message>>,
    ) -> Result<SubscriptionHandle> {
        let mut s = self.state.lock().unwrap();
        s.next_sink_id += 1;
        let id = s.next_sink_id;
        s.msg_sinks.insert(id, (conversation_id.to_string(), sink));
        let state = self.state.clone();
        Ok(SubscriptionHandle::new(move || {
            state.lock().unwrap().msg_sinks.remove(&id);
        }))
    }

    async fn send_message(&self, conversation_id: &str, content: &str) -> Result<Message> {
        let mut s = self.state.lock().unwrap();
        if s.fail_sends {
            return Err(anyhow!("network down"));
        }
        let sender = s.authed_user.clone().unwrap_or_default();
        if let Some(conv) = s.conversations.iter().find(|c| c.id == conversation_id) {
            for other in conv.participant_ids.iter().filter(|p| **p != sender) {
                if Self::pair_blocked(&s, &sender, other) {
                    return Err(anyhow!("blocked"));
                }
            }
        }
        s.next_msg_id += 1;
        let message = confirmed(
            &format!("srv-{}", s.next_msg_id),
            conversation_id,
            &sender,
            content,
            now_millis(),
        );
        s.send_calls
            .push((conversation_id.to_string(), content.to_string()));
        s.messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(message.clone());
        if let Some(conv) = s
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            conv.last_message = Some(LastMessage {
                message_id: message.id.clone(),
                sender_id: message.sender_id.clone(),
                content: message.content.clone(),
                timestamp: message.timestamp,
            });
        }
        Ok(message)
    }

    async fn mark_read(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.mark_read_calls
            .push((conversation_id.to_string(), user_id.to_string()));
        if let Some(conv) = s
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
        {
            if let Some(p) = conv.participant_data.get_mut(user_id) {
                p.unread_count = 0;
            }
        }
        Ok(())
    }

    async fn get_user_details(&self, user_id: &str) -> Result<Option<IdentityRecord>> {
        let delay = self.state.lock().unwrap().identity_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut s = self.state.lock().unwrap();
        *s.identity_fetches.entry(user_id.to_string()).or_default() += 1;
        Ok(s.identities.get(user_id).cloned())
    }

    async fn create_or_get_conversation(
        &self,
        participant_id: &str,
        _display_name: &str,
        _avatar_url: Option<&str>,
    ) -> Result<Conversation> {
        let mut s = self.state.lock().unwrap();
        let me = s
            .authed_user
            .clone()
            .ok_or_else(|| anyhow!("not authenticated"))?;
        let mut pair = [me.as_str(), participant_id];
        pair.sort();

        if let Some(existing) = s.conversations.iter().find(|c| {
            !c.is_group_chat && {
                let mut ids: Vec<&str> = c.participant_ids.iter().map(String::as_str).collect();
                ids.sort();
                ids == pair
            }
        }) {
            return Ok(existing.clone());
        }

        let conv = conversation(&format!("conv-{}-{}", pair[0], pair[1]), &pair, &[]);
        s.conversations.push(conv.clone());
        Ok(conv)
    }

    async fn check_block_status(
        &self,
        _conversation_id: &str,
        sender_id: &str,
        receiver_id: &str,
    ) -> Result<BlockStatus> {
        let s = self.state.lock().unwrap();
        if Self::pair_blocked(&s, sender_id, receiver_id) {
            return Ok(BlockStatus {
                is_blocked: true,
                message: Some("You can no longer message this user".to_string()),
            });
        }
        Ok(BlockStatus::default())
    }
}

pub fn boot_with_config(backend: Arc<MockBackend>, config_json: &str) -> (Arc<ChatApp>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("chat_config.json"), config_json).unwrap();
    let app = ChatApp::new(backend, dir.path().to_string_lossy().into_owned());
    (app, dir)
}

/// Short windows so tests exercise the post-suppression path quickly.
pub fn boot(backend: Arc<MockBackend>) -> (Arc<ChatApp>, TempDir) {
    boot_with_config(
        backend,
        r#"{"suppress_window_ms": 100, "empty_debounce_ms": 100}"#,
    )
}
