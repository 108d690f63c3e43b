mod config;
mod directory;
mod feeds;
mod reconcile;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};

use flume::Sender;

use crate::actions::AppAction;
use crate::backend::{ChatBackend, SubscriptionHandle};
use crate::state::{
    now_millis, total_unread_count, AppState, Conversation, ConversationId, Message,
    MessageDeliveryState, MessageKind, UserId, TEMP_ID_PREFIX,
};
use crate::updates::{AppUpdate, CoreMsg, InternalEvent};

use reconcile::SuppressionMap;

struct Session {
    user_id: UserId,
    alive: Arc<AtomicBool>,
    conv_sub: Option<SubscriptionHandle>,
    msg_sub: Option<SubscriptionHandle>,
}

pub struct ChatCore {
    pub state: AppState,
    rev: u64,
    temp_seq: u64,
    last_outgoing_ts: i64,

    update_sender: Sender<AppUpdate>,
    core_sender: Sender<CoreMsg>,
    shared_state: Arc<RwLock<AppState>>,

    backend: Arc<dyn ChatBackend>,
    config: config::ChatConfig,
    runtime: tokio::runtime::Runtime,

    session: Option<Session>,

    // Feed epochs: results tagged with an older epoch are discarded.
    conv_epoch: u64,
    msg_epoch: u64,

    // Conversation snapshots are published only after their identity batch
    // settles; the token pairs a snapshot with its resolution result.
    resolve_token: u64,
    pending_snapshot: Option<(u64, Vec<Conversation>)>,
    empty_debounce_armed: bool,

    suppression: SuppressionMap,
    // conversation id -> locally sent messages awaiting server confirmation
    pending_optimistic: HashMap<ConversationId, Vec<Message>>,
    // conversation id -> message id -> delivery override
    delivery_overrides: HashMap<ConversationId, HashMap<String, MessageDeliveryState>>,
    // conversation id -> temp id -> raw text, kept for retries of failed sends
    outbox_contents: HashMap<ConversationId, HashMap<String, String>>,
}

impl ChatCore {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        update_sender: Sender<AppUpdate>,
        core_sender: Sender<CoreMsg>,
        data_dir: String,
        shared_state: Arc<RwLock<AppState>>,
    ) -> Self {
        let config = config::load_chat_config(&data_dir);
        let state = AppState::empty();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()
            .expect("tokio runtime");

        let this = Self {
            state,
            rev: 0,
            temp_seq: 0,
            last_outgoing_ts: 0,
            update_sender,
            core_sender,
            shared_state,
            backend,
            config,
            runtime,
            session: None,
            conv_epoch: 0,
            msg_epoch: 0,
            resolve_token: 0,
            pending_snapshot: None,
            empty_debounce_armed: false,
            suppression: SuppressionMap::default(),
            pending_optimistic: HashMap::new(),
            delivery_overrides: HashMap::new(),
            outbox_contents: HashMap::new(),
        };

        // Ensure ChatApp::state() has an immediately-available snapshot.
        let snapshot = this.state.clone();
        this.commit_state_snapshot(&snapshot);
        this
    }

    fn next_rev(&mut self) -> u64 {
        self.rev += 1;
        self.state.rev = self.rev;
        self.rev
    }

    fn commit_state_snapshot(&self, snapshot: &AppState) {
        match self.shared_state.write() {
            Ok(mut g) => *g = snapshot.clone(),
            Err(poison) => *poison.into_inner() = snapshot.clone(),
        }
    }

    fn emit_state(&mut self) {
        self.next_rev();
        let snapshot = self.state.clone();
        self.commit_state_snapshot(&snapshot);
        let _ = self.update_sender.send(AppUpdate::FullState(snapshot));
    }

    fn toast(&mut self, msg: impl Into<String>) {
        // Kept in state until the host explicitly clears it, so a snapshot
        // resync still contains the message.
        self.state.toast = Some(msg.into());
        self.emit_state();
    }

    fn current_user(&self) -> Option<String> {
        self.state.auth.user_id().map(str::to_string)
    }

    fn conversation_exists(&self, conversation_id: &str) -> bool {
        self.state.conversations.iter().any(|c| c.id == conversation_id)
    }

    fn recompute_total_unread(&mut self) {
        self.state.total_unread = match self.state.auth.user_id() {
            Some(user_id) => total_unread_count(&self.state.conversations, user_id),
            None => 0,
        };
    }

    /// Millisecond timestamps can collide on rapid sends; keep outgoing
    /// timestamps strictly monotonic so ordering and optimistic matching
    /// stay deterministic.
    fn next_outgoing_ts(&mut self) -> i64 {
        let now = now_millis();
        if now <= self.last_outgoing_ts {
            self.last_outgoing_ts += 1;
        } else {
            self.last_outgoing_ts = now;
        }
        self.last_outgoing_ts
    }

    fn sync_current_delivery(&mut self, conversation_id: &str) {
        let delivery = self
            .delivery_overrides
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        if let Some(cur) = self.state.current.as_mut() {
            if cur.conversation_id == conversation_id {
                cur.delivery = delivery;
            }
        }
    }

    pub fn handle_message(&mut self, msg: CoreMsg) {
        match msg {
            CoreMsg::Action(ref action) => {
                // Never log `?action` directly: message content stays out of logs.
                tracing::info!(action = action.tag(), "dispatch");
                self.handle_action(action.clone());
            }
            CoreMsg::Internal(internal) => self.handle_internal(*internal),
        }
    }

    fn handle_action(&mut self, action: AppAction) {
        match action {
            AppAction::Connect { user_id } => {
                let user_id = user_id.trim().to_string();
                if user_id.is_empty() {
                    self.toast("Enter a user id");
                    return;
                }
                self.start_session(user_id);
            }
            AppAction::Disconnect => {
                self.stop_session();
            }
            AppAction::StartConversation {
                participant_id,
                display_name,
                avatar_url,
            } => {
                self.start_conversation(participant_id, display_name, avatar_url);
            }
            AppAction::SelectConversation { conversation_id } => {
                self.select_conversation(&conversation_id);
            }
            AppAction::CloseConversation => {
                self.close_conversation();
            }
            AppAction::SendMessage {
                conversation_id,
                content,
            } => {
                self.send_message(conversation_id, content);
            }
            AppAction::RetryMessage {
                conversation_id,
                message_id,
            } => {
                self.retry_message(conversation_id, message_id);
            }
            AppAction::ClearToast => {
                if self.state.toast.is_some() {
                    self.state.toast = None;
                    self.emit_state();
                }
            }
        }
    }

    fn handle_internal(&mut self, internal: InternalEvent) {
        match internal {
            InternalEvent::ConversationFeedSubscribed { epoch, handle } => {
                if epoch != self.conv_epoch {
                    // Stale attach; dropping the handle unsubscribes it.
                    return;
                }
                if let Some(sess) = self.session.as_mut() {
                    sess.conv_sub = Some(handle);
                }
            }
            InternalEvent::MessageFeedSubscribed { epoch, handle } => {
                if epoch != self.msg_epoch {
                    return;
                }
                if let Some(sess) = self.session.as_mut() {
                    sess.msg_sub = Some(handle);
                }
            }
            InternalEvent::SubscribeFailed { what, error } => {
                tracing::warn!(what, %error, "feed subscription failed");
                if what == "conversations" {
                    self.state.conversations_loading = false;
                }
                self.state.last_error = Some(format!("{what} subscription failed: {error}"));
                self.emit_state();
            }
            InternalEvent::ConversationsSnapshot {
                epoch,
                conversations,
            } => {
                self.handle_conversations_snapshot(epoch, conversations);
            }
            InternalEvent::MessagesSnapshot {
                epoch,
                conversation_id,
                messages,
            } => {
                self.handle_messages_snapshot(epoch, conversation_id, messages);
            }
            InternalEvent::EmptyFeedDebounce { epoch } => {
                if epoch == self.conv_epoch
                    && self.state.conversations_loading
                    && self.state.conversations.is_empty()
                {
                    self.state.conversations_loading = false;
                    self.emit_state();
                }
            }
            InternalEvent::IdentitiesResolved {
                session_epoch,
                publish_token,
                records,
            } => {
                if session_epoch != self.conv_epoch {
                    // Resolved under a previous session; keys no longer active.
                    return;
                }
                let had_records = !records.is_empty();
                self.merge_identities(records);

                let gated = publish_token.and_then(|token| match self.pending_snapshot.take() {
                    Some((pending_token, conversations)) if pending_token == token => {
                        Some(conversations)
                    }
                    other => {
                        self.pending_snapshot = other;
                        None
                    }
                });
                if let Some(conversations) = gated {
                    self.publish_conversations(conversations);
                } else if had_records {
                    // Sender names for the open conversation may have changed.
                    self.emit_state();
                }
            }
            InternalEvent::ConversationCreated {
                conversation,
                error,
            } => {
                if let Some(err) = error {
                    self.toast(err);
                    return;
                }
                let Some(conversation) = conversation else {
                    return;
                };
                let conversation_id = conversation.id.clone();
                if !self.conversation_exists(&conversation_id) {
                    // The feed will deliver it too; surface it immediately so
                    // selection below cannot race the snapshot.
                    self.state.conversations.push(conversation);
                    self.recompute_total_unread();
                }
                self.select_conversation(&conversation_id);
            }
            InternalEvent::SendResult {
                conversation_id,
                temp_id,
                ok,
                blocked,
                error,
            } => {
                self.handle_send_result(conversation_id, temp_id, ok, blocked, error);
            }
            InternalEvent::MarkReadFailed {
                conversation_id,
                error,
            } => {
                // Background failure: logged and recorded, never rolled back.
                tracing::warn!(%conversation_id, %error, "mark_read failed");
                self.state.last_error = Some(format!("mark read failed: {error}"));
                self.emit_state();
            }
        }
    }

    fn handle_conversations_snapshot(&mut self, epoch: u64, conversations: Vec<Conversation>) {
        if epoch != self.conv_epoch {
            return;
        }
        let Some(me) = self.current_user() else {
            return;
        };

        // Union of participant ids across the snapshot, current user included.
        let mut ids: BTreeSet<UserId> = conversations
            .iter()
            .flat_map(|c| c.participant_ids.iter().cloned())
            .collect();
        ids.insert(me);

        let unresolved: Vec<UserId> = ids
            .into_iter()
            .filter(|id| !self.state.identities.contains_key(id))
            .collect();

        if unresolved.is_empty() {
            // A direct publish supersedes any older snapshot still gated on
            // identity resolution; its settled batch must not publish later.
            self.pending_snapshot = None;
            self.publish_conversations(conversations);
            return;
        }

        // Publish only after this batch settles; fallbacks guarantee it does.
        self.resolve_token += 1;
        self.pending_snapshot = Some((self.resolve_token, conversations));
        let token = self.resolve_token;
        self.spawn_identity_resolution(unresolved, Some(token));
    }

    fn publish_conversations(&mut self, mut conversations: Vec<Conversation>) {
        // Optimistic read state: the open conversation always renders as read,
        // even if the snapshot raced the remote mark-read.
        if let (Some(current_id), Some(me)) = (
            self.state.current.as_ref().map(|c| c.conversation_id.clone()),
            self.current_user(),
        ) {
            if let Some(conv) = conversations.iter_mut().find(|c| c.id == current_id) {
                if let Some(p) = conv.participant_data.get_mut(&me) {
                    p.unread_count = 0;
                }
            }
        }

        if !conversations.is_empty() {
            self.state.conversations_loading = false;
        } else if self.state.conversations_loading && !self.empty_debounce_armed {
            // An empty first result may just mean "still arriving"; believe
            // it only after the debounce.
            self.empty_debounce_armed = true;
            let epoch = self.conv_epoch;
            let delay = self.empty_debounce();
            let tx = self.core_sender.clone();
            self.runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::EmptyFeedDebounce {
                    epoch,
                })));
            });
        }

        self.state.conversations = conversations;
        self.recompute_total_unread();
        self.emit_state();
    }

    fn handle_messages_snapshot(
        &mut self,
        epoch: u64,
        conversation_id: String,
        incoming: Vec<Message>,
    ) {
        if epoch != self.msg_epoch {
            return;
        }
        match self.state.current.as_ref() {
            Some(cur) if cur.conversation_id == conversation_id => {}
            _ => return,
        }
        if self.suppression.is_active(&conversation_id) {
            tracing::debug!(%conversation_id, "snapshot dropped (send suppression active)");
            return;
        }

        // Discover sender identities without blocking message display.
        let me = self.current_user().unwrap_or_default();
        let unseen: Vec<UserId> = incoming
            .iter()
            .map(|m| m.sender_id.clone())
            .filter(|s| *s != me && !self.state.identities.contains_key(s))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !unseen.is_empty() {
            self.spawn_identity_resolution(unseen, None);
        }

        let pending = self
            .pending_optimistic
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default();
        let (merged, remaining) = reconcile::merge_snapshot(incoming, &pending);

        // Drop bookkeeping for optimistic messages that found their
        // confirmed counterpart.
        let remaining_ids: HashSet<&str> = remaining.iter().map(|m| m.id.as_str()).collect();
        for message in &pending {
            if !remaining_ids.contains(message.id.as_str()) {
                if let Some(d) = self.delivery_overrides.get_mut(&conversation_id) {
                    d.remove(&message.id);
                }
                if let Some(o) = self.outbox_contents.get_mut(&conversation_id) {
                    o.remove(&message.id);
                }
            }
        }
        if remaining.is_empty() {
            self.pending_optimistic.remove(&conversation_id);
        } else {
            self.pending_optimistic
                .insert(conversation_id.clone(), remaining);
        }

        let delivery = self
            .delivery_overrides
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default();
        if let Some(cur) = self.state.current.as_mut() {
            cur.messages = merged;
            cur.delivery = delivery;
        }
        self.emit_state();

        // Inbound messages while the conversation is open are read on arrival.
        if !me.is_empty() && self.mark_read_on_open() {
            self.spawn_mark_read(&conversation_id);
        }
    }

    fn start_conversation(
        &mut self,
        participant_id: String,
        display_name: String,
        avatar_url: Option<String>,
    ) {
        if self.session.is_none() {
            self.toast("Please connect first");
            return;
        }
        let participant_id = participant_id.trim().to_string();
        if participant_id.is_empty() {
            self.toast("Enter a user id");
            return;
        }

        let backend = self.backend.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            let event = match backend
                .create_or_get_conversation(&participant_id, &display_name, avatar_url.as_deref())
                .await
            {
                Ok(conversation) => InternalEvent::ConversationCreated {
                    conversation: Some(conversation),
                    error: None,
                },
                Err(e) => InternalEvent::ConversationCreated {
                    conversation: None,
                    error: Some(format!("Couldn't start conversation: {e:#}")),
                },
            };
            let _ = tx.send(CoreMsg::Internal(Box::new(event)));
        });
    }

    fn send_message(&mut self, conversation_id: String, content: String) {
        let Some(sender_id) = self.current_user() else {
            self.toast("Please connect first");
            return;
        };
        let content = content.trim().to_string();
        if content.is_empty() {
            return;
        }
        if !self.conversation_exists(&conversation_id) {
            // Conversation-not-found is a guarded no-op at the send entry.
            tracing::debug!(%conversation_id, "send ignored: unknown conversation");
            return;
        }
        let selected = self
            .state
            .current
            .as_ref()
            .is_some_and(|c| c.conversation_id == conversation_id);
        if !selected {
            tracing::debug!(%conversation_id, "send ignored: conversation not open");
            return;
        }

        let ts = self.next_outgoing_ts();
        self.temp_seq += 1;
        let temp_id = format!("{TEMP_ID_PREFIX}{ts}-{}", self.temp_seq);

        let optimistic = Message {
            id: temp_id.clone(),
            conversation_id: conversation_id.clone(),
            sender_id: sender_id.clone(),
            content: content.clone(),
            timestamp: ts,
            kind: MessageKind::Text,
            read_status: HashMap::new(),
            is_deleted: false,
            is_edited: false,
            edited_at: None,
            metadata: None,
            mentions: vec![],
            reactions: None,
        };

        self.pending_optimistic
            .entry(conversation_id.clone())
            .or_default()
            .push(optimistic.clone());
        self.delivery_overrides
            .entry(conversation_id.clone())
            .or_default()
            .insert(temp_id.clone(), MessageDeliveryState::Pending);
        self.outbox_contents
            .entry(conversation_id.clone())
            .or_default()
            .insert(temp_id.clone(), content.clone());

        // Immediate, synchronous UI effect: the message appears at the end.
        if let Some(cur) = self.state.current.as_mut() {
            if cur.conversation_id == conversation_id {
                cur.messages.push(optimistic);
                cur.delivery
                    .insert(temp_id.clone(), MessageDeliveryState::Pending);
            }
        }

        self.suppression
            .open(&conversation_id, self.suppress_window());
        self.emit_state();

        self.spawn_send(conversation_id, temp_id, content, sender_id);
    }

    fn spawn_send(
        &mut self,
        conversation_id: String,
        temp_id: String,
        content: String,
        sender_id: String,
    ) {
        // 1:1 recipient for the block check; group sends skip it.
        let receiver_id = self
            .state
            .conversations
            .iter()
            .find(|c| c.id == conversation_id && !c.is_group_chat)
            .and_then(|c| c.participant_ids.iter().find(|p| **p != sender_id).cloned());

        let backend = self.backend.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            if let Some(receiver_id) = receiver_id {
                match backend
                    .check_block_status(&conversation_id, &sender_id, &receiver_id)
                    .await
                {
                    Ok(status) if status.is_blocked => {
                        let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SendResult {
                            conversation_id,
                            temp_id,
                            ok: false,
                            blocked: true,
                            error: Some(status.message.unwrap_or_else(|| {
                                "You can no longer message this user".to_string()
                            })),
                        })));
                        return;
                    }
                    Ok(_) => {}
                    // Inconclusive check: attempt the send anyway; the
                    // backend rejects blocked pairs itself. That rejection
                    // comes back untyped, so it surfaces as a generic Failed
                    // (retryable) rather than a discard; a retry of such a
                    // message just fails the same way.
                    Err(e) => tracing::debug!(%e, "block status check failed"),
                }
            }

            let event = match backend.send_message(&conversation_id, &content).await {
                Ok(_) => InternalEvent::SendResult {
                    conversation_id,
                    temp_id,
                    ok: true,
                    blocked: false,
                    error: None,
                },
                Err(e) => InternalEvent::SendResult {
                    conversation_id,
                    temp_id,
                    ok: false,
                    blocked: false,
                    error: Some(format!("{e:#}")),
                },
            };
            let _ = tx.send(CoreMsg::Internal(Box::new(event)));
        });
    }

    fn handle_send_result(
        &mut self,
        conversation_id: String,
        temp_id: String,
        ok: bool,
        blocked: bool,
        error: Option<String>,
    ) {
        tracing::info!(ok, blocked, ?error, %conversation_id, %temp_id, "send_result");

        if ok {
            if let Some(d) = self.delivery_overrides.get_mut(&conversation_id) {
                d.insert(temp_id.clone(), MessageDeliveryState::Sent);
            }
            if let Some(o) = self.outbox_contents.get_mut(&conversation_id) {
                o.remove(&temp_id);
            }
            // The suppression window expires on its own; the confirmed
            // message arrives through the feed once it reopens.
            self.sync_current_delivery(&conversation_id);
            self.emit_state();
            return;
        }

        // Failure: stop ignoring feed updates right away.
        self.suppression.clear(&conversation_id);

        if blocked {
            // A blocked send can never succeed; discard the optimistic message.
            if let Some(pending) = self.pending_optimistic.get_mut(&conversation_id) {
                pending.retain(|m| m.id != temp_id);
                if pending.is_empty() {
                    self.pending_optimistic.remove(&conversation_id);
                }
            }
            if let Some(d) = self.delivery_overrides.get_mut(&conversation_id) {
                d.remove(&temp_id);
            }
            if let Some(o) = self.outbox_contents.get_mut(&conversation_id) {
                o.remove(&temp_id);
            }
            if let Some(cur) = self.state.current.as_mut() {
                if cur.conversation_id == conversation_id {
                    cur.messages.retain(|m| m.id != temp_id);
                    cur.delivery.remove(&temp_id);
                }
            }
            self.toast(error.unwrap_or_else(|| "You can no longer message this user".to_string()));
            return;
        }

        let reason = error.unwrap_or_else(|| "send failed".to_string());
        if let Some(d) = self.delivery_overrides.get_mut(&conversation_id) {
            d.insert(
                temp_id,
                MessageDeliveryState::Failed {
                    reason: reason.clone(),
                },
            );
        }
        self.sync_current_delivery(&conversation_id);
        self.toast(format!("Send failed: {reason}"));
    }

    fn retry_message(&mut self, conversation_id: String, message_id: String) {
        let Some(sender_id) = self.current_user() else {
            self.toast("Please connect first");
            return;
        };
        let Some(content) = self
            .outbox_contents
            .get(&conversation_id)
            .and_then(|m| m.get(&message_id))
            .cloned()
        else {
            self.toast("Nothing to retry");
            return;
        };

        // Refresh the optimistic timestamp so the eventual confirmation
        // still falls inside the match window.
        let ts = self.next_outgoing_ts();
        if let Some(pending) = self.pending_optimistic.get_mut(&conversation_id) {
            if let Some(m) = pending.iter_mut().find(|m| m.id == message_id) {
                m.timestamp = ts;
            }
        }
        if let Some(cur) = self.state.current.as_mut() {
            if cur.conversation_id == conversation_id {
                if let Some(m) = cur.messages.iter_mut().find(|m| m.id == message_id) {
                    m.timestamp = ts;
                }
            }
        }
        self.delivery_overrides
            .entry(conversation_id.clone())
            .or_default()
            .insert(message_id.clone(), MessageDeliveryState::Pending);
        self.sync_current_delivery(&conversation_id);
        self.suppression
            .open(&conversation_id, self.suppress_window());
        self.emit_state();

        self.spawn_send(conversation_id, message_id, content, sender_id);
    }
}
