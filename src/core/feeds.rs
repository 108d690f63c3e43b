// Session lifecycle and live feed subscriptions.
//
// Subscribing is async but the actor is not, so a forwarding task performs
// the subscribe, hands the resulting handle back through an internal event,
// and then pumps snapshots into the actor. The handle lives in the session;
// dropping it (session teardown, stale epoch) unsubscribes the feed, which
// closes the snapshot channel and ends the forwarding task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::state::{AuthState, ConversationViewState};
use crate::updates::{CoreMsg, InternalEvent};

use super::{ChatCore, Session};

impl ChatCore {
    pub(super) fn start_session(&mut self, user_id: String) {
        self.stop_session();
        tracing::info!(user_id = %user_id, "start_session");

        self.session = Some(Session {
            user_id: user_id.clone(),
            alive: Arc::new(AtomicBool::new(true)),
            conv_sub: None,
            msg_sub: None,
        });
        self.state.auth = AuthState::Connected { user_id };
        self.state.conversations_loading = true;
        self.emit_state();

        self.subscribe_conversation_feed();
    }

    pub(super) fn stop_session(&mut self) {
        // Bumping the epochs invalidates every in-flight async result from
        // the old session before its tasks get a chance to report back.
        self.conv_epoch += 1;
        self.msg_epoch += 1;
        self.resolve_token += 1;
        self.pending_snapshot = None;
        self.empty_debounce_armed = false;
        self.suppression.clear_all();
        self.pending_optimistic.clear();
        self.delivery_overrides.clear();
        self.outbox_contents.clear();

        if let Some(sess) = self.session.take() {
            sess.alive.store(false, Ordering::SeqCst);
            // Dropping the session drops both subscription handles, which
            // unsubscribes the feeds.
        }

        self.state.auth = AuthState::Disconnected;
        self.state.conversations_loading = false;
        self.state.conversations = vec![];
        self.state.identities.clear();
        self.state.current = None;
        self.state.total_unread = 0;
        self.state.last_error = None;
        self.emit_state();
    }

    pub(super) fn subscribe_conversation_feed(&mut self) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        self.conv_epoch += 1;
        let epoch = self.conv_epoch;
        let user_id = sess.user_id.clone();
        let alive = sess.alive.clone();
        let backend = self.backend.clone();
        let tx = self.core_sender.clone();
        let (snap_tx, snap_rx) = flume::unbounded();

        self.runtime.spawn(async move {
            let handle = match backend.subscribe_conversations(&user_id, snap_tx).await {
                Ok(handle) => handle,
                Err(e) => {
                    let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SubscribeFailed {
                        what: "conversations",
                        error: format!("{e:#}"),
                    })));
                    return;
                }
            };
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::ConversationFeedSubscribed { epoch, handle },
            )));

            while let Ok(conversations) = snap_rx.recv_async().await {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                let event = InternalEvent::ConversationsSnapshot {
                    epoch,
                    conversations,
                };
                if tx.send(CoreMsg::Internal(Box::new(event))).is_err() {
                    break;
                }
            }
        });
    }

    fn subscribe_message_feed(&mut self, conversation_id: &str) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        self.msg_epoch += 1;
        let epoch = self.msg_epoch;
        let conversation_id = conversation_id.to_string();
        let alive = sess.alive.clone();
        let backend = self.backend.clone();
        let tx = self.core_sender.clone();
        let (snap_tx, snap_rx) = flume::unbounded();

        self.runtime.spawn(async move {
            let handle = match backend
                .subscribe_messages(&conversation_id, snap_tx)
                .await
            {
                Ok(handle) => handle,
                Err(e) => {
                    let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::SubscribeFailed {
                        what: "messages",
                        error: format!("{e:#}"),
                    })));
                    return;
                }
            };
            let _ = tx.send(CoreMsg::Internal(Box::new(
                InternalEvent::MessageFeedSubscribed { epoch, handle },
            )));

            while let Ok(messages) = snap_rx.recv_async().await {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                let event = InternalEvent::MessagesSnapshot {
                    epoch,
                    conversation_id: conversation_id.clone(),
                    messages,
                };
                if tx.send(CoreMsg::Internal(Box::new(event))).is_err() {
                    break;
                }
            }
        });
    }

    pub(super) fn select_conversation(&mut self, conversation_id: &str) {
        if self.session.is_none() {
            self.toast("Please connect first");
            return;
        }
        if !self.conversation_exists(conversation_id) {
            self.toast("Conversation not found");
            return;
        }
        tracing::debug!(%conversation_id, "select_conversation");

        // Tear down the previous message feed before attaching the new one.
        self.msg_epoch += 1;
        if let Some(sess) = self.session.as_mut() {
            sess.msg_sub = None;
        }

        // Seed the view with any still-pending optimistic messages so a
        // switch-away-and-back does not lose an in-flight send.
        self.state.current = Some(ConversationViewState {
            conversation_id: conversation_id.to_string(),
            messages: self
                .pending_optimistic
                .get(conversation_id)
                .cloned()
                .unwrap_or_default(),
            delivery: self
                .delivery_overrides
                .get(conversation_id)
                .cloned()
                .unwrap_or_default(),
        });

        // Optimistic read state: opening a conversation renders it read
        // without waiting for the backend round trip.
        if let Some(me) = self.current_user() {
            if let Some(conv) = self
                .state
                .conversations
                .iter_mut()
                .find(|c| c.id == conversation_id)
            {
                if let Some(p) = conv.participant_data.get_mut(&me) {
                    p.unread_count = 0;
                }
            }
            self.recompute_total_unread();
            if self.mark_read_on_open() {
                self.spawn_mark_read(conversation_id);
            }
        }
        self.emit_state();

        self.subscribe_message_feed(conversation_id);
    }

    pub(super) fn close_conversation(&mut self) {
        if self.state.current.is_none() {
            return;
        }
        self.msg_epoch += 1;
        if let Some(sess) = self.session.as_mut() {
            sess.msg_sub = None;
        }
        self.state.current = None;
        self.emit_state();
    }

    /// Fire-and-forget; a failure is reported back for logging only.
    pub(super) fn spawn_mark_read(&mut self, conversation_id: &str) {
        let Some(sess) = self.session.as_ref() else {
            return;
        };
        let user_id = sess.user_id.clone();
        let conversation_id = conversation_id.to_string();
        let backend = self.backend.clone();
        let tx = self.core_sender.clone();
        self.runtime.spawn(async move {
            if let Err(e) = backend.mark_read(&conversation_id, &user_id).await {
                let _ = tx.send(CoreMsg::Internal(Box::new(InternalEvent::MarkReadFailed {
                    conversation_id,
                    error: format!("{e:#}"),
                })));
            }
        });
    }
}
