//! Chat synchronization core for a supplier/admin marketplace dashboard.
//!
//! All state lives in a single app actor thread; the host dispatches
//! [`AppAction`]s and receives [`AppUpdate`] snapshots through a
//! [`Reconciler`] callback. Async side effects (feed subscriptions, sends,
//! identity lookups) run on an embedded tokio runtime and report back into
//! the actor as internal events, so every state transition is serialized.

pub mod actions;
pub mod backend;
mod core;
pub mod logging;
pub mod state;
pub mod updates;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use crate::actions::AppAction;
use crate::backend::ChatBackend;
use crate::core::ChatCore;
use crate::state::AppState;
use crate::updates::{AppUpdate, CoreMsg};

/// Host-side sink for state snapshots. Called from the actor thread; keep
/// implementations fast and non-blocking.
pub trait Reconciler: Send + Sync + 'static {
    fn reconcile(&self, update: AppUpdate);
}

pub struct ChatApp {
    core_sender: flume::Sender<CoreMsg>,
    update_receiver: flume::Receiver<AppUpdate>,
    shared_state: Arc<RwLock<AppState>>,
    listening: AtomicBool,
}

impl ChatApp {
    /// Build the app and start its actor thread. `data_dir` holds the
    /// optional `chat_config.json`.
    pub fn new(backend: Arc<dyn ChatBackend>, data_dir: String) -> Arc<Self> {
        logging::init_logging();

        let (core_sender, core_receiver) = flume::unbounded::<CoreMsg>();
        let (update_sender, update_receiver) = flume::unbounded::<AppUpdate>();
        let shared_state = Arc::new(RwLock::new(AppState::empty()));

        let mut core = ChatCore::new(
            backend,
            update_sender,
            core_sender.clone(),
            data_dir,
            shared_state.clone(),
        );

        thread::spawn(move || {
            while let Ok(msg) = core_receiver.recv() {
                core.handle_message(msg);
            }
            tracing::info!("core channel closed; actor exiting");
        });

        Arc::new(Self {
            core_sender,
            update_receiver,
            shared_state,
            listening: AtomicBool::new(false),
        })
    }

    pub fn dispatch(&self, action: AppAction) {
        let _ = self.core_sender.send(CoreMsg::Action(action));
    }

    /// Latest committed snapshot, available synchronously at any time.
    pub fn state(&self) -> AppState {
        match self.shared_state.read() {
            Ok(g) => g.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    /// Start forwarding updates to `reconciler` on a dedicated thread.
    /// Subsequent calls are no-ops; there is a single listener per app.
    pub fn listen_for_updates(&self, reconciler: Arc<dyn Reconciler>) {
        if self
            .listening
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("listen_for_updates called twice; ignoring");
            return;
        }
        let receiver = self.update_receiver.clone();
        thread::spawn(move || {
            while let Ok(update) = receiver.recv() {
                reconciler.reconcile(update);
            }
        });
    }
}
