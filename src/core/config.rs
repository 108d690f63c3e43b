use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::ChatCore;

// Sized to exceed typical backend propagation latency after a send.
const DEFAULT_SUPPRESS_WINDOW_MS: u64 = 1_500;
// Debounce before an empty conversation feed is believed to be truly empty.
const DEFAULT_EMPTY_DEBOUNCE_MS: u64 = 1_000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(super) struct ChatConfig {
    pub(super) suppress_window_ms: Option<u64>,
    pub(super) empty_debounce_ms: Option<u64>,
    pub(super) mark_read_on_open: Option<bool>,
}

pub(super) fn load_chat_config(data_dir: &str) -> ChatConfig {
    let path = Path::new(data_dir).join("chat_config.json");
    let Ok(bytes) = std::fs::read(&path) else {
        return ChatConfig::default();
    };
    serde_json::from_slice::<ChatConfig>(&bytes).unwrap_or_default()
}

impl ChatCore {
    pub(super) fn suppress_window(&self) -> Duration {
        Duration::from_millis(
            self.config
                .suppress_window_ms
                .unwrap_or(DEFAULT_SUPPRESS_WINDOW_MS),
        )
    }

    pub(super) fn empty_debounce(&self) -> Duration {
        Duration::from_millis(
            self.config
                .empty_debounce_ms
                .unwrap_or(DEFAULT_EMPTY_DEBOUNCE_MS),
        )
    }

    pub(super) fn mark_read_on_open(&self) -> bool {
        self.config.mark_read_on_open.unwrap_or(true)
    }
}
