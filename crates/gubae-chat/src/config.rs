use gubae_shared::constants::{
    EVENT_BUFFER, MAX_COMMUNITY_NAME_CHARS, MAX_CONTENT_CHARS, MAX_HISTORY_PAGE,
    MAX_REACTION_CHARS,
};

/// Limits applied by the messaging core.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Longest accepted message or edit, in characters.
    pub max_content_chars: usize,

    /// Longest accepted reaction symbol, in characters.
    pub max_reaction_chars: usize,

    /// Longest accepted community name, in characters.
    pub max_name_chars: usize,

    /// Upper bound applied to every history fetch `limit`.
    pub max_history_page: u32,

    /// Events buffered per event-bus receiver before it lags.
    pub event_buffer: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_content_chars: MAX_CONTENT_CHARS,
            max_reaction_chars: MAX_REACTION_CHARS,
            max_name_chars: MAX_COMMUNITY_NAME_CHARS,
            max_history_page: MAX_HISTORY_PAGE,
            event_buffer: EVENT_BUFFER,
        }
    }
}
