/// Application name
pub const APP_NAME: &str = "Gubae";

/// Maximum message content length in characters
pub const MAX_CONTENT_CHARS: usize = 10_000;

/// Maximum length of a reaction symbol in characters
pub const MAX_REACTION_CHARS: usize = 32;

/// Maximum community name length in characters
pub const MAX_COMMUNITY_NAME_CHARS: usize = 100;

/// Largest history page a single fetch may return
pub const MAX_HISTORY_PAGE: u32 = 200;

/// Events buffered per event-bus receiver before it starts lagging
pub const EVENT_BUFFER: usize = 1_024;

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Trusted headers set by the auth gateway
pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_USER_NAME: &str = "x-user-name";
pub const HEADER_USER_ROLE: &str = "x-user-role";
