//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use gubae_chat::ChatConfig;
use gubae_shared::constants::DEFAULT_HTTP_PORT;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `None` (platform data directory).
    pub database_path: Option<PathBuf>,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Gubae"`
    pub instance_name: String,

    /// Env: `MAX_CONTENT_CHARS`
    pub max_content_chars: usize,

    /// Largest page `GET .../messages` returns.
    /// Env: `HISTORY_PAGE_LIMIT`
    pub history_page_limit: u32,

    /// Env: `EVENT_BUFFER`
    pub event_buffer: usize,

    /// Sustained requests per second per caller.
    /// Env: `RATE_LIMIT_PER_SEC`
    /// Default: `10`
    pub rate_limit_per_sec: f64,

    /// Env: `RATE_LIMIT_BURST`
    /// Default: `30`
    pub rate_limit_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let chat = ChatConfig::default();
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            instance_name: "Gubae".to_string(),
            max_content_chars: chat.max_content_chars,
            history_page_limit: chat.max_history_page,
            event_buffer: chat.event_buffer,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&lookup, "HTTP_ADDR", &mut config.http_addr);

        if let Some(path) = lookup("DATABASE_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        parse_into(&lookup, "MAX_CONTENT_CHARS", &mut config.max_content_chars);
        parse_into(&lookup, "HISTORY_PAGE_LIMIT", &mut config.history_page_limit);
        parse_into(&lookup, "EVENT_BUFFER", &mut config.event_buffer);
        parse_into(&lookup, "RATE_LIMIT_PER_SEC", &mut config.rate_limit_per_sec);
        parse_into(&lookup, "RATE_LIMIT_BURST", &mut config.rate_limit_burst);

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    pub fn chat_config(&self) -> ChatConfig {
        ChatConfig {
            max_content_chars: self.max_content_chars,
            max_history_page: self.history_page_limit,
            event_buffer: self.event_buffer,
            ..ChatConfig::default()
        }
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid setting, using default");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert!(config.database_path.is_none());
        assert_eq!(config.chat_config().max_content_chars, 10_000);
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("DATABASE_PATH", "/tmp/gubae.db"),
            ("HISTORY_PAGE_LIMIT", "50"),
            ("RATE_LIMIT_BURST", "5"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/gubae.db")));
        assert_eq!(config.chat_config().max_history_page, 50);
        assert_eq!(config.rate_limit_burst, 5.0);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_pairs(&[("HTTP_ADDR", "nowhere"), ("EVENT_BUFFER", "-3")]);
        assert_eq!(config.http_addr, ServerConfig::default().http_addr);
        assert_eq!(config.event_buffer, ServerConfig::default().event_buffer);
    }
}
