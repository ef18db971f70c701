//! Crate-level configuration: retry/timeout tunables, the default webhook
//! callback URL, and the WebSocket keepalive override. Every field has a
//! documented default, so loading an empty TOML file is valid.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub client: ClientIdConfig,
    #[serde(default)]
    pub eventsub: EventSubConfig,
    #[serde(default)]
    pub helix: HelixConfig,
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)?;
        let s = std::str::from_utf8(&bytes)?;
        let cfg: ClientConfig = toml::from_str(s)?;
        Ok(cfg)
    }

    /// Parse configuration from a TOML string, e.g. for embedding in tests.
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client: ClientIdConfig::default(),
            eventsub: EventSubConfig::default(),
            helix: HelixConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientIdConfig {
    #[serde(default)]
    pub client_id: String,
}

impl Default for ClientIdConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventSubConfig {
    /// Overrides the `keepalive_timeout_seconds` query parameter on the
    /// WebSocket URL. `None` lets Twitch pick its default.
    #[serde(default)]
    pub keepalive_timeout_seconds: Option<u32>,

    /// Default webhook callback URL used when subscribing without an
    /// explicit override.
    #[serde(default)]
    pub callback_url: String,

    #[serde(default = "default_seen_message_cache_capacity")]
    pub seen_message_cache_capacity: usize,
}

impl Default for EventSubConfig {
    fn default() -> Self {
        Self {
            keepalive_timeout_seconds: None,
            callback_url: String::new(),
            seen_message_cache_capacity: default_seen_message_cache_capacity(),
        }
    }
}

fn default_seen_message_cache_capacity() -> usize {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_rate_limit_warning_cooldown_secs")]
    pub rate_limit_warning_cooldown_secs: u64,
}

impl Default for HelixConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            rate_limit_warning_cooldown_secs: default_rate_limit_warning_cooldown_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_rate_limit_warning_cooldown_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_documented_defaults() {
        let cfg = ClientConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.helix.max_retries, 5);
        assert_eq!(cfg.eventsub.seen_message_cache_capacity, 10_000);
        assert_eq!(cfg.eventsub.keepalive_timeout_seconds, None);
    }

    #[test]
    fn overrides_are_honoured() {
        let cfg = ClientConfig::from_toml_str(
            r#"
            [client]
            client_id = "abc123"

            [eventsub]
            keepalive_timeout_seconds = 30
            callback_url = "https://example.com/callback"

            [helix]
            max_retries = 2
            "#,
        )
        .unwrap();

        assert_eq!(cfg.client.client_id, "abc123");
        assert_eq!(cfg.eventsub.keepalive_timeout_seconds, Some(30));
        assert_eq!(cfg.eventsub.callback_url, "https://example.com/callback");
        assert_eq!(cfg.helix.max_retries, 2);
    }
}
