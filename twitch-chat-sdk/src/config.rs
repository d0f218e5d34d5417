//! Client configuration.
//!
//! Config file lives at `~/.config/twitch-chat/config.toml` by default:
//!
//! ```toml
//! channel = "csharpfritz"
//! chat_bot_name = "tagzbot"
//! oauth_token = "..."
//!
//! [options]
//! rate_cap = 100
//! reconnect_delay_ms = 2000
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::bus::Backpressure;
use crate::connection::DEFAULT_WRITE_TIMEOUT;
use crate::error::ConfigError;
use crate::receiver::ReconnectPolicy;

/// Twitch's plaintext IRC endpoint.
pub const DEFAULT_ENDPOINT: &str = "irc.chat.twitch.tv:80";
/// Channel watched when the config doesn't name one.
pub const DEFAULT_CHANNEL: &str = "csharpfritz";
/// Messages per window allowed for a regular (non-moderator) account.
pub const DEFAULT_RATE_CAP: u32 = 20;
/// A zero poll would turn an idle receive loop into a busy spin.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Connection identity. Immutable once built; always non-empty.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    channel: String,
    bot_name: String,
    token: String,
}

impl Session {
    /// Validates and normalises the three identity settings. A leading `#`
    /// on the channel and a leading `oauth:` on the token are dropped.
    pub fn new(
        channel: impl AsRef<str>,
        bot_name: impl AsRef<str>,
        token: impl AsRef<str>,
    ) -> Result<Self, ConfigError> {
        let channel = channel.as_ref().trim();
        let channel = channel.strip_prefix('#').unwrap_or(channel);
        let bot_name = bot_name.as_ref().trim();
        let token = token.as_ref().trim();
        let token = token.strip_prefix("oauth:").unwrap_or(token);

        if channel.is_empty() {
            return Err(ConfigError::Missing("channel"));
        }
        if bot_name.is_empty() {
            return Err(ConfigError::Missing("chat_bot_name"));
        }
        if token.is_empty() {
            return Err(ConfigError::Missing("oauth_token"));
        }

        Ok(Self {
            channel: channel.to_string(),
            bot_name: bot_name.to_string(),
            token: token.to_string(),
        })
    }

    /// Channel name without `#`.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn bot_name(&self) -> &str {
        &self.bot_name
    }

    pub(crate) fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("channel", &self.channel)
            .field("bot_name", &self.bot_name)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Tunables for the connection, receive loop, limiter and event bus.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Chat server address (host:port).
    pub endpoint: String,
    /// How long one receive-loop iteration waits for a line.
    pub poll_interval: Duration,
    /// Silence after which a liveness warning is logged.
    pub stall_threshold: Duration,
    pub rate_window: Duration,
    /// Sends allowed per `rate_window`.
    pub rate_cap: u32,
    /// Buffered chat events per subscriber.
    pub event_capacity: usize,
    pub backpressure: Backpressure,
    pub reconnect: ReconnectPolicy,
    /// Upper bound on a single outbound line write.
    pub write_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            poll_interval: Duration::from_millis(50),
            stall_threshold: Duration::from_secs(60),
            rate_window: Duration::from_secs(30),
            rate_cap: DEFAULT_RATE_CAP,
            event_capacity: 1024,
            backpressure: Backpressure::default(),
            reconnect: ReconnectPolicy::default(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// On-disk configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TwitchChatConfig {
    /// The Twitch channel to monitor.
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub chat_bot_name: String,
    #[serde(default)]
    pub oauth_token: String,
    #[serde(default)]
    pub options: OptionsFile,
}

impl Default for TwitchChatConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            chat_bot_name: String::new(),
            oauth_token: String::new(),
            options: OptionsFile::default(),
        }
    }
}

/// `[options]` table. Every key is optional; durations are milliseconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptionsFile {
    pub endpoint: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub stall_threshold_ms: Option<u64>,
    pub rate_window_ms: Option<u64>,
    pub rate_cap: Option<u32>,
    pub event_capacity: Option<usize>,
    pub backpressure: Option<Backpressure>,
    pub reconnect_delay_ms: Option<u64>,
    pub reconnect_multiplier: Option<u32>,
    pub reconnect_max_delay_ms: Option<u64>,
    pub reconnect_max_attempts: Option<u32>,
    pub write_timeout_ms: Option<u64>,
}

fn default_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

/// `<config dir>/twitch-chat/config.toml`.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("twitch-chat")
        .join("config.toml")
}

impl TwitchChatConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Validated identity; fails fast on any empty setting.
    pub fn session(&self) -> Result<Session, ConfigError> {
        Session::new(&self.channel, &self.chat_bot_name, &self.oauth_token)
    }

    /// Defaults overlaid with whatever `[options]` sets.
    pub fn client_options(&self) -> ClientOptions {
        let o = &self.options;
        let mut opts = ClientOptions::default();
        let ms = Duration::from_millis;

        if let Some(ref endpoint) = o.endpoint {
            opts.endpoint = endpoint.clone();
        }
        if let Some(v) = o.poll_interval_ms {
            opts.poll_interval = ms(v).max(MIN_POLL_INTERVAL);
        }
        if let Some(v) = o.stall_threshold_ms {
            opts.stall_threshold = ms(v);
        }
        if let Some(v) = o.rate_window_ms {
            opts.rate_window = ms(v);
        }
        if let Some(v) = o.rate_cap {
            opts.rate_cap = v;
        }
        if let Some(v) = o.event_capacity {
            opts.event_capacity = v;
        }
        if let Some(v) = o.backpressure {
            opts.backpressure = v;
        }
        if let Some(v) = o.reconnect_delay_ms {
            opts.reconnect.delay = ms(v);
            opts.reconnect.max_delay = opts.reconnect.max_delay.max(ms(v));
        }
        if let Some(v) = o.reconnect_multiplier {
            opts.reconnect.multiplier = v;
        }
        if let Some(v) = o.reconnect_max_delay_ms {
            opts.reconnect.max_delay = ms(v);
        }
        if o.reconnect_max_attempts.is_some() {
            opts.reconnect.max_attempts = o.reconnect_max_attempts;
        }
        if let Some(v) = o.write_timeout_ms {
            opts.write_timeout = ms(v);
        }
        opts
    }
}
