//! Session and per-relay configuration.
//!
//! Configuration is plain data handed to [`RelayPool::new`](crate::RelayPool::new);
//! nothing here is global. [`SessionConfig::from_env`] reads the variables
//! below, [`SessionConfig::from_env_file`] loads a `.env` file first.
//!
//! | Variable | Meaning |
//! |---|---|
//! | `NOSTR_RELAY_URL` | a single relay |
//! | `NOSTR_RELAY_URLS` | comma separated relays |
//! | `NOSTR_PRIVATE_KEY` | signing key, `nsec1...` or hex |
//! | `NOSTR_ACK_TIMEOUT_SECS` | seconds to wait for `OK` |
//! | `NOSTR_CONNECT_TIMEOUT_SECS` | seconds to wait for the handshake |

use crate::error::{ClientError, Result};
use crate::relay::parse_relay_url;
use nostr::Keys;
use std::env;
use std::path::Path;
use std::time::Duration;

pub const ENV_RELAY_URL: &str = "NOSTR_RELAY_URL";
pub const ENV_RELAY_URLS: &str = "NOSTR_RELAY_URLS";
pub const ENV_PRIVATE_KEY: &str = "NOSTR_PRIVATE_KEY";
pub const ENV_ACK_TIMEOUT_SECS: &str = "NOSTR_ACK_TIMEOUT_SECS";
pub const ENV_CONNECT_TIMEOUT_SECS: &str = "NOSTR_CONNECT_TIMEOUT_SECS";

/// Relay connection configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Handshake deadline
    pub connect_timeout: Duration,
    /// How long `publish` waits for `OK`
    pub ack_timeout: Duration,
    /// Per-subscription queue capacity; the oldest event is dropped when full
    pub subscription_buffer: usize,
    /// Outbound frames queued ahead of the writer task
    pub outbound_buffer: usize,
    /// Drop inbound events whose id or signature does not verify
    pub verify_events: bool,
    /// Initial reconnection delay
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// Reconnection attempts (0 = infinite)
    pub max_reconnect_attempts: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            subscription_buffer: 1024,
            outbound_buffer: 256,
            verify_events: true,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            max_reconnect_attempts: 5,
        }
    }
}

/// Everything a [`RelayPool`](crate::RelayPool) needs to run a session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Relay URLs (`ws://` or `wss://`)
    pub relays: Vec<String>,
    /// Signing key; publishing helpers fail without one
    pub keys: Option<Keys>,
    /// Settings applied to every relay connection
    pub relay: RelayConfig,
    /// Reconnect with backoff when a relay drops unexpectedly
    pub auto_reconnect: bool,
    /// Re-issue live pool subscriptions after a reconnect
    pub resubscribe_on_reconnect: bool,
}

impl SessionConfig {
    pub fn new<I, S>(relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            relays: relays.into_iter().map(Into::into).collect(),
            resubscribe_on_reconnect: true,
            ..Self::default()
        }
    }

    pub fn with_keys(mut self, keys: Keys) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn with_relay_config(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Read the session from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load a `.env` file into the environment, then read it.
    ///
    /// Variables already set in the process win over the file.
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        dotenvy::from_path(path)
            .map_err(|e| ClientError::Config(format!("failed to load {}: {}", path.display(), e)))?;
        Self::from_env()
    }

    /// Build from any variable source (`name -> value`).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let mut relays: Vec<String> = Vec::new();
        let listed = get(ENV_RELAY_URLS).unwrap_or_default();
        let candidates = get(ENV_RELAY_URL)
            .into_iter()
            .chain(listed.split(',').map(str::to_string));
        for candidate in candidates {
            let candidate = candidate.trim();
            if candidate.is_empty() {
                continue;
            }
            parse_relay_url(candidate)?;
            if !relays.iter().any(|existing| existing == candidate) {
                relays.push(candidate.to_string());
            }
        }

        let keys = get(ENV_PRIVATE_KEY)
            .map(|value| {
                Keys::parse(&value)
                    .map_err(|e| ClientError::Config(format!("{}: {}", ENV_PRIVATE_KEY, e)))
            })
            .transpose()?;

        let mut relay = RelayConfig::default();
        if let Some(secs) = get(ENV_ACK_TIMEOUT_SECS) {
            relay.ack_timeout = parse_secs(ENV_ACK_TIMEOUT_SECS, &secs)?;
        }
        if let Some(secs) = get(ENV_CONNECT_TIMEOUT_SECS) {
            relay.connect_timeout = parse_secs(ENV_CONNECT_TIMEOUT_SECS, &secs)?;
        }

        Ok(Self {
            keys,
            relay,
            ..Self::new(relays)
        })
    }

    /// The signing key, or a configuration error naming the variable to set.
    pub fn require_keys(&self) -> Result<&Keys> {
        self.keys.as_ref().ok_or_else(|| {
            ClientError::Config(format!("no signing key configured (set {})", ENV_PRIVATE_KEY))
        })
    }
}

fn parse_secs(name: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ClientError::Config(format!("{} must be whole seconds, got {:?}", name, value)))
}
