//! Nostr relay session client.
//!
//! This crate provides:
//! - WebSocket connections to Nostr relays (`ws://` and `wss://`)
//! - NIP-01 relay protocol framing
//! - Subscriptions multiplexed over one connection, delivered as async streams
//! - Publishing with per-relay `OK` acknowledgement
//! - A relay pool that merges subscriptions and reports publish outcomes
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr::Keys;
//! use nostr_client::{Filter, RelayPool, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> nostr_client::Result<()> {
//!     let config = SessionConfig::new(["wss://relay.damus.io", "wss://nos.lol"])
//!         .with_keys(Keys::generate());
//!     let pool = RelayPool::new(config)?;
//!     pool.connect().await;
//!
//!     let report = pool.publish_note("hello nostr", vec![]).await?;
//!     println!("{} accepted by {} relays", report.event_id(), report.accepted().len());
//!
//!     // Stored kind 1 notes, merged across relays
//!     let mut notes = pool.fetch(vec![Filter::new().kinds(vec![1]).limit(10)]).await?;
//!     while let Some(event) = notes.next().await? {
//!         println!("{}: {}", event.pubkey, event.content);
//!     }
//!
//!     pool.disconnect_all().await;
//!     Ok(())
//! }
//! ```

mod backoff;
mod config;
mod error;
mod message;
mod pool;
mod relay;
mod subscription;

// Re-export main types
pub use backoff::{ExponentialBackoff, Jitter};
pub use config::{
    ENV_ACK_TIMEOUT_SECS, ENV_CONNECT_TIMEOUT_SECS, ENV_PRIVATE_KEY, ENV_RELAY_URL,
    ENV_RELAY_URLS, RelayConfig, SessionConfig,
};
pub use error::{ClientError, Result};
pub use message::{ClientMessage, Filter, MessageError, RelayMessage};
pub use pool::{PoolEvent, PoolSubscription, PublishReport, RelayPool};
pub use relay::{
    ConnectionState, PublishConfirmation, RelayConnection, RelayNotification, parse_relay_url,
};
pub use subscription::{
    CloseReason, MAX_SUBSCRIPTION_ID_LEN, Subscription, SubscriptionBuilder, SubscriptionItem,
    SubscriptionMode, SubscriptionRouter, SubscriptionState, SubscriptionTracker,
    generate_subscription_id,
};

pub use nostr::{Event, EventTemplate, Keys};
