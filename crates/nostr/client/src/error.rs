//! Client error types

use crate::message::MessageError;
use nostr::Nip01Error;
use std::time::Duration;
use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// Handshake or transport failure; retrying may help
    #[error("Connection error: {0}")]
    Connection(String),

    /// The transport dropped while the operation was pending
    #[error("Connection lost")]
    ConnectionLost,

    /// A frame that could not be decoded
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] MessageError),

    /// No OK arrived before the deadline
    #[error("No acknowledgement within {0:?}")]
    AckTimeout(Duration),

    /// The relay answered OK false
    #[error("Event rejected: {0}")]
    Rejected(String),

    /// The caller already closed this subscription
    #[error("Subscription closed: {0}")]
    SubscriptionClosed(String),

    /// Subscription id already in use on this connection
    #[error("Duplicate subscription id: {0}")]
    DuplicateSubscription(String),

    /// Request the relay would refuse (empty filter list, bad subscription id)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Not connected
    #[error("Not connected to relay")]
    NotConnected,

    /// Already connected
    #[error("Already connected to relay")]
    AlreadyConnected,

    /// Key or signing failure
    #[error("Event error: {0}")]
    Event(#[from] Nip01Error),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
