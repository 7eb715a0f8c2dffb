//! NIP-01: Basic protocol flow description.
//!
//! This module implements the core Nostr event structure and operations:
//! - Event structure (id, pubkey, created_at, kind, tags, content, sig)
//! - Canonical serialization `[0, pubkey, created_at, kind, tags, content]`
//! - Content-addressed ids (sha256 of the canonical form)
//! - BIP-340 Schnorr signing and verification

use bitcoin::hashes::{Hash, sha256};
use bitcoin::secp256k1::{Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey, schnorr};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors that can occur during NIP-01 operations.
#[derive(Debug, Error)]
pub enum Nip01Error {
    /// The private key is malformed (length, encoding or curve range).
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Signing failed, or the key does not belong to the event's author.
    #[error("signature error: {0}")]
    SignatureError(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A signed Nostr event.
///
/// Events are produced by [`sign_event`] or [`finalize_event`] and treated as
/// immutable afterwards; changing any field invalidates `id` and `sig`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind (integer between 0 and 65535)
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// The unsigned view of this event (everything covered by the id).
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Recompute the id from the event's fields.
    pub fn compute_id(&self) -> Result<String, Nip01Error> {
        compute_id(&self.unsigned())
    }

    /// Check id and signature. See [`verify_event`].
    pub fn verify(&self) -> bool {
        verify_event(self)
    }

    /// Values (second element) of every tag with the given name.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }
}

/// An unsigned event (before signing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

/// A template for creating events (without pubkey, which comes from the signing key).
///
/// ```
/// use nostr::{EventTemplate, KIND_SHORT_TEXT_NOTE, unix_now};
///
/// let template = EventTemplate {
///     created_at: unix_now(),
///     kind: KIND_SHORT_TEXT_NOTE,
///     tags: vec![vec!["t".to_string(), "nostr".to_string()]],
///     content: "Hello Nostr!".to_string(),
/// };
/// assert_eq!(template.kind, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Array of arrays of strings (tags)
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
}

impl EventTemplate {
    /// A template stamped with the current time.
    pub fn now(kind: u16, tags: Vec<Vec<String>>, content: impl Into<String>) -> Self {
        Self {
            created_at: unix_now(),
            kind,
            tags,
            content: content.into(),
        }
    }
}

// Standard event kinds
pub const KIND_METADATA: u16 = 0;
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;
pub const KIND_CONTACTS: u16 = 3;

/// How relays are expected to store a kind (NIP-01).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    Regular,
    /// Latest per pubkey and kind.
    Replaceable,
    /// Not stored.
    Ephemeral,
    /// Latest per pubkey, kind and `d` tag.
    Addressable,
    Unknown,
}

impl KindClass {
    pub fn of(kind: u16) -> Self {
        match kind {
            1 | 2 | 4..=44 | 1000..=9999 => KindClass::Regular,
            0 | 3 | 10000..=19999 => KindClass::Replaceable,
            20000..=29999 => KindClass::Ephemeral,
            30000..=39999 => KindClass::Addressable,
            _ => KindClass::Unknown,
        }
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Generate 32 random bytes suitable for a secret key.
pub fn generate_secret_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

fn secret_key(secret_key: &[u8; 32]) -> Result<SecretKey, Nip01Error> {
    SecretKey::from_slice(secret_key).map_err(|e| Nip01Error::InvalidKey(e.to_string()))
}

/// Get the x-only public key as a hex string from a secret key.
pub fn get_public_key_hex(secret: &[u8; 32]) -> Result<String, Nip01Error> {
    let secp = Secp256k1::signing_only();
    let (xonly, _parity) = secret_key(secret)?.x_only_public_key(&secp);
    Ok(hex::encode(xonly.serialize()))
}

/// Assemble an unsigned event.
pub fn build_event(
    pubkey: impl Into<String>,
    content: impl Into<String>,
    kind: u16,
    tags: Vec<Vec<String>>,
    created_at: u64,
) -> UnsignedEvent {
    UnsignedEvent {
        pubkey: pubkey.into(),
        created_at,
        kind,
        tags,
        content: content.into(),
    }
}

/// Serialize an unsigned event for hashing.
///
/// Format: `[0,pubkey,created_at,kind,tags,content]` with no whitespace.
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    if !is_lower_hex(&event.pubkey, 64) {
        return Err(Nip01Error::InvalidEvent(
            "pubkey must be 64 lowercase hex characters".to_string(),
        ));
    }

    Ok(serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))?)
}

fn event_digest(event: &UnsignedEvent) -> Result<[u8; 32], Nip01Error> {
    let serialized = serialize_event(event)?;
    Ok(sha256::Hash::hash(serialized.as_bytes()).to_byte_array())
}

/// Compute the event id: lowercase hex sha256 of the canonical serialization.
pub fn compute_id(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    Ok(hex::encode(event_digest(event)?))
}

/// Sign an unsigned event, setting `id` and `sig`.
///
/// The secret key must belong to `event.pubkey`.
pub fn sign_event(event: UnsignedEvent, secret: &[u8; 32]) -> Result<Event, Nip01Error> {
    let secp = Secp256k1::new();
    let sk = secret_key(secret)?;
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let (xonly, _parity) = keypair.x_only_public_key();
    if hex::encode(xonly.serialize()) != event.pubkey {
        return Err(Nip01Error::SignatureError(
            "secret key does not match event pubkey".to_string(),
        ));
    }

    let digest = event_digest(&event)?;
    let sig = secp.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &keypair);

    Ok(Event {
        id: hex::encode(digest),
        pubkey: event.pubkey,
        created_at: event.created_at,
        kind: event.kind,
        tags: event.tags,
        content: event.content,
        sig: hex::encode(sig.serialize()),
    })
}

/// Sign an event template with a secret key, producing a complete signed event.
pub fn finalize_event(template: &EventTemplate, secret: &[u8; 32]) -> Result<Event, Nip01Error> {
    let pubkey = get_public_key_hex(secret)?;
    sign_event(
        build_event(
            pubkey,
            template.content.clone(),
            template.kind,
            template.tags.clone(),
            template.created_at,
        ),
        secret,
    )
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Validate a signed event's shape (not including signature verification).
pub fn validate_event(event: &Event) -> bool {
    is_lower_hex(&event.id, 64) && is_lower_hex(&event.pubkey, 64) && is_lower_hex(&event.sig, 128)
}

/// Verify an event's id and signature.
///
/// Returns false on any mismatch, including malformed hex or lengths.
pub fn verify_event(event: &Event) -> bool {
    if !validate_event(event) {
        return false;
    }

    let Ok(digest) = event_digest(&event.unsigned()) else {
        return false;
    };
    if hex::encode(digest) != event.id {
        return false;
    }

    let Some(sig) = hex::decode(&event.sig)
        .ok()
        .and_then(|bytes| schnorr::Signature::from_slice(&bytes).ok())
    else {
        return false;
    };
    let Some(pubkey) = hex::decode(&event.pubkey)
        .ok()
        .and_then(|bytes| XOnlyPublicKey::from_slice(&bytes).ok())
    else {
        return false;
    };

    Secp256k1::verification_only()
        .verify_schnorr(&sig, &Message::from_digest(digest), &pubkey)
        .is_ok()
}
