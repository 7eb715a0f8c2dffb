//! Nostr protocol primitives.
//!
//! This crate provides:
//! - NIP-01: Event structure, canonical serialization, signing and verification
//! - NIP-09: Event Deletion Request templates
//! - NIP-19: bech32 `nsec`/`npub` keys
//! - NIP-25: Reaction templates
//! - In-memory signing keys ([`Keys`])

mod keys;
mod nip01;
mod nip09;
mod nip19;
mod nip25;

pub use keys::Keys;

// NIP-01: Basic protocol
pub use nip01::{
    Event, EventTemplate, KIND_CONTACTS, KindClass, KIND_METADATA, KIND_SHORT_TEXT_NOTE, Nip01Error,
    UnsignedEvent, build_event, compute_id, finalize_event, generate_secret_key,
    get_public_key_hex, serialize_event, sign_event, unix_now, validate_event, verify_event,
};

// NIP-09: Event Deletion Request
pub use nip09::{DELETION_REQUEST_KIND, deleted_event_ids, deletion_template, is_deletion_request};

// NIP-19: bech32-encoded keys
pub use nip19::{Nip19Error, decode_npub, decode_nsec, encode_npub, encode_nsec};

// NIP-25: Reactions
pub use nip25::{REACTION_KIND, reacted_event_id, reaction_template};
