//! In-memory signing keys.

use crate::nip01::{
    Event, EventTemplate, Nip01Error, UnsignedEvent, finalize_event, generate_secret_key,
    get_public_key_hex, sign_event,
};
use crate::nip19::{self, Nip19Error};
use std::fmt;

/// A secret key held in memory together with its hex public key.
///
/// `Debug` never prints the secret.
#[derive(Clone)]
pub struct Keys {
    secret: [u8; 32],
    public_key: String,
}

impl Keys {
    /// Build from raw secret key bytes.
    pub fn from_secret_bytes(secret: [u8; 32]) -> Result<Self, Nip01Error> {
        let public_key = get_public_key_hex(&secret)?;
        Ok(Self { secret, public_key })
    }

    /// Parse a secret key given as `nsec1...` or 64 hex characters.
    pub fn parse(input: &str) -> Result<Self, Nip01Error> {
        let input = input.trim();
        let secret = if input.starts_with(nip19::NSEC_HRP) {
            nip19::decode_nsec(input).map_err(|e| Nip01Error::InvalidKey(e.to_string()))?
        } else {
            let bytes = hex::decode(input).map_err(|e| Nip01Error::InvalidKey(e.to_string()))?;
            bytes.as_slice().try_into().map_err(|_| {
                Nip01Error::InvalidKey(format!("expected 32 bytes, got {}", bytes.len()))
            })?
        };
        Self::from_secret_bytes(secret)
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        loop {
            // A random 32-byte string is outside the curve order with negligible probability.
            if let Ok(keys) = Self::from_secret_bytes(generate_secret_key()) {
                return keys;
            }
        }
    }

    /// Hex-encoded x-only public key.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn npub(&self) -> Result<String, Nip19Error> {
        let mut public = [0u8; 32];
        hex::decode_to_slice(&self.public_key, &mut public)
            .map_err(|e| Nip19Error::Encode(e.to_string()))?;
        nip19::encode_npub(&public)
    }

    pub fn nsec(&self) -> Result<String, Nip19Error> {
        nip19::encode_nsec(&self.secret)
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    /// Sign a template as this key's author.
    pub fn sign(&self, template: &EventTemplate) -> Result<Event, Nip01Error> {
        finalize_event(template, &self.secret)
    }

    /// Sign a prebuilt unsigned event; its pubkey must be this key's.
    pub fn sign_unsigned(&self, event: UnsignedEvent) -> Result<Event, Nip01Error> {
        sign_event(event, &self.secret)
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .field("secret", &"<redacted>")
            .finish()
    }
}
