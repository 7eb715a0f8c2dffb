//! NIP-19: bech32-encoded keys (`nsec`, `npub`).
//!
//! Only the bare key entities are supported; TLV entities (`nprofile`,
//! `nevent`, ...) are not needed by the session engine.

use bech32::{Bech32, Hrp};
use thiserror::Error;

/// Human-readable part for nsec (private key)
pub const NSEC_HRP: &str = "nsec";

/// Human-readable part for npub (public key)
pub const NPUB_HRP: &str = "npub";

#[derive(Debug, Error)]
pub enum Nip19Error {
    #[error("bech32 encoding error: {0}")]
    Encode(String),

    #[error("bech32 decoding error: {0}")]
    Decode(String),

    #[error("invalid hrp: expected {expected}, got {got}")]
    InvalidHrp { expected: String, got: String },

    #[error("expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

fn encode(hrp: &str, data: &[u8; 32]) -> Result<String, Nip19Error> {
    let hrp = Hrp::parse(hrp).map_err(|e| Nip19Error::Encode(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, data).map_err(|e| Nip19Error::Encode(e.to_string()))
}

fn decode(expected_hrp: &str, encoded: &str) -> Result<[u8; 32], Nip19Error> {
    let expected = Hrp::parse(expected_hrp).map_err(|e| Nip19Error::Decode(e.to_string()))?;
    let (hrp, data) = bech32::decode(encoded).map_err(|e| Nip19Error::Decode(e.to_string()))?;

    if hrp != expected {
        return Err(Nip19Error::InvalidHrp {
            expected: expected_hrp.to_string(),
            got: hrp.to_string(),
        });
    }

    data.as_slice()
        .try_into()
        .map_err(|_| Nip19Error::InvalidLength(data.len()))
}

/// Encode a 32-byte secret key as `nsec1...`.
pub fn encode_nsec(secret_key: &[u8; 32]) -> Result<String, Nip19Error> {
    encode(NSEC_HRP, secret_key)
}

/// Decode `nsec1...` into a 32-byte secret key.
pub fn decode_nsec(nsec: &str) -> Result<[u8; 32], Nip19Error> {
    decode(NSEC_HRP, nsec)
}

/// Encode a 32-byte x-only public key as `npub1...`.
pub fn encode_npub(public_key: &[u8; 32]) -> Result<String, Nip19Error> {
    encode(NPUB_HRP, public_key)
}

/// Decode `npub1...` into a 32-byte x-only public key.
pub fn decode_npub(npub: &str) -> Result<[u8; 32], Nip19Error> {
    decode(NPUB_HRP, npub)
}
