// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of duelrank.
//
// duelrank is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// duelrank is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with duelrank.  If not,
// see <http://www.gnu.org/licenses/>.

//! # pair tokens
//!
//! The server will only accept a vote on a matchup it authored. When the pair endpoint deals
//! `(A, B)` it mints a pair id and signs `(pair_id, A, B)`; the vote endpoint recomputes the
//! signature and compares in constant time. The key is 32 random bytes generated at process
//! startup & never persisted — a restart invalidates every outstanding token, which is exactly
//! the intent.
//!
//! The payload is signed as its JSON serialization. Field order is fixed by the struct
//! declaration, so the bytes are canonical as long as nobody reorders the fields.

use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use snafu::{Backtrace, ResultExt, Snafu};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use crate::entities::ItemId;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to serialize the token payload: {source}"))]
    Ser {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The signed contents of a pair token
///
/// Serialized with single-letter field names; this exact byte sequence is what's MAC'd, and the
/// client echoes the fields back in its vote submission.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PairToken {
    #[serde(rename = "p")]
    pub pair_id: String,
    #[serde(rename = "a")]
    pub item_a: ItemId,
    #[serde(rename = "b")]
    pub item_b: ItemId,
}

/// The per-process HMAC key
pub struct Secret([u8; 32]);

impl Secret {
    /// Generate a fresh key from the OS RNG
    pub fn generate() -> Secret {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Secret(key)
    }
    /// A fixed key, for tests that need reproducible signatures
    pub fn from_bytes(key: [u8; 32]) -> Secret {
        Secret(key)
    }
}

fn mac_of(secret: &Secret, token: &PairToken) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(token).context(SerSnafu)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(&secret.0).expect("any key length works for HMAC");
    mac.update(&payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Sign a pair token; returns the base64url (unpadded) signature
pub fn sign(secret: &Secret, token: &PairToken) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(mac_of(secret, token)?))
}

/// Verify a claimed signature over `token`, in constant time
///
/// Any failure — undecodable base64, wrong length, wrong MAC — is simply `false`; the caller's
/// silent-fail policy doesn't care which.
pub fn verify(secret: &Secret, token: &PairToken, signature_b64: &str) -> bool {
    let claimed = match URL_SAFE_NO_PAD.decode(signature_b64) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let payload = match serde_json::to_vec(token) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let mut mac = Hmac::<Sha256>::new_from_slice(&secret.0).expect("any key length works for HMAC");
    mac.update(&payload);
    mac.verify_slice(&claimed).is_ok()
}

#[cfg(test)]
mod test {
    use super::*;

    fn token() -> PairToken {
        PairToken {
            pair_id: "0190b5a2-7d71-7bd0-b1d5-9a31c889a4b1".to_owned(),
            item_a: ItemId::from("BOMB"),
            item_b: ItemId::from("SPARK"),
        }
    }

    #[test]
    fn the_payload_is_canonical() {
        let json = serde_json::to_string(&token()).unwrap();
        assert_eq!(
            json,
            r#"{"p":"0190b5a2-7d71-7bd0-b1d5-9a31c889a4b1","a":"BOMB","b":"SPARK"}"#
        );
    }

    #[test]
    fn round_trip_verifies() {
        let secret = Secret::generate();
        let signature = sign(&secret, &token()).unwrap();
        assert!(verify(&secret, &token(), &signature));
    }

    #[test]
    fn a_single_flipped_bit_fails() {
        let secret = Secret::from_bytes([7u8; 32]);
        let signature = sign(&secret, &token()).unwrap();
        let mut bytes = URL_SAFE_NO_PAD.decode(&signature).unwrap();
        bytes[0] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(&bytes);
        assert!(!verify(&secret, &token(), &tampered));
    }

    #[test]
    fn a_different_pair_fails() {
        let secret = Secret::generate();
        let signature = sign(&secret, &token()).unwrap();
        let mut other = token();
        other.item_b = ItemId::from("FIREBOLT");
        assert!(!verify(&secret, &other, &signature));
    }

    #[test]
    fn garbage_signatures_fail_quietly() {
        let secret = Secret::generate();
        assert!(!verify(&secret, &token(), "not!base64!!"));
        assert!(!verify(&secret, &token(), ""));
    }

    #[test]
    fn different_keys_disagree() {
        let signature = sign(&Secret::from_bytes([1u8; 32]), &token()).unwrap();
        assert!(!verify(&Secret::from_bytes([2u8; 32]), &token(), &signature));
    }
}
