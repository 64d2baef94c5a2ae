//! v3 onion addresses
//!
//! A v3 address is 56 base32 characters encoding
//! `pubkey (32) || checksum (2) || version (1)`, where the checksum is
//! the first two bytes of SHA3-256(".onion checksum" || pubkey ||
//! version) and the version byte is 3.

use crate::error::{Result, TorError};
use crate::protocol::crypto::sha3_256;
use data_encoding::BASE32_NOPAD;

/// Length of the base32 portion of an address.
pub const ADDRESS_LEN: usize = 56;

/// Version byte of the v3 scheme.
pub const VERSION: u8 = 3;

const CHECKSUM_PREFIX: &[u8] = b".onion checksum";

/// A parsed and checksum-verified onion service address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionAddress {
    pubkey: [u8; 32],
}

impl OnionAddress {
    /// Parse an address, with or without the `.onion` suffix.
    pub fn parse(address: &str) -> Result<Self> {
        let trimmed = address.trim().trim_end_matches('.');
        let body = trimmed
            .strip_suffix(".onion")
            .unwrap_or(trimmed)
            .to_ascii_lowercase();

        if body.len() != ADDRESS_LEN {
            return Err(TorError::InvalidAddress(format!(
                "expected {} base32 chars, got {}",
                ADDRESS_LEN,
                body.len()
            )));
        }

        let raw = BASE32_NOPAD
            .decode(body.to_ascii_uppercase().as_bytes())
            .map_err(|_| TorError::InvalidAddress("not valid base32".into()))?;
        if raw.len() != 35 {
            return Err(TorError::InvalidAddress(format!(
                "decoded to {} bytes, expected 35",
                raw.len()
            )));
        }

        let mut pubkey = [0u8; 32];
        pubkey.copy_from_slice(&raw[0..32]);
        let checksum = [raw[32], raw[33]];
        let version = raw[34];

        if version != VERSION {
            return Err(TorError::InvalidAddress(format!(
                "unsupported version {}",
                version
            )));
        }
        if checksum != expected_checksum(&pubkey, version) {
            return Err(TorError::InvalidAddress("checksum mismatch".into()));
        }

        Ok(Self { pubkey })
    }

    /// Build an address from an identity public key.
    pub fn from_pubkey(pubkey: [u8; 32]) -> Self {
        Self { pubkey }
    }

    /// The service's Ed25519 identity public key.
    pub fn pubkey(&self) -> &[u8; 32] {
        &self.pubkey
    }
}

impl std::fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut raw = Vec::with_capacity(35);
        raw.extend_from_slice(&self.pubkey);
        raw.extend_from_slice(&expected_checksum(&self.pubkey, VERSION));
        raw.push(VERSION);
        let body = BASE32_NOPAD.encode(&raw).to_ascii_lowercase();
        write!(f, "{}.onion", body)
    }
}

fn expected_checksum(pubkey: &[u8; 32], version: u8) -> [u8; 2] {
    let mut input = Vec::with_capacity(CHECKSUM_PREFIX.len() + 33);
    input.extend_from_slice(CHECKSUM_PREFIX);
    input.extend_from_slice(pubkey);
    input.push(version);
    let digest = sha3_256(&input);
    [digest[0], digest[1]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let address = OnionAddress::from_pubkey([0x5Au8; 32]);
        let encoded = address.to_string();
        assert_eq!(encoded.len(), ADDRESS_LEN + ".onion".len());

        let parsed = OnionAddress::parse(&encoded).unwrap();
        assert_eq!(parsed.pubkey(), &[0x5Au8; 32]);

        // Also parses without the suffix.
        let bare = encoded.strip_suffix(".onion").unwrap();
        assert_eq!(OnionAddress::parse(bare).unwrap(), parsed);
    }

    #[test]
    fn test_corrupted_character_rejected() {
        let encoded = OnionAddress::from_pubkey([0x5Au8; 32]).to_string();
        let body: Vec<char> = encoded
            .strip_suffix(".onion")
            .unwrap()
            .chars()
            .collect();

        // Flip each position to a different valid base32 char; every
        // mutation must fail the checksum (or version) check.
        for pos in 0..body.len() {
            let mut mutated = body.clone();
            mutated[pos] = if mutated[pos] == 'a' { 'b' } else { 'a' };
            let candidate: String = mutated.into_iter().collect();
            assert!(
                matches!(
                    OnionAddress::parse(&candidate),
                    Err(TorError::InvalidAddress(_))
                ),
                "mutation at {} unexpectedly parsed",
                pos
            );
        }
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(matches!(
            OnionAddress::parse("tooshort.onion"),
            Err(TorError::InvalidAddress(_))
        ));
        assert!(matches!(
            OnionAddress::parse(&"a".repeat(57)),
            Err(TorError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_invalid_base32_rejected() {
        // '1' and '8' are outside the base32 alphabet.
        let bad = "1".repeat(ADDRESS_LEN);
        assert!(matches!(
            OnionAddress::parse(&bad),
            Err(TorError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_wrong_version_rejected() {
        // Hand-build an address with version byte 2 and a checksum that
        // matches version 2; the version check must still reject it.
        let pubkey = [7u8; 32];
        let mut input = Vec::new();
        input.extend_from_slice(CHECKSUM_PREFIX);
        input.extend_from_slice(&pubkey);
        input.push(2);
        let digest = crate::protocol::crypto::sha3_256(&input);

        let mut raw = Vec::new();
        raw.extend_from_slice(&pubkey);
        raw.extend_from_slice(&digest[..2]);
        raw.push(2);
        let body = BASE32_NOPAD.encode(&raw).to_ascii_lowercase();

        assert!(matches!(
            OnionAddress::parse(&body),
            Err(TorError::InvalidAddress(_))
        ));
    }
}
