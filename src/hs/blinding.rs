//! Time periods and key blinding
//!
//! Hidden-service descriptors rotate on a time period (24h, offset so
//! periods begin at 12:00 UTC). For each period the service's identity
//! key is blinded with a scalar derived from the key and the period;
//! clients derive the same blinded key to locate and decrypt the
//! descriptor. The subcredential binds descriptor encryption and the
//! introduction handshake to both the identity and the blinded key.

use crate::error::{Result, TorError};
use crate::protocol::crypto::sha3_256;
use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::scalar::{clamp_integer, Scalar};
use sha3::{Digest, Sha3_256};

/// Period length in minutes (24 hours).
pub const PERIOD_LENGTH_MINUTES: u64 = 1440;

/// Periods begin this many minutes past the epoch day boundary.
pub const ROTATION_OFFSET_MINUTES: u64 = 12 * 60;

const BLIND_STRING: &[u8] = b"Derive temporary signing key";
const ED25519_BASEPOINT: &[u8] =
    b"(15112221349535400772501151409588531511454012693041857206046113283949847762202, \
46316835694926478169428394003475163141307993866256225615783033603165251855960)";

/// One descriptor rotation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimePeriod {
    /// Period ordinal since the epoch
    pub number: u64,

    /// Period length in minutes
    pub length_minutes: u64,
}

impl TimePeriod {
    /// The period containing `unix_seconds`.
    pub fn at(unix_seconds: u64) -> Self {
        let minutes = unix_seconds / 60;
        let shifted = minutes.saturating_sub(ROTATION_OFFSET_MINUTES);
        Self {
            number: shifted / PERIOD_LENGTH_MINUTES,
            length_minutes: PERIOD_LENGTH_MINUTES,
        }
    }

    /// The current period.
    pub fn current() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::at(now)
    }

    /// 8-byte big-endian period number.
    pub fn number_bytes(&self) -> [u8; 8] {
        self.number.to_be_bytes()
    }

    /// 8-byte big-endian period length.
    pub fn length_bytes(&self) -> [u8; 8] {
        self.length_minutes.to_be_bytes()
    }
}

/// Derive the blinded public key for `identity` in `period`.
///
/// The blinding factor is a clamped scalar hashed from the identity key
/// and the period; the blinded key is that scalar times the identity
/// point.
pub fn blinded_pubkey(identity: &[u8; 32], period: TimePeriod) -> Result<[u8; 32]> {
    let mut hasher = Sha3_256::new();
    hasher.update(BLIND_STRING);
    hasher.update([0u8]);
    hasher.update(identity);
    hasher.update(ED25519_BASEPOINT);
    hasher.update(b"key-blind");
    hasher.update(period.number_bytes());
    hasher.update(period.length_bytes());
    let mut h: [u8; 32] = hasher.finalize().into();

    let scalar = Scalar::from_bytes_mod_order(clamp_integer(h));
    h.fill(0);

    let point = CompressedEdwardsY(*identity)
        .decompress()
        .ok_or_else(|| TorError::InvalidAddress("identity key is not a curve point".into()))?;

    Ok((point * scalar).compress().to_bytes())
}

/// Subcredential for `identity` under `blinded`:
/// `N_hs_subcred = H("subcredential" | H("credential" | identity) | blinded)`.
pub fn subcredential(identity: &[u8; 32], blinded: &[u8; 32]) -> [u8; 32] {
    let mut credential_input = Vec::with_capacity(10 + 32);
    credential_input.extend_from_slice(b"credential");
    credential_input.extend_from_slice(identity);
    let credential = sha3_256(&credential_input);

    let mut subcred_input = Vec::with_capacity(13 + 64);
    subcred_input.extend_from_slice(b"subcredential");
    subcred_input.extend_from_slice(&credential);
    subcred_input.extend_from_slice(blinded);
    sha3_256(&subcred_input)
}

/// Where this blinded key's descriptor lives on the hash ring:
/// `hs_index(replica) = H("store-at-idx" | blinded | INT_8(replica) |
/// INT_8(period_length) | INT_8(period_num))`.
pub fn hs_index(blinded: &[u8; 32], replica: u64, period: TimePeriod) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(b"store-at-idx");
    hasher.update(blinded);
    hasher.update(replica.to_be_bytes());
    hasher.update(period.length_bytes());
    hasher.update(period.number_bytes());
    hasher.finalize().into()
}

/// A relay's position on the hash ring:
/// `hsdir_index(node) = H("node-idx" | identity | shared_random |
/// INT_8(period_num) | INT_8(period_length))`.
pub fn hsdir_index(
    node_identity: &[u8; 32],
    shared_random: &[u8; 32],
    period: TimePeriod,
) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(b"node-idx");
    hasher.update(node_identity);
    hasher.update(shared_random);
    hasher.update(period.number_bytes());
    hasher.update(period.length_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn test_time_period_boundaries() {
        // 2021-01-01 00:00:00 UTC = 1609459200.
        let midnight = TimePeriod::at(1_609_459_200);
        // Eleven hours later, still the same period (rotation at 12:00).
        let morning = TimePeriod::at(1_609_459_200 + 11 * 3600);
        assert_eq!(midnight, morning);

        // Crossing 12:00 UTC starts the next period.
        let afternoon = TimePeriod::at(1_609_459_200 + 13 * 3600);
        assert_eq!(afternoon.number, midnight.number + 1);

        assert_eq!(midnight.length_minutes, 1440);
    }

    #[test]
    fn test_blinding_is_deterministic_and_period_dependent() {
        let signing = SigningKey::generate(&mut OsRng);
        let identity = signing.verifying_key().to_bytes();

        let p1 = TimePeriod {
            number: 19000,
            length_minutes: 1440,
        };
        let p2 = TimePeriod {
            number: 19001,
            length_minutes: 1440,
        };

        let a = blinded_pubkey(&identity, p1).unwrap();
        let b = blinded_pubkey(&identity, p1).unwrap();
        let c = blinded_pubkey(&identity, p2).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, identity);
    }

    #[test]
    fn test_blinding_rejects_non_point() {
        // Not every 32-byte string decompresses to a curve point.
        let mut bogus = [0xFFu8; 32];
        bogus[31] = 0x7F;
        let period = TimePeriod {
            number: 1,
            length_minutes: 1440,
        };
        // Either outcome is a point or an error; a non-point must error.
        if CompressedEdwardsY(bogus).decompress().is_none() {
            assert!(blinded_pubkey(&bogus, period).is_err());
        }
    }

    #[test]
    fn test_subcredential_binds_both_keys() {
        let id_a = [1u8; 32];
        let id_b = [2u8; 32];
        let blind_a = [3u8; 32];
        let blind_b = [4u8; 32];

        assert_ne!(
            subcredential(&id_a, &blind_a),
            subcredential(&id_b, &blind_a)
        );
        assert_ne!(
            subcredential(&id_a, &blind_a),
            subcredential(&id_a, &blind_b)
        );
    }

    #[test]
    fn test_indices_differ_by_replica() {
        let blinded = [5u8; 32];
        let period = TimePeriod {
            number: 100,
            length_minutes: 1440,
        };
        assert_ne!(
            hs_index(&blinded, 1, period),
            hs_index(&blinded, 2, period)
        );
    }
}
