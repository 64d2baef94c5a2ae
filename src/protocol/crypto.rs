//! Circuit-layer cryptography
//!
//! Per-hop symmetric state for relay cells:
//! - AES-128-CTR stream ciphers, one per hop and direction, whose
//!   keystream position persists across cells
//! - SHA-1 running digests seeded with Df/Db from the ntor KDF
//! - Onion layering (encrypt innermost-first outbound, peel outermost-first
//!   inbound with recognition checks)
//!
//! Also exposes the small standalone primitives the rest of the crate
//! needs: Ed25519 verification and SHA3-256.

use crate::protocol::cell::{Cell, RelayCell};
use crate::protocol::ntor::KEY_MATERIAL_LEN;
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use sha1::{Digest as Sha1Digest, Sha1};
use sha3::{Digest as Sha3Digest, Sha3_256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-128-CTR cipher type
type Aes128Ctr = Ctr128BE<Aes128>;

/// Key material for one hop, as laid out by the ntor KDF:
/// `Df (20) || Db (20) || Kf (16) || Kb (16)`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CircuitKeys {
    /// Forward digest seed Df
    pub forward_digest_seed: [u8; 20],

    /// Backward digest seed Db
    pub backward_digest_seed: [u8; 20],

    /// Forward encryption key Kf (AES-128)
    pub forward_key: [u8; 16],

    /// Backward encryption key Kb (AES-128)
    pub backward_key: [u8; 16],
}

impl std::fmt::Debug for CircuitKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitKeys").finish_non_exhaustive()
    }
}

impl CircuitKeys {
    /// Split 72 bytes of ntor key material into its components.
    pub fn from_material(material: &[u8; KEY_MATERIAL_LEN]) -> Self {
        let mut keys = Self {
            forward_digest_seed: [0u8; 20],
            backward_digest_seed: [0u8; 20],
            forward_key: [0u8; 16],
            backward_key: [0u8; 16],
        };
        keys.forward_digest_seed.copy_from_slice(&material[0..20]);
        keys.backward_digest_seed.copy_from_slice(&material[20..40]);
        keys.forward_key.copy_from_slice(&material[40..56]);
        keys.backward_key.copy_from_slice(&material[56..72]);
        keys
    }
}

/// Live symmetric state for one direction of one hop.
///
/// The CTR keystream and the running digest both advance monotonically;
/// losing sync with the relay is unrecoverable for the circuit.
pub struct HopCrypto {
    cipher: Aes128Ctr,
    digest: Sha1,
}

impl HopCrypto {
    fn new(key: &[u8; 16], digest_seed: &[u8; 20]) -> Self {
        // IV starts at zero; the keystream position carries over between cells.
        let iv = [0u8; 16];
        let mut digest = Sha1::new();
        digest.update(digest_seed);
        Self {
            cipher: Aes128Ctr::new(key.into(), &iv.into()),
            digest,
        }
    }

    /// Forward-direction state (client to relay) for a hop.
    pub fn forward(keys: &CircuitKeys) -> Self {
        Self::new(&keys.forward_key, &keys.forward_digest_seed)
    }

    /// Backward-direction state (relay to client) for a hop.
    pub fn backward(keys: &CircuitKeys) -> Self {
        Self::new(&keys.backward_key, &keys.backward_digest_seed)
    }

    /// Apply one cipher layer in place (CTR: same operation both ways).
    pub fn apply_layer(&mut self, body: &mut [u8]) {
        self.cipher.apply_keystream(body);
    }

    /// Commit `body` (digest field zeroed) into the running digest and
    /// return the 4-byte digest value to place into the cell.
    pub fn seal_digest(&mut self, body: &[u8]) -> [u8; 4] {
        self.digest.update(body);
        let snapshot = self.digest.clone().finalize();
        let mut out = [0u8; 4];
        out.copy_from_slice(&snapshot[..4]);
        out
    }

    /// Check whether `body` is recognized at this hop.
    ///
    /// `body` must already have this hop's cipher layer removed. The check
    /// is: Recognized bytes are zero AND the digest field matches the
    /// running digest over the body with the digest field zeroed. Only a
    /// successful check advances the running digest.
    pub fn check_recognized(&mut self, body: &[u8]) -> bool {
        if body.len() < RelayCell::HEADER_SIZE {
            return false;
        }
        // Recognized field: bytes 1..3
        if body[1] != 0 || body[2] != 0 {
            return false;
        }

        let mut zeroed = body.to_vec();
        let received = [body[5], body[6], body[7], body[8]];
        zeroed[RelayCell::DIGEST_RANGE].fill(0);

        let mut candidate = self.digest.clone();
        candidate.update(&zeroed);
        let expected = candidate.clone().finalize();

        if expected[..4] == received {
            self.digest = candidate;
            true
        } else {
            false
        }
    }
}

/// Prepare and onion-encrypt an outbound relay body in place.
///
/// `hops` is ordered guard first; `terminus` is the hop the cell is for
/// (normally the last). The digest is computed against the terminus hop's
/// forward digest state, then layers are applied innermost (terminus)
/// to outermost (guard).
pub fn onion_encrypt_forward(hops: &mut [HopCrypto], terminus: usize, body: &mut Vec<u8>) {
    debug_assert!(terminus < hops.len());
    body.resize(Cell::PAYLOAD_SIZE, 0);

    body[RelayCell::DIGEST_RANGE].fill(0);
    let digest = hops[terminus].seal_digest(body);
    body[RelayCell::DIGEST_RANGE].copy_from_slice(&digest);

    for hop in hops[..=terminus].iter_mut().rev() {
        hop.apply_layer(body);
    }
}

/// Peel an inbound relay body in place.
///
/// Layers are removed outermost (guard) inward; after each peel the hop's
/// recognition check runs. Returns the index of the hop that recognized
/// the cell, or None if no hop did (the caller must treat that as a
/// protocol violation and tear the circuit down).
pub fn onion_decrypt_backward(hops: &mut [HopCrypto], body: &mut [u8]) -> Option<usize> {
    for (idx, hop) in hops.iter_mut().enumerate() {
        hop.apply_layer(body);
        if hop.check_recognized(body) {
            return Some(idx);
        }
    }
    None
}

/// Verify an Ed25519 signature.
pub fn ed25519_verify(pubkey: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    let Ok(key) = VerifyingKey::from_bytes(pubkey) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &sig).is_ok()
}

/// SHA3-256 digest.
pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cell::RelayCommand;

    fn test_keys(tag: u8) -> CircuitKeys {
        let mut material = [0u8; KEY_MATERIAL_LEN];
        for (i, b) in material.iter_mut().enumerate() {
            *b = tag.wrapping_add(i as u8);
        }
        CircuitKeys::from_material(&material)
    }

    #[test]
    fn test_key_material_layout() {
        let mut material = [0u8; KEY_MATERIAL_LEN];
        material[0] = 0xD1;
        material[20] = 0xD2;
        material[40] = 0x11;
        material[56] = 0x22;
        let keys = CircuitKeys::from_material(&material);
        assert_eq!(keys.forward_digest_seed[0], 0xD1);
        assert_eq!(keys.backward_digest_seed[0], 0xD2);
        assert_eq!(keys.forward_key[0], 0x11);
        assert_eq!(keys.backward_key[0], 0x22);
    }

    #[test]
    fn test_ctr_layer_symmetry() {
        let keys = test_keys(1);
        let mut enc = HopCrypto::forward(&keys);
        let mut dec = HopCrypto::forward(&keys);

        let mut body = vec![0u8; Cell::PAYLOAD_SIZE];
        body[..5].copy_from_slice(&[1, 2, 3, 4, 5]);
        let original = body.clone();

        enc.apply_layer(&mut body);
        assert_ne!(body, original);
        dec.apply_layer(&mut body);
        assert_eq!(body, original);
    }

    #[test]
    fn test_three_hop_roundtrip_recognized_at_exit() {
        let key_sets = [test_keys(1), test_keys(2), test_keys(3)];

        // Client's forward states and the relays' matching peel states.
        let mut client_fwd: Vec<HopCrypto> =
            key_sets.iter().map(HopCrypto::forward).collect();
        let mut relay_fwd: Vec<HopCrypto> =
            key_sets.iter().map(HopCrypto::forward).collect();

        let cell = RelayCell::new(RelayCommand::Data, 7, b"payload bytes".to_vec());
        let mut body = cell.encode().unwrap();
        onion_encrypt_forward(&mut client_fwd, 2, &mut body);

        // Each relay peels one layer; the exit recognizes the cell.
        for (idx, relay) in relay_fwd.iter_mut().enumerate() {
            relay.apply_layer(&mut body);
            let recognized = relay.check_recognized(&body);
            assert_eq!(recognized, idx == 2, "only the exit should recognize");
        }

        let decoded = RelayCell::decode(&body).unwrap();
        assert_eq!(decoded.command, RelayCommand::Data);
        assert_eq!(decoded.stream_id, 7);
        assert_eq!(decoded.data, b"payload bytes");
    }

    #[test]
    fn test_backward_recognition() {
        let key_sets = [test_keys(9), test_keys(8), test_keys(7)];

        // The exit originates a backward cell; the client peels all layers.
        let mut exit_back = HopCrypto::backward(&key_sets[2]);
        let mut middle_back = HopCrypto::backward(&key_sets[1]);
        let mut guard_back = HopCrypto::backward(&key_sets[0]);

        let cell = RelayCell::new(RelayCommand::Connected, 7, vec![]);
        let mut body = cell.encode().unwrap();
        body[RelayCell::DIGEST_RANGE].fill(0);
        let digest = exit_back.seal_digest(&body);
        body[RelayCell::DIGEST_RANGE].copy_from_slice(&digest);
        exit_back.apply_layer(&mut body);
        middle_back.apply_layer(&mut body);
        guard_back.apply_layer(&mut body);

        let mut client_back: Vec<HopCrypto> =
            key_sets.iter().map(HopCrypto::backward).collect();
        let recognized = onion_decrypt_backward(&mut client_back, &mut body);
        assert_eq!(recognized, Some(2));

        let decoded = RelayCell::decode(&body).unwrap();
        assert_eq!(decoded.command, RelayCommand::Connected);
    }

    #[test]
    fn test_unrecognized_cell() {
        let keys = test_keys(5);
        let mut hops = vec![HopCrypto::backward(&keys)];
        let mut body = vec![0xA5u8; Cell::PAYLOAD_SIZE];
        assert_eq!(onion_decrypt_backward(&mut hops, &mut body), None);
    }

    #[test]
    fn test_running_digest_advances_per_cell() {
        let keys = test_keys(3);
        let mut hop = HopCrypto::forward(&keys);

        let body = vec![0u8; Cell::PAYLOAD_SIZE];
        let d1 = hop.seal_digest(&body);
        let d2 = hop.seal_digest(&body);
        assert_ne!(d1, d2, "running digest must evolve between cells");
    }

    #[test]
    fn test_sha3_256_known_vector() {
        // SHA3-256 of the empty string
        let digest = sha3_256(b"");
        assert_eq!(
            hex::encode(digest),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }

    #[test]
    fn test_ed25519_verify_rejects_garbage() {
        assert!(!ed25519_verify(&[0u8; 32], b"msg", &[0u8; 64]));
    }
}
