//! ntor handshake implementation
//!
//! Implements the client side of the ntor one-way-authenticated key
//! exchange used for CREATE2 and EXTEND2, based on X25519.
//!
//! Security: AUTH verification uses constant-time comparison, and the
//! ephemeral secret is zeroized as soon as key material is derived.

use crate::error::{Result, TorError};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

/// Protocol identifier mixed into the shared-secret input
pub const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";

/// HKDF salt for key-material extraction
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";

/// HKDF salt for AUTH verification
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";

/// Handshake request size: NODEID (20) | KEYID (32) | CLIENT_PK (32)
pub const HANDSHAKE_LEN: usize = 84;

/// Handshake response size: Y (32) | AUTH (32)
pub const RESPONSE_LEN: usize = 64;

/// Derived key material: Df (20) | Db (20) | Kf (16) | Kb (16)
pub const KEY_MATERIAL_LEN: usize = 72;

/// In-flight client handshake state
///
/// The ephemeral secret lives only as long as this value; `StaticSecret`
/// zeroizes itself on drop.
pub struct NtorHandshake {
    /// Client's ephemeral secret key x
    client_secret: StaticSecret,

    /// Client's ephemeral public key X = x*G
    client_public: PublicKey,
}

impl NtorHandshake {
    /// Start a handshake with a fresh ephemeral keypair.
    pub fn new() -> Self {
        let client_secret = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&client_secret);

        Self {
            client_secret,
            client_public,
        }
    }

    /// The client's ephemeral public key X.
    pub fn client_public(&self) -> &PublicKey {
        &self.client_public
    }

    /// Build the 84-byte handshake request.
    ///
    /// Format: `NODEID (20) || KEYID (32) || CLIENT_PK (32)`, where NODEID
    /// is the relay's SHA-1 identity fingerprint and KEYID its ntor onion
    /// key.
    pub fn handshake_data(
        &self,
        relay_identity: &[u8; 20],
        relay_ntor_key: &PublicKey,
    ) -> Vec<u8> {
        let mut data = Vec::with_capacity(HANDSHAKE_LEN);
        data.extend_from_slice(relay_identity);
        data.extend_from_slice(relay_ntor_key.as_bytes());
        data.extend_from_slice(self.client_public.as_bytes());
        data
    }

    /// Complete the handshake with the relay's 64-byte response.
    ///
    /// The response is `Y (32) || AUTH (32)`. AUTH is verified in constant
    /// time against the value derived from the shared secret; on mismatch
    /// no key material is produced. On success returns the 72-byte key
    /// material `Df || Db || Kf || Kb`.
    pub fn finalize(
        self,
        response: &[u8],
        relay_identity: &[u8; 20],
        relay_ntor_key: &PublicKey,
    ) -> Result<[u8; KEY_MATERIAL_LEN]> {
        if response.len() < RESPONSE_LEN {
            return Err(TorError::ProtocolError(format!(
                "ntor response too short: {} bytes",
                response.len()
            )));
        }

        let mut server_public_bytes = [0u8; 32];
        server_public_bytes.copy_from_slice(&response[0..32]);
        let server_public = PublicKey::from(server_public_bytes);
        let auth = &response[32..64];

        // secret_input = EXP(Y,x) | EXP(B,x) | ID | B | X | Y | PROTOID
        let shared_yx = self.client_secret.diffie_hellman(&server_public);
        let shared_bx = self.client_secret.diffie_hellman(relay_ntor_key);

        let mut secret_input = Vec::with_capacity(32 * 4 + 20 + 32 + PROTOID.len());
        secret_input.extend_from_slice(shared_yx.as_bytes());
        secret_input.extend_from_slice(shared_bx.as_bytes());
        secret_input.extend_from_slice(relay_identity);
        secret_input.extend_from_slice(relay_ntor_key.as_bytes());
        secret_input.extend_from_slice(self.client_public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        // expected AUTH from the verification branch of the KDF
        let mut expected_auth = [0u8; 32];
        Hkdf::<Sha256>::new(Some(T_VERIFY), &secret_input)
            .expand(&[], &mut expected_auth)
            .map_err(|_| TorError::Crypto("ntor verify expansion failed".into()))?;

        let auth_valid: bool = expected_auth.as_slice().ct_eq(auth).into();
        if !auth_valid {
            return Err(TorError::HandshakeAuthFailure);
        }

        let mut key_material = [0u8; KEY_MATERIAL_LEN];
        Hkdf::<Sha256>::new(Some(T_KEY), &secret_input)
            .expand(&[], &mut key_material)
            .map_err(|_| TorError::Crypto("ntor key expansion failed".into()))?;

        // self is consumed here; the ephemeral secret zeroizes on drop.
        Ok(key_material)
    }
}

impl Default for NtorHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-side transcript of the same exchange, used by tests to confirm
/// both ends derive identical key material.
#[cfg(test)]
pub(crate) fn server_respond(
    client_handshake: &[u8],
    identity: &[u8; 20],
    onion_secret: &StaticSecret,
) -> ([u8; RESPONSE_LEN], [u8; KEY_MATERIAL_LEN]) {
    use hkdf::Hkdf;

    let onion_public = PublicKey::from(onion_secret);

    let mut client_pk_bytes = [0u8; 32];
    client_pk_bytes.copy_from_slice(&client_handshake[52..84]);
    let client_public = PublicKey::from(client_pk_bytes);

    let server_secret = StaticSecret::random_from_rng(OsRng);
    let server_public = PublicKey::from(&server_secret);

    let shared_xy = server_secret.diffie_hellman(&client_public);
    let shared_xb = onion_secret.diffie_hellman(&client_public);

    let mut secret_input = Vec::new();
    secret_input.extend_from_slice(shared_xy.as_bytes());
    secret_input.extend_from_slice(shared_xb.as_bytes());
    secret_input.extend_from_slice(identity);
    secret_input.extend_from_slice(onion_public.as_bytes());
    secret_input.extend_from_slice(client_public.as_bytes());
    secret_input.extend_from_slice(server_public.as_bytes());
    secret_input.extend_from_slice(PROTOID);

    let mut auth = [0u8; 32];
    Hkdf::<Sha256>::new(Some(T_VERIFY), &secret_input)
        .expand(&[], &mut auth)
        .unwrap();

    let mut key_material = [0u8; KEY_MATERIAL_LEN];
    Hkdf::<Sha256>::new(Some(T_KEY), &secret_input)
        .expand(&[], &mut key_material)
        .unwrap();

    let mut response = [0u8; RESPONSE_LEN];
    response[..32].copy_from_slice(server_public.as_bytes());
    response[32..].copy_from_slice(&auth);

    (response, key_material)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_relay() -> ([u8; 20], StaticSecret, PublicKey) {
        let identity = [0x42u8; 20];
        let onion_secret = StaticSecret::random_from_rng(OsRng);
        let onion_public = PublicKey::from(&onion_secret);
        (identity, onion_secret, onion_public)
    }

    #[test]
    fn test_handshake_data_layout() {
        let (identity, _, onion_public) = test_relay();
        let hs = NtorHandshake::new();
        let data = hs.handshake_data(&identity, &onion_public);

        assert_eq!(data.len(), HANDSHAKE_LEN);
        assert_eq!(&data[0..20], &identity);
        assert_eq!(&data[20..52], onion_public.as_bytes());
        assert_eq!(&data[52..84], hs.client_public().as_bytes());
    }

    #[test]
    fn test_both_sides_derive_same_keys() {
        let (identity, onion_secret, onion_public) = test_relay();

        let hs = NtorHandshake::new();
        let request = hs.handshake_data(&identity, &onion_public);
        let (response, server_keys) = server_respond(&request, &identity, &onion_secret);

        let client_keys = hs
            .finalize(&response, &identity, &onion_public)
            .expect("auth should verify");

        assert_eq!(client_keys, server_keys);
    }

    #[test]
    fn test_auth_bit_flip_rejected() {
        let (identity, onion_secret, onion_public) = test_relay();

        let hs = NtorHandshake::new();
        let request = hs.handshake_data(&identity, &onion_public);
        let (mut response, _) = server_respond(&request, &identity, &onion_secret);

        // Flip one bit of AUTH.
        response[32] ^= 0x01;

        let err = hs.finalize(&response, &identity, &onion_public).unwrap_err();
        assert!(matches!(err, TorError::HandshakeAuthFailure));
    }

    #[test]
    fn test_short_response_rejected() {
        let (identity, _, onion_public) = test_relay();
        let hs = NtorHandshake::new();
        let err = hs.finalize(&[0u8; 32], &identity, &onion_public).unwrap_err();
        assert!(matches!(err, TorError::ProtocolError(_)));
    }
}
