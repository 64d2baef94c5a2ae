//! Introduction and rendezvous
//!
//! The client side of connecting to a hidden service once its descriptor
//! is in hand:
//! 1. establish a rendezvous cookie at a randomly chosen relay
//! 2. send INTRODUCE1 through a circuit ending at an introduction point,
//!    carrying the cookie and rendezvous point, encrypted to the
//!    service's hs-ntor key
//! 3. await INTRODUCE_ACK, then RENDEZVOUS2 on the rendezvous circuit
//! 4. finish the handshake and install the service as a virtual hop
//!
//! The hs-ntor exchange mirrors the relay ntor handshake but keys its
//! derivations with SHA3-256/SHAKE-256 and binds the service's intro
//! authentication key into every MAC.

use crate::error::{Result, TorError};
use crate::hs::descriptor::IntroPoint;
use crate::protocol::cell::{RelayCell, RelayCommand};
use crate::protocol::circuit::Circuit;
use crate::protocol::crypto::{sha3_256, CircuitKeys};
use crate::protocol::ntor::KEY_MATERIAL_LEN;
use crate::protocol::relay::Relay;
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::rngs::OsRng;
use rand::RngCore;
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake256;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use x25519_dalek::{PublicKey, StaticSecret};

type Aes256Ctr = Ctr128BE<Aes256>;

const PROTOID: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1";
const T_HSENC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_extract";
const T_HSVERIFY: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_verify";
const T_HSMAC: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_mac";
const M_HSEXPAND: &[u8] = b"tor-hs-ntor-curve25519-sha3-256-1:hs_key_expand";

/// Rendezvous cookie length.
pub const COOKIE_LEN: usize = 20;

/// How long to wait for each control-cell response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// `MAC(key, message) = H(INT_8(len(key)) | key | message)` with SHA3-256.
fn hs_mac(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut input = Vec::with_capacity(8 + key.len() + message.len());
    input.extend_from_slice(&(key.len() as u64).to_be_bytes());
    input.extend_from_slice(key);
    input.extend_from_slice(message);
    sha3_256(&input)
}

/// A rendezvous point with its cookie established.
pub struct RendezvousPoint {
    /// Circuit ending at the rendezvous relay
    pub circuit: Arc<Circuit>,

    /// The relay itself (sent to the service inside INTRODUCE1)
    pub relay: Relay,

    /// The cookie both sides present
    pub cookie: [u8; COOKIE_LEN],

    /// Circuit-level cells from the rendezvous circuit
    control: mpsc::UnboundedReceiver<RelayCell>,
}

impl RendezvousPoint {
    /// Send ESTABLISH_RENDEZVOUS on `circuit` and wait for the ack.
    pub async fn establish(circuit: Arc<Circuit>, relay: Relay) -> Result<Self> {
        let mut cookie = [0u8; COOKIE_LEN];
        OsRng.fill_bytes(&mut cookie);

        let mut control = circuit.take_control_channel();
        let cell = RelayCell::new(
            RelayCommand::EstablishRendezvous,
            0,
            cookie.to_vec(),
        );
        circuit.send_relay_cell(&cell, false).await?;

        let reply = recv_control(&mut control, "RENDEZVOUS_ESTABLISHED").await?;
        if reply.command != RelayCommand::RendezvousEstablished {
            return Err(TorError::RendezvousFailed(format!(
                "expected RENDEZVOUS_ESTABLISHED, got {:?}",
                reply.command
            )));
        }

        log::debug!(
            "rendezvous established at {} on circuit {}",
            relay.nickname,
            circuit.id()
        );
        Ok(Self {
            circuit,
            relay,
            cookie,
            control,
        })
    }

    /// Wait for the service's RENDEZVOUS2 and complete the handshake,
    /// installing the service as a virtual hop on the circuit.
    pub async fn await_rendezvous2(&mut self, handshake: HsNtorClient) -> Result<()> {
        let reply = recv_control(&mut self.control, "RENDEZVOUS2").await?;
        if reply.command != RelayCommand::Rendezvous2 {
            return Err(TorError::RendezvousFailed(format!(
                "expected RENDEZVOUS2, got {:?}",
                reply.command
            )));
        }

        let keys = handshake.finalize(&reply.data)?;
        self.circuit.add_virtual_hop(&keys).await?;
        log::info!(
            "rendezvous complete on circuit {}, hidden service attached",
            self.circuit.id()
        );
        Ok(())
    }
}

async fn recv_control(
    control: &mut mpsc::UnboundedReceiver<RelayCell>,
    what: &str,
) -> Result<RelayCell> {
    match tokio::time::timeout(RESPONSE_TIMEOUT, control.recv()).await {
        Ok(Some(cell)) => Ok(cell),
        Ok(None) => Err(TorError::RendezvousFailed(format!(
            "circuit died waiting for {}",
            what
        ))),
        Err(_) => Err(TorError::Timeout(format!("waiting for {}", what))),
    }
}

/// Client state for one hs-ntor exchange.
pub struct HsNtorClient {
    client_secret: StaticSecret,
    client_public: PublicKey,
    intro_auth_key: [u8; 32],
    intro_enc_key: PublicKey,
    subcredential: [u8; 32],
}

impl HsNtorClient {
    pub fn new(intro: &IntroPoint, subcredential: [u8; 32]) -> Self {
        let client_secret = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&client_secret);
        Self {
            client_secret,
            client_public,
            intro_auth_key: intro.auth_key,
            intro_enc_key: PublicKey::from(intro.enc_key),
            subcredential,
        }
    }

    pub fn client_public(&self) -> &PublicKey {
        &self.client_public
    }

    /// Key stream for the INTRODUCE1 encrypted portion:
    /// `SHAKE-256(EXP(B,x) | AUTH_KEY | X | B | PROTOID | t_hsenc |
    /// m_hsexpand | subcredential)` -> ENC_KEY (32) | MAC_KEY (32).
    fn intro_keys(&self) -> ([u8; 32], [u8; 32]) {
        let shared_bx = self.client_secret.diffie_hellman(&self.intro_enc_key);

        let mut kdf = Shake256::default();
        kdf.update(shared_bx.as_bytes());
        kdf.update(&self.intro_auth_key);
        kdf.update(self.client_public.as_bytes());
        kdf.update(self.intro_enc_key.as_bytes());
        kdf.update(PROTOID);
        kdf.update(T_HSENC);
        kdf.update(M_HSEXPAND);
        kdf.update(&self.subcredential);

        let mut out = [0u8; 64];
        kdf.finalize_xof().read(&mut out);
        let mut enc_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        enc_key.copy_from_slice(&out[..32]);
        mac_key.copy_from_slice(&out[32..]);
        (enc_key, mac_key)
    }

    /// Build the INTRODUCE1 cell body.
    ///
    /// Layout: `LEGACY_KEY_ID (20, zero) | AUTH_KEY_TYPE (1) |
    /// AUTH_KEY_LEN (2) | AUTH_KEY | N_EXTENSIONS (1) | CLIENT_PK (32) |
    /// ENCRYPTED(plaintext) | MAC (32)`, where the plaintext carries the
    /// rendezvous cookie, the rendezvous point's ntor key, and its link
    /// specifiers.
    pub fn build_introduce1(&self, rendezvous: &RendezvousPoint) -> Result<Vec<u8>> {
        let rend_relay = &rendezvous.relay;
        let rend_ntor = rend_relay.ntor_onion_key.ok_or_else(|| {
            TorError::IntroductionFailed(format!(
                "rendezvous relay {} has no ntor key",
                rend_relay.nickname
            ))
        })?;
        let rend_id = rend_relay.fingerprint_bytes().ok_or_else(|| {
            TorError::IntroductionFailed("rendezvous relay fingerprint invalid".into())
        })?;

        // Plaintext of the encrypted portion.
        let mut plaintext = Vec::with_capacity(64 + 40);
        plaintext.extend_from_slice(&rendezvous.cookie);
        plaintext.push(0); // N_EXTENSIONS
        plaintext.push(0x01); // ONION_KEY_TYPE: ntor
        plaintext.extend_from_slice(&32u16.to_be_bytes());
        plaintext.extend_from_slice(&rend_ntor);
        // Link specifiers: IPv4 + legacy identity.
        plaintext.push(2);
        match rend_relay.address {
            IpAddr::V4(v4) => {
                plaintext.push(0x00);
                plaintext.push(6);
                plaintext.extend_from_slice(&v4.octets());
                plaintext.extend_from_slice(&rend_relay.or_port.to_be_bytes());
            }
            IpAddr::V6(v6) => {
                plaintext.push(0x01);
                plaintext.push(18);
                plaintext.extend_from_slice(&v6.octets());
                plaintext.extend_from_slice(&rend_relay.or_port.to_be_bytes());
            }
        }
        plaintext.push(0x02);
        plaintext.push(20);
        plaintext.extend_from_slice(&rend_id);

        let (enc_key, mac_key) = self.intro_keys();
        let mut encrypted = plaintext;
        let iv = [0u8; 16];
        let mut cipher = Aes256Ctr::new(&enc_key.into(), &iv.into());
        cipher.apply_keystream(&mut encrypted);

        // Assemble the cell body.
        let mut body = Vec::with_capacity(20 + 3 + 32 + 1 + 32 + encrypted.len() + 32);
        body.extend_from_slice(&[0u8; 20]); // LEGACY_KEY_ID, zero for v3
        body.push(0x02); // AUTH_KEY_TYPE: ed25519
        body.extend_from_slice(&32u16.to_be_bytes());
        body.extend_from_slice(&self.intro_auth_key);
        body.push(0); // N_EXTENSIONS
        body.extend_from_slice(self.client_public.as_bytes());
        body.extend_from_slice(&encrypted);

        let mac = hs_mac(&mac_key, &body);
        body.extend_from_slice(&mac);
        Ok(body)
    }

    /// Finish the handshake with the RENDEZVOUS2 payload
    /// (`SERVER_PK (32) | AUTH (32)`), producing the virtual hop's keys.
    pub fn finalize(self, payload: &[u8]) -> Result<CircuitKeys> {
        if payload.len() < 64 {
            return Err(TorError::RendezvousFailed(format!(
                "RENDEZVOUS2 payload of {} bytes",
                payload.len()
            )));
        }
        let mut server_pk = [0u8; 32];
        server_pk.copy_from_slice(&payload[..32]);
        let server_public = PublicKey::from(server_pk);
        let auth = &payload[32..64];

        // rend_secret_hs_input = EXP(Y,x) | EXP(B,x) | AUTH_KEY | B | X | Y | PROTOID
        let shared_yx = self.client_secret.diffie_hellman(&server_public);
        let shared_bx = self.client_secret.diffie_hellman(&self.intro_enc_key);

        let mut secret_input = Vec::with_capacity(32 * 5 + 32 + PROTOID.len());
        secret_input.extend_from_slice(shared_yx.as_bytes());
        secret_input.extend_from_slice(shared_bx.as_bytes());
        secret_input.extend_from_slice(&self.intro_auth_key);
        secret_input.extend_from_slice(self.intro_enc_key.as_bytes());
        secret_input.extend_from_slice(self.client_public.as_bytes());
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let key_seed = hs_mac(&secret_input, T_HSENC);
        let verify = hs_mac(&secret_input, T_HSVERIFY);

        let mut auth_input = Vec::with_capacity(32 * 5 + PROTOID.len() + 6);
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(&self.intro_auth_key);
        auth_input.extend_from_slice(self.intro_enc_key.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(self.client_public.as_bytes());
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");
        let expected_auth = hs_mac(&auth_input, T_HSMAC);

        let auth_ok: bool = expected_auth.as_slice().ct_eq(auth).into();
        if !auth_ok {
            return Err(TorError::HandshakeAuthFailure);
        }

        // Expand the seed into the standard hop key layout.
        let mut kdf = Shake256::default();
        kdf.update(&key_seed);
        kdf.update(M_HSEXPAND);
        let mut material = [0u8; KEY_MATERIAL_LEN];
        kdf.finalize_xof().read(&mut material);

        Ok(CircuitKeys::from_material(&material))
    }
}

/// Send INTRODUCE1 on `intro_circuit` and wait for the ack.
pub async fn introduce(
    intro_circuit: &Arc<Circuit>,
    introduce1_body: Vec<u8>,
) -> Result<()> {
    let mut control = intro_circuit.take_control_channel();
    let cell = RelayCell::new(RelayCommand::Introduce1, 0, introduce1_body);
    intro_circuit.send_relay_cell(&cell, false).await?;

    let reply = recv_control(&mut control, "INTRODUCE_ACK").await?;
    if reply.command != RelayCommand::IntroduceAck {
        return Err(TorError::IntroductionFailed(format!(
            "expected INTRODUCE_ACK, got {:?}",
            reply.command
        )));
    }

    let status = if reply.data.len() >= 2 {
        u16::from_be_bytes([reply.data[0], reply.data[1]])
    } else {
        0
    };
    if status != 0 {
        return Err(TorError::IntroductionFailed(format!(
            "introduction point refused (status {})",
            status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hs::descriptor::LinkSpec;

    fn intro_point(enc_secret: &StaticSecret) -> IntroPoint {
        IntroPoint {
            link_specifiers: vec![LinkSpec::Ipv4("192.0.2.1".parse().unwrap(), 443)],
            onion_key: [1u8; 32],
            auth_key: [2u8; 32],
            enc_key: PublicKey::from(enc_secret).to_bytes(),
        }
    }

    /// Service-side transcript of the rendezvous handshake, mirroring
    /// `HsNtorClient::finalize`.
    fn service_rendezvous2(
        client_pk: &[u8; 32],
        enc_secret: &StaticSecret,
        auth_key: &[u8; 32],
    ) -> (Vec<u8>, CircuitKeys) {
        let client_public = PublicKey::from(*client_pk);
        let enc_public = PublicKey::from(enc_secret);

        let server_secret = StaticSecret::random_from_rng(OsRng);
        let server_public = PublicKey::from(&server_secret);

        let shared_xy = server_secret.diffie_hellman(&client_public);
        let shared_xb = enc_secret.diffie_hellman(&client_public);

        let mut secret_input = Vec::new();
        secret_input.extend_from_slice(shared_xy.as_bytes());
        secret_input.extend_from_slice(shared_xb.as_bytes());
        secret_input.extend_from_slice(auth_key);
        secret_input.extend_from_slice(enc_public.as_bytes());
        secret_input.extend_from_slice(client_pk);
        secret_input.extend_from_slice(server_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let key_seed = hs_mac(&secret_input, T_HSENC);
        let verify = hs_mac(&secret_input, T_HSVERIFY);

        let mut auth_input = Vec::new();
        auth_input.extend_from_slice(&verify);
        auth_input.extend_from_slice(auth_key);
        auth_input.extend_from_slice(enc_public.as_bytes());
        auth_input.extend_from_slice(server_public.as_bytes());
        auth_input.extend_from_slice(client_pk);
        auth_input.extend_from_slice(PROTOID);
        auth_input.extend_from_slice(b"Server");
        let auth = hs_mac(&auth_input, T_HSMAC);

        let mut payload = Vec::with_capacity(64);
        payload.extend_from_slice(server_public.as_bytes());
        payload.extend_from_slice(&auth);

        let mut kdf = Shake256::default();
        kdf.update(&key_seed);
        kdf.update(M_HSEXPAND);
        let mut material = [0u8; KEY_MATERIAL_LEN];
        kdf.finalize_xof().read(&mut material);

        (payload, CircuitKeys::from_material(&material))
    }

    #[test]
    fn test_rendezvous_handshake_agrees() {
        let enc_secret = StaticSecret::random_from_rng(OsRng);
        let intro = intro_point(&enc_secret);
        let client = HsNtorClient::new(&intro, [9u8; 32]);
        let client_pk = client.client_public().to_bytes();

        let (payload, service_keys) =
            service_rendezvous2(&client_pk, &enc_secret, &intro.auth_key);
        let client_keys = client.finalize(&payload).unwrap();

        assert_eq!(client_keys.forward_key, service_keys.forward_key);
        assert_eq!(client_keys.backward_key, service_keys.backward_key);
        assert_eq!(
            client_keys.forward_digest_seed,
            service_keys.forward_digest_seed
        );
    }

    #[test]
    fn test_rendezvous_auth_mismatch() {
        let enc_secret = StaticSecret::random_from_rng(OsRng);
        let intro = intro_point(&enc_secret);
        let client = HsNtorClient::new(&intro, [9u8; 32]);
        let client_pk = client.client_public().to_bytes();

        let (mut payload, _) =
            service_rendezvous2(&client_pk, &enc_secret, &intro.auth_key);
        payload[40] ^= 0x80;

        let err = client.finalize(&payload).unwrap_err();
        assert!(matches!(err, TorError::HandshakeAuthFailure));
    }

    #[test]
    fn test_intro_keys_depend_on_subcredential() {
        let enc_secret = StaticSecret::random_from_rng(OsRng);
        let intro = intro_point(&enc_secret);

        let a = HsNtorClient::new(&intro, [1u8; 32]).intro_keys();
        let b = HsNtorClient::new(&intro, [2u8; 32]).intro_keys();
        // Fresh ephemerals also differ, but the keys must never collide.
        assert_ne!(a.0, b.0);
    }

    #[test]
    fn test_short_rendezvous2_rejected() {
        let enc_secret = StaticSecret::random_from_rng(OsRng);
        let intro = intro_point(&enc_secret);
        let client = HsNtorClient::new(&intro, [9u8; 32]);
        assert!(client.finalize(&[0u8; 32]).is_err());
    }
}
