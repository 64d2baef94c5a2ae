//! Hidden-service descriptors
//!
//! A v3 descriptor is a signed outer document wrapping two encryption
//! layers. The outer signature comes from a per-period signing key,
//! certified by the blinded key via an Ed25519 certificate. The
//! superencrypted and encrypted layers are keyed from the blinded key,
//! the subcredential, and the revision counter (SHAKE-256 KDF,
//! AES-256-CTR, SHA3-256 MAC). The innermost plaintext lists the
//! service's introduction points.
//!
//! Restricted-discovery descriptors (client authorization) are not
//! supported; their second layer fails the MAC check and surfaces as
//! `InvalidDescriptor`.

use crate::error::{Result, TorError};
use crate::protocol::crypto::{ed25519_verify, sha3_256};
use aes::Aes256;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake256;
use std::net::Ipv4Addr;
use subtle::ConstantTimeEq;

type Aes256Ctr = Ctr128BE<Aes256>;

/// Prefix mixed into the outer descriptor signature.
const SIG_PREFIX: &[u8] = b"Tor onion service descriptor sig v3";

/// Prefix mixed into Ed25519 certificate signatures.
const CERT_PREFIX: &[u8] = b"Tor node signing key certificate v1";

/// KDF personalization for the first (superencrypted) layer.
const SUPERENC_CONST: &[u8] = b"hsdir-superencrypted-data";

/// KDF personalization for the second (encrypted) layer.
const ENC_CONST: &[u8] = b"hsdir-encrypted-data";

/// Cert type: short-term descriptor signing key, signed by the blinded key.
const CERT_TYPE_HS_DESC_SIGNING: u8 = 0x08;

/// Cert type: introduction point authentication key.
const CERT_TYPE_INTRO_AUTH: u8 = 0x09;

/// Layer envelope: SALT (16) | ENCRYPTED | MAC (32).
const SALT_LEN: usize = 16;
const MAC_LEN: usize = 32;

/// A parsed Ed25519 certificate (Tor cert format v1).
#[derive(Debug, Clone)]
pub struct Ed25519Cert {
    pub cert_type: u8,
    pub expiration_hours: u32,
    pub certified_key: [u8; 32],
    pub signing_key: Option<[u8; 32]>,
    signed_portion: Vec<u8>,
    signature: [u8; 64],
}

impl Ed25519Cert {
    /// Parse the binary certificate body.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 1 + 1 + 4 + 1 + 32 + 1 + 64 {
            return Err(TorError::InvalidDescriptor("cert too short".into()));
        }
        if data[0] != 0x01 {
            return Err(TorError::InvalidDescriptor(format!(
                "cert version {}",
                data[0]
            )));
        }
        let cert_type = data[1];
        let expiration_hours = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        if data[6] != 0x01 {
            return Err(TorError::InvalidDescriptor(format!(
                "cert key type {}",
                data[6]
            )));
        }
        let mut certified_key = [0u8; 32];
        certified_key.copy_from_slice(&data[7..39]);

        let n_extensions = data[39];
        let mut offset = 40;
        let mut signing_key = None;
        for _ in 0..n_extensions {
            if offset + 4 > data.len() {
                return Err(TorError::InvalidDescriptor("cert extension truncated".into()));
            }
            let ext_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
            let ext_type = data[offset + 2];
            offset += 4;
            if offset + ext_len > data.len() {
                return Err(TorError::InvalidDescriptor("cert extension truncated".into()));
            }
            // 0x04: signed-with-ed25519-key
            if ext_type == 0x04 && ext_len == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&data[offset..offset + 32]);
                signing_key = Some(key);
            }
            offset += ext_len;
        }

        if data.len() < offset + 64 {
            return Err(TorError::InvalidDescriptor("cert signature truncated".into()));
        }
        let signed_portion = data[..data.len() - 64].to_vec();
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&data[data.len() - 64..]);

        Ok(Self {
            cert_type,
            expiration_hours,
            certified_key,
            signing_key,
            signed_portion,
            signature,
        })
    }

    /// Verify the certificate signature against `key`.
    pub fn verify(&self, key: &[u8; 32]) -> bool {
        let mut message = Vec::with_capacity(CERT_PREFIX.len() + self.signed_portion.len());
        message.extend_from_slice(CERT_PREFIX);
        message.extend_from_slice(&self.signed_portion);
        ed25519_verify(key, &message, &self.signature)
    }
}

/// One link specifier for an introduction point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpec {
    Ipv4(Ipv4Addr, u16),
    LegacyId([u8; 20]),
    Ed25519([u8; 32]),
    Other(u8, Vec<u8>),
}

impl LinkSpec {
    /// Parse a concatenated `NSPEC | specs...` blob.
    pub fn parse_list(data: &[u8]) -> Result<Vec<LinkSpec>> {
        if data.is_empty() {
            return Err(TorError::InvalidDescriptor("empty link specifiers".into()));
        }
        let nspec = data[0] as usize;
        let mut specs = Vec::with_capacity(nspec);
        let mut offset = 1;
        for _ in 0..nspec {
            if offset + 2 > data.len() {
                return Err(TorError::InvalidDescriptor("link specifier truncated".into()));
            }
            let ls_type = data[offset];
            let ls_len = data[offset + 1] as usize;
            offset += 2;
            if offset + ls_len > data.len() {
                return Err(TorError::InvalidDescriptor("link specifier truncated".into()));
            }
            let body = &data[offset..offset + ls_len];
            offset += ls_len;

            let spec = match (ls_type, ls_len) {
                (0x00, 6) => LinkSpec::Ipv4(
                    Ipv4Addr::new(body[0], body[1], body[2], body[3]),
                    u16::from_be_bytes([body[4], body[5]]),
                ),
                (0x02, 20) => {
                    let mut id = [0u8; 20];
                    id.copy_from_slice(body);
                    LinkSpec::LegacyId(id)
                }
                (0x03, 32) => {
                    let mut key = [0u8; 32];
                    key.copy_from_slice(body);
                    LinkSpec::Ed25519(key)
                }
                _ => LinkSpec::Other(ls_type, body.to_vec()),
            };
            specs.push(spec);
        }
        Ok(specs)
    }
}

/// One introduction point from the inner layer.
#[derive(Debug, Clone)]
pub struct IntroPoint {
    /// How to reach the intro relay
    pub link_specifiers: Vec<LinkSpec>,

    /// The intro relay's ntor onion key
    pub onion_key: [u8; 32],

    /// The service's introduction authentication key
    pub auth_key: [u8; 32],

    /// The service's hs-ntor encryption key (B)
    pub enc_key: [u8; 32],
}

impl IntroPoint {
    /// The intro relay's IPv4 endpoint, when listed.
    pub fn ipv4_endpoint(&self) -> Option<(Ipv4Addr, u16)> {
        self.link_specifiers.iter().find_map(|ls| match ls {
            LinkSpec::Ipv4(addr, port) => Some((*addr, *port)),
            _ => None,
        })
    }

    /// The intro relay's legacy identity fingerprint, when listed.
    pub fn legacy_id(&self) -> Option<[u8; 20]> {
        self.link_specifiers.iter().find_map(|ls| match ls {
            LinkSpec::LegacyId(id) => Some(*id),
            _ => None,
        })
    }
}

/// A fully parsed and verified descriptor.
#[derive(Debug, Clone)]
pub struct HsDescriptor {
    /// Minutes the descriptor is valid for
    pub lifetime_minutes: u64,

    /// Monotonic revision counter
    pub revision: u64,

    /// Introduction points, in service order
    pub intro_points: Vec<IntroPoint>,
}

/// Parse the outer document, check its certificate chain and signature,
/// and decrypt both layers.
pub fn parse_and_verify(
    text: &str,
    blinded: &[u8; 32],
    subcredential: &[u8; 32],
) -> Result<HsDescriptor> {
    let outer = parse_outer(text)?;

    // Certificate: the signing key must be certified by the blinded key.
    let cert = Ed25519Cert::parse(&outer.signing_cert)?;
    if cert.cert_type != CERT_TYPE_HS_DESC_SIGNING {
        return Err(TorError::InvalidDescriptor(format!(
            "signing cert has type {:#04x}",
            cert.cert_type
        )));
    }
    match cert.signing_key {
        Some(key) if key == *blinded => {}
        Some(_) => {
            return Err(TorError::InvalidDescriptor(
                "signing cert not issued by the blinded key".into(),
            ));
        }
        None => {
            return Err(TorError::InvalidDescriptor(
                "signing cert lacks a signed-with key".into(),
            ));
        }
    }
    if !cert.verify(blinded) {
        return Err(TorError::InvalidDescriptor(
            "signing cert signature invalid".into(),
        ));
    }

    // Outer signature by the certified signing key, over the canonical
    // prefix plus everything up to and including "signature ".
    let mut message = Vec::with_capacity(SIG_PREFIX.len() + outer.signed_text.len());
    message.extend_from_slice(SIG_PREFIX);
    message.extend_from_slice(outer.signed_text.as_bytes());
    if !ed25519_verify(&cert.certified_key, &message, &outer.signature) {
        return Err(TorError::InvalidDescriptor(
            "descriptor signature invalid".into(),
        ));
    }

    // Decrypt the two layers.
    let first = decrypt_layer(
        &outer.superencrypted,
        blinded,
        subcredential,
        outer.revision,
        SUPERENC_CONST,
    )?;
    let first_text = String::from_utf8(first)
        .map_err(|_| TorError::InvalidDescriptor("first layer is not UTF-8".into()))?;
    let inner_blob = extract_encrypted_block(&first_text)?;

    let second = decrypt_layer(
        &inner_blob,
        blinded,
        subcredential,
        outer.revision,
        ENC_CONST,
    )?;
    let second_text = String::from_utf8(second)
        .map_err(|_| TorError::InvalidDescriptor("second layer is not UTF-8".into()))?;

    let intro_points = parse_intro_points(&second_text)?;
    if intro_points.is_empty() {
        return Err(TorError::InvalidDescriptor(
            "descriptor lists no introduction points".into(),
        ));
    }

    Ok(HsDescriptor {
        lifetime_minutes: outer.lifetime_minutes,
        revision: outer.revision,
        intro_points,
    })
}

struct OuterDescriptor {
    lifetime_minutes: u64,
    revision: u64,
    signing_cert: Vec<u8>,
    superencrypted: Vec<u8>,
    signed_text: String,
    signature: [u8; 64],
}

fn parse_outer(text: &str) -> Result<OuterDescriptor> {
    let mut lifetime_minutes = 180;
    let mut revision = None;
    let mut signing_cert = None;
    let mut superencrypted = None;
    let mut signature = None;

    let mut lines = text.lines().peekable();
    let mut saw_version = false;
    while let Some(line) = lines.next() {
        if let Some(rest) = line.strip_prefix("hs-descriptor ") {
            if rest.trim() != "3" {
                return Err(TorError::InvalidDescriptor(format!(
                    "descriptor version {}",
                    rest.trim()
                )));
            }
            saw_version = true;
        } else if let Some(rest) = line.strip_prefix("descriptor-lifetime ") {
            lifetime_minutes = rest
                .trim()
                .parse()
                .map_err(|_| TorError::InvalidDescriptor("bad descriptor-lifetime".into()))?;
        } else if line == "descriptor-signing-key-cert" {
            signing_cert = Some(read_pem_block(&mut lines, "ED25519 CERT")?);
        } else if let Some(rest) = line.strip_prefix("revision-counter ") {
            revision = Some(
                rest.trim()
                    .parse()
                    .map_err(|_| TorError::InvalidDescriptor("bad revision-counter".into()))?,
            );
        } else if line == "superencrypted" {
            superencrypted = Some(read_pem_block(&mut lines, "MESSAGE")?);
        } else if let Some(rest) = line.strip_prefix("signature ") {
            let decoded = STANDARD_NO_PAD
                .decode(rest.trim())
                .or_else(|_| STANDARD.decode(rest.trim()))
                .map_err(|_| TorError::InvalidDescriptor("bad signature encoding".into()))?;
            let sig: [u8; 64] = decoded
                .try_into()
                .map_err(|_| TorError::InvalidDescriptor("signature length".into()))?;
            signature = Some(sig);
        }
    }

    if !saw_version {
        return Err(TorError::InvalidDescriptor("missing hs-descriptor line".into()));
    }

    let sig_marker = "\nsignature ";
    let sig_pos = text
        .find(sig_marker)
        .ok_or_else(|| TorError::InvalidDescriptor("missing signature line".into()))?;
    let signed_text = text[..sig_pos + sig_marker.len()].to_string();

    Ok(OuterDescriptor {
        lifetime_minutes,
        revision: revision
            .ok_or_else(|| TorError::InvalidDescriptor("missing revision-counter".into()))?,
        signing_cert: signing_cert
            .ok_or_else(|| TorError::InvalidDescriptor("missing signing cert".into()))?,
        superencrypted: superencrypted
            .ok_or_else(|| TorError::InvalidDescriptor("missing superencrypted".into()))?,
        signed_text,
        signature: signature
            .ok_or_else(|| TorError::InvalidDescriptor("missing signature".into()))?,
    })
}

/// Read a `-----BEGIN tag----- ... -----END tag-----` block.
fn read_pem_block<'a, I>(lines: &mut I, tag: &str) -> Result<Vec<u8>>
where
    I: Iterator<Item = &'a str>,
{
    let begin = format!("-----BEGIN {}-----", tag);
    let end = format!("-----END {}-----", tag);

    match lines.next() {
        Some(line) if line.trim() == begin => {}
        other => {
            return Err(TorError::InvalidDescriptor(format!(
                "expected {} block, got {:?}",
                tag, other
            )));
        }
    }

    let mut b64 = String::new();
    for line in lines {
        if line.trim() == end {
            return STANDARD
                .decode(b64.as_bytes())
                .map_err(|_| TorError::InvalidDescriptor(format!("bad base64 in {}", tag)));
        }
        b64.push_str(line.trim());
    }
    Err(TorError::InvalidDescriptor(format!(
        "unterminated {} block",
        tag
    )))
}

/// Decrypt one descriptor layer: SALT | ENCRYPTED | MAC.
fn decrypt_layer(
    blob: &[u8],
    blinded: &[u8; 32],
    subcredential: &[u8; 32],
    revision: u64,
    personalization: &[u8],
) -> Result<Vec<u8>> {
    if blob.len() <= SALT_LEN + MAC_LEN {
        return Err(TorError::InvalidDescriptor("encrypted layer too short".into()));
    }
    let salt = &blob[..SALT_LEN];
    let encrypted = &blob[SALT_LEN..blob.len() - MAC_LEN];
    let mac = &blob[blob.len() - MAC_LEN..];

    // keys = SHAKE-256(blinded | subcred | INT_8(revision) | salt | const)
    let mut kdf = Shake256::default();
    kdf.update(blinded);
    kdf.update(subcredential);
    kdf.update(&revision.to_be_bytes());
    kdf.update(salt);
    kdf.update(personalization);
    let mut keys = [0u8; 32 + 16 + 32];
    kdf.finalize_xof().read(&mut keys);

    let (enc_key, rest) = keys.split_at(32);
    let (iv, mac_key) = rest.split_at(16);

    let expected_mac = layer_mac(mac_key, salt, encrypted);
    let mac_ok: bool = expected_mac.as_slice().ct_eq(mac).into();
    if !mac_ok {
        return Err(TorError::InvalidDescriptor("layer MAC mismatch".into()));
    }

    let mut plaintext = encrypted.to_vec();
    let enc_key: [u8; 32] = enc_key.try_into().expect("split is 32 bytes");
    let iv: [u8; 16] = iv.try_into().expect("split is 16 bytes");
    let mut cipher = Aes256Ctr::new(&enc_key.into(), &iv.into());
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

/// `MAC = H(INT_8(len(mac_key)) | mac_key | INT_8(len(salt)) | salt | encrypted)`
fn layer_mac(mac_key: &[u8], salt: &[u8], encrypted: &[u8]) -> [u8; 32] {
    let mut input =
        Vec::with_capacity(8 + mac_key.len() + 8 + salt.len() + encrypted.len());
    input.extend_from_slice(&(mac_key.len() as u64).to_be_bytes());
    input.extend_from_slice(mac_key);
    input.extend_from_slice(&(salt.len() as u64).to_be_bytes());
    input.extend_from_slice(salt);
    input.extend_from_slice(encrypted);
    sha3_256(&input)
}

/// Pull the `encrypted` MESSAGE block out of the first-layer plaintext.
fn extract_encrypted_block(text: &str) -> Result<Vec<u8>> {
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        if line.trim() == "encrypted" {
            return read_pem_block(&mut lines, "MESSAGE");
        }
    }
    Err(TorError::InvalidDescriptor(
        "first layer lacks an encrypted block".into(),
    ))
}

/// Parse the innermost plaintext into introduction points.
fn parse_intro_points(text: &str) -> Result<Vec<IntroPoint>> {
    struct Partial {
        link_specifiers: Vec<LinkSpec>,
        onion_key: Option<[u8; 32]>,
        auth_key: Option<[u8; 32]>,
        enc_key: Option<[u8; 32]>,
    }

    fn finish(partial: Partial) -> Result<IntroPoint> {
        Ok(IntroPoint {
            link_specifiers: partial.link_specifiers,
            onion_key: partial
                .onion_key
                .ok_or_else(|| TorError::InvalidDescriptor("intro point lacks onion key".into()))?,
            auth_key: partial
                .auth_key
                .ok_or_else(|| TorError::InvalidDescriptor("intro point lacks auth key".into()))?,
            enc_key: partial
                .enc_key
                .ok_or_else(|| TorError::InvalidDescriptor("intro point lacks enc key".into()))?,
        })
    }

    let mut points = Vec::new();
    let mut current: Option<Partial> = None;

    let mut lines = text.lines().peekable();
    while let Some(line) = lines.next() {
        if let Some(rest) = line.strip_prefix("introduction-point ") {
            if let Some(partial) = current.take() {
                points.push(finish(partial)?);
            }
            let blob = STANDARD
                .decode(rest.trim())
                .or_else(|_| STANDARD_NO_PAD.decode(rest.trim()))
                .map_err(|_| {
                    TorError::InvalidDescriptor("bad link specifier encoding".into())
                })?;
            current = Some(Partial {
                link_specifiers: LinkSpec::parse_list(&blob)?,
                onion_key: None,
                auth_key: None,
                enc_key: None,
            });
        } else if let Some(rest) = line.strip_prefix("onion-key ntor ") {
            if let Some(ref mut partial) = current {
                partial.onion_key = Some(decode_key32(rest)?);
            }
        } else if line == "auth-key" {
            let cert_bytes = read_pem_block(&mut lines, "ED25519 CERT")?;
            let cert = Ed25519Cert::parse(&cert_bytes)?;
            if cert.cert_type != CERT_TYPE_INTRO_AUTH {
                return Err(TorError::InvalidDescriptor(format!(
                    "auth-key cert has type {:#04x}",
                    cert.cert_type
                )));
            }
            if let Some(ref mut partial) = current {
                partial.auth_key = Some(cert.certified_key);
            }
        } else if let Some(rest) = line.strip_prefix("enc-key ntor ") {
            if let Some(ref mut partial) = current {
                partial.enc_key = Some(decode_key32(rest)?);
            }
        } else if line == "enc-key-cert" {
            // Present in the wild; consumed but unused here.
            let _ = read_pem_block(&mut lines, "ED25519 CERT")?;
        }
    }

    if let Some(partial) = current.take() {
        points.push(finish(partial)?);
    }
    Ok(points)
}

fn decode_key32(field: &str) -> Result<[u8; 32]> {
    let decoded = STANDARD
        .decode(field.trim())
        .or_else(|_| STANDARD_NO_PAD.decode(field.trim()))
        .map_err(|_| TorError::InvalidDescriptor("bad key encoding".into()))?;
    decoded
        .try_into()
        .map_err(|_| TorError::InvalidDescriptor("key is not 32 bytes".into()))
}

#[cfg(test)]
pub(crate) mod testvec {
    //! Construction helpers mirroring the service side, for tests.

    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    pub fn encode_cert(
        cert_type: u8,
        certified_key: &[u8; 32],
        issuer: &SigningKey,
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(0x01);
        body.push(cert_type);
        body.extend_from_slice(&0x0049_5f00u32.to_be_bytes());
        body.push(0x01);
        body.extend_from_slice(certified_key);
        body.push(1); // one extension: signed-with-ed25519-key
        body.extend_from_slice(&32u16.to_be_bytes());
        body.push(0x04);
        body.push(0x00);
        body.extend_from_slice(issuer.verifying_key().as_bytes());

        let mut message = Vec::new();
        message.extend_from_slice(CERT_PREFIX);
        message.extend_from_slice(&body);
        let signature = issuer.sign(&message);
        body.extend_from_slice(&signature.to_bytes());
        body
    }

    pub fn encrypt_layer(
        plaintext: &[u8],
        blinded: &[u8; 32],
        subcredential: &[u8; 32],
        revision: u64,
        personalization: &[u8],
        salt: [u8; SALT_LEN],
    ) -> Vec<u8> {
        let mut kdf = Shake256::default();
        kdf.update(blinded);
        kdf.update(subcredential);
        kdf.update(&revision.to_be_bytes());
        kdf.update(&salt);
        kdf.update(personalization);
        let mut keys = [0u8; 32 + 16 + 32];
        kdf.finalize_xof().read(&mut keys);

        let (enc_key, rest) = keys.split_at(32);
        let (iv, mac_key) = rest.split_at(16);

        let mut encrypted = plaintext.to_vec();
        let enc_key: [u8; 32] = enc_key.try_into().unwrap();
        let iv: [u8; 16] = iv.try_into().unwrap();
        let mut cipher = Aes256Ctr::new(&enc_key.into(), &iv.into());
        cipher.apply_keystream(&mut encrypted);

        let mac = layer_mac(mac_key, &salt, &encrypted);

        let mut blob = Vec::with_capacity(SALT_LEN + encrypted.len() + MAC_LEN);
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&encrypted);
        blob.extend_from_slice(&mac);
        blob
    }

    pub fn pem(tag: &str, data: &[u8]) -> String {
        let b64 = STANDARD.encode(data);
        let mut out = format!("-----BEGIN {}-----\n", tag);
        for chunk in b64.as_bytes().chunks(64) {
            out.push_str(std::str::from_utf8(chunk).unwrap());
            out.push('\n');
        }
        out.push_str(&format!("-----END {}-----", tag));
        out
    }

    pub fn encode_link_specs(addr: Ipv4Addr, port: u16, legacy: &[u8; 20]) -> Vec<u8> {
        let mut blob = vec![2u8];
        blob.push(0x00);
        blob.push(6);
        blob.extend_from_slice(&addr.octets());
        blob.extend_from_slice(&port.to_be_bytes());
        blob.push(0x02);
        blob.push(20);
        blob.extend_from_slice(legacy);
        blob
    }

    /// Build a complete, internally consistent descriptor. Returns the
    /// text plus (blinded_pub, subcredential).
    pub fn build_descriptor(
        revision: u64,
        intro_enc_key: &[u8; 32],
        intro_onion_key: &[u8; 32],
    ) -> (String, [u8; 32], [u8; 32]) {
        use rand::rngs::OsRng;

        let blinded = SigningKey::generate(&mut OsRng);
        let blinded_pub = blinded.verifying_key().to_bytes();
        let signing = SigningKey::generate(&mut OsRng);
        let auth = SigningKey::generate(&mut OsRng);
        let subcred = [0x21u8; 32];

        // Innermost plaintext.
        let auth_cert = encode_cert(
            CERT_TYPE_INTRO_AUTH,
            &auth.verifying_key().to_bytes(),
            &signing,
        );
        let link_specs =
            encode_link_specs("192.0.2.7".parse().unwrap(), 443, &[0x33u8; 20]);
        let inner = format!(
            "create2-formats 2\n\
             introduction-point {}\n\
             onion-key ntor {}\n\
             auth-key\n{}\n\
             enc-key ntor {}\n",
            STANDARD.encode(&link_specs),
            STANDARD.encode(intro_onion_key),
            pem("ED25519 CERT", &auth_cert),
            STANDARD.encode(intro_enc_key),
        );

        let second_layer = encrypt_layer(
            inner.as_bytes(),
            &blinded_pub,
            &subcred,
            revision,
            ENC_CONST,
            [0x55u8; SALT_LEN],
        );
        let first = format!(
            "desc-auth-type x25519\n\
             desc-auth-ephemeral-key {}\n\
             encrypted\n{}\n",
            STANDARD.encode([0x66u8; 32]),
            pem("MESSAGE", &second_layer),
        );
        let superencrypted = encrypt_layer(
            first.as_bytes(),
            &blinded_pub,
            &subcred,
            revision,
            SUPERENC_CONST,
            [0x77u8; SALT_LEN],
        );

        let signing_cert = encode_cert(
            CERT_TYPE_HS_DESC_SIGNING,
            &signing.verifying_key().to_bytes(),
            &blinded,
        );

        let body = format!(
            "hs-descriptor 3\n\
             descriptor-lifetime 180\n\
             descriptor-signing-key-cert\n{}\n\
             revision-counter {}\n\
             superencrypted\n{}\n\
             signature ",
            pem("ED25519 CERT", &signing_cert),
            revision,
            pem("MESSAGE", &superencrypted),
        );

        let mut message = Vec::new();
        message.extend_from_slice(SIG_PREFIX);
        message.extend_from_slice(body.as_bytes());
        let signature = ed25519_dalek::Signer::sign(&signing, &message);
        let text = format!(
            "{}{}\n",
            body,
            STANDARD_NO_PAD.encode(signature.to_bytes())
        );

        (text, blinded_pub, subcred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_descriptor_roundtrip() {
        let enc_key = [0x11u8; 32];
        let onion_key = [0x12u8; 32];
        let (text, blinded, subcred) = testvec::build_descriptor(7, &enc_key, &onion_key);

        let descriptor = parse_and_verify(&text, &blinded, &subcred).unwrap();
        assert_eq!(descriptor.revision, 7);
        assert_eq!(descriptor.lifetime_minutes, 180);
        assert_eq!(descriptor.intro_points.len(), 1);

        let intro = &descriptor.intro_points[0];
        assert_eq!(intro.enc_key, enc_key);
        assert_eq!(intro.onion_key, onion_key);
        assert_eq!(
            intro.ipv4_endpoint(),
            Some(("192.0.2.7".parse().unwrap(), 443))
        );
        assert_eq!(intro.legacy_id(), Some([0x33u8; 20]));
    }

    #[test]
    fn test_wrong_blinded_key_rejected() {
        let (text, _blinded, subcred) =
            testvec::build_descriptor(7, &[0x11u8; 32], &[0x12u8; 32]);
        let err = parse_and_verify(&text, &[0xABu8; 32], &subcred).unwrap_err();
        assert!(matches!(err, TorError::InvalidDescriptor(_)));
    }

    #[test]
    fn test_wrong_subcredential_rejected() {
        let (text, blinded, _subcred) =
            testvec::build_descriptor(7, &[0x11u8; 32], &[0x12u8; 32]);
        let err = parse_and_verify(&text, &blinded, &[0xCDu8; 32]).unwrap_err();
        assert!(matches!(err, TorError::InvalidDescriptor(_)));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let (text, blinded, subcred) =
            testvec::build_descriptor(7, &[0x11u8; 32], &[0x12u8; 32]);
        let tampered = text.replace("descriptor-lifetime 180", "descriptor-lifetime 181");
        let err = parse_and_verify(&tampered, &blinded, &subcred).unwrap_err();
        assert!(matches!(err, TorError::InvalidDescriptor(_)));
    }

    #[test]
    fn test_link_spec_parse() {
        let blob = testvec::encode_link_specs("10.1.2.3".parse().unwrap(), 9001, &[9u8; 20]);
        let specs = LinkSpec::parse_list(&blob).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(
            specs[0],
            LinkSpec::Ipv4("10.1.2.3".parse().unwrap(), 9001)
        );
        assert_eq!(specs[1], LinkSpec::LegacyId([9u8; 20]));
    }

    #[test]
    fn test_truncated_cert_rejected() {
        assert!(Ed25519Cert::parse(&[0x01, 0x08, 0, 0]).is_err());
    }

    #[test]
    fn test_garbage_descriptor_rejected() {
        let err = parse_and_verify("not a descriptor", &[0u8; 32], &[0u8; 32]).unwrap_err();
        assert!(matches!(err, TorError::InvalidDescriptor(_)));
    }
}
