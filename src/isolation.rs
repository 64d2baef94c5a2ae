//! Stream isolation
//!
//! Two SOCKS requests may share a circuit only when their isolation keys
//! are equal. A key is assembled from the request according to the
//! configured policy; its recognized components are the destination
//! host, destination port, a SHA-256 hash of the SOCKS credentials, the
//! client's source port, and an explicit session token.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Base isolation policy level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// All requests may share circuits
    None,
    /// Isolate by destination host
    #[default]
    Destination,
    /// Isolate by SOCKS credentials
    Credential,
    /// Isolate by destination port
    Port,
    /// Isolate by session token
    Session,
    /// Isolate by client source port
    Client,
}

/// Full isolation policy: a base level plus additive flags.
#[derive(Debug, Clone, Default)]
pub struct IsolationPolicy {
    pub level: IsolationLevel,
    pub isolate_destination: bool,
    pub isolate_socks_auth: bool,
    pub isolate_client_port: bool,
}

/// The request attributes isolation can see.
#[derive(Debug, Clone, Default)]
pub struct RequestAttrs<'a> {
    pub host: &'a str,
    pub port: u16,
    pub credentials: Option<(&'a [u8], &'a [u8])>,
    pub client_port: u16,
    pub session: Option<&'a str>,
}

/// Equivalence class of requests that may share a circuit.
///
/// Declared components compare by value; two keys are equal iff all
/// their components are equal, which makes equality symmetric by
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct IsolationKey {
    destination: Option<String>,
    port: Option<u16>,
    credential: Option<[u8; 32]>,
    client_port: Option<u16>,
    session: Option<String>,
}

impl IsolationKey {
    /// The shared key under which every request is equivalent.
    pub fn any() -> Self {
        Self::default()
    }
}

impl IsolationPolicy {
    /// Derive the isolation key for one request.
    pub fn key_for(&self, attrs: &RequestAttrs<'_>) -> IsolationKey {
        let mut key = IsolationKey::default();

        match self.level {
            IsolationLevel::None => {}
            IsolationLevel::Destination => {
                key.destination = Some(normalize_host(attrs.host));
            }
            IsolationLevel::Credential => {
                key.credential = Some(hash_credentials(attrs.credentials));
            }
            IsolationLevel::Port => {
                key.port = Some(attrs.port);
            }
            IsolationLevel::Session => {
                key.session = attrs.session.map(str::to_owned);
            }
            IsolationLevel::Client => {
                key.client_port = Some(attrs.client_port);
            }
        }

        if self.isolate_destination {
            key.destination = Some(normalize_host(attrs.host));
        }
        if self.isolate_socks_auth {
            key.credential = Some(hash_credentials(attrs.credentials));
        }
        if self.isolate_client_port {
            key.client_port = Some(attrs.client_port);
        }

        key
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Credentials are never kept in the key; only their SHA-256 is.
fn hash_credentials(credentials: Option<(&[u8], &[u8])>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    if let Some((username, password)) = credentials {
        hasher.update((username.len() as u32).to_be_bytes());
        hasher.update(username);
        hasher.update(password);
    }
    hasher.finalize().into()
}
