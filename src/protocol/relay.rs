//! Relay records from the network consensus

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// A relay as described by the directory consensus, merged with the
/// key material from its server descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relay {
    /// Relay nickname
    pub nickname: String,

    /// Identity fingerprint: 40 hex chars (SHA-1 of the identity key)
    pub fingerprint: String,

    /// IPv4 address
    pub address: IpAddr,

    /// OR port
    pub or_port: u16,

    /// Directory port, if the relay serves directory requests
    pub dir_port: Option<u16>,

    /// Consensus flags
    pub flags: RelayFlags,

    /// Publication time (Unix seconds)
    pub published: u64,

    /// Ed25519 identity key (from the server descriptor)
    pub identity_ed25519: Option<[u8; 32]>,

    /// Curve25519 ntor onion key (from the server descriptor)
    pub ntor_onion_key: Option<[u8; 32]>,

    /// Consensus bandwidth weight (KB/s)
    pub bandwidth: u64,

    /// Exit policy port summary from the consensus `p` line
    pub exit_policy: Option<ExitPolicySummary>,
}

impl Relay {
    /// OR socket address
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.or_port)
    }

    /// Identity fingerprint as raw bytes.
    pub fn fingerprint_bytes(&self) -> Option<[u8; 20]> {
        let decoded = hex::decode(&self.fingerprint).ok()?;
        decoded.try_into().ok()
    }

    /// Usable at all: carries Running and Valid.
    pub fn is_usable(&self) -> bool {
        self.flags.running && self.flags.valid
    }

    /// Eligible for the guard position.
    pub fn is_guard_eligible(&self) -> bool {
        self.is_usable() && self.flags.guard && self.flags.stable
    }

    /// Eligible for the exit position.
    pub fn is_exit_eligible(&self) -> bool {
        self.is_usable() && self.flags.exit && !self.flags.bad_exit
    }

    /// Authorized to store hidden-service descriptors.
    pub fn is_hsdir(&self) -> bool {
        self.is_usable() && self.flags.hsdir
    }

    /// Whether this relay's exit policy permits connections to `port`.
    ///
    /// Relays without a published summary are assumed permissive.
    pub fn allows_exit_port(&self, port: u16) -> bool {
        match &self.exit_policy {
            Some(policy) => policy.allows_port(port),
            None => true,
        }
    }
}

/// Consensus flag set (`s` line)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayFlags {
    pub authority: bool,
    pub bad_exit: bool,
    pub exit: bool,
    pub fast: bool,
    pub guard: bool,
    pub hsdir: bool,
    pub running: bool,
    pub stable: bool,
    pub v2dir: bool,
    pub valid: bool,
}

impl RelayFlags {
    /// Parse a space-separated flag list.
    pub fn from_string(flags: &str) -> Self {
        let mut out = Self::default();
        for flag in flags.split_whitespace() {
            match flag {
                "Authority" => out.authority = true,
                "BadExit" => out.bad_exit = true,
                "Exit" => out.exit = true,
                "Fast" => out.fast = true,
                "Guard" => out.guard = true,
                "HSDir" => out.hsdir = true,
                "Running" => out.running = true,
                "Stable" => out.stable = true,
                "V2Dir" => out.v2dir = true,
                "Valid" => out.valid = true,
                _ => {}
            }
        }
        out
    }
}

/// Exit policy summary from a consensus `p` line, e.g.
/// `p accept 80,443,8000-8999`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitPolicySummary {
    /// True for an accept-list, false for a reject-list
    pub accept: bool,

    /// Inclusive port ranges
    pub ranges: Vec<(u16, u16)>,
}

impl ExitPolicySummary {
    /// Parse the `accept`/`reject` keyword plus port list.
    pub fn parse(keyword: &str, ports: &str) -> Option<Self> {
        let accept = match keyword {
            "accept" => true,
            "reject" => false,
            _ => return None,
        };

        let mut ranges = Vec::new();
        for part in ports.split(',') {
            if let Some((lo, hi)) = part.split_once('-') {
                let lo: u16 = lo.parse().ok()?;
                let hi: u16 = hi.parse().ok()?;
                if lo > hi {
                    return None;
                }
                ranges.push((lo, hi));
            } else {
                let port: u16 = part.parse().ok()?;
                ranges.push((port, port));
            }
        }

        Some(Self { accept, ranges })
    }

    /// Whether the summary permits `port`.
    pub fn allows_port(&self, port: u16) -> bool {
        let listed = self.ranges.iter().any(|&(lo, hi)| port >= lo && port <= hi);
        if self.accept {
            listed
        } else {
            !listed
        }
    }
}
