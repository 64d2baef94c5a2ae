//! Consensus and descriptor parsing
//!
//! Line-oriented parser for the network-status consensus and for server
//! descriptors. The consensus gives us the relay list and flags; server
//! descriptors supply the ntor onion keys and Ed25519 identities that the
//! unflavored consensus does not carry.
//!
//! Parse strictness: above 10% malformed `r` lines the document is
//! rejected as corrupt; above 20% port parse errors we log a warning but
//! keep going. Metadata timestamps are validated with a 30-minute skew
//! allowance. Signature validation is a counting placeholder: minimum
//! claimed authority and signature counts are enforced, but no
//! cryptographic quorum check is performed against a pinned authority set.

use crate::error::{Result, TorError};
use crate::protocol::relay::{ExitPolicySummary, Relay, RelayFlags};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Reject the document when more than this fraction of `r` lines fail to parse.
const MAX_MALFORMED_FRACTION: f64 = 0.10;

/// Warn when more than this fraction of records have port parse errors.
const MAX_PORT_ERROR_FRACTION: f64 = 0.20;

/// Accepted clock skew for consensus validity timestamps.
const TIMESTAMP_SKEW_SECS: u64 = 30 * 60;

/// Minimum number of claimed signing authorities.
pub const MIN_AUTHORITIES: usize = 5;

/// Minimum number of claimed directory signatures.
pub const MIN_SIGNATURES: usize = 5;

/// Parsed consensus document
#[derive(Debug, Clone, Default)]
pub struct Consensus {
    /// `valid-after` (Unix seconds), when present
    pub valid_after: Option<u64>,

    /// `fresh-until` (Unix seconds), when present
    pub fresh_until: Option<u64>,

    /// `valid-until` (Unix seconds), when present
    pub valid_until: Option<u64>,

    /// Current shared random value (for the HSDir ring)
    pub shared_rand_current: Option<[u8; 32]>,

    /// Previous shared random value
    pub shared_rand_previous: Option<[u8; 32]>,

    /// All relays in the consensus
    pub relays: Vec<Relay>,

    /// Number of `dir-source` entries claimed by the document
    pub authority_count: usize,

    /// Number of `directory-signature` entries claimed by the document
    pub signature_count: usize,
}

impl Consensus {
    /// Whether the consensus is still within its validity window.
    pub fn is_valid(&self) -> bool {
        match self.valid_until {
            Some(until) => now_secs() < until + TIMESTAMP_SKEW_SECS,
            None => true,
        }
    }

    /// Relays that are usable at all (Running + Valid).
    pub fn usable_relays(&self) -> impl Iterator<Item = &Relay> {
        self.relays.iter().filter(|r| r.is_usable())
    }

    /// Look up a relay by its 40-hex fingerprint.
    pub fn relay_by_fingerprint(&self, fingerprint: &str) -> Option<&Relay> {
        self.relays
            .iter()
            .find(|r| r.fingerprint.eq_ignore_ascii_case(fingerprint))
    }
}

/// Key material extracted from one server descriptor.
#[derive(Debug, Clone, Default)]
pub struct DescriptorKeys {
    /// Curve25519 ntor onion key
    pub ntor_onion_key: Option<[u8; 32]>,

    /// Ed25519 master identity key
    pub identity_ed25519: Option<[u8; 32]>,
}

/// Consensus parser
pub struct ConsensusParser;

impl ConsensusParser {
    /// Parse a consensus document.
    pub fn parse(data: &[u8]) -> Result<Consensus> {
        let text = std::str::from_utf8(data)
            .map_err(|e| TorError::CorruptConsensus(format!("not UTF-8: {}", e)))?;
        Self::parse_text(text)
    }

    /// Parse consensus from text.
    pub fn parse_text(text: &str) -> Result<Consensus> {
        let mut consensus = Consensus::default();
        let mut current: Option<Relay> = None;

        let mut r_lines = 0usize;
        let mut malformed = 0usize;
        let mut port_errors = 0usize;

        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix("valid-after ") {
                consensus.valid_after = parse_datetime(rest);
            } else if let Some(rest) = line.strip_prefix("fresh-until ") {
                consensus.fresh_until = parse_datetime(rest);
            } else if let Some(rest) = line.strip_prefix("valid-until ") {
                consensus.valid_until = parse_datetime(rest);
            } else if let Some(rest) = line.strip_prefix("shared-rand-current-value ") {
                consensus.shared_rand_current = parse_shared_rand(rest);
            } else if let Some(rest) = line.strip_prefix("shared-rand-previous-value ") {
                consensus.shared_rand_previous = parse_shared_rand(rest);
            } else if line.starts_with("dir-source ") {
                consensus.authority_count += 1;
            } else if line.starts_with("directory-signature") {
                consensus.signature_count += 1;
            } else if line.starts_with("r ") {
                if let Some(relay) = current.take() {
                    consensus.relays.push(relay);
                }
                r_lines += 1;
                match Self::parse_r_line(line) {
                    Ok(relay) => current = Some(relay),
                    Err(RLineError::Port) => {
                        port_errors += 1;
                    }
                    Err(RLineError::Malformed(why)) => {
                        log::debug!("skipping malformed r line: {}", why);
                        malformed += 1;
                    }
                }
            } else if let Some(rest) = line.strip_prefix("s ") {
                if let Some(ref mut relay) = current {
                    relay.flags = RelayFlags::from_string(rest);
                }
            } else if let Some(rest) = line.strip_prefix("w ") {
                if let Some(ref mut relay) = current {
                    if let Some(bw) = parse_bandwidth(rest) {
                        relay.bandwidth = bw;
                    }
                }
            } else if let Some(rest) = line.strip_prefix("p ") {
                if let Some(ref mut relay) = current {
                    if let Some((keyword, ports)) = rest.split_once(' ') {
                        relay.exit_policy = ExitPolicySummary::parse(keyword, ports);
                    }
                }
            }
        }

        if let Some(relay) = current.take() {
            consensus.relays.push(relay);
        }

        Self::check_thresholds(r_lines, malformed, port_errors)?;
        Self::check_metadata(&consensus)?;

        Ok(consensus)
    }

    fn check_thresholds(r_lines: usize, malformed: usize, port_errors: usize) -> Result<()> {
        if r_lines == 0 {
            return Err(TorError::CorruptConsensus("no relay entries".into()));
        }

        let malformed_fraction = malformed as f64 / r_lines as f64;
        if malformed_fraction > MAX_MALFORMED_FRACTION {
            return Err(TorError::CorruptConsensus(format!(
                "{} of {} relay lines malformed",
                malformed, r_lines
            )));
        }

        let port_fraction = port_errors as f64 / r_lines as f64;
        if port_fraction > MAX_PORT_ERROR_FRACTION {
            log::warn!(
                "consensus has {} of {} relay lines with unparseable ports",
                port_errors,
                r_lines
            );
        }

        Ok(())
    }

    fn check_metadata(consensus: &Consensus) -> Result<()> {
        let now = now_secs();

        if let Some(valid_after) = consensus.valid_after {
            if valid_after > now + TIMESTAMP_SKEW_SECS {
                return Err(TorError::CorruptConsensus(
                    "valid-after is too far in the future".into(),
                ));
            }
        }
        if let Some(valid_until) = consensus.valid_until {
            if valid_until + TIMESTAMP_SKEW_SECS < now {
                return Err(TorError::CorruptConsensus("consensus has expired".into()));
            }
        }

        // Placeholder threshold check: the claimed counts must meet the
        // minimums, but no signature is cryptographically verified here.
        if consensus.authority_count > 0 && consensus.authority_count < MIN_AUTHORITIES {
            return Err(TorError::CorruptConsensus(format!(
                "only {} authorities listed",
                consensus.authority_count
            )));
        }
        if consensus.signature_count > 0 && consensus.signature_count < MIN_SIGNATURES {
            return Err(TorError::CorruptConsensus(format!(
                "only {} signatures listed",
                consensus.signature_count
            )));
        }

        Ok(())
    }

    /// Parse an `r` line.
    ///
    /// Canonical form:
    /// `r nickname identity digest date time IP ORPort DirPort`.
    /// The address and ports are taken from the line's tail so documents
    /// with or without the descriptor-digest field both parse.
    fn parse_r_line(line: &str) -> std::result::Result<Relay, RLineError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 6 {
            return Err(RLineError::Malformed("too few fields".into()));
        }

        let nickname = parts[1].to_string();
        if nickname.is_empty() {
            return Err(RLineError::Malformed("empty nickname".into()));
        }

        let fingerprint = decode_fingerprint(parts[2])
            .ok_or_else(|| RLineError::Malformed(format!("bad identity {}", parts[2])))?;

        let tail = &parts[parts.len() - 3..];
        let address: IpAddr = tail[0]
            .parse()
            .map_err(|_| RLineError::Malformed(format!("bad address {}", tail[0])))?;

        let or_port: u16 = tail[1].parse().map_err(|_| RLineError::Port)?;
        let dir_port: u16 = tail[2].parse().map_err(|_| RLineError::Port)?;

        // Publication "date time" pair, if the line carries one.
        let mut published = 0;
        for window in parts[3..parts.len() - 3].windows(2) {
            if let Some(ts) = parse_datetime(&format!("{} {}", window[0], window[1])) {
                published = ts;
                break;
            }
        }

        Ok(Relay {
            nickname,
            fingerprint,
            address,
            or_port,
            dir_port: if dir_port == 0 { None } else { Some(dir_port) },
            flags: RelayFlags::default(),
            published,
            identity_ed25519: None,
            ntor_onion_key: None,
            bandwidth: 0,
            exit_policy: None,
        })
    }
}

enum RLineError {
    Malformed(String),
    Port,
}

/// Parse a concatenation of server descriptors (`/tor/server/all`) and
/// return per-relay key material keyed by 40-hex fingerprint.
pub fn parse_server_descriptors(text: &str) -> HashMap<String, DescriptorKeys> {
    let mut out = HashMap::new();
    let mut current_fp: Option<String> = None;
    let mut current = DescriptorKeys::default();

    let mut commit =
        |fp: &mut Option<String>, keys: &mut DescriptorKeys, map: &mut HashMap<_, _>| {
            if let Some(fp) = fp.take() {
                map.insert(fp, std::mem::take(keys));
            }
        };

    for line in text.lines() {
        let line = line.trim_end();

        if line.starts_with("router ") {
            commit(&mut current_fp, &mut current, &mut out);
        } else if let Some(rest) = line.strip_prefix("fingerprint ") {
            let fp: String = rest.split_whitespace().collect::<Vec<_>>().concat();
            if fp.len() == 40 {
                current_fp = Some(fp.to_uppercase());
            }
        } else if let Some(rest) = line.strip_prefix("ntor-onion-key ") {
            current.ntor_onion_key = decode_key32(rest);
        } else if let Some(rest) = line.strip_prefix("master-key-ed25519 ") {
            current.identity_ed25519 = decode_key32(rest);
        }
    }
    commit(&mut current_fp, &mut current, &mut out);

    out
}

/// Merge descriptor key material into consensus relay records.
pub fn merge_descriptor_keys(consensus: &mut Consensus, keys: &HashMap<String, DescriptorKeys>) {
    let mut merged = 0usize;
    for relay in &mut consensus.relays {
        if let Some(desc) = keys.get(&relay.fingerprint) {
            if desc.ntor_onion_key.is_some() {
                relay.ntor_onion_key = desc.ntor_onion_key;
            }
            if desc.identity_ed25519.is_some() {
                relay.identity_ed25519 = desc.identity_ed25519;
            }
            merged += 1;
        }
    }
    log::debug!(
        "merged descriptor keys into {} of {} relays",
        merged,
        consensus.relays.len()
    );
}

/// Decode a consensus identity field into a 40-hex fingerprint.
///
/// The consensus encodes it as unpadded base64 of the 20-byte SHA-1;
/// already-hex input is accepted as-is.
fn decode_fingerprint(field: &str) -> Option<String> {
    if field.len() == 40 && field.chars().all(|c| c.is_ascii_hexdigit()) {
        return Some(field.to_uppercase());
    }
    let decoded = STANDARD_NO_PAD
        .decode(field)
        .or_else(|_| STANDARD.decode(field))
        .ok()?;
    if decoded.len() != 20 {
        return None;
    }
    Some(hex::encode_upper(decoded))
}

fn decode_key32(field: &str) -> Option<[u8; 32]> {
    let decoded = STANDARD_NO_PAD
        .decode(field.trim())
        .or_else(|_| STANDARD.decode(field.trim()))
        .ok()?;
    decoded.try_into().ok()
}

fn parse_shared_rand(rest: &str) -> Option<[u8; 32]> {
    // Format: `<num-reveals> <value-b64>`
    let value = rest.split_whitespace().nth(1)?;
    decode_key32(value)
}

fn parse_bandwidth(rest: &str) -> Option<u64> {
    for part in rest.split_whitespace() {
        if let Some(bw) = part.strip_prefix("Bandwidth=") {
            return bw.parse().ok();
        }
    }
    None
}

/// Parse a `YYYY-MM-DD HH:MM:SS` consensus timestamp into Unix seconds.
fn parse_datetime(field: &str) -> Option<u64> {
    let mut parts = field.split_whitespace();
    let date = parts.next()?;
    let time = parts.next()?;
    if date.len() != 10 || time.len() != 8 {
        return None;
    }
    let rfc3339 = format!("{}T{}Z", date, time);
    let ts = humantime::parse_rfc3339(&rfc3339).ok()?;
    ts.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
