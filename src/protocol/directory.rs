//! Directory client
//!
//! Fetches the network consensus (and the server descriptors that carry
//! ntor keys) over plain HTTP/1.0 from a hard-coded list of fallback
//! directory authorities, trying each in turn until one succeeds.

use crate::error::{Result, TorError};
use crate::protocol::consensus::{
    merge_descriptor_keys, parse_server_descriptors, Consensus, ConsensusParser,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Fallback directory authorities (name, dirport address).
pub const DIRECTORY_AUTHORITIES: &[(&str, &str)] = &[
    ("moria1", "128.31.0.34:9131"),
    ("tor26", "217.196.147.77:80"),
    ("dizum", "45.66.35.11:80"),
    ("gabelmoo", "131.188.40.189:80"),
    ("dannenberg", "193.23.244.244:80"),
    ("maatuska", "171.25.193.9:443"),
    ("longclaw", "199.58.81.140:80"),
    ("bastet", "204.13.164.118:80"),
    ("faravahar", "216.218.219.41:80"),
];

/// Consensus document path
const CONSENSUS_PATH: &str = "/tor/status-vote/current/consensus";

/// All server descriptors path
const DESCRIPTORS_PATH: &str = "/tor/server/all";

/// Ceiling on a directory response body
const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

/// Fetches and assembles directory information.
pub struct DirectoryClient {
    /// Per-authority fetch deadline
    timeout: Duration,
}

impl DirectoryClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Fetch and parse the current consensus, with descriptor keys merged
    /// in. Iterates the fallback authorities; fails with `NoDirectory`
    /// only when every authority has failed.
    pub async fn fetch_consensus(&self) -> Result<Consensus> {
        for (name, addr) in DIRECTORY_AUTHORITIES {
            match self.fetch_from(name, addr).await {
                Ok(consensus) => {
                    log::info!(
                        "fetched consensus from {} ({} relays)",
                        name,
                        consensus.relays.len()
                    );
                    return Ok(consensus);
                }
                Err(e) => {
                    log::warn!("authority {} failed: {}", name, e);
                }
            }
        }
        Err(TorError::NoDirectory)
    }

    async fn fetch_from(&self, name: &str, addr: &str) -> Result<Consensus> {
        let body = self.http_get(addr, CONSENSUS_PATH).await?;
        let mut consensus = ConsensusParser::parse(&body)?;

        // The unflavored consensus has no ntor keys; pull the server
        // descriptors from the same authority. A failure here degrades
        // the relay set but is not fatal to the fetch.
        match self.http_get(addr, DESCRIPTORS_PATH).await {
            Ok(descriptors) => match std::str::from_utf8(&descriptors) {
                Ok(text) => {
                    let keys = parse_server_descriptors(text);
                    merge_descriptor_keys(&mut consensus, &keys);
                }
                Err(e) => log::warn!("descriptors from {} not UTF-8: {}", name, e),
            },
            Err(e) => log::warn!("descriptor fetch from {} failed: {}", name, e),
        }

        let with_keys = consensus
            .relays
            .iter()
            .filter(|r| r.ntor_onion_key.is_some())
            .count();
        log::debug!(
            "{} of {} relays carry ntor keys",
            with_keys,
            consensus.relays.len()
        );

        Ok(consensus)
    }

    /// Plain HTTP/1.0 GET, returning the response body.
    async fn http_get(&self, addr: &str, path: &str) -> Result<Vec<u8>> {
        tokio::time::timeout(self.timeout, self.http_get_inner(addr, path))
            .await
            .map_err(|_| TorError::Timeout(format!("directory fetch from {}", addr)))?
    }

    async fn http_get_inner(&self, addr: &str, path: &str) -> Result<Vec<u8>> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TorError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        let host = addr.split(':').next().unwrap_or(addr);
        let request = format!(
            "GET {} HTTP/1.0\r\nHost: {}\r\nUser-Agent: tor-client/0.1.0\r\n\r\n",
            path, host
        );
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let mut response = Vec::new();
        let mut buf = [0u8; 16384];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
            if response.len() > MAX_RESPONSE_BYTES {
                return Err(TorError::Directory(format!(
                    "response from {} exceeds {} bytes",
                    addr, MAX_RESPONSE_BYTES
                )));
            }
        }

        parse_http_response(&response)
    }
}

/// Split an HTTP response into status + body and require a 200.
pub(crate) fn parse_http_response(response: &[u8]) -> Result<Vec<u8>> {
    let header_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| TorError::Directory("response has no header terminator".into()))?;

    let head = std::str::from_utf8(&response[..header_end])
        .map_err(|_| TorError::Directory("response header is not ASCII".into()))?;
    let status_line = head.lines().next().unwrap_or("");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| TorError::Directory(format!("bad status line {:?}", status_line)))?;

    if status != 200 {
        return Err(TorError::Directory(format!("HTTP status {}", status)));
    }

    Ok(response[header_end + 4..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_response_ok() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\nhello body";
        let body = parse_http_response(raw).unwrap();
        assert_eq!(body, b"hello body");
    }

    #[test]
    fn test_parse_http_response_error_status() {
        let raw = b"HTTP/1.0 404 Not Found\r\n\r\n";
        assert!(matches!(
            parse_http_response(raw),
            Err(TorError::Directory(_))
        ));
    }

    #[test]
    fn test_parse_http_response_truncated() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Ty";
        assert!(parse_http_response(raw).is_err());
    }

    #[test]
    fn test_authority_addresses_parse() {
        for (_, addr) in DIRECTORY_AUTHORITIES {
            assert!(addr.parse::<std::net::SocketAddr>().is_ok(), "{}", addr);
        }
    }
}
