//! Link connection to a single relay
//!
//! Manages one TLS session to one onion router: dial, link-protocol
//! version negotiation, NETINFO exchange, and cell transport.
//!
//! The TLS machinery drives a `rustls::ClientConnection` by hand over the
//! TCP socket. Relay certificates are self-signed by design in this
//! protocol; the verifier accepts them without chain validation. Identity
//! pinning against the CERTS cell is deferred: the CERTS payload is
//! retained, and a caller-supplied expected identity is recorded, but no
//! cryptographic check is enforced yet (known gap, kept explicit).
//!
//! Locking: cell sends serialize on one lock, cell receives on another,
//! and the shared TLS state is touched only briefly between socket
//! operations, never across an await point.

use crate::error::{Result, TorError};
use crate::protocol::cell::{Cell, CellCommand, CellFormat};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Link protocol versions we advertise, in ascending order.
pub const SUPPORTED_VERSIONS: [u16; 3] = [3, 4, 5];

/// Lower bound on the caller-supplied handshake deadline.
pub const MIN_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on the caller-supplied handshake deadline.
pub const MAX_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Accepted skew on the peer's NETINFO timestamp before we log about it.
const NETINFO_SKEW: Duration = Duration::from_secs(24 * 60 * 60);

/// Link connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Connecting = 0,
    Handshaking = 1,
    Open = 2,
    Closed = 3,
    Failed = 4,
}

impl LinkState {
    fn from_u8(v: u8) -> LinkState {
        match v {
            0 => LinkState::Connecting,
            1 => LinkState::Handshaking,
            2 => LinkState::Open,
            3 => LinkState::Closed,
            _ => LinkState::Failed,
        }
    }
}

/// Receive half: the socket read side plus a reassembly buffer of
/// decrypted TLS plaintext.
struct RecvHalf {
    io: OwnedReadHalf,
    buf: Vec<u8>,
}

/// A TLS connection to one relay, carrying cells.
pub struct LinkConnection {
    /// TLS session state; locked only between socket operations
    tls: StdMutex<ClientConnection>,

    /// Exclusive send lock over the socket write half
    wr: Mutex<OwnedWriteHalf>,

    /// Exclusive receive lock over the socket read half
    rd: Mutex<RecvHalf>,

    /// Lifecycle state
    state: AtomicU8,

    /// Negotiated link protocol version (0 until VERSIONS completes)
    version: AtomicU16,

    /// Peer address
    peer: SocketAddr,

    /// Raw CERTS cell payload, kept for the deferred identity check
    certs_payload: StdMutex<Option<Vec<u8>>>,

    /// Identity the caller expects this relay to prove (recorded only)
    expected_identity: Option<[u8; 20]>,
}

impl std::fmt::Debug for LinkConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkConnection")
            .field("peer", &self.peer)
            .field("state", &LinkState::from_u8(self.state.load(Ordering::Relaxed)))
            .field("version", &self.version.load(Ordering::Relaxed))
            .finish()
    }
}

impl LinkConnection {
    /// Dial a relay, upgrade to TLS, and run the link handshake.
    ///
    /// `deadline` bounds the whole operation (TCP + TLS + VERSIONS +
    /// NETINFO) and must lie within [5s, 60s].
    pub async fn connect(
        addr: SocketAddr,
        deadline: Duration,
        expected_identity: Option<[u8; 20]>,
    ) -> Result<Arc<Self>> {
        if deadline < MIN_HANDSHAKE_TIMEOUT || deadline > MAX_HANDSHAKE_TIMEOUT {
            return Err(TorError::InvalidConfig(format!(
                "handshake timeout {:?} outside [{:?}, {:?}]",
                deadline, MIN_HANDSHAKE_TIMEOUT, MAX_HANDSHAKE_TIMEOUT
            )));
        }

        tokio::time::timeout(deadline, Self::connect_inner(addr, expected_identity))
            .await
            .map_err(|_| TorError::Timeout(format!("link handshake with {}", addr)))?
    }

    async fn connect_inner(
        addr: SocketAddr,
        expected_identity: Option<[u8; 20]>,
    ) -> Result<Arc<Self>> {
        log::debug!("dialing relay {}", addr);

        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| TorError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        tcp.set_nodelay(true).ok();
        let (rd_io, wr_io) = tcp.into_split();

        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier::AcceptSelfSigned::new()))
            .with_no_client_auth();

        let server_name = ServerName::IpAddress(addr.ip().into());
        let tls = ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| TorError::ConnectionFailed(format!("TLS setup: {}", e)))?;

        let link = Arc::new(Self {
            tls: StdMutex::new(tls),
            wr: Mutex::new(wr_io),
            rd: Mutex::new(RecvHalf {
                io: rd_io,
                buf: Vec::with_capacity(Cell::SIZE_V4 * 4),
            }),
            state: AtomicU8::new(LinkState::Connecting as u8),
            version: AtomicU16::new(0),
            peer: addr,
            certs_payload: StdMutex::new(None),
            expected_identity,
        });

        link.tls_handshake().await?;
        link.state
            .store(LinkState::Handshaking as u8, Ordering::SeqCst);
        link.link_handshake().await?;
        link.state.store(LinkState::Open as u8, Ordering::SeqCst);

        log::info!(
            "link to {} open (link protocol v{})",
            addr,
            link.version.load(Ordering::SeqCst)
        );
        Ok(link)
    }

    /// A link over a fresh loopback socket pair, already in the Open
    /// state with link protocol v4. The returned peer socket must stay
    /// alive or reads on the link observe EOF.
    #[cfg(test)]
    pub(crate) async fn loopback_for_tests() -> (Arc<Self>, TcpStream) {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let (peer, _) = accepted.unwrap();

        let (rd_io, wr_io) = client.into_split();
        let config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier::AcceptSelfSigned::new()))
            .with_no_client_auth();
        let tls =
            ClientConnection::new(Arc::new(config), ServerName::IpAddress(addr.ip().into()))
                .unwrap();

        let link = Arc::new(Self {
            tls: StdMutex::new(tls),
            wr: Mutex::new(wr_io),
            rd: Mutex::new(RecvHalf {
                io: rd_io,
                buf: Vec::new(),
            }),
            state: AtomicU8::new(LinkState::Open as u8),
            version: AtomicU16::new(4),
            peer: addr,
            certs_payload: StdMutex::new(None),
            expected_identity: None,
        });
        (link, peer)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Negotiated link protocol version.
    pub fn version(&self) -> u16 {
        self.version.load(Ordering::SeqCst)
    }

    /// Peer address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The raw CERTS payload received during the handshake, retained for
    /// the deferred identity check.
    pub fn certs_payload(&self) -> Option<Vec<u8>> {
        self.certs_payload
            .lock()
            .expect("certs lock poisoned")
            .clone()
    }

    /// Framing for the current negotiation state.
    pub fn cell_format(&self) -> CellFormat {
        let v = self.version();
        if v == 0 {
            CellFormat::PRE_VERSIONS
        } else {
            CellFormat::for_link_version(v)
        }
    }

    /// Serialize and send a cell under the send lock.
    pub async fn send_cell(&self, cell: &Cell) -> Result<()> {
        if self.state() != LinkState::Open {
            return Err(TorError::NotOpen);
        }
        self.send_cell_raw(cell, self.cell_format()).await
    }

    /// Receive one complete cell under the receive lock.
    ///
    /// Returns `Eof` on a clean peer close at a frame boundary and
    /// `UnexpectedEof` when the stream dies mid-frame.
    pub async fn recv_cell(&self) -> Result<Cell> {
        if self.state() != LinkState::Open {
            return Err(TorError::NotOpen);
        }
        self.recv_cell_raw(self.cell_format()).await
    }

    /// Close the link. Idempotent; subsequent sends/receives fail with
    /// `NotOpen`.
    pub async fn close(&self) {
        let prev = self.state.swap(LinkState::Closed as u8, Ordering::SeqCst);
        if prev == LinkState::Closed as u8 {
            return;
        }

        // Best-effort TLS close_notify.
        let pending = {
            let mut tls = self.tls.lock().expect("tls lock poisoned");
            tls.send_close_notify();
            let mut out = Vec::new();
            while tls.wants_write() {
                if tls.write_tls(&mut out).is_err() {
                    break;
                }
            }
            out
        };
        if !pending.is_empty() {
            let mut wr = self.wr.lock().await;
            let _ = wr.write_all(&pending).await;
            let _ = wr.shutdown().await;
        }
        log::debug!("link to {} closed", self.peer);
    }

    /// Mark the link failed (protocol violation or I/O error).
    pub fn fail(&self) {
        self.state.store(LinkState::Failed as u8, Ordering::SeqCst);
    }

    // ===== handshake =====

    async fn tls_handshake(&self) -> Result<()> {
        loop {
            self.flush_tls_output().await?;
            let handshaking = {
                let tls = self.tls.lock().expect("tls lock poisoned");
                tls.is_handshaking()
            };
            if !handshaking {
                break;
            }
            self.read_tls_once().await?;
        }
        self.flush_tls_output().await?;
        Ok(())
    }

    /// Run the VERSIONS and NETINFO exchange.
    ///
    /// Responder cells observed in the wild arrive as VERSIONS, CERTS,
    /// AUTH_CHALLENGE, NETINFO; we consume them in any order after
    /// VERSIONS and answer with our own NETINFO.
    async fn link_handshake(&self) -> Result<()> {
        // Our VERSIONS, under the 2-byte circ-id framing.
        let mut payload = Vec::with_capacity(SUPPORTED_VERSIONS.len() * 2);
        for v in SUPPORTED_VERSIONS {
            payload.extend_from_slice(&v.to_be_bytes());
        }
        let versions = Cell::new(0, CellCommand::Versions, payload);
        self.send_cell_raw(&versions, CellFormat::PRE_VERSIONS)
            .await?;

        // Peer VERSIONS.
        let peer_versions = self.recv_cell_raw(CellFormat::PRE_VERSIONS).await?;
        if peer_versions.command != CellCommand::Versions {
            return Err(TorError::UnexpectedCell {
                expected: "VERSIONS".into(),
                got: format!("{:?}", peer_versions.command),
            });
        }
        let offered: Vec<u16> = peer_versions
            .payload
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        let selected = negotiate_version(&offered)?;
        self.version.store(selected, Ordering::SeqCst);
        log::debug!("negotiated link protocol v{} with {}", selected, self.peer);

        // Consume responder cells until NETINFO.
        let format = self.cell_format();
        loop {
            let cell = self.recv_cell_raw(format).await?;
            match cell.command {
                CellCommand::Certs => {
                    *self.certs_payload.lock().expect("certs lock poisoned") =
                        Some(cell.payload);
                    if self.expected_identity.is_some() {
                        // Deferred: CERTS retained, pinning not yet enforced.
                        log::warn!(
                            "expected identity set for {}, but CERTS verification \
                             is not implemented; accepting self-signed cert",
                            self.peer
                        );
                    }
                }
                CellCommand::AuthChallenge => {
                    // We never authenticate as a client; ignored.
                }
                CellCommand::Padding | CellCommand::Vpadding => {}
                CellCommand::Netinfo => {
                    self.check_peer_netinfo(&cell.payload);
                    break;
                }
                other => {
                    return Err(TorError::UnexpectedCell {
                        expected: "CERTS/AUTH_CHALLENGE/NETINFO".into(),
                        got: format!("{:?}", other),
                    });
                }
            }
        }

        // Our NETINFO: timestamp, the peer's address, and an empty list of
        // our own addresses.
        let mut netinfo = Vec::new();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        netinfo.extend_from_slice(&timestamp.to_be_bytes());
        match self.peer.ip() {
            std::net::IpAddr::V4(v4) => {
                netinfo.push(0x04);
                netinfo.push(4);
                netinfo.extend_from_slice(&v4.octets());
            }
            std::net::IpAddr::V6(v6) => {
                netinfo.push(0x06);
                netinfo.push(16);
                netinfo.extend_from_slice(&v6.octets());
            }
        }
        netinfo.push(0); // number of our addresses

        let cell = Cell::new(0, CellCommand::Netinfo, netinfo);
        self.send_cell_raw(&cell, format).await
    }

    fn check_peer_netinfo(&self, payload: &[u8]) {
        if payload.len() < 4 {
            log::warn!("short NETINFO from {}", self.peer);
            return;
        }
        let peer_time = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let skew = now.abs_diff(peer_time as u64);
        if skew > NETINFO_SKEW.as_secs() {
            log::warn!("peer {} NETINFO clock skew of {}s", self.peer, skew);
        }
    }

    // ===== cell transport =====

    async fn send_cell_raw(&self, cell: &Cell, format: CellFormat) -> Result<()> {
        let bytes = cell.encode(format)?;

        let mut wr = self.wr.lock().await;
        let ciphertext = {
            let mut tls = self.tls.lock().expect("tls lock poisoned");
            tls.writer()
                .write_all(&bytes)
                .map_err(|e| TorError::Network(format!("TLS write: {}", e)))?;
            let mut out = Vec::with_capacity(bytes.len() + 64);
            while tls.wants_write() {
                tls.write_tls(&mut out)
                    .map_err(|e| TorError::Network(format!("TLS write: {}", e)))?;
            }
            out
        };
        wr.write_all(&ciphertext).await.map_err(|e| {
            self.fail();
            TorError::Network(format!("socket write: {}", e))
        })?;
        wr.flush().await.map_err(|e| {
            self.fail();
            TorError::Network(format!("socket flush: {}", e))
        })?;
        Ok(())
    }

    async fn recv_cell_raw(&self, format: CellFormat) -> Result<Cell> {
        let mut rd = self.rd.lock().await;
        loop {
            match Cell::decode(&rd.buf, format) {
                Ok((cell, consumed)) => {
                    rd.buf.drain(..consumed);
                    return Ok(cell);
                }
                Err(TorError::UnexpectedEof) => {
                    let at_boundary = rd.buf.is_empty();
                    let n = self.fill_recv_buf(&mut rd).await?;
                    if n == 0 {
                        return if at_boundary {
                            Err(TorError::Eof)
                        } else {
                            Err(TorError::UnexpectedEof)
                        };
                    }
                }
                Err(e) => {
                    self.fail();
                    return Err(e);
                }
            }
        }
    }

    /// Read ciphertext from the socket and append any decrypted plaintext
    /// to the receive buffer. Returns the number of plaintext bytes added
    /// (0 only on peer close).
    async fn fill_recv_buf(&self, rd: &mut RecvHalf) -> Result<usize> {
        let mut tmp = [0u8; 4096];
        loop {
            let n = rd.io.read(&mut tmp).await.map_err(|e| {
                self.fail();
                TorError::Network(format!("socket read: {}", e))
            })?;
            if n == 0 {
                return Ok(0);
            }

            let produced = {
                let mut tls = self.tls.lock().expect("tls lock poisoned");
                let mut slice = &tmp[..n];
                while !slice.is_empty() {
                    let consumed = tls
                        .read_tls(&mut slice)
                        .map_err(|e| TorError::Network(format!("TLS read: {}", e)))?;
                    if consumed == 0 {
                        break;
                    }
                }
                let state = tls
                    .process_new_packets()
                    .map_err(|e| TorError::Network(format!("TLS processing: {}", e)))?;
                let available = state.plaintext_bytes_to_read();
                if available > 0 {
                    let start = rd.buf.len();
                    rd.buf.resize(start + available, 0);
                    tls.reader()
                        .read_exact(&mut rd.buf[start..])
                        .map_err(|e| TorError::Network(format!("TLS plaintext: {}", e)))?;
                }
                available
            };

            if produced > 0 {
                return Ok(produced);
            }
            // TLS consumed the bytes without plaintext (handshake records,
            // session tickets); keep reading.
        }
    }

    async fn flush_tls_output(&self) -> Result<()> {
        let pending = {
            let mut tls = self.tls.lock().expect("tls lock poisoned");
            let mut out = Vec::new();
            while tls.wants_write() {
                tls.write_tls(&mut out)
                    .map_err(|e| TorError::Network(format!("TLS write: {}", e)))?;
            }
            out
        };
        if !pending.is_empty() {
            let mut wr = self.wr.lock().await;
            wr.write_all(&pending)
                .await
                .map_err(|e| TorError::Network(format!("socket write: {}", e)))?;
            wr.flush()
                .await
                .map_err(|e| TorError::Network(format!("socket flush: {}", e)))?;
        }
        Ok(())
    }

    /// TLS handshake read step: one socket read fed into the session.
    async fn read_tls_once(&self) -> Result<()> {
        let mut rd = self.rd.lock().await;
        let mut tmp = [0u8; 4096];
        let n = rd
            .io
            .read(&mut tmp)
            .await
            .map_err(|e| TorError::ConnectionFailed(format!("TLS handshake read: {}", e)))?;
        if n == 0 {
            return Err(TorError::ConnectionFailed(
                "connection closed during TLS handshake".into(),
            ));
        }

        let mut tls = self.tls.lock().expect("tls lock poisoned");
        let mut slice = &tmp[..n];
        while !slice.is_empty() {
            let consumed = tls
                .read_tls(&mut slice)
                .map_err(|e| TorError::ConnectionFailed(format!("TLS read: {}", e)))?;
            if consumed == 0 {
                break;
            }
        }
        tls.process_new_packets()
            .map_err(|e| TorError::ConnectionFailed(format!("TLS handshake: {}", e)))?;
        Ok(())
    }
}

/// Pick the highest link protocol version both sides support.
pub fn negotiate_version(peer_offered: &[u16]) -> Result<u16> {
    SUPPORTED_VERSIONS
        .iter()
        .rev()
        .find(|v| peer_offered.contains(v))
        .copied()
        .ok_or_else(|| TorError::NoCompatibleVersion(peer_offered.to_vec()))
}

mod verifier {
    //! Certificate verifier that accepts relay self-signed certificates.
    //!
    //! Relay identity is proven inside the protocol (CERTS cell and the
    //! ntor handshake), not by the TLS certificate chain.

    use rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    #[derive(Debug)]
    pub struct AcceptSelfSigned {
        provider: CryptoProvider,
    }

    impl AcceptSelfSigned {
        pub fn new() -> Self {
            Self {
                provider: ring::default_provider(),
            }
        }
    }

    impl ServerCertVerifier for AcceptSelfSigned {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.provider.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
