//! SOCKS5 front end
//!
//! RFC 1928 server: NoAuth and UserPass methods, CONNECT only, with
//! IPv4/IPv6/domain targets. Each accepted request derives an isolation
//! key, is dispatched onto a pool circuit consistent with that key (or a
//! freshly built one), and then relays bytes between the TCP peer and
//! the Tor stream until either side finishes. `.onion` domains take the
//! hidden-service path.

use crate::client::{Bandwidth, NetworkView};
use crate::error::{Result, TorError};
use crate::events::{Event, EventPublisher};
use crate::hs::{HsClient, OnionAddress};
use crate::isolation::{IsolationPolicy, RequestAttrs};
use crate::pool::{CircuitFactory, CircuitPool};
use crate::protocol::stream::{StreamEvent, TorStream};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

const SOCKS_VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_TTL_EXPIRED: u8 = 0x06;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// RELAY_END reasons that map onto SOCKS replies.
const END_REASON_RESOLVEFAILED: u8 = 2;
const END_REASON_CONNECTREFUSED: u8 = 3;
const END_REASON_EXITPOLICY: u8 = 4;
const END_REASON_TIMEOUT: u8 = 7;

/// Deadline for opening the Tor-side stream.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything one SOCKS session needs from the client.
pub struct SocksContext {
    pub policy: IsolationPolicy,
    pub pool: Arc<CircuitPool>,
    pub factory: Arc<dyn CircuitFactory>,
    pub hs: Arc<HsClient>,
    pub netview: Arc<NetworkView>,
    pub bandwidth: Arc<Bandwidth>,
    pub events: EventPublisher,
}

/// The parsed CONNECT request.
struct SocksRequest {
    host: String,
    port: u16,
    credentials: Option<(Vec<u8>, Vec<u8>)>,
}

/// Serve one SOCKS connection to completion.
pub async fn handle_socks_conn(
    ctx: Arc<SocksContext>,
    mut tcp: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let request = match negotiate(&mut tcp, &ctx.policy).await {
        Ok(request) => request,
        Err(e) => {
            log::debug!("SOCKS negotiation with {} failed: {}", peer, e);
            return Err(e);
        }
    };

    log::debug!(
        "SOCKS CONNECT {}:{} from {}",
        request.host,
        request.port,
        peer
    );

    let attrs = RequestAttrs {
        host: &request.host,
        port: request.port,
        credentials: request
            .credentials
            .as_ref()
            .map(|(u, p)| (u.as_slice(), p.as_slice())),
        client_port: peer.port(),
        session: None,
    };
    let isolation = ctx.policy.key_for(&attrs);

    let stream = tokio::time::timeout(
        CONNECT_TIMEOUT,
        open_tor_stream(&ctx, &request, &isolation),
    )
    .await
    .unwrap_or_else(|_| Err(TorError::Timeout("stream open".into())));

    let mut stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            log::info!(
                "CONNECT {}:{} failed: {}",
                request.host,
                request.port,
                e
            );
            send_reply(&mut tcp, reply_code_for(&e)).await?;
            return Err(e);
        }
    };

    send_reply(&mut tcp, REPLY_SUCCEEDED).await?;
    ctx.events.publish(Event::Stream {
        circuit_id: stream.circuit().id(),
        stream_id: stream.stream_id(),
        status: "SUCCEEDED",
        target: format!("{}:{}", request.host, request.port),
    });

    relay_bytes(&ctx, &mut tcp, &mut stream, &mut shutdown).await
}

/// Method negotiation, optional RFC 1929 subnegotiation, request parse.
async fn negotiate(tcp: &mut TcpStream, policy: &IsolationPolicy) -> Result<SocksRequest> {
    // Greeting: VER NMETHODS METHODS...
    let mut header = [0u8; 2];
    tcp.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(TorError::ProtocolError(format!(
            "SOCKS version {}",
            header[0]
        )));
    }
    let mut methods = vec![0u8; header[1] as usize];
    tcp.read_exact(&mut methods).await?;

    let wants_credentials = policy.isolate_socks_auth
        || policy.level == crate::isolation::IsolationLevel::Credential;
    let method = if wants_credentials && methods.contains(&METHOD_USER_PASS) {
        METHOD_USER_PASS
    } else if methods.contains(&METHOD_NO_AUTH) {
        METHOD_NO_AUTH
    } else if methods.contains(&METHOD_USER_PASS) {
        METHOD_USER_PASS
    } else {
        tcp.write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        return Err(TorError::ProtocolError(
            "no acceptable SOCKS method".into(),
        ));
    };
    tcp.write_all(&[SOCKS_VERSION, method]).await?;

    let credentials = if method == METHOD_USER_PASS {
        Some(read_userpass(tcp).await?)
    } else {
        None
    };

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut head = [0u8; 4];
    tcp.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(TorError::ProtocolError("bad request version".into()));
    }
    if head[1] != CMD_CONNECT {
        send_reply(tcp, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(TorError::ProtocolError(format!(
            "unsupported SOCKS command {}",
            head[1]
        )));
    }

    let host = match head[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            tcp.read_exact(&mut addr).await?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            tcp.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            tcp.read_exact(&mut name).await?;
            String::from_utf8(name)
                .map_err(|_| TorError::ProtocolError("domain is not UTF-8".into()))?
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            tcp.read_exact(&mut addr).await?;
            std::net::Ipv6Addr::from(addr).to_string()
        }
        other => {
            send_reply(tcp, REPLY_ATYP_NOT_SUPPORTED).await?;
            return Err(TorError::ProtocolError(format!(
                "unsupported ATYP {}",
                other
            )));
        }
    };

    let mut port = [0u8; 2];
    tcp.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    Ok(SocksRequest {
        host,
        port,
        credentials,
    })
}

/// RFC 1929 username/password subnegotiation.
async fn read_userpass(tcp: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut ver = [0u8; 1];
    tcp.read_exact(&mut ver).await?;
    if ver[0] != 0x01 {
        return Err(TorError::ProtocolError(format!(
            "userpass version {}",
            ver[0]
        )));
    }

    let mut len = [0u8; 1];
    tcp.read_exact(&mut len).await?;
    let mut username = vec![0u8; len[0] as usize];
    tcp.read_exact(&mut username).await?;

    tcp.read_exact(&mut len).await?;
    let mut password = vec![0u8; len[0] as usize];
    tcp.read_exact(&mut password).await?;

    // Credentials are accepted unconditionally; they exist for isolation.
    tcp.write_all(&[0x01, 0x00]).await?;
    Ok((username, password))
}

/// Dispatch onto a circuit and open the stream.
async fn open_tor_stream(
    ctx: &SocksContext,
    request: &SocksRequest,
    isolation: &crate::isolation::IsolationKey,
) -> Result<TorStream> {
    if request.host.to_ascii_lowercase().ends_with(".onion") {
        let address = OnionAddress::parse(&request.host)?;
        let consensus = ctx.netview.consensus();
        return ctx.hs.connect(&consensus, &address, request.port).await;
    }

    let circuit = match ctx.pool.get(isolation) {
        Some(circuit) => circuit,
        None => ctx.pool.build_for(&ctx.factory, isolation).await?,
    };

    match circuit.open_stream(&request.host, request.port).await {
        Ok(stream) => Ok(stream),
        Err(e) => {
            // A dead circuit should not poison the next attempt.
            if !circuit.is_open() {
                ctx.pool.sweep().await;
            }
            Err(e)
        }
    }
}

/// Bidirectional copy between the TCP peer and the Tor stream.
///
/// The client-read branch is gated on the stream window, so SENDME
/// starvation back-pressures the application instead of erroring.
async fn relay_bytes(
    ctx: &SocksContext,
    tcp: &mut TcpStream,
    stream: &mut TorStream,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        let window_open = stream.can_send();
        tokio::select! {
            read = tcp.read(&mut buf), if window_open => {
                match read {
                    Ok(0) => {
                        let _ = stream.close().await;
                        return Ok(());
                    }
                    Ok(n) => {
                        stream.send_data(&buf[..n]).await?;
                        ctx.bandwidth.add_written(n as u64);
                    }
                    Err(e) => {
                        // Count the partial transfer before surfacing.
                        let _ = stream.close().await;
                        return Err(e.into());
                    }
                }
            }
            event = stream.next_event() => {
                match event? {
                    StreamEvent::Data(data) => {
                        ctx.bandwidth.add_read(data.len() as u64);
                        tcp.write_all(&data).await?;
                    }
                    StreamEvent::End(reason) => {
                        log::debug!(
                            "stream {} ended by peer (reason {})",
                            stream.stream_id(),
                            reason
                        );
                        return Ok(());
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = stream.close().await;
                    return Ok(());
                }
            }
        }
    }
}

async fn send_reply(tcp: &mut TcpStream, code: u8) -> Result<()> {
    // Reply with an all-zero IPv4 bind address.
    let reply = [
        SOCKS_VERSION,
        code,
        0x00,
        ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    tcp.write_all(&reply).await?;
    Ok(())
}

/// Map an error onto the SOCKS5 reply code the peer sees.
fn reply_code_for(err: &TorError) -> u8 {
    match err {
        TorError::StreamRefused(reason) => match *reason {
            END_REASON_CONNECTREFUSED => REPLY_CONNECTION_REFUSED,
            END_REASON_RESOLVEFAILED | END_REASON_EXITPOLICY => REPLY_HOST_UNREACHABLE,
            END_REASON_TIMEOUT => REPLY_TTL_EXPIRED,
            _ => REPLY_GENERAL_FAILURE,
        },
        // Hidden-service failures surface as host unreachable.
        TorError::InvalidAddress(_)
        | TorError::DescriptorFetchFailed(_)
        | TorError::InvalidDescriptor(_)
        | TorError::IntroductionFailed(_)
        | TorError::RendezvousFailed(_) => REPLY_HOST_UNREACHABLE,
        TorError::Timeout(_) => REPLY_TTL_EXPIRED,
        TorError::Network(_) | TorError::ConnectionFailed(_) | TorError::Eof => {
            REPLY_NETWORK_UNREACHABLE
        }
        _ => REPLY_GENERAL_FAILURE,
    }
}
