//! Circuit construction and relay-cell transport
//!
//! A circuit is built hop by hop over one link connection: CREATE2 with
//! an ntor handshake for the guard, then EXTEND2 relay cells (sent as
//! RELAY_EARLY) for the middle and exit. Once three hops are up the
//! pending circuit is converted into an open one: forward crypto state
//! stays with the senders, backward crypto state moves into a reactor
//! task that decrypts incoming cells and routes them to streams.
//!
//! Ordering: outbound relay cells apply per-hop state under one lock in
//! send order; there is a single logical writer per circuit.

use crate::error::{Result, TorError};
use crate::protocol::cell::{Cell, CellCommand, RelayCell, RelayCommand};
use crate::protocol::crypto::{
    onion_decrypt_backward, onion_encrypt_forward, CircuitKeys, HopCrypto,
};
use crate::protocol::flow_control::CircuitFlowControl;
use crate::protocol::link::LinkConnection;
use crate::protocol::ntor::NtorHandshake;
use crate::protocol::relay::Relay;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use x25519_dalek::PublicKey;

/// Hops in a full circuit
pub const MAX_HOPS: usize = 3;

/// RELAY_EARLY cells permitted per circuit
pub const RELAY_EARLY_BUDGET: u8 = 8;

/// Streams permitted per circuit
pub const MAX_STREAMS_PER_CIRCUIT: usize = 100;

/// DESTROY reason sent on orderly teardown
const DESTROY_REASON_FINISHED: u8 = 9;

/// Circuit lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Building = 0,
    Open = 1,
    Closed = 2,
    Failed = 3,
}

impl CircuitState {
    fn from_u8(v: u8) -> CircuitState {
        match v {
            0 => CircuitState::Building,
            1 => CircuitState::Open,
            2 => CircuitState::Closed,
            _ => CircuitState::Failed,
        }
    }
}

/// What a circuit was built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPurpose {
    /// Exit traffic for SOCKS clients
    General,
    /// Ends at an HSDir for descriptor fetches
    HsDir,
    /// Ends at an introduction point
    Introduction,
    /// Ends at a rendezvous point
    Rendezvous,
}

/// Identity of one hop's relay, kept for diagnostics and path checks.
#[derive(Debug, Clone)]
pub struct HopIdentity {
    pub nickname: String,
    pub fingerprint: String,
    pub address: IpAddr,
    pub or_port: u16,
}

impl HopIdentity {
    fn of(relay: &Relay) -> Self {
        Self {
            nickname: relay.nickname.clone(),
            fingerprint: relay.fingerprint.clone(),
            address: relay.address,
            or_port: relay.or_port,
        }
    }
}

/// One hop's crypto state during construction: both directions live
/// together until the circuit opens and the directions are split.
pub struct CircuitHop {
    pub relay: HopIdentity,
    forward: HopCrypto,
    backward: HopCrypto,
}

impl CircuitHop {
    fn new(relay: HopIdentity, keys: &CircuitKeys) -> Self {
        Self {
            relay,
            forward: HopCrypto::forward(keys),
            backward: HopCrypto::backward(keys),
        }
    }
}

/// Pick a fresh nonzero circuit id with the initiator bit set.
fn pick_circuit_id() -> u32 {
    rand::random::<u32>() | 0x8000_0000
}

/// Run an ntor handshake's derivation for one hop.
fn hop_material(relay: &Relay) -> Result<([u8; 20], PublicKey)> {
    let identity = relay.fingerprint_bytes().ok_or_else(|| {
        TorError::CircuitBuildFailed(format!("relay {} has a bad fingerprint", relay.nickname))
    })?;
    let ntor_key = relay.ntor_onion_key.ok_or_else(|| {
        TorError::CircuitBuildFailed(format!("relay {} has no ntor onion key", relay.nickname))
    })?;
    Ok((identity, PublicKey::from(ntor_key)))
}

/// A circuit under construction. Owns the link exclusively until the
/// build completes or fails.
pub struct PendingCircuit {
    id: u32,
    link: Arc<LinkConnection>,
    hops: Vec<CircuitHop>,
    relay_early_remaining: u8,
}

impl PendingCircuit {
    /// Send CREATE2 to the first hop and install its keys.
    pub async fn create(link: Arc<LinkConnection>, guard: &Relay) -> Result<Self> {
        let id = pick_circuit_id();
        let (identity, ntor_key) = hop_material(guard)?;

        let handshake = NtorHandshake::new();
        let handshake_data = handshake.handshake_data(&identity, &ntor_key);

        // CREATE2 payload: HTYPE (2, ntor=0x0002) | HLEN (2) | HDATA
        let mut payload = Vec::with_capacity(4 + handshake_data.len());
        payload.extend_from_slice(&[0x00, 0x02]);
        payload.extend_from_slice(&(handshake_data.len() as u16).to_be_bytes());
        payload.extend_from_slice(&handshake_data);

        link.send_cell(&Cell::new(id, CellCommand::Create2, payload))
            .await?;

        let response = link.recv_cell().await?;
        let hdata = match response.command {
            CellCommand::Created2 => {
                if response.circuit_id != id {
                    return Err(TorError::ProtocolError(format!(
                        "CREATED2 for circuit {} on circuit {}",
                        response.circuit_id, id
                    )));
                }
                parse_handshake_reply(&response.payload)?
            }
            CellCommand::Destroy => {
                let reason = response.payload.first().copied().unwrap_or(0);
                return Err(TorError::circuit_destroyed(reason));
            }
            other => {
                return Err(TorError::UnexpectedCell {
                    expected: "CREATED2".into(),
                    got: format!("{:?}", other),
                });
            }
        };

        let material = handshake.finalize(hdata, &identity, &ntor_key)?;
        let keys = CircuitKeys::from_material(&material);

        log::debug!("circuit {} created through {}", id, guard.nickname);

        Ok(Self {
            id,
            link,
            hops: vec![CircuitHop::new(HopIdentity::of(guard), &keys)],
            relay_early_remaining: RELAY_EARLY_BUDGET,
        })
    }

    /// Circuit id on the link.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of completed hops.
    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Extend the circuit by one hop with EXTEND2.
    pub async fn extend(&mut self, relay: &Relay) -> Result<()> {
        if self.hops.len() >= MAX_HOPS {
            return Err(TorError::CircuitBuildFailed(
                "circuit already has three hops".into(),
            ));
        }

        let (identity, ntor_key) = hop_material(relay)?;
        let handshake = NtorHandshake::new();
        let handshake_data = handshake.handshake_data(&identity, &ntor_key);

        // EXTEND2 body: NSPEC, then link specifiers (IPv4+port, legacy
        // identity), then HTYPE | HLEN | HDATA.
        let mut data = Vec::with_capacity(2 + 8 + 22 + 4 + handshake_data.len());
        data.push(2); // NSPEC
        match relay.address {
            IpAddr::V4(v4) => {
                data.push(0x00); // TLS-over-TCP, IPv4
                data.push(6);
                data.extend_from_slice(&v4.octets());
                data.extend_from_slice(&relay.or_port.to_be_bytes());
            }
            IpAddr::V6(v6) => {
                data.push(0x01); // TLS-over-TCP, IPv6
                data.push(18);
                data.extend_from_slice(&v6.octets());
                data.extend_from_slice(&relay.or_port.to_be_bytes());
            }
        }
        data.push(0x02); // legacy identity
        data.push(20);
        data.extend_from_slice(&identity);
        data.extend_from_slice(&[0x00, 0x02]);
        data.extend_from_slice(&(handshake_data.len() as u16).to_be_bytes());
        data.extend_from_slice(&handshake_data);

        let extend_cell = RelayCell::new(RelayCommand::Extend2, 0, data);
        self.send_relay_cell(&extend_cell, true).await?;

        let (hop_idx, reply) = self.recv_relay_cell().await?;
        if hop_idx != self.hops.len() - 1 {
            return Err(TorError::ProtocolError(format!(
                "EXTENDED2 recognized at hop {} instead of the terminus",
                hop_idx
            )));
        }
        if reply.command != RelayCommand::Extended2 {
            return Err(TorError::UnexpectedCell {
                expected: "EXTENDED2".into(),
                got: format!("{:?}", reply.command),
            });
        }

        let hdata = parse_handshake_reply(&reply.data)?;
        let material = handshake.finalize(hdata, &identity, &ntor_key)?;
        let keys = CircuitKeys::from_material(&material);
        self.hops
            .push(CircuitHop::new(HopIdentity::of(relay), &keys));

        log::debug!(
            "circuit {} extended to {} ({} hops)",
            self.id,
            relay.nickname,
            self.hops.len()
        );
        Ok(())
    }

    /// Onion-encrypt and send one relay cell. Extensions must go out as
    /// RELAY_EARLY, which is budgeted per circuit.
    async fn send_relay_cell(&mut self, relay_cell: &RelayCell, early: bool) -> Result<()> {
        let mut body = relay_cell.encode()?;
        let terminus = self.hops.len() - 1;

        body[RelayCell::DIGEST_RANGE].fill(0);
        let digest = self.hops[terminus].forward.seal_digest(&body);
        body[RelayCell::DIGEST_RANGE].copy_from_slice(&digest);
        for hop in self.hops[..=terminus].iter_mut().rev() {
            hop.forward.apply_layer(&mut body);
        }

        let command = if early {
            if self.relay_early_remaining == 0 {
                return Err(TorError::CircuitBuildFailed(
                    "RELAY_EARLY budget exhausted".into(),
                ));
            }
            self.relay_early_remaining -= 1;
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        };

        self.link.send_cell(&Cell::new(self.id, command, body)).await
    }

    /// Receive and peel one relay cell, returning the recognizing hop.
    async fn recv_relay_cell(&mut self) -> Result<(usize, RelayCell)> {
        loop {
            let cell = self.link.recv_cell().await?;
            if cell.circuit_id != self.id {
                log::debug!(
                    "ignoring cell for circuit {} while building {}",
                    cell.circuit_id,
                    self.id
                );
                continue;
            }
            match cell.command {
                CellCommand::Relay | CellCommand::RelayEarly => {
                    let mut body = cell.payload;
                    let mut recognized = None;
                    for (idx, hop) in self.hops.iter_mut().enumerate() {
                        hop.backward.apply_layer(&mut body);
                        if hop.backward.check_recognized(&body) {
                            recognized = Some(idx);
                            break;
                        }
                    }
                    let Some(idx) = recognized else {
                        self.destroy().await;
                        return Err(TorError::DigestMismatch);
                    };
                    return Ok((idx, RelayCell::decode(&body)?));
                }
                CellCommand::Destroy => {
                    let reason = cell.payload.first().copied().unwrap_or(0);
                    return Err(TorError::circuit_destroyed(reason));
                }
                CellCommand::Padding | CellCommand::Vpadding => continue,
                // A second CREATED2 here is a protocol violation.
                other => {
                    self.destroy().await;
                    return Err(TorError::UnexpectedCell {
                        expected: "RELAY".into(),
                        got: format!("{:?}", other),
                    });
                }
            }
        }
    }

    /// Send DESTROY toward the guard and drop the link.
    pub async fn destroy(&self) {
        let mut payload = vec![0u8; Cell::PAYLOAD_SIZE];
        payload[0] = DESTROY_REASON_FINISHED;
        let _ = self
            .link
            .send_cell(&Cell::new(self.id, CellCommand::Destroy, payload))
            .await;
        self.link.close().await;
    }

    /// Convert a fully built circuit into an open, shared one, spawning
    /// its reactor.
    pub fn into_circuit(self, purpose: CircuitPurpose) -> Result<Arc<Circuit>> {
        if self.hops.len() != MAX_HOPS {
            return Err(TorError::CircuitBuildFailed(format!(
                "open circuit requires {} hops, have {}",
                MAX_HOPS,
                self.hops.len()
            )));
        }

        let mut forward = Vec::with_capacity(self.hops.len());
        let mut backward = Vec::with_capacity(self.hops.len());
        let mut path = Vec::with_capacity(self.hops.len());
        for hop in self.hops {
            path.push(hop.relay);
            forward.push(hop.forward);
            backward.push(hop.backward);
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let circuit = Arc::new(Circuit {
            id: self.id,
            link: self.link,
            purpose,
            created_at: Instant::now(),
            path,
            state: AtomicU8::new(CircuitState::Open as u8),
            tx: Mutex::new(CircuitTx {
                hops: forward,
                relay_early_remaining: self.relay_early_remaining,
                flow: CircuitFlowControl::new(),
                next_stream_id: 1,
            }),
            registry: StdMutex::new(StreamRegistry::default()),
            reactor_cmd: cmd_tx,
        });

        let reactor = Reactor {
            circuit: Arc::clone(&circuit),
            hops: backward,
            flow: CircuitFlowControl::new(),
            cmd_rx,
        };
        tokio::spawn(reactor.run());

        Ok(circuit)
    }
}

fn parse_handshake_reply(payload: &[u8]) -> Result<&[u8]> {
    // CREATED2/EXTENDED2: HLEN (2) | HDATA (HLEN)
    if payload.len() < 2 {
        return Err(TorError::ProtocolError("handshake reply too short".into()));
    }
    let hlen = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if hlen < 64 || payload.len() < 2 + hlen {
        return Err(TorError::ProtocolError(format!(
            "handshake reply length {} invalid",
            hlen
        )));
    }
    Ok(&payload[2..2 + hlen])
}

/// Sender-side circuit state, under the circuit's write lock.
struct CircuitTx {
    hops: Vec<HopCrypto>,
    relay_early_remaining: u8,
    flow: CircuitFlowControl,
    next_stream_id: u16,
}

/// Routing table from stream ids to their delivery channels.
#[derive(Default)]
struct StreamRegistry {
    streams: HashMap<u16, mpsc::UnboundedSender<RelayCell>>,
    control: Option<mpsc::UnboundedSender<RelayCell>>,
}

/// Commands from circuit handles to the reactor.
enum ReactorCmd {
    /// Install a backward crypto layer for a virtual hop.
    AddBackwardHop(HopCrypto),
}

/// An open three-hop circuit shared between the pool, streams, and its
/// reactor task.
pub struct Circuit {
    id: u32,
    link: Arc<LinkConnection>,
    purpose: CircuitPurpose,
    created_at: Instant,
    path: Vec<HopIdentity>,
    state: AtomicU8,
    tx: Mutex<CircuitTx>,
    registry: StdMutex<StreamRegistry>,
    reactor_cmd: mpsc::UnboundedSender<ReactorCmd>,
}

impl Circuit {
    /// An open circuit over a loopback link with fixed hop keys, for
    /// pool and dispatch tests. Keep the returned peer socket alive or
    /// the reactor observes EOF and closes the circuit.
    #[cfg(test)]
    pub(crate) async fn open_for_tests() -> (Arc<Circuit>, tokio::net::TcpStream) {
        use crate::protocol::ntor::KEY_MATERIAL_LEN;

        let (link, peer) = LinkConnection::loopback_for_tests().await;

        let hops: Vec<CircuitHop> = (0..MAX_HOPS)
            .map(|i| {
                let mut material = [0u8; KEY_MATERIAL_LEN];
                material[0] = i as u8 + 1;
                let keys = CircuitKeys::from_material(&material);
                CircuitHop::new(
                    HopIdentity {
                        nickname: format!("hop{}", i),
                        fingerprint: hex::encode_upper([i as u8 + 1; 20]),
                        address: "127.0.0.1".parse().unwrap(),
                        or_port: 9001,
                    },
                    &keys,
                )
            })
            .collect();

        let pending = PendingCircuit {
            id: pick_circuit_id(),
            link,
            hops,
            relay_early_remaining: RELAY_EARLY_BUDGET,
        };
        let circuit = pending
            .into_circuit(CircuitPurpose::General)
            .expect("three hops");
        (circuit, peer)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn purpose(&self) -> CircuitPurpose {
        self.purpose
    }

    /// Relays on the path, guard first.
    pub fn path(&self) -> &[HopIdentity] {
        &self.path
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Time since the circuit opened.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Allocate a stream id and register its delivery channel.
    ///
    /// Fails when the circuit is not open or the per-circuit stream limit
    /// is reached.
    pub(crate) async fn register_stream(
        &self,
    ) -> Result<(u16, mpsc::UnboundedReceiver<RelayCell>)> {
        if !self.is_open() {
            return Err(TorError::CircuitClosed(format!("circuit {}", self.id)));
        }

        let mut tx = self.tx.lock().await;
        let stream_id = {
            let registry = self.registry.lock().expect("registry lock poisoned");
            if registry.streams.len() >= MAX_STREAMS_PER_CIRCUIT {
                return Err(TorError::ResourceExhausted(format!(
                    "circuit {} already has {} streams",
                    self.id, MAX_STREAMS_PER_CIRCUIT
                )));
            }
            let mut id = tx.next_stream_id;
            // Skip 0 and ids still in use.
            loop {
                if id != 0 && !registry.streams.contains_key(&id) {
                    break;
                }
                id = id.wrapping_add(1);
            }
            id
        };
        tx.next_stream_id = stream_id.wrapping_add(1);
        drop(tx);

        let (cell_tx, cell_rx) = mpsc::unbounded_channel();
        self.registry
            .lock()
            .expect("registry lock poisoned")
            .streams
            .insert(stream_id, cell_tx);
        Ok((stream_id, cell_rx))
    }

    /// Remove a stream's delivery channel.
    pub(crate) fn unregister_stream(&self, stream_id: u16) {
        self.registry
            .lock()
            .expect("registry lock poisoned")
            .streams
            .remove(&stream_id);
    }

    /// Register for circuit-level (stream id 0) cells that the reactor
    /// does not consume itself. Used by the hidden-service client for
    /// RENDEZVOUS_ESTABLISHED, INTRODUCE_ACK and RENDEZVOUS2.
    pub(crate) fn take_control_channel(&self) -> mpsc::UnboundedReceiver<RelayCell> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry
            .lock()
            .expect("registry lock poisoned")
            .control = Some(tx);
        rx
    }

    /// Onion-encrypt and send one relay cell to the terminus hop.
    ///
    /// `counts_toward_window` is true for DATA cells, which consume the
    /// circuit-level package window.
    pub(crate) async fn send_relay_cell(
        &self,
        relay_cell: &RelayCell,
        counts_toward_window: bool,
    ) -> Result<()> {
        if !self.is_open() {
            return Err(TorError::CircuitClosed(format!("circuit {}", self.id)));
        }

        let mut tx = self.tx.lock().await;
        if counts_toward_window {
            tx.flow.on_package()?;
        }

        let mut body = relay_cell.encode()?;
        let terminus = tx.hops.len() - 1;
        onion_encrypt_forward(&mut tx.hops, terminus, &mut body);

        self.link
            .send_cell(&Cell::new(self.id, CellCommand::Relay, body))
            .await
    }

    /// Whether the circuit-level package window permits another data cell.
    pub(crate) async fn can_package(&self) -> bool {
        self.tx.lock().await.flow.can_package()
    }

    /// Install a virtual hop after a completed rendezvous handshake. The
    /// hidden service becomes the new terminus for relay cells.
    pub(crate) async fn add_virtual_hop(&self, keys: &CircuitKeys) -> Result<()> {
        let mut tx = self.tx.lock().await;
        tx.hops.push(HopCrypto::forward(keys));
        drop(tx);

        self.reactor_cmd
            .send(ReactorCmd::AddBackwardHop(HopCrypto::backward(keys)))
            .map_err(|_| TorError::CircuitClosed(format!("circuit {}", self.id)))
    }

    /// Close the circuit: best-effort DESTROY toward the guard, fail all
    /// streams, drop the link. Idempotent.
    pub async fn close(&self) {
        let prev = self
            .state
            .swap(CircuitState::Closed as u8, Ordering::SeqCst);
        if prev == CircuitState::Closed as u8 || prev == CircuitState::Failed as u8 {
            return;
        }

        let mut payload = vec![0u8; Cell::PAYLOAD_SIZE];
        payload[0] = DESTROY_REASON_FINISHED;
        let _ = self
            .link
            .send_cell(&Cell::new(self.id, CellCommand::Destroy, payload))
            .await;
        self.link.close().await;

        self.fail_streams();
        log::debug!("circuit {} closed", self.id);
    }

    fn mark_failed(&self, err: &TorError) {
        self.state
            .store(CircuitState::Failed as u8, Ordering::SeqCst);
        self.link.fail();
        log::warn!("circuit {} failed: {}", self.id, err);
        self.fail_streams();
    }

    fn mark_closed_by_peer(&self, err: &TorError) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::SeqCst);
        log::debug!("circuit {} closed by peer: {}", self.id, err);
        self.fail_streams();
    }

    /// Drop every stream channel so readers observe the failure.
    fn fail_streams(&self) {
        let mut registry = self.registry.lock().expect("registry lock poisoned");
        registry.streams.clear();
        registry.control = None;
    }
}

/// Receive-side task: peels incoming relay cells and routes them.
struct Reactor {
    circuit: Arc<Circuit>,
    hops: Vec<HopCrypto>,
    flow: CircuitFlowControl,
    cmd_rx: mpsc::UnboundedReceiver<ReactorCmd>,
}

impl Reactor {
    async fn run(mut self) {
        let reason = loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(ReactorCmd::AddBackwardHop(hop)) => self.hops.push(hop),
                        // All circuit handles dropped; wind down.
                        None => break TorError::CircuitClosed(
                            format!("circuit {}", self.circuit.id)),
                    }
                }
                cell = self.circuit.link.recv_cell() => {
                    match cell {
                        Ok(cell) => {
                            if let Some(err) = self.handle_cell(cell).await {
                                break err;
                            }
                        }
                        Err(err) => break err,
                    }
                }
            }
        };

        match reason {
            TorError::CircuitDestroyed { .. } | TorError::Eof => {
                self.circuit.mark_closed_by_peer(&reason);
            }
            err => {
                if self.circuit.state() == CircuitState::Open {
                    // Protocol violations tear the circuit down toward
                    // the guard before we abandon it.
                    let mut payload = vec![0u8; Cell::PAYLOAD_SIZE];
                    payload[0] = DESTROY_REASON_FINISHED;
                    let _ = self
                        .circuit
                        .link
                        .send_cell(&Cell::new(
                            self.circuit.id,
                            CellCommand::Destroy,
                            payload,
                        ))
                        .await;
                    self.circuit.mark_failed(&err);
                }
            }
        }
        log::debug!("circuit {} reactor exited", self.circuit.id);
    }

    /// Process one inbound cell. Returns Some(error) to stop the reactor.
    async fn handle_cell(&mut self, cell: Cell) -> Option<TorError> {
        if cell.circuit_id != self.circuit.id {
            log::debug!(
                "dropping cell for unknown circuit {} on link of circuit {}",
                cell.circuit_id,
                self.circuit.id
            );
            return None;
        }

        match cell.command {
            CellCommand::Relay | CellCommand::RelayEarly => {
                let mut body = cell.payload;
                let recognized = onion_decrypt_backward(&mut self.hops, &mut body);
                if recognized.is_none() {
                    // No hop claimed the cell: fatal protocol violation;
                    // run() sends the DESTROY on the way out.
                    return Some(TorError::DigestMismatch);
                }

                let relay_cell = match RelayCell::decode(&body) {
                    Ok(rc) => rc,
                    Err(e) => return Some(e),
                };
                self.route_relay_cell(relay_cell).await
            }
            CellCommand::Destroy => {
                let reason = cell.payload.first().copied().unwrap_or(0);
                Some(TorError::circuit_destroyed(reason))
            }
            CellCommand::Padding | CellCommand::Vpadding => None,
            other => Some(TorError::UnexpectedCell {
                expected: "RELAY/DESTROY".into(),
                got: format!("{:?}", other),
            }),
        }
    }

    async fn route_relay_cell(&mut self, relay_cell: RelayCell) -> Option<TorError> {
        if relay_cell.stream_id == 0 {
            return self.handle_circuit_cell(relay_cell).await;
        }

        // Circuit-level deliver accounting applies to DATA cells on any
        // stream; replenish the sender when a window increment is used up.
        if relay_cell.command == RelayCommand::Data && self.flow.on_deliver() {
            let sendme = RelayCell::new(RelayCommand::Sendme, 0, vec![]);
            if let Err(e) = self.circuit.send_relay_cell(&sendme, false).await {
                return Some(e);
            }
        }

        let sender = {
            let registry = self.circuit.registry.lock().expect("registry lock poisoned");
            registry.streams.get(&relay_cell.stream_id).cloned()
        };
        match sender {
            Some(sender) => {
                if sender.send(relay_cell).is_err() {
                    // Stream object dropped without unregistering.
                }
            }
            None => {
                log::debug!(
                    "circuit {}: dropping {:?} for unknown stream {}",
                    self.circuit.id,
                    relay_cell.command,
                    relay_cell.stream_id
                );
            }
        }
        None
    }

    async fn handle_circuit_cell(&mut self, relay_cell: RelayCell) -> Option<TorError> {
        match relay_cell.command {
            RelayCommand::Sendme => {
                self.circuit.tx.lock().await.flow.on_sendme();
                None
            }
            RelayCommand::Truncated => {
                let reason = relay_cell.data.first().copied().unwrap_or(0);
                Some(TorError::circuit_destroyed(reason))
            }
            RelayCommand::Drop => None,
            // A repeat EXTENDED2 on an open circuit is fatal.
            RelayCommand::Extended2 | RelayCommand::Extended => {
                Some(TorError::ProtocolError(
                    "EXTENDED2 on a fully built circuit".into(),
                ))
            }
            other => {
                let sender = {
                    let registry =
                        self.circuit.registry.lock().expect("registry lock poisoned");
                    registry.control.clone()
                };
                match sender {
                    Some(sender) => {
                        if sender.send(relay_cell).is_err() {
                            log::debug!(
                                "circuit {}: control receiver gone for {:?}",
                                self.circuit.id,
                                other
                            );
                        }
                        None
                    }
                    None => {
                        log::debug!(
                            "circuit {}: unhandled circuit-level {:?}",
                            self.circuit.id,
                            other
                        );
                        None
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_id_has_initiator_bit() {
        for _ in 0..32 {
            let id = pick_circuit_id();
            assert_ne!(id, 0);
            assert_eq!(id & 0x8000_0000, 0x8000_0000);
        }
    }

    #[test]
    fn test_parse_handshake_reply() {
        let mut payload = vec![0x00, 0x40];
        payload.extend_from_slice(&[7u8; 64]);
        let hdata = parse_handshake_reply(&payload).unwrap();
        assert_eq!(hdata.len(), 64);
        assert_eq!(hdata[0], 7);

        // Truncated and undersized replies are rejected.
        assert!(parse_handshake_reply(&[0x00]).is_err());
        assert!(parse_handshake_reply(&[0x00, 0x20, 0, 0]).is_err());
        let mut short = vec![0x00, 0x40];
        short.extend_from_slice(&[0u8; 32]);
        assert!(parse_handshake_reply(&short).is_err());
    }

    #[test]
    fn test_circuit_states() {
        assert_eq!(CircuitState::from_u8(0), CircuitState::Building);
        assert_eq!(CircuitState::from_u8(1), CircuitState::Open);
        assert_eq!(CircuitState::from_u8(2), CircuitState::Closed);
        assert_eq!(CircuitState::from_u8(3), CircuitState::Failed);
    }
}
