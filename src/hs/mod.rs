//! Hidden-service v3 client
//!
//! Turns a `.onion` address into an open stream: derive the blinded key
//! for the current time period, locate the descriptor on the HSDir hash
//! ring, fetch and verify it through a directory circuit, then introduce
//! ourselves and meet the service at a rendezvous point.
//!
//! Every step is retryable against a different HSDir or introduction
//! point; the caller sees a single `connect` that works through the
//! alternatives before giving up.

pub mod address;
pub mod blinding;
pub mod descriptor;
pub mod hsdir;
pub mod rendezvous;

pub use address::OnionAddress;
pub use descriptor::{HsDescriptor, IntroPoint};

use crate::error::{Result, TorError};
use crate::hs::blinding::{blinded_pubkey, subcredential, TimePeriod};
use crate::hs::hsdir::HsDirRing;
use crate::hs::rendezvous::{introduce, HsNtorClient, RendezvousPoint};
use crate::pool::CircuitFactory;
use crate::protocol::circuit::{Circuit, CircuitPurpose};
use crate::protocol::consensus::Consensus;
use crate::protocol::directory::parse_http_response;
use crate::protocol::relay::{Relay, RelayFlags};
use crate::protocol::stream::TorStream;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use std::sync::Arc;

/// Hidden-service connection machinery.
pub struct HsClient {
    factory: Arc<dyn CircuitFactory>,
}

impl HsClient {
    pub fn new(factory: Arc<dyn CircuitFactory>) -> Self {
        Self { factory }
    }

    /// Connect a stream to `address:port`.
    pub async fn connect(
        &self,
        consensus: &Arc<Consensus>,
        address: &OnionAddress,
        port: u16,
    ) -> Result<TorStream> {
        let period = TimePeriod::current();
        let blinded = blinded_pubkey(address.pubkey(), period)?;
        let subcred = subcredential(address.pubkey(), &blinded);

        let descriptor = self
            .fetch_descriptor(consensus, &blinded, &subcred, period)
            .await?;
        log::info!(
            "descriptor for {} fetched (revision {}, {} intro points)",
            address,
            descriptor.revision,
            descriptor.intro_points.len()
        );

        // Work through the introduction points in random order.
        let mut intro_points = descriptor.intro_points.clone();
        intro_points.shuffle(&mut OsRng);

        let mut last_err =
            TorError::IntroductionFailed("descriptor lists no introduction points".into());
        for intro in &intro_points {
            match self.rendezvous_with(consensus, intro, subcred).await {
                Ok(circuit) => {
                    // The virtual hop is the terminus; the begin address
                    // is empty because the circuit ends at the service.
                    return circuit.open_stream("", port).await;
                }
                Err(e) => {
                    log::warn!("introduction attempt failed: {}", e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Fetch the descriptor from the responsible HSDirs, first success
    /// wins.
    async fn fetch_descriptor(
        &self,
        consensus: &Arc<Consensus>,
        blinded: &[u8; 32],
        subcred: &[u8; 32],
        period: TimePeriod,
    ) -> Result<HsDescriptor> {
        let ring = HsDirRing::from_consensus(consensus, period);
        let hsdirs = ring.responsible_relays(blinded, period);
        if hsdirs.is_empty() {
            return Err(TorError::DescriptorFetchFailed(
                "no HSDirs in the consensus".into(),
            ));
        }

        let mut last_err = TorError::DescriptorFetchFailed("no HSDir answered".into());
        for hsdir in &hsdirs {
            match self.fetch_from_hsdir(hsdir, blinded, subcred).await {
                Ok(descriptor) => return Ok(descriptor),
                Err(e) => {
                    log::warn!("HSDir {} failed: {}", hsdir.nickname, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// One HSDir: circuit ending there, BEGIN_DIR stream, HTTP GET.
    async fn fetch_from_hsdir(
        &self,
        hsdir: &Relay,
        blinded: &[u8; 32],
        subcred: &[u8; 32],
    ) -> Result<HsDescriptor> {
        let circuit = self
            .factory
            .build_circuit_to(hsdir, CircuitPurpose::HsDir)
            .await?;

        let result = self.fetch_over_circuit(&circuit, blinded, subcred).await;
        circuit.close().await;
        result
    }

    async fn fetch_over_circuit(
        &self,
        circuit: &Arc<Circuit>,
        blinded: &[u8; 32],
        subcred: &[u8; 32],
    ) -> Result<HsDescriptor> {
        let mut stream = circuit.open_dir_stream().await?;

        let request = format!(
            "GET /tor/hs/3/{} HTTP/1.0\r\nHost: hsdir\r\n\r\n",
            STANDARD_NO_PAD.encode(blinded)
        );
        stream.write_all(request.as_bytes()).await?;

        let response = stream.read_to_end().await?;
        let _ = stream.close().await;
        let body = parse_http_response(&response)
            .map_err(|e| TorError::DescriptorFetchFailed(e.to_string()))?;
        let text = String::from_utf8(body)
            .map_err(|_| TorError::InvalidDescriptor("descriptor is not UTF-8".into()))?;

        descriptor::parse_and_verify(&text, blinded, subcred)
    }

    /// Establish a rendezvous and introduce ourselves through `intro`.
    /// Returns the rendezvous circuit with the service attached as its
    /// virtual hop.
    async fn rendezvous_with(
        &self,
        consensus: &Arc<Consensus>,
        intro: &IntroPoint,
        subcred: [u8; 32],
    ) -> Result<Arc<Circuit>> {
        // Any usable relay can serve as the rendezvous point.
        let rend_relay = {
            let candidates: Vec<&Relay> = consensus
                .relays
                .iter()
                .filter(|r| r.is_usable() && r.ntor_onion_key.is_some())
                .collect();
            candidates
                .choose(&mut OsRng)
                .copied()
                .cloned()
                .ok_or_else(|| {
                    TorError::RendezvousFailed("no rendezvous candidates".into())
                })?
        };

        let rend_circuit = self
            .factory
            .build_circuit_to(&rend_relay, CircuitPurpose::Rendezvous)
            .await?;
        let mut rendezvous =
            RendezvousPoint::establish(rend_circuit, rend_relay).await?;

        let intro_relay = resolve_intro_relay(consensus, intro)?;
        let intro_circuit = self
            .factory
            .build_circuit_to(&intro_relay, CircuitPurpose::Introduction)
            .await?;

        let handshake = HsNtorClient::new(intro, subcred);
        let introduce1 = handshake.build_introduce1(&rendezvous)?;
        let intro_result = introduce(&intro_circuit, introduce1).await;
        intro_circuit.close().await;
        intro_result?;

        rendezvous.await_rendezvous2(handshake).await?;
        Ok(rendezvous.circuit)
    }
}

/// Turn an introduction point into a dialable relay record: prefer the
/// consensus entry named by its legacy identity, falling back to a
/// record synthesized from the link specifiers.
fn resolve_intro_relay(consensus: &Consensus, intro: &IntroPoint) -> Result<Relay> {
    if let Some(legacy) = intro.legacy_id() {
        let fingerprint = hex::encode_upper(legacy);
        if let Some(relay) = consensus.relay_by_fingerprint(&fingerprint) {
            let mut relay = relay.clone();
            // The descriptor's copy of the ntor key is authoritative for
            // the introduction.
            relay.ntor_onion_key = Some(intro.onion_key);
            return Ok(relay);
        }
    }

    let (address, or_port) = intro.ipv4_endpoint().ok_or_else(|| {
        TorError::IntroductionFailed("intro point has no IPv4 link specifier".into())
    })?;
    let fingerprint = intro
        .legacy_id()
        .map(hex::encode_upper)
        .ok_or_else(|| {
            TorError::IntroductionFailed("intro point has no identity specifier".into())
        })?;

    Ok(Relay {
        nickname: "intro-point".into(),
        fingerprint,
        address: address.into(),
        or_port,
        dir_port: None,
        flags: RelayFlags {
            running: true,
            valid: true,
            ..Default::default()
        },
        published: 0,
        identity_ed25519: None,
        ntor_onion_key: Some(intro.onion_key),
        bandwidth: 0,
        exit_policy: None,
    })
}
