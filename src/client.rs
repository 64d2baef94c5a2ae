//! Client orchestrator
//!
//! Wires the subsystems together: bootstrap fetches the directory and
//! loads guard state, `run` serves SOCKS connections with a warm circuit
//! pool behind them, and shutdown tears everything down within a bounded
//! grace period.

use crate::config::Config;
use crate::error::{Result, TorError};
use crate::events::{Event, EventPublisher};
use crate::guards::GuardStore;
use crate::hs::HsClient;
use crate::path::{Path, PathSelector};
use crate::pool::{CircuitFactory, CircuitPool, PoolConfig};
use crate::protocol::circuit::{Circuit, CircuitPurpose, PendingCircuit};
use crate::protocol::consensus::Consensus;
use crate::protocol::directory::DirectoryClient;
use crate::protocol::link::LinkConnection;
use crate::protocol::relay::Relay;
use crate::retry::{CircuitBreaker, RetryPolicy};
use crate::socks::{handle_socks_conn, SocksContext};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Shutdown grace period for in-flight SOCKS sessions.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Maintenance sweep interval.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// How often the consensus snapshot is refreshed.
const DIRECTORY_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Global bandwidth counters. Failed streams still count their partial
/// transfer, so accounting happens at relay time, not at teardown.
#[derive(Default)]
pub struct Bandwidth {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl Bandwidth {
    pub fn add_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    /// (bytes_read, bytes_written)
    pub fn totals(&self) -> (u64, u64) {
        (
            self.bytes_read.load(Ordering::Relaxed),
            self.bytes_written.load(Ordering::Relaxed),
        )
    }
}

/// The current consensus snapshot, replaced atomically on refresh.
pub struct NetworkView {
    consensus: StdRwLock<Arc<Consensus>>,
}

impl NetworkView {
    pub fn new(consensus: Arc<Consensus>) -> Self {
        Self {
            consensus: StdRwLock::new(consensus),
        }
    }

    pub fn consensus(&self) -> Arc<Consensus> {
        Arc::clone(&self.consensus.read().expect("netview lock poisoned"))
    }

    pub fn replace(&self, consensus: Arc<Consensus>) {
        *self.consensus.write().expect("netview lock poisoned") = consensus;
    }
}

/// Builds circuits from the current consensus and the guard set.
struct ClientCircuitFactory {
    netview: Arc<NetworkView>,
    guards: Arc<GuardStore>,
    events: EventPublisher,
    handshake_timeout: Duration,
    retry: RetryPolicy,
}

impl ClientCircuitFactory {
    /// Drive a three-hop build over a selected path.
    async fn build_over_path(
        &self,
        path: &Path,
        purpose: CircuitPurpose,
    ) -> Result<Arc<Circuit>> {
        if self.guards.note_guard(&path.guard) {
            self.events.publish(Event::Guard {
                fingerprint: path.guard.fingerprint.clone(),
                status: "NEW",
            });
            self.guards.save().await?;
        }

        let link = LinkConnection::connect(
            path.guard.socket_addr(),
            self.handshake_timeout,
            path.guard.fingerprint_bytes(),
        )
        .await?;
        self.events.publish(Event::OrConn {
            peer: path.guard.socket_addr().to_string(),
            status: "CONNECTED",
        });

        let mut pending = PendingCircuit::create(link, &path.guard).await?;
        pending.extend(&path.middle).await?;
        pending.extend(&path.exit).await?;
        let circuit = pending.into_circuit(purpose)?;

        // First completed circuit through a guard confirms it.
        if self.guards.confirm(&path.guard.fingerprint) {
            self.events.publish(Event::Guard {
                fingerprint: path.guard.fingerprint.clone(),
                status: "CONFIRMED",
            });
            self.guards.save().await?;
        }

        self.events.publish(Event::Circuit {
            id: circuit.id(),
            status: "BUILT",
            path: path.fingerprints().iter().map(|s| s.to_string()).collect(),
        });
        log::info!(
            "circuit {} built: {} -> {} -> {}",
            circuit.id(),
            path.guard.nickname,
            path.middle.nickname,
            path.exit.nickname
        );
        Ok(circuit)
    }

    fn guard_hint(&self) -> Option<String> {
        self.guards.preferred().map(|g| g.fingerprint)
    }
}

#[async_trait]
impl CircuitFactory for ClientCircuitFactory {
    async fn build_circuit(&self, purpose: CircuitPurpose) -> Result<Arc<Circuit>> {
        // A failed attempt re-selects the path, so retries land on
        // different relays.
        self.retry
            .run(|_| async move {
                let selector = PathSelector::new(self.netview.consensus());
                let path = selector.select_path(self.guard_hint().as_deref(), None)?;
                self.build_over_path(&path, purpose).await
            })
            .await
    }

    async fn build_circuit_to(
        &self,
        last: &Relay,
        purpose: CircuitPurpose,
    ) -> Result<Arc<Circuit>> {
        self.retry
            .run(|_| async move {
                let selector = PathSelector::new(self.netview.consensus());
                let path =
                    selector.select_path_ending_at(last, self.guard_hint().as_deref())?;
                self.build_over_path(&path, purpose).await
            })
            .await
    }
}

/// The assembled client.
pub struct TorClient {
    config: Config,
    events: EventPublisher,
    netview: Arc<NetworkView>,
    guards: Arc<GuardStore>,
    pool: Arc<CircuitPool>,
    factory: Arc<dyn CircuitFactory>,
    hs: Arc<HsClient>,
    bandwidth: Arc<Bandwidth>,
    directory_breaker: CircuitBreaker,
    active_sessions: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
}

impl TorClient {
    /// Validate the configuration, load persistent state, and fetch the
    /// initial consensus.
    pub async fn bootstrap(config: Config) -> Result<Self> {
        config.validate()?;
        log::info!("bootstrapping (data dir {})", config.data_directory.display());

        let events = EventPublisher::default();
        let guards = Arc::new(GuardStore::load(&config.data_directory).await?);

        let directory_breaker = CircuitBreaker::default();
        if !directory_breaker.try_acquire() {
            return Err(TorError::NoDirectory);
        }
        let directory = DirectoryClient::new(config.directory_timeout());
        let consensus = match directory.fetch_consensus().await {
            Ok(consensus) => {
                directory_breaker.on_success();
                consensus
            }
            Err(e) => {
                directory_breaker.on_failure();
                return Err(e);
            }
        };

        events.publish(Event::NetworkStatus {
            relay_count: consensus.relays.len(),
        });
        events.publish(Event::NewDescriptors {
            count: consensus
                .relays
                .iter()
                .filter(|r| r.ntor_onion_key.is_some())
                .count(),
        });

        let netview = Arc::new(NetworkView::new(Arc::new(consensus)));

        let factory: Arc<dyn CircuitFactory> = Arc::new(ClientCircuitFactory {
            netview: Arc::clone(&netview),
            guards: Arc::clone(&guards),
            events: events.clone(),
            handshake_timeout: config.handshake_timeout(),
            retry: RetryPolicy::default(),
        });

        let pool = Arc::new(CircuitPool::new(
            PoolConfig {
                min_circuits: config.circuit_pool_min,
                max_circuits: config.circuit_pool_max,
                max_dirtiness: config.max_circuit_dirtiness(),
                build_timeout: config.circuit_build_timeout(),
                prebuild: config.enable_circuit_prebuilding,
                ..Default::default()
            },
            events.clone(),
        ));

        let hs = Arc::new(HsClient::new(Arc::clone(&factory)));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            events,
            netview,
            guards,
            pool,
            factory,
            hs,
            bandwidth: Arc::new(Bandwidth::default()),
            directory_breaker,
            active_sessions: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        })
    }

    /// Subscribe to lifecycle events.
    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// Global byte counters.
    pub fn bandwidth(&self) -> (u64, u64) {
        self.bandwidth.totals()
    }

    /// Current pool statistics.
    pub fn pool_stats(&self) -> crate::pool::PoolStats {
        self.pool.stats()
    }

    /// Current consensus snapshot.
    pub fn consensus(&self) -> Arc<Consensus> {
        self.netview.consensus()
    }

    /// Serve until `shutdown` is called.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let bind = format!("127.0.0.1:{}", self.config.socks_port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| TorError::InvalidConfig(format!("bind {}: {}", bind, e)))?;
        log::info!("SOCKS5 listening on {}", bind);

        // Background prebuilder.
        tokio::spawn(Arc::clone(&self.pool).run_prebuilder(
            Arc::clone(&self.factory),
            self.shutdown_tx.subscribe(),
        ));

        // Maintenance: dirtiness sweep, bandwidth reporting, and the
        // periodic consensus refresh.
        {
            let client = Arc::clone(self);
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
                let mut refresh = tokio::time::interval(DIRECTORY_REFRESH_INTERVAL);
                refresh.tick().await; // skip the immediate first tick
                loop {
                    tokio::select! {
                        _ = sweep.tick() => {
                            client.pool.sweep().await;
                            let (read, written) = client.bandwidth.totals();
                            client.events.publish(Event::Bandwidth {
                                bytes_read: read,
                                bytes_written: written,
                            });
                        }
                        _ = refresh.tick() => {
                            if let Err(e) = client.refresh_directory().await {
                                log::warn!("consensus refresh failed: {}", e);
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            });
        }

        let ctx = Arc::new(SocksContext {
            policy: self.config.isolation_policy(),
            pool: Arc::clone(&self.pool),
            factory: Arc::clone(&self.factory),
            hs: Arc::clone(&self.hs),
            netview: Arc::clone(&self.netview),
            bandwidth: Arc::clone(&self.bandwidth),
            events: self.events.clone(),
        });

        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (tcp, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("accept failed: {}", e);
                            continue;
                        }
                    };

                    let active = self.active_sessions.load(Ordering::SeqCst);
                    if active >= self.config.max_socks_sessions {
                        log::warn!("dropping {}: {} sessions active", peer, active);
                        continue;
                    }

                    self.active_sessions.fetch_add(1, Ordering::SeqCst);
                    let ctx = Arc::clone(&ctx);
                    let sessions = Arc::clone(&self.active_sessions);
                    let session_shutdown = self.shutdown_tx.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_socks_conn(ctx, tcp, peer, session_shutdown).await
                        {
                            log::debug!("session {} ended: {}", peer, e);
                        }
                        sessions.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("accept loop stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Refresh the consensus snapshot (atomic replacement).
    pub async fn refresh_directory(&self) -> Result<()> {
        if !self.directory_breaker.try_acquire() {
            return Err(TorError::NoDirectory);
        }
        let directory = DirectoryClient::new(self.config.directory_timeout());
        match directory.fetch_consensus().await {
            Ok(consensus) => {
                self.directory_breaker.on_success();
                self.events.publish(Event::NetworkStatus {
                    relay_count: consensus.relays.len(),
                });
                self.netview.replace(Arc::new(consensus));
                Ok(())
            }
            Err(e) => {
                self.directory_breaker.on_failure();
                Err(e)
            }
        }
    }

    /// Cancel sessions, close circuits (best-effort DESTROY), and persist
    /// guard state, bounded by the grace period.
    pub async fn shutdown(&self) {
        log::info!("shutting down");
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.active_sessions.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let leftover = self.active_sessions.load(Ordering::SeqCst);
        if leftover > 0 {
            log::warn!("{} sessions still active at grace deadline", leftover);
        }

        self.pool.close_all().await;
        if let Err(e) = self.guards.save().await {
            log::warn!("saving guards on shutdown: {}", e);
        }
        log::info!("shutdown complete");
    }
}
