//! Circuit pool
//!
//! Keeps between `min` and `max` open circuits warm so that a SOCKS
//! request rarely waits on a three-hop build. A background prebuilder
//! tops the pool up; a maintenance sweep drops closed circuits and
//! retires any whose age exceeds `MaxCircuitDirtiness`.
//!
//! Isolation: a circuit is bound to the isolation key of the first
//! stream dispatched on it; later requests reuse it only with an equal
//! key. When several circuits match, the youngest wins.

use crate::error::{Result, TorError};
use crate::events::{Event, EventPublisher};
use crate::isolation::IsolationKey;
use crate::protocol::circuit::{Circuit, CircuitPurpose};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::watch;

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Keep at least this many open circuits warm
    pub min_circuits: usize,

    /// Never hold more than this many circuits
    pub max_circuits: usize,

    /// Age past which a circuit takes no new streams
    pub max_dirtiness: Duration,

    /// Prebuilder wake interval
    pub prebuild_interval: Duration,

    /// Deadline for one circuit build
    pub build_timeout: Duration,

    /// Whether the prebuilder runs at all
    pub prebuild: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_circuits: 2,
            max_circuits: 10,
            max_dirtiness: Duration::from_secs(10 * 60),
            prebuild_interval: Duration::from_secs(10),
            build_timeout: Duration::from_secs(30),
            prebuild: true,
        }
    }
}

/// Anything that can produce a fresh circuit.
#[async_trait]
pub trait CircuitFactory: Send + Sync {
    /// Build a circuit with a freely chosen exit.
    async fn build_circuit(&self, purpose: CircuitPurpose) -> Result<Arc<Circuit>>;

    /// Build a circuit whose final hop is `last` (HSDir, introduction,
    /// and rendezvous circuits pin their terminus).
    async fn build_circuit_to(
        &self,
        last: &crate::protocol::relay::Relay,
        purpose: CircuitPurpose,
    ) -> Result<Arc<Circuit>>;
}

struct PooledCircuit {
    circuit: Arc<Circuit>,
    isolation: Option<IsolationKey>,
}

/// Pool statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub open_circuits: usize,
    pub hits: u64,
    pub misses: u64,
    pub built: u64,
    pub expired: u64,
}

/// The warm circuit pool.
pub struct CircuitPool {
    config: PoolConfig,
    inner: StdMutex<Vec<PooledCircuit>>,
    stats: StdMutex<PoolStats>,
    build_in_flight: AtomicBool,
    events: EventPublisher,
}

impl CircuitPool {
    pub fn new(config: PoolConfig, events: EventPublisher) -> Self {
        Self {
            config,
            inner: StdMutex::new(Vec::new()),
            stats: StdMutex::new(PoolStats::default()),
            build_in_flight: AtomicBool::new(false),
            events,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Open circuits currently held.
    pub fn open_count(&self) -> usize {
        self.inner
            .lock()
            .expect("pool lock poisoned")
            .iter()
            .filter(|p| p.circuit.is_open())
            .count()
    }

    /// Take or share a circuit compatible with `key`.
    ///
    /// Only Open circuits younger than `max_dirtiness` qualify. An
    /// unbound circuit is bound to `key` on first use. Among multiple
    /// matches the youngest is preferred.
    pub fn get(&self, key: &IsolationKey) -> Option<Arc<Circuit>> {
        let mut inner = self.inner.lock().expect("pool lock poisoned");

        let mut best: Option<usize> = None;
        for (idx, pooled) in inner.iter().enumerate() {
            if !pooled.circuit.is_open() {
                continue;
            }
            if pooled.circuit.age() > self.config.max_dirtiness {
                continue;
            }
            let compatible = match &pooled.isolation {
                Some(existing) => existing == key,
                None => true,
            };
            if !compatible {
                continue;
            }
            let better = match best {
                Some(current) => pooled.circuit.age() < inner[current].circuit.age(),
                None => true,
            };
            if better {
                best = Some(idx);
            }
        }

        let mut stats = self.stats.lock().expect("stats lock poisoned");
        match best {
            Some(idx) => {
                inner[idx].isolation = Some(key.clone());
                stats.hits += 1;
                Some(Arc::clone(&inner[idx].circuit))
            }
            None => {
                stats.misses += 1;
                None
            }
        }
    }

    /// Offer a circuit to the cache. Returns false when the pool is at
    /// capacity and the circuit was not admitted; the circuit itself is
    /// never touched, so a caller still using it keeps a live circuit
    /// either way.
    pub fn admit(&self, circuit: &Arc<Circuit>, isolation: Option<IsolationKey>) -> bool {
        let accepted = {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            if inner.len() >= self.config.max_circuits {
                false
            } else {
                inner.push(PooledCircuit {
                    circuit: Arc::clone(circuit),
                    isolation,
                });
                true
            }
        };

        if accepted {
            let open = self.open_count();
            let mut stats = self.stats.lock().expect("stats lock poisoned");
            stats.open_circuits = open;
        }
        accepted
    }

    /// Return a circuit nobody is using. Kept when still Open and the
    /// pool has room; otherwise the circuit is released (closed).
    pub async fn put(&self, circuit: Arc<Circuit>, isolation: Option<IsolationKey>) {
        if circuit.is_open() && self.admit(&circuit, isolation) {
            return;
        }
        log::debug!("pool at capacity, releasing circuit {}", circuit.id());
        circuit.close().await;
    }

    fn record_build(&self) {
        self.stats.lock().expect("stats lock poisoned").built += 1;
    }

    /// Maintenance: drop circuits that are no longer open and close any
    /// older than `max_dirtiness`.
    pub async fn sweep(&self) {
        let retired: Vec<Arc<Circuit>> = {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            let mut retired = Vec::new();
            inner.retain(|pooled| {
                if !pooled.circuit.is_open() {
                    retired.push(Arc::clone(&pooled.circuit));
                    return false;
                }
                if pooled.circuit.age() > self.config.max_dirtiness {
                    retired.push(Arc::clone(&pooled.circuit));
                    return false;
                }
                true
            });
            retired
        };

        if !retired.is_empty() {
            let open = self.open_count();
            {
                let mut stats = self.stats.lock().expect("stats lock poisoned");
                stats.expired += retired.len() as u64;
                stats.open_circuits = open;
            }

            for circuit in retired {
                self.events.publish(Event::Circuit {
                    id: circuit.id(),
                    status: "CLOSED",
                    path: Vec::new(),
                });
                circuit.close().await;
            }
        }
    }

    /// Close everything (shutdown path).
    pub async fn close_all(&self) {
        let drained: Vec<PooledCircuit> = {
            let mut inner = self.inner.lock().expect("pool lock poisoned");
            inner.drain(..).collect()
        };
        for pooled in drained {
            pooled.circuit.close().await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = self.stats.lock().expect("stats lock poisoned").clone();
        stats.open_circuits = self.open_count();
        stats
    }

    /// Run the prebuild loop until `shutdown` flips. One build at a time;
    /// the build itself runs without the pool lock.
    pub async fn run_prebuilder(
        self: Arc<Self>,
        factory: Arc<dyn CircuitFactory>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if !self.config.prebuild {
            return;
        }
        let mut ticker = tokio::time::interval(self.config.prebuild_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::debug!("prebuilder stopping");
                        return;
                    }
                }
            }

            self.sweep().await;

            if self.open_count() >= self.config.min_circuits {
                continue;
            }
            if self.build_in_flight.swap(true, Ordering::SeqCst) {
                continue;
            }

            let result = tokio::time::timeout(
                self.config.build_timeout,
                factory.build_circuit(CircuitPurpose::General),
            )
            .await;
            self.build_in_flight.store(false, Ordering::SeqCst);

            match result {
                Ok(Ok(circuit)) => {
                    log::info!("prebuilt circuit {}", circuit.id());
                    self.record_build();
                    self.put(circuit, None).await;
                }
                Ok(Err(e)) => log::warn!("prebuild failed: {}", e),
                Err(_) => log::warn!("prebuild timed out"),
            }
        }
    }

    /// Build a circuit on demand (pool miss), bound to `key`.
    ///
    /// The caller gets the circuit back whether or not the cache had
    /// room for it; a full pool only means the circuit stays unpooled.
    pub async fn build_for(
        &self,
        factory: &Arc<dyn CircuitFactory>,
        key: &IsolationKey,
    ) -> Result<Arc<Circuit>> {
        let circuit = tokio::time::timeout(
            self.config.build_timeout,
            factory.build_circuit(CircuitPurpose::General),
        )
        .await
        .map_err(|_| TorError::Timeout("circuit build".into()))??;
        self.record_build();

        if !self.admit(&circuit, Some(key.clone())) {
            log::debug!(
                "pool at capacity, circuit {} stays unpooled",
                circuit.id()
            );
        }
        Ok(circuit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::{IsolationLevel, IsolationPolicy, RequestAttrs};
    use crate::protocol::relay::Relay;
    use tokio::net::TcpStream;
    use tokio::sync::Mutex as TokioMutex;

    /// Hands out loopback-backed circuits, keeping their peer sockets
    /// alive so the circuits stay Open for the duration of a test.
    struct LoopbackFactory {
        peers: TokioMutex<Vec<TcpStream>>,
    }

    impl LoopbackFactory {
        fn new() -> Arc<dyn CircuitFactory> {
            Arc::new(Self {
                peers: TokioMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CircuitFactory for LoopbackFactory {
        async fn build_circuit(&self, _purpose: CircuitPurpose) -> Result<Arc<Circuit>> {
            let (circuit, peer) = Circuit::open_for_tests().await;
            self.peers.lock().await.push(peer);
            Ok(circuit)
        }

        async fn build_circuit_to(
            &self,
            _last: &Relay,
            purpose: CircuitPurpose,
        ) -> Result<Arc<Circuit>> {
            self.build_circuit(purpose).await
        }
    }

    fn small_pool(max_circuits: usize) -> CircuitPool {
        CircuitPool::new(
            PoolConfig {
                min_circuits: 0,
                max_circuits,
                ..Default::default()
            },
            EventPublisher::default(),
        )
    }

    fn destination_key(host: &str) -> IsolationKey {
        let policy = IsolationPolicy {
            level: IsolationLevel::Destination,
            ..Default::default()
        };
        policy.key_for(&RequestAttrs {
            host,
            port: 80,
            ..Default::default()
        })
    }

    #[test]
    fn test_pool_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.min_circuits, 2);
        assert_eq!(config.max_circuits, 10);
        assert_eq!(config.max_dirtiness, Duration::from_secs(600));
    }

    #[test]
    fn test_empty_pool_misses() {
        let pool = CircuitPool::new(PoolConfig::default(), EventPublisher::default());
        assert!(pool.get(&IsolationKey::any()).is_none());
        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.open_circuits, 0);
    }

    #[tokio::test]
    async fn test_build_for_at_capacity_returns_open_circuit() {
        let pool = small_pool(2);
        let factory = LoopbackFactory::new();

        // Grow the cache to its cap.
        for _ in 0..2 {
            let circuit = factory
                .build_circuit(CircuitPurpose::General)
                .await
                .unwrap();
            assert!(pool.admit(&circuit, None));
        }
        assert_eq!(pool.open_count(), 2);

        // An on-demand build while the pool is full must still hand the
        // caller a live circuit; it just stays out of the cache.
        let circuit = pool
            .build_for(&factory, &IsolationKey::any())
            .await
            .unwrap();
        assert!(circuit.is_open());
        assert_eq!(pool.open_count(), 2);
        assert_eq!(pool.stats().built, 1);

        // The unpooled circuit is actually usable: a stream can still be
        // registered on it.
        let (stream_id, _rx) = circuit.register_stream().await.unwrap();
        assert_ne!(stream_id, 0);
    }

    #[tokio::test]
    async fn test_admit_refuses_beyond_capacity_without_closing() {
        let pool = small_pool(1);
        let factory = LoopbackFactory::new();

        let first = factory
            .build_circuit(CircuitPurpose::General)
            .await
            .unwrap();
        assert!(pool.admit(&first, None));

        let second = factory
            .build_circuit(CircuitPurpose::General)
            .await
            .unwrap();
        assert!(!pool.admit(&second, None));
        assert!(second.is_open(), "admit must never close a rejected circuit");
        assert_eq!(pool.open_count(), 1);
    }

    #[tokio::test]
    async fn test_put_releases_only_at_capacity() {
        let pool = small_pool(1);
        let factory = LoopbackFactory::new();

        let kept = factory
            .build_circuit(CircuitPurpose::General)
            .await
            .unwrap();
        pool.put(Arc::clone(&kept), None).await;
        assert!(kept.is_open());
        assert_eq!(pool.open_count(), 1);

        // A circuit returned after use that does not fit is released.
        let extra = factory
            .build_circuit(CircuitPurpose::General)
            .await
            .unwrap();
        pool.put(Arc::clone(&extra), None).await;
        assert!(!extra.is_open());
        assert!(kept.is_open());
        assert_eq!(pool.open_count(), 1);
    }

    #[tokio::test]
    async fn test_build_for_binds_isolation_key() {
        let pool = small_pool(4);
        let factory = LoopbackFactory::new();

        let com = destination_key("example.com");
        let org = destination_key("example.org");

        let circuit = pool.build_for(&factory, &com).await.unwrap();
        let reused = pool.get(&com).expect("matching key reuses the circuit");
        assert!(Arc::ptr_eq(&reused, &circuit));

        // A different destination never shares it.
        assert!(pool.get(&org).is_none());
    }
}
