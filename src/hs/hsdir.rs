//! HSDir hash ring
//!
//! Relays carrying the HSDir flag form a ring ordered by an index hashed
//! from their Ed25519 identity and the consensus shared-random value.
//! A descriptor is stored at (and fetched from) the first
//! `hsdir_spread_fetch` relays clockwise of each replica's hs_index.

use crate::hs::blinding::{hs_index, hsdir_index, TimePeriod};
use crate::protocol::consensus::Consensus;
use crate::protocol::relay::Relay;

/// Descriptor replicas on the ring.
pub const HSDIR_N_REPLICAS: u64 = 2;

/// Relays fetched per replica.
pub const HSDIR_SPREAD_FETCH: usize = 3;

/// The ordered ring for one time period.
pub struct HsDirRing {
    /// (ring index, relay), sorted ascending by index
    nodes: Vec<([u8; 32], Relay)>,
}

impl HsDirRing {
    /// Build the ring from a consensus snapshot.
    ///
    /// Only HSDir relays with a known Ed25519 identity can take a ring
    /// position. Uses the current shared-random value, falling back to
    /// the previous one, then to all-zero (degraded but deterministic).
    pub fn from_consensus(consensus: &Consensus, period: TimePeriod) -> Self {
        let shared_random = consensus
            .shared_rand_current
            .or(consensus.shared_rand_previous)
            .unwrap_or([0u8; 32]);

        let mut nodes: Vec<([u8; 32], Relay)> = consensus
            .relays
            .iter()
            .filter(|r| r.is_hsdir())
            .filter_map(|r| {
                let identity = r.identity_ed25519?;
                Some((hsdir_index(&identity, &shared_random, period), r.clone()))
            })
            .collect();
        nodes.sort_by(|a, b| a.0.cmp(&b.0));

        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The relays responsible for `blinded` across all replicas, fetch
    /// order, deduplicated by fingerprint.
    pub fn responsible_relays(&self, blinded: &[u8; 32], period: TimePeriod) -> Vec<Relay> {
        let mut out: Vec<Relay> = Vec::new();

        for replica in 1..=HSDIR_N_REPLICAS {
            let target = hs_index(blinded, replica, period);
            for relay in self.walk_from(&target, HSDIR_SPREAD_FETCH) {
                if !out.iter().any(|r| r.fingerprint == relay.fingerprint) {
                    out.push(relay);
                }
            }
        }
        out
    }

    /// `count` relays at or clockwise of `target`, wrapping at the end.
    fn walk_from(&self, target: &[u8; 32], count: usize) -> Vec<Relay> {
        if self.nodes.is_empty() {
            return Vec::new();
        }

        let start = self
            .nodes
            .partition_point(|(index, _)| index < target)
            % self.nodes.len();

        let take = count.min(self.nodes.len());
        (0..take)
            .map(|i| self.nodes[(start + i) % self.nodes.len()].1.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::relay::RelayFlags;

    fn hsdir(tag: u8) -> Relay {
        Relay {
            nickname: format!("hsdir{}", tag),
            fingerprint: hex::encode_upper([tag; 20]),
            address: "10.0.0.1".parse().unwrap(),
            or_port: 9001,
            dir_port: None,
            flags: RelayFlags::from_string("HSDir Running Valid"),
            published: 0,
            identity_ed25519: Some([tag; 32]),
            ntor_onion_key: Some([tag; 32]),
            bandwidth: 1000,
            exit_policy: None,
        }
    }

    fn period() -> TimePeriod {
        TimePeriod {
            number: 19500,
            length_minutes: 1440,
        }
    }

    fn test_consensus(n: u8) -> Consensus {
        Consensus {
            relays: (1..=n).map(hsdir).collect(),
            shared_rand_current: Some([0x42u8; 32]),
            ..Default::default()
        }
    }

    #[test]
    fn test_ring_is_sorted() {
        let ring = HsDirRing::from_consensus(&test_consensus(12), period());
        assert_eq!(ring.len(), 12);
        for pair in ring.nodes.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
    }

    #[test]
    fn test_relays_without_ed25519_excluded() {
        let mut consensus = test_consensus(4);
        consensus.relays[0].identity_ed25519 = None;
        let ring = HsDirRing::from_consensus(&consensus, period());
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_responsible_relays_bounded_and_unique() {
        let ring = HsDirRing::from_consensus(&test_consensus(12), period());
        let relays = ring.responsible_relays(&[7u8; 32], period());

        assert!(!relays.is_empty());
        assert!(relays.len() <= HSDIR_N_REPLICAS as usize * HSDIR_SPREAD_FETCH);

        let mut fingerprints: Vec<_> = relays.iter().map(|r| &r.fingerprint).collect();
        fingerprints.sort();
        fingerprints.dedup();
        assert_eq!(fingerprints.len(), relays.len());
    }

    #[test]
    fn test_selection_is_deterministic() {
        let ring = HsDirRing::from_consensus(&test_consensus(12), period());
        let a = ring.responsible_relays(&[7u8; 32], period());
        let b = ring.responsible_relays(&[7u8; 32], period());
        let fps = |v: &[Relay]| v.iter().map(|r| r.fingerprint.clone()).collect::<Vec<_>>();
        assert_eq!(fps(&a), fps(&b));
    }

    #[test]
    fn test_small_ring_wraps() {
        let ring = HsDirRing::from_consensus(&test_consensus(2), period());
        let relays = ring.responsible_relays(&[0xEEu8; 32], period());
        // With two nodes the spread covers the whole ring, once.
        assert_eq!(relays.len(), 2);
    }

    #[test]
    fn test_empty_ring() {
        let ring = HsDirRing::from_consensus(&Consensus::default(), period());
        assert!(ring.is_empty());
        assert!(ring
            .responsible_relays(&[1u8; 32], period())
            .is_empty());
    }
}
