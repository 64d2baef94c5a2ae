//! Path selection
//!
//! Chooses the guard, middle, and exit for a new circuit from a consensus
//! snapshot. Selection is read-only with respect to the snapshot and uses
//! OS randomness. Constraints:
//! - every hop is usable (Running + Valid) and carries an ntor key
//! - the guard is guard-eligible, preferring the persistent guard set
//! - the exit is exit-eligible, permits the target port when one is
//!   known, and differs from the guard
//! - the middle differs from both by fingerprint

use crate::error::{Result, TorError};
use crate::protocol::consensus::Consensus;
use crate::protocol::relay::Relay;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use std::sync::Arc;

/// A selected three-hop path.
#[derive(Debug, Clone)]
pub struct Path {
    pub guard: Relay,
    pub middle: Relay,
    pub exit: Relay,
}

impl Path {
    /// Hop fingerprints, guard first.
    pub fn fingerprints(&self) -> [&str; 3] {
        [
            &self.guard.fingerprint,
            &self.middle.fingerprint,
            &self.exit.fingerprint,
        ]
    }
}

/// Path selector over one consensus snapshot.
///
/// The snapshot is replaced wholesale when the directory refreshes; a
/// selector never mutates it.
pub struct PathSelector {
    consensus: Arc<Consensus>,
}

impl PathSelector {
    pub fn new(consensus: Arc<Consensus>) -> Self {
        Self { consensus }
    }

    pub fn consensus(&self) -> &Arc<Consensus> {
        &self.consensus
    }

    /// Select a full path.
    ///
    /// `guard_hint` is the fingerprint of a persistent guard to prefer;
    /// when it is absent from (or no longer usable in) the consensus a
    /// fresh guard is selected instead. `exit_port` constrains the exit's
    /// policy when known.
    pub fn select_path(&self, guard_hint: Option<&str>, exit_port: Option<u16>) -> Result<Path> {
        let guard = self.select_guard(guard_hint)?;
        let exit = self.select_exit(&guard, exit_port)?;
        let middle = self.select_middle(&[&guard.fingerprint, &exit.fingerprint])?;

        Ok(Path {
            guard,
            middle,
            exit,
        })
    }

    /// Select a path whose final hop is `last` (used for circuits that
    /// must end at an HSDir, introduction point, or rendezvous point).
    pub fn select_path_ending_at(&self, last: &Relay, guard_hint: Option<&str>) -> Result<Path> {
        if last.ntor_onion_key.is_none() {
            return Err(TorError::PathSelectionFailed(format!(
                "pinned hop {} has no ntor key",
                last.nickname
            )));
        }

        let guard = self.select_guard(guard_hint)?;
        if guard.fingerprint == last.fingerprint {
            return Err(TorError::PathSelectionFailed(
                "pinned hop equals the guard".into(),
            ));
        }
        let middle = self.select_middle(&[&guard.fingerprint, &last.fingerprint])?;

        Ok(Path {
            guard,
            middle,
            exit: last.clone(),
        })
    }

    /// The guard: the persistent one when it is still usable, otherwise a
    /// fresh guard-eligible relay.
    fn select_guard(&self, guard_hint: Option<&str>) -> Result<Relay> {
        if let Some(fingerprint) = guard_hint {
            if let Some(relay) = self.consensus.relay_by_fingerprint(fingerprint) {
                if relay.is_guard_eligible() && relay.ntor_onion_key.is_some() {
                    return Ok(relay.clone());
                }
                log::info!(
                    "persistent guard {} no longer guard-eligible, reselecting",
                    relay.nickname
                );
            }
        }

        let candidates: Vec<&Relay> = self
            .consensus
            .relays
            .iter()
            .filter(|r| r.is_guard_eligible() && r.ntor_onion_key.is_some())
            .collect();

        pick(&candidates)
            .cloned()
            .ok_or_else(|| TorError::PathSelectionFailed("no guard candidates".into()))
    }

    fn select_exit(&self, guard: &Relay, exit_port: Option<u16>) -> Result<Relay> {
        let candidates: Vec<&Relay> = self
            .consensus
            .relays
            .iter()
            .filter(|r| {
                r.is_exit_eligible()
                    && r.ntor_onion_key.is_some()
                    && r.fingerprint != guard.fingerprint
                    && exit_port.map_or(true, |p| r.allows_exit_port(p))
            })
            .collect();

        pick(&candidates)
            .cloned()
            .ok_or_else(|| TorError::PathSelectionFailed("no exit candidates".into()))
    }

    fn select_middle(&self, exclude: &[&str]) -> Result<Relay> {
        let candidates: Vec<&Relay> = self
            .consensus
            .relays
            .iter()
            .filter(|r| {
                r.is_usable()
                    && r.ntor_onion_key.is_some()
                    && !exclude.contains(&r.fingerprint.as_str())
            })
            .collect();

        pick(&candidates)
            .cloned()
            .ok_or_else(|| TorError::PathSelectionFailed("no middle candidates".into()))
    }
}

/// Uniform choice with OS randomness.
fn pick<'a>(candidates: &[&'a Relay]) -> Option<&'a Relay> {
    candidates.choose(&mut OsRng).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::relay::RelayFlags;

    fn relay(nickname: &str, tag: u8, flags: &str) -> Relay {
        Relay {
            nickname: nickname.into(),
            fingerprint: hex::encode_upper([tag; 20]),
            address: "10.0.0.1".parse().unwrap(),
            or_port: 9001,
            dir_port: None,
            flags: RelayFlags::from_string(flags),
            published: 0,
            identity_ed25519: None,
            ntor_onion_key: Some([tag; 32]),
            bandwidth: 1000,
            exit_policy: None,
        }
    }

    fn consensus(relays: Vec<Relay>) -> Arc<Consensus> {
        Arc::new(Consensus {
            relays,
            ..Default::default()
        })
    }

    #[test]
    fn test_select_path_distinct_hops() {
        let selector = PathSelector::new(consensus(vec![
            relay("g", 1, "Guard Running Stable Valid"),
            relay("m", 2, "Running Valid"),
            relay("e", 3, "Exit Running Valid"),
        ]));

        let path = selector.select_path(None, None).unwrap();
        assert_eq!(path.guard.nickname, "g");
        assert_eq!(path.middle.nickname, "m");
        assert_eq!(path.exit.nickname, "e");

        let fps = path.fingerprints();
        assert_ne!(fps[0], fps[1]);
        assert_ne!(fps[1], fps[2]);
        assert_ne!(fps[0], fps[2]);
    }

    #[test]
    fn test_no_candidates_fails() {
        let selector = PathSelector::new(consensus(vec![
            relay("g", 1, "Guard Running Stable Valid"),
            relay("m", 2, "Running Valid"),
        ]));

        let err = selector.select_path(None, None).unwrap_err();
        assert!(matches!(err, TorError::PathSelectionFailed(_)));
    }

    #[test]
    fn test_guard_hint_preferred() {
        let hinted = relay("hinted", 4, "Guard Running Stable Valid");
        let hint_fp = hinted.fingerprint.clone();
        let selector = PathSelector::new(consensus(vec![
            relay("g", 1, "Guard Running Stable Valid"),
            hinted,
            relay("m", 2, "Running Valid"),
            relay("e", 3, "Exit Running Valid"),
        ]));

        for _ in 0..8 {
            let path = selector.select_path(Some(&hint_fp), None).unwrap();
            assert_eq!(path.guard.fingerprint, hint_fp);
        }
    }

    #[test]
    fn test_stale_guard_hint_reselected() {
        let selector = PathSelector::new(consensus(vec![
            relay("g", 1, "Guard Running Stable Valid"),
            relay("m", 2, "Running Valid"),
            relay("e", 3, "Exit Running Valid"),
        ]));

        let unknown = hex::encode_upper([0xEE; 20]);
        let path = selector.select_path(Some(&unknown), None).unwrap();
        assert_eq!(path.guard.nickname, "g");
    }

    #[test]
    fn test_exit_respects_port_policy() {
        let mut open_exit = relay("open", 3, "Exit Running Valid");
        open_exit.exit_policy =
            crate::protocol::relay::ExitPolicySummary::parse("accept", "80,443");
        let mut mail_exit = relay("mail", 5, "Exit Running Valid");
        mail_exit.exit_policy = crate::protocol::relay::ExitPolicySummary::parse("accept", "25");

        let selector = PathSelector::new(consensus(vec![
            relay("g", 1, "Guard Running Stable Valid"),
            relay("m", 2, "Running Valid"),
            open_exit,
            mail_exit,
        ]));

        for _ in 0..8 {
            let path = selector.select_path(None, Some(443)).unwrap();
            assert_eq!(path.exit.nickname, "open");
        }
    }

    #[test]
    fn test_relay_without_ntor_key_excluded() {
        let mut keyless = relay("keyless", 1, "Guard Running Stable Valid");
        keyless.ntor_onion_key = None;
        let selector = PathSelector::new(consensus(vec![
            keyless,
            relay("m", 2, "Running Valid"),
            relay("e", 3, "Exit Running Valid"),
        ]));

        let err = selector.select_path(None, None).unwrap_err();
        assert!(matches!(err, TorError::PathSelectionFailed(_)));
    }

    #[test]
    fn test_pinned_last_hop() {
        let hsdir = relay("hsdir", 9, "HSDir Running Valid");
        let selector = PathSelector::new(consensus(vec![
            relay("g", 1, "Guard Running Stable Valid"),
            relay("m", 2, "Running Valid"),
            relay("e", 3, "Exit Running Valid"),
            hsdir.clone(),
        ]));

        let path = selector.select_path_ending_at(&hsdir, None).unwrap();
        assert_eq!(path.exit.fingerprint, hsdir.fingerprint);
        assert_ne!(path.guard.fingerprint, hsdir.fingerprint);
        assert_ne!(path.middle.fingerprint, hsdir.fingerprint);
    }
}
