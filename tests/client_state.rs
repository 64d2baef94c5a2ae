//! Client-state behavior tests: guard persistence, isolation
//! equivalence, flow-control windows, breaker transitions, and config
//! validation.

use std::time::Duration;
use tor_client::config::Config;
use tor_client::error::TorError;
use tor_client::guards::{GuardStore, MAX_GUARDS};
use tor_client::isolation::{IsolationLevel, IsolationPolicy, RequestAttrs};
use tor_client::protocol::flow_control::{CircuitFlowControl, StreamFlowControl};
use tor_client::protocol::relay::{Relay, RelayFlags};
use tor_client::retry::{BreakerConfig, BreakerState, CircuitBreaker};

fn guard_relay(tag: u8) -> Relay {
    Relay {
        nickname: format!("guard{}", tag),
        fingerprint: hex::encode_upper([tag; 20]),
        address: "10.0.0.1".parse().unwrap(),
        or_port: 9001,
        dir_port: None,
        flags: RelayFlags::from_string("Guard Running Stable Valid"),
        published: 0,
        identity_ed25519: Some([tag; 32]),
        ntor_onion_key: Some([tag; 32]),
        bandwidth: 1000,
        exit_policy: None,
    }
}

#[tokio::test]
async fn guard_set_caps_entries_and_survives_reload() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = GuardStore::load(dir.path()).await.unwrap();
        // Add A, B, C, D; D last. The oldest unconfirmed guard (A) is
        // displaced when D arrives.
        for tag in [0xA0, 0xB0, 0xC0, 0xD0] {
            store.note_guard(&guard_relay(tag));
        }
        assert!(store.len() <= MAX_GUARDS);
        assert!(!store
            .entries()
            .iter()
            .any(|g| g.fingerprint == guard_relay(0xA0).fingerprint));

        // Confirm one surviving guard and persist.
        assert!(store.confirm(&guard_relay(0xB0).fingerprint));
        store.save().await.unwrap();
    }

    let reloaded = GuardStore::load(dir.path()).await.unwrap();
    assert!(reloaded.len() <= MAX_GUARDS);
    let confirmed: Vec<_> = reloaded
        .entries()
        .into_iter()
        .filter(|g| g.confirmed)
        .collect();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].fingerprint, guard_relay(0xB0).fingerprint);

    // Save -> load -> save is byte-identical.
    let path = dir.path().join("guard_state.json");
    let first = std::fs::read(&path).unwrap();
    reloaded.save().await.unwrap();
    let second = std::fs::read(&path).unwrap();
    assert_eq!(first, second);
}

#[test]
fn isolation_destination_policy_dispatch() {
    let policy = IsolationPolicy {
        level: IsolationLevel::Destination,
        ..Default::default()
    };

    let com_a = policy.key_for(&RequestAttrs {
        host: "example.com",
        port: 80,
        ..Default::default()
    });
    let com_b = policy.key_for(&RequestAttrs {
        host: "example.com",
        port: 80,
        ..Default::default()
    });
    let org = policy.key_for(&RequestAttrs {
        host: "example.org",
        port: 80,
        ..Default::default()
    });

    // Two connections to the same destination share an equivalence
    // class (and hence a circuit); different destinations never do.
    assert_eq!(com_a, com_b);
    assert_ne!(com_a, org);

    // Symmetry of equality.
    assert_eq!(com_a == org, org == com_a);
}

#[test]
fn windows_start_at_500_and_gate_sending() {
    let mut circuit = CircuitFlowControl::new();
    let mut stream = StreamFlowControl::new();

    assert_eq!(circuit.package_window, 500);
    assert_eq!(stream.package_window, 500);

    for _ in 0..500 {
        circuit.on_package().unwrap();
        stream.on_package().unwrap();
    }
    assert!(!circuit.can_package());
    assert!(!stream.can_package());

    circuit.on_sendme();
    stream.on_sendme();
    assert_eq!(circuit.package_window, 100);
    assert_eq!(stream.package_window, 50);
}

#[test]
fn breaker_opens_exactly_at_max_failures() {
    let breaker = CircuitBreaker::new(BreakerConfig {
        max_failures: 5,
        timeout: Duration::from_secs(60),
        ..Default::default()
    });

    for i in 1..=5 {
        assert!(breaker.try_acquire(), "request {} must be admitted", i);
        breaker.on_failure();
        if i < 5 {
            assert_eq!(
                breaker.state(),
                BreakerState::Closed,
                "must not open before failure 5 (at {})",
                i
            );
        }
    }
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.try_acquire());
}

#[test]
fn config_rejects_out_of_range_timeouts() {
    let mut config = Config::default();
    config.validate().unwrap();

    config.handshake_timeout_secs = 4;
    assert!(matches!(
        config.validate(),
        Err(TorError::InvalidConfig(_))
    ));

    config.handshake_timeout_secs = 61;
    assert!(matches!(
        config.validate(),
        Err(TorError::InvalidConfig(_))
    ));
}
