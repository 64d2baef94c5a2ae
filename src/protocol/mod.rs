//! Tor wire protocol implementation
//!
//! This module implements the protocol proper:
//! - Cell framing and the link-layer session (TLS, VERSIONS, NETINFO)
//! - Circuit construction (ntor handshakes, CREATE2/EXTEND2)
//! - Onion-layer cryptography and running digests
//! - Stream multiplexing and SENDME flow control
//! - Directory consensus fetching and parsing

pub mod cell;
pub mod circuit;
pub mod consensus;
pub mod crypto;
pub mod directory;
pub mod flow_control;
pub mod link;
pub mod ntor;
pub mod relay;
pub mod stream;

pub use cell::{Cell, CellCommand, CellFormat, RelayCell, RelayCommand};
pub use circuit::{Circuit, CircuitPurpose, CircuitState, PendingCircuit};
pub use consensus::{Consensus, ConsensusParser};
pub use crypto::CircuitKeys;
pub use directory::{DirectoryClient, DIRECTORY_AUTHORITIES};
pub use flow_control::{CircuitFlowControl, StreamFlowControl};
pub use link::{LinkConnection, LinkState};
pub use ntor::NtorHandshake;
pub use relay::{Relay, RelayFlags};
pub use stream::{StreamEvent, TorStream};
