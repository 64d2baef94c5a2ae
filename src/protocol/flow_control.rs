//! SENDME flow control
//!
//! Both the circuit and each stream carry a package window (cells we may
//! still send) and a deliver window (cells the peer may still send us).
//! Windows start at 500. A SENDME from the peer opens the package window
//! by the increment; when our deliver window drops by one increment we
//! owe the peer a SENDME.

use crate::error::{Result, TorError};

/// Circuit-level flow control
#[derive(Debug, Clone)]
pub struct CircuitFlowControl {
    /// Cells we may still package onto the circuit
    pub package_window: u16,

    /// Cells the peer may still deliver to us
    pub deliver_window: u16,
}

impl CircuitFlowControl {
    /// Initial window, both directions
    pub const INITIAL_WINDOW: u16 = 500;

    /// Window increment per circuit-level SENDME
    pub const WINDOW_INCREMENT: u16 = 100;

    pub fn new() -> Self {
        Self {
            package_window: Self::INITIAL_WINDOW,
            deliver_window: Self::INITIAL_WINDOW,
        }
    }

    /// Whether another data cell may be sent.
    pub fn can_package(&self) -> bool {
        self.package_window > 0
    }

    /// Account for one outbound data cell.
    pub fn on_package(&mut self) -> Result<()> {
        if self.package_window == 0 {
            return Err(TorError::Stream(
                "circuit package window exhausted".into(),
            ));
        }
        self.package_window -= 1;
        Ok(())
    }

    /// Account for a circuit-level SENDME from the peer.
    pub fn on_sendme(&mut self) {
        self.package_window = self.package_window.saturating_add(Self::WINDOW_INCREMENT);
    }

    /// Account for one inbound data cell. Returns true when we owe the
    /// peer a circuit-level SENDME.
    pub fn on_deliver(&mut self) -> bool {
        self.deliver_window = self.deliver_window.saturating_sub(1);
        if self.deliver_window <= Self::INITIAL_WINDOW - Self::WINDOW_INCREMENT {
            self.deliver_window += Self::WINDOW_INCREMENT;
            true
        } else {
            false
        }
    }
}

impl Default for CircuitFlowControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream-level flow control
#[derive(Debug, Clone)]
pub struct StreamFlowControl {
    /// Cells we may still package on this stream
    pub package_window: u16,

    /// Cells the peer may still deliver on this stream
    pub deliver_window: u16,
}

impl StreamFlowControl {
    /// Initial window, both directions
    pub const INITIAL_WINDOW: u16 = 500;

    /// Window increment per stream-level SENDME
    pub const WINDOW_INCREMENT: u16 = 50;

    pub fn new() -> Self {
        Self {
            package_window: Self::INITIAL_WINDOW,
            deliver_window: Self::INITIAL_WINDOW,
        }
    }

    /// Whether another DATA cell may be sent on this stream.
    pub fn can_package(&self) -> bool {
        self.package_window > 0
    }

    /// Account for one outbound DATA cell.
    pub fn on_package(&mut self) -> Result<()> {
        if self.package_window == 0 {
            return Err(TorError::Stream("stream package window exhausted".into()));
        }
        self.package_window -= 1;
        Ok(())
    }

    /// Account for a stream-level SENDME from the peer.
    pub fn on_sendme(&mut self) {
        self.package_window = self.package_window.saturating_add(Self::WINDOW_INCREMENT);
    }

    /// Account for one inbound DATA cell. Returns true when we owe the
    /// peer a stream-level SENDME.
    pub fn on_deliver(&mut self) -> bool {
        self.deliver_window = self.deliver_window.saturating_sub(1);
        if self.deliver_window <= Self::INITIAL_WINDOW - Self::WINDOW_INCREMENT {
            self.deliver_window += Self::WINDOW_INCREMENT;
            true
        } else {
            false
        }
    }
}

impl Default for StreamFlowControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_package_window() {
        let mut fc = CircuitFlowControl::new();
        assert_eq!(fc.package_window, 500);

        for _ in 0..500 {
            fc.on_package().unwrap();
        }
        assert!(!fc.can_package());
        assert!(fc.on_package().is_err());

        fc.on_sendme();
        assert!(fc.can_package());
        assert_eq!(fc.package_window, 100);
    }

    #[test]
    fn test_circuit_deliver_sendme_cadence() {
        let mut fc = CircuitFlowControl::new();

        // One SENDME owed per hundred delivered cells.
        let mut owed = 0;
        for _ in 0..300 {
            if fc.on_deliver() {
                owed += 1;
            }
        }
        assert_eq!(owed, 3);
        assert_eq!(fc.deliver_window, 500);
    }

    #[test]
    fn test_stream_windows() {
        let mut fc = StreamFlowControl::new();
        assert_eq!(fc.package_window, 500);

        for _ in 0..10 {
            fc.on_package().unwrap();
        }
        assert_eq!(fc.package_window, 490);

        fc.on_sendme();
        assert_eq!(fc.package_window, 540);

        let mut owed = 0;
        for _ in 0..100 {
            if fc.on_deliver() {
                owed += 1;
            }
        }
        assert_eq!(owed, 2);
    }

    #[test]
    fn test_stream_blocking() {
        let mut fc = StreamFlowControl::new();
        for _ in 0..500 {
            assert!(fc.can_package());
            fc.on_package().unwrap();
        }
        assert!(!fc.can_package());
        assert!(fc.on_package().is_err());

        fc.on_sendme();
        assert!(fc.can_package());
        assert_eq!(fc.package_window, 50);
    }
}
