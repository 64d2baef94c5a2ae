//! Lifecycle events
//!
//! The core publishes lifecycle events on a broadcast channel; a control
//! surface (when attached) formats and delivers them. Publishing never
//! blocks and events are dropped when nobody is listening.

use tokio::sync::broadcast;

/// Events published by the core.
#[derive(Debug, Clone)]
pub enum Event {
    /// Circuit lifecycle change (`CIRC`)
    Circuit {
        id: u32,
        status: &'static str,
        path: Vec<String>,
    },
    /// Stream lifecycle change (`STREAM`)
    Stream {
        circuit_id: u32,
        stream_id: u16,
        status: &'static str,
        target: String,
    },
    /// Bandwidth totals (`BW`)
    Bandwidth { bytes_read: u64, bytes_written: u64 },
    /// Link connection change (`ORCONN`)
    OrConn { peer: String, status: &'static str },
    /// New descriptors available (`NEWDESC`)
    NewDescriptors { count: usize },
    /// Guard set change (`GUARD`)
    Guard {
        fingerprint: String,
        status: &'static str,
    },
    /// New network status / consensus (`NS`)
    NetworkStatus { relay_count: usize },
}

/// Broadcast publisher handed to every component that emits events.
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<Event>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; lagging or absent subscribers are not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let publisher = EventPublisher::new(8);
        let mut rx = publisher.subscribe();

        publisher.publish(Event::NetworkStatus { relay_count: 42 });
        match rx.recv().await.unwrap() {
            Event::NetworkStatus { relay_count } => assert_eq!(relay_count, 42),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let publisher = EventPublisher::new(8);
        // Must not error or block.
        publisher.publish(Event::Bandwidth {
            bytes_read: 1,
            bytes_written: 2,
        });
    }
}
