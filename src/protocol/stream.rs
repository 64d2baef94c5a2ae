//! Stream layer
//!
//! A stream is a multiplexed bidirectional byte channel over a circuit.
//! Opening sends RELAY_BEGIN (or RELAY_BEGIN_DIR for directory streams)
//! and waits for RELAY_CONNECTED; data moves in RELAY_DATA cells; either
//! side finishes with RELAY_END. Per-stream SENDME windows gate sending,
//! and the stream replenishes the peer's window as it consumes data.
//!
//! Bytes are delivered in order per stream; END is terminal for the
//! stream but not for its circuit.

use crate::error::{Result, TorError};
use crate::protocol::cell::{RelayCell, RelayCommand};
use crate::protocol::circuit::Circuit;
use crate::protocol::flow_control::StreamFlowControl;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

/// RELAY_END reason for an orderly local close.
pub const END_REASON_DONE: u8 = 6;

/// Stream lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    New,
    Connecting,
    Open,
    Closed,
    Failed,
}

/// Something the peer did to the stream.
#[derive(Debug)]
pub enum StreamEvent {
    /// Application bytes arrived
    Data(Vec<u8>),
    /// The peer ended the stream with a reason code
    End(u8),
}

impl Circuit {
    /// Open a stream to `host:port` through this circuit's exit.
    pub async fn open_stream(self: &Arc<Self>, host: &str, port: u16) -> Result<TorStream> {
        let target = format!("{}:{}\0", host, port);
        self.begin_stream(RelayCommand::Begin, target.into_bytes())
            .await
    }

    /// Open a directory stream to this circuit's final hop.
    pub async fn open_dir_stream(self: &Arc<Self>) -> Result<TorStream> {
        self.begin_stream(RelayCommand::BeginDir, Vec::new()).await
    }

    async fn begin_stream(
        self: &Arc<Self>,
        command: RelayCommand,
        payload: Vec<u8>,
    ) -> Result<TorStream> {
        let (stream_id, mut rx) = self.register_stream().await?;

        let begin = RelayCell::new(command, stream_id, payload);
        if let Err(e) = self.send_relay_cell(&begin, false).await {
            self.unregister_stream(stream_id);
            return Err(e);
        }

        // The exit answers CONNECTED or END.
        let reply = match rx.recv().await {
            Some(cell) => cell,
            None => {
                self.unregister_stream(stream_id);
                return Err(TorError::CircuitClosed(format!("circuit {}", self.id())));
            }
        };

        match reply.command {
            RelayCommand::Connected => {
                log::debug!("stream {} open on circuit {}", stream_id, self.id());
                Ok(TorStream {
                    circuit: Arc::clone(self),
                    stream_id,
                    rx,
                    flow: StreamFlowControl::new(),
                    inbox: VecDeque::new(),
                    read_buf: VecDeque::new(),
                    owed_sendme: false,
                    state: StreamState::Open,
                })
            }
            RelayCommand::End => {
                self.unregister_stream(stream_id);
                let reason = reply.data.first().copied().unwrap_or(0);
                Err(TorError::StreamRefused(reason))
            }
            other => {
                self.unregister_stream(stream_id);
                Err(TorError::UnexpectedCell {
                    expected: "CONNECTED/END".into(),
                    got: format!("{:?}", other),
                })
            }
        }
    }
}

/// An open stream over a circuit.
pub struct TorStream {
    circuit: Arc<Circuit>,
    stream_id: u16,
    rx: mpsc::UnboundedReceiver<RelayCell>,
    flow: StreamFlowControl,
    /// Events decoded while waiting for something else (e.g. a SENDME)
    inbox: VecDeque<StreamEvent>,
    /// Bytes delivered but not yet read
    read_buf: VecDeque<u8>,
    /// A stream-level SENDME is due but not yet on the wire
    owed_sendme: bool,
    state: StreamState,
}

impl TorStream {
    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    pub fn circuit(&self) -> &Arc<Circuit> {
        &self.circuit
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Whether the peer has ended the stream.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, StreamState::Closed | StreamState::Failed)
    }

    /// Whether the stream-level window permits another DATA cell.
    ///
    /// The SOCKS relay loop gates its client-read branch on this, which
    /// is how window back-pressure reaches the application.
    pub fn can_send(&self) -> bool {
        self.flow.can_package()
    }

    /// Send application bytes, chunked into DATA cells.
    ///
    /// The caller must ensure `can_send()`; a depleted window fails with
    /// a stream error rather than blocking here, so a relay loop that is
    /// also watching for SENDMEs cannot deadlock itself.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(TorError::Stream(format!(
                "stream {} is closed",
                self.stream_id
            )));
        }

        for chunk in data.chunks(RelayCell::MAX_DATA_SIZE) {
            self.flow.on_package()?;
            let cell = RelayCell::new(RelayCommand::Data, self.stream_id, chunk.to_vec());
            self.circuit.send_relay_cell(&cell, true).await?;
        }
        Ok(())
    }

    /// Wait for the next event from the peer.
    ///
    /// SENDMEs are absorbed into the window here and never surfaced.
    pub async fn next_event(&mut self) -> Result<StreamEvent> {
        if let Some(event) = self.inbox.pop_front() {
            return Ok(event);
        }
        loop {
            if let Some(event) = self.process_one_cell().await? {
                return Ok(event);
            }
        }
    }

    /// Write all bytes, waiting on the peer's SENDMEs when the window
    /// runs dry. Data arriving meanwhile is buffered for `read`.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            if !self.can_send() {
                match self.process_one_cell().await? {
                    Some(StreamEvent::End(reason)) => {
                        self.inbox.push_back(StreamEvent::End(reason));
                        return Err(TorError::Stream(format!(
                            "stream {} ended by peer (reason {})",
                            self.stream_id, reason
                        )));
                    }
                    Some(event) => self.inbox.push_back(event),
                    None => {}
                }
                continue;
            }
            let take = (data.len() - offset).min(RelayCell::MAX_DATA_SIZE);
            self.send_data(&data[offset..offset + take]).await?;
            offset += take;
        }
        Ok(())
    }

    /// Read some bytes, in delivery order.
    ///
    /// Returns 0 once the peer has ended the stream and all delivered
    /// bytes have been consumed.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if !self.read_buf.is_empty() {
                let n = buf.len().min(self.read_buf.len());
                for byte in buf.iter_mut().take(n) {
                    *byte = self.read_buf.pop_front().expect("checked non-empty");
                }
                return Ok(n);
            }
            if self.is_closed() {
                return Ok(0);
            }

            let event = match self.inbox.pop_front() {
                Some(event) => event,
                None => match self.process_one_cell().await? {
                    Some(event) => event,
                    None => continue,
                },
            };
            match event {
                StreamEvent::Data(data) => self.read_buf.extend(data),
                StreamEvent::End(_) => return Ok(0),
            }
        }
    }

    /// Read until the peer ends the stream.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// End the stream locally. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.state = StreamState::Closed;

        let end = RelayCell::new(
            RelayCommand::End,
            self.stream_id,
            vec![END_REASON_DONE],
        );
        let result = self.circuit.send_relay_cell(&end, false).await;
        self.circuit.unregister_stream(self.stream_id);
        result
    }

    /// Pull one cell off the circuit and account for it. Returns an event
    /// when the cell is surfaced to the caller.
    ///
    /// Cancellation-safe: an owed SENDME survives as a flag until it is
    /// actually on the wire.
    async fn process_one_cell(&mut self) -> Result<Option<StreamEvent>> {
        self.flush_owed_sendme().await?;

        let cell = match self.rx.recv().await {
            Some(cell) => cell,
            None => {
                self.state = StreamState::Failed;
                return Err(TorError::CircuitClosed(format!(
                    "circuit {} died under stream {}",
                    self.circuit.id(),
                    self.stream_id
                )));
            }
        };

        match cell.command {
            RelayCommand::Data => {
                if self.flow.on_deliver() {
                    self.owed_sendme = true;
                }
                self.flush_owed_sendme().await?;
                Ok(Some(StreamEvent::Data(cell.data)))
            }
            RelayCommand::Sendme => {
                self.flow.on_sendme();
                Ok(None)
            }
            RelayCommand::End => {
                let reason = cell.data.first().copied().unwrap_or(0);
                self.state = StreamState::Closed;
                self.circuit.unregister_stream(self.stream_id);
                Ok(Some(StreamEvent::End(reason)))
            }
            other => {
                log::debug!(
                    "stream {}: ignoring unexpected {:?}",
                    self.stream_id,
                    other
                );
                Ok(None)
            }
        }
    }
}

impl TorStream {
    async fn flush_owed_sendme(&mut self) -> Result<()> {
        if self.owed_sendme {
            let sendme = RelayCell::new(RelayCommand::Sendme, self.stream_id, vec![]);
            self.circuit.send_relay_cell(&sendme, false).await?;
            self.owed_sendme = false;
        }
        Ok(())
    }
}

impl Drop for TorStream {
    fn drop(&mut self) {
        self.circuit.unregister_stream(self.stream_id);
    }
}
