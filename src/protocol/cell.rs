//! Tor cell codec
//!
//! Implements the Tor cell format for communication with relays.
//! Cells are the basic unit of communication on a link connection.
//!
//! Fixed-length cells are 514 bytes on the wire under link protocol v4+
//! (4-byte circuit id); before VERSIONS negotiation the circuit id is
//! 2 bytes. Variable-length cells carry an explicit 2-byte payload length
//! instead of zero padding.

use crate::error::{Result, TorError};

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - link padding
    Padding = 0,
    /// CREATE - create a circuit (deprecated)
    Create = 1,
    /// CREATED - circuit created (deprecated)
    Created = 2,
    /// RELAY - relay cell
    Relay = 3,
    /// DESTROY - destroy a circuit
    Destroy = 4,
    /// CREATE_FAST - fast circuit creation (deprecated)
    CreateFast = 5,
    /// CREATED_FAST - fast circuit created (deprecated)
    CreatedFast = 6,
    /// VERSIONS - negotiate link protocol versions
    Versions = 7,
    /// NETINFO - network info exchange
    Netinfo = 8,
    /// RELAY_EARLY - relay cell allowed early in the circuit lifetime
    RelayEarly = 9,
    /// CREATE2 - create a circuit (current)
    Create2 = 10,
    /// CREATED2 - circuit created (current)
    Created2 = 11,
    /// PADDING_NEGOTIATE - negotiate padding
    PaddingNegotiate = 12,
    /// VPADDING - variable-length padding
    Vpadding = 128,
    /// CERTS - certificate cell
    Certs = 129,
    /// AUTH_CHALLENGE - authentication challenge
    AuthChallenge = 130,
    /// AUTHENTICATE - authenticate
    Authenticate = 131,
    /// AUTHORIZE - authorize
    Authorize = 132,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            12 => Some(CellCommand::PaddingNegotiate),
            128 => Some(CellCommand::Vpadding),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            131 => Some(CellCommand::Authenticate),
            132 => Some(CellCommand::Authorize),
            _ => None,
        }
    }

    /// Whether cells with this command carry an explicit length on the wire.
    pub fn is_variable_length(self) -> bool {
        self == CellCommand::Versions || (self as u8) >= 128
    }
}

/// Framing parameters for the cell codec.
///
/// The circuit-id width is 2 bytes until a VERSIONS exchange selects link
/// protocol >= 4, after which it is 4 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellFormat {
    /// Circuit id width in bytes (2 or 4)
    pub circ_id_len: usize,

    /// Ceiling on a variable cell's declared payload length
    pub max_variable_len: usize,
}

impl CellFormat {
    /// Framing before VERSIONS negotiation (2-byte circuit ids).
    pub const PRE_VERSIONS: CellFormat = CellFormat {
        circ_id_len: 2,
        max_variable_len: Cell::MAX_VARIABLE_PAYLOAD,
    };

    /// Framing under link protocol v4+ (4-byte circuit ids).
    pub const LINK_V4: CellFormat = CellFormat {
        circ_id_len: 4,
        max_variable_len: Cell::MAX_VARIABLE_PAYLOAD,
    };

    /// Framing for a negotiated link protocol version.
    pub fn for_link_version(version: u16) -> CellFormat {
        if version >= 4 {
            CellFormat::LINK_V4
        } else {
            CellFormat::PRE_VERSIONS
        }
    }
}

/// Tor cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit ID (up to 4 bytes on the wire)
    pub circuit_id: u32,

    /// Command
    pub command: CellCommand,

    /// Payload; padded to 509 bytes on encode for fixed-length cells
    pub payload: Vec<u8>,
}

impl Cell {
    /// Payload size for fixed-length cells
    pub const PAYLOAD_SIZE: usize = 509;

    /// Wire size of a fixed cell under link protocol v4+ (4 + 1 + 509)
    pub const SIZE_V4: usize = 514;

    /// Default ceiling on variable-length payloads
    pub const MAX_VARIABLE_PAYLOAD: usize = 65535;

    /// Create a new cell
    pub fn new(circuit_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    /// Create a RELAY cell
    pub fn relay(circuit_id: u32, relay_payload: Vec<u8>) -> Self {
        Self::new(circuit_id, CellCommand::Relay, relay_payload)
    }

    /// Serialize the cell under the given framing.
    pub fn encode(&self, format: CellFormat) -> Result<Vec<u8>> {
        let variable = self.command.is_variable_length();

        if variable && self.payload.len() > format.max_variable_len {
            return Err(TorError::MalformedCell(format!(
                "variable payload {} exceeds ceiling {}",
                self.payload.len(),
                format.max_variable_len
            )));
        }
        if !variable && self.payload.len() > Self::PAYLOAD_SIZE {
            return Err(TorError::MalformedCell(format!(
                "fixed payload {} exceeds {}",
                self.payload.len(),
                Self::PAYLOAD_SIZE
            )));
        }

        let mut buf = Vec::with_capacity(format.circ_id_len + 3 + self.payload.len());

        // Circuit ID, big-endian, at the negotiated width
        match format.circ_id_len {
            2 => buf.extend_from_slice(&(self.circuit_id as u16).to_be_bytes()),
            4 => buf.extend_from_slice(&self.circuit_id.to_be_bytes()),
            n => {
                return Err(TorError::Internal(format!("bad circ_id width {}", n)));
            }
        }

        buf.push(self.command as u8);

        if variable {
            buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
            buf.extend_from_slice(&self.payload);
        } else {
            buf.extend_from_slice(&self.payload);
            buf.resize(format.circ_id_len + 1 + Self::PAYLOAD_SIZE, 0);
        }

        Ok(buf)
    }

    /// Parse one cell from the front of `data` under the given framing.
    ///
    /// Returns the cell and the number of bytes consumed. Fails with
    /// `UnexpectedEof` when `data` ends mid-frame and `MalformedCell` on
    /// an unknown command or over-ceiling variable length.
    pub fn decode(data: &[u8], format: CellFormat) -> Result<(Self, usize)> {
        let header_len = format.circ_id_len + 1;
        if data.len() < header_len {
            return Err(TorError::UnexpectedEof);
        }

        let circuit_id = match format.circ_id_len {
            2 => u16::from_be_bytes([data[0], data[1]]) as u32,
            4 => u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            n => {
                return Err(TorError::Internal(format!("bad circ_id width {}", n)));
            }
        };

        let cmd_byte = data[format.circ_id_len];
        let command = CellCommand::from_u8(cmd_byte)
            .ok_or_else(|| TorError::MalformedCell(format!("unknown command {}", cmd_byte)))?;

        if command.is_variable_length() {
            if data.len() < header_len + 2 {
                return Err(TorError::UnexpectedEof);
            }
            let length = u16::from_be_bytes([data[header_len], data[header_len + 1]]) as usize;
            if length > format.max_variable_len {
                return Err(TorError::MalformedCell(format!(
                    "declared length {} exceeds ceiling {}",
                    length, format.max_variable_len
                )));
            }
            let total = header_len + 2 + length;
            if data.len() < total {
                return Err(TorError::UnexpectedEof);
            }
            let payload = data[header_len + 2..total].to_vec();
            Ok((
                Self {
                    circuit_id,
                    command,
                    payload,
                },
                total,
            ))
        } else {
            let total = header_len + Self::PAYLOAD_SIZE;
            if data.len() < total {
                return Err(TorError::UnexpectedEof);
            }
            let payload = data[header_len..total].to_vec();
            Ok((
                Self {
                    circuit_id,
                    command,
                    payload,
                },
                total,
            ))
        }
    }
}

/// Relay command types (inside RELAY / RELAY_EARLY cells)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open stream
    Begin = 1,
    /// DATA - stream data
    Data = 2,
    /// END - close stream
    End = 3,
    /// CONNECTED - stream connected
    Connected = 4,
    /// SENDME - flow control
    Sendme = 5,
    /// EXTEND - extend circuit (deprecated)
    Extend = 6,
    /// EXTENDED - circuit extended (deprecated)
    Extended = 7,
    /// TRUNCATE - truncate circuit
    Truncate = 8,
    /// TRUNCATED - circuit truncated
    Truncated = 9,
    /// DROP - long-range padding
    Drop = 10,
    /// RESOLVE - DNS resolve
    Resolve = 11,
    /// RESOLVED - DNS resolved
    Resolved = 12,
    /// BEGIN_DIR - begin directory stream to the final hop
    BeginDir = 13,
    /// EXTEND2 - extend circuit (current)
    Extend2 = 14,
    /// EXTENDED2 - circuit extended (current)
    Extended2 = 15,
    /// ESTABLISH_RENDEZVOUS - set up a rendezvous point
    EstablishRendezvous = 33,
    /// INTRODUCE1 - introduction request (client to intro point)
    Introduce1 = 34,
    /// RENDEZVOUS2 - rendezvous completion (service side arrives here)
    Rendezvous2 = 37,
    /// RENDEZVOUS_ESTABLISHED - rendezvous point acknowledgment
    RendezvousEstablished = 39,
    /// INTRODUCE_ACK - introduction acknowledged
    IntroduceAck = 40,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            33 => Some(RelayCommand::EstablishRendezvous),
            34 => Some(RelayCommand::Introduce1),
            37 => Some(RelayCommand::Rendezvous2),
            39 => Some(RelayCommand::RendezvousEstablished),
            40 => Some(RelayCommand::IntroduceAck),
            _ => None,
        }
    }
}

/// Relay cell body (the 509-byte payload of a RELAY or RELAY_EARLY cell)
#[derive(Debug, Clone)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Recognized (zero on cells we originate; zero after the terminus
    /// hop's decryption on cells we receive)
    pub recognized: u16,

    /// Stream ID (0 for circuit-level commands)
    pub stream_id: u16,

    /// Digest (4 bytes of the running SHA-1 state)
    pub digest: [u8; 4],

    /// Length of data
    pub length: u16,

    /// Data (up to 498 bytes)
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Relay header size: command(1) + recognized(2) + stream(2) + digest(4) + length(2)
    pub const HEADER_SIZE: usize = 11;

    /// Maximum data size in a relay cell
    pub const MAX_DATA_SIZE: usize = 498;

    /// Byte range of the digest field within the relay body
    pub const DIGEST_RANGE: std::ops::Range<usize> = 5..9;

    /// Create a new relay cell
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            length: data.len() as u16,
            data,
        }
    }

    /// Serialize the relay body, zero-padded to 509 bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.data.len() > Self::MAX_DATA_SIZE {
            return Err(TorError::MalformedCell(format!(
                "relay data {} exceeds {}",
                self.data.len(),
                Self::MAX_DATA_SIZE
            )));
        }

        let mut buf = Vec::with_capacity(Cell::PAYLOAD_SIZE);
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.recognized.to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.digest);
        buf.extend_from_slice(&self.length.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf.resize(Cell::PAYLOAD_SIZE, 0);

        Ok(buf)
    }

    /// Parse a relay body.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE {
            return Err(TorError::MalformedCell("relay body too short".into()));
        }

        let command = RelayCommand::from_u8(data[0]).ok_or_else(|| {
            TorError::MalformedCell(format!("unknown relay command {}", data[0]))
        })?;

        let recognized = u16::from_be_bytes([data[1], data[2]]);
        let stream_id = u16::from_be_bytes([data[3], data[4]]);
        let digest = [data[5], data[6], data[7], data[8]];
        let length = u16::from_be_bytes([data[9], data[10]]);

        let data_end = Self::HEADER_SIZE + length as usize;
        if data_end > data.len() {
            return Err(TorError::MalformedCell("relay data truncated".into()));
        }

        let cell_data = data[Self::HEADER_SIZE..data_end].to_vec();

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            length,
            data: cell_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_cell_roundtrip() {
        let cell = Cell::new(12345, CellCommand::Create2, vec![1, 2, 3, 4]);
        let bytes = cell.encode(CellFormat::LINK_V4).unwrap();
        assert_eq!(bytes.len(), Cell::SIZE_V4);

        let (parsed, consumed) = Cell::decode(&bytes, CellFormat::LINK_V4).unwrap();
        assert_eq!(consumed, Cell::SIZE_V4);
        assert_eq!(parsed.circuit_id, 12345);
        assert_eq!(parsed.command, CellCommand::Create2);
        assert_eq!(&parsed.payload[..4], &[1, 2, 3, 4]);
        assert!(parsed.payload[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_versions_cell_pre_v4_wire_format() {
        // VERSIONS advertising {3,4,5} under the 2-byte circ-id framing
        let cell = Cell::new(
            0,
            CellCommand::Versions,
            vec![0x00, 0x03, 0x00, 0x04, 0x00, 0x05],
        );
        let bytes = cell.encode(CellFormat::PRE_VERSIONS).unwrap();
        assert_eq!(
            bytes,
            vec![0x00, 0x00, 0x07, 0x00, 0x06, 0x00, 0x03, 0x00, 0x04, 0x00, 0x05]
        );

        let (parsed, consumed) = Cell::decode(&bytes, CellFormat::PRE_VERSIONS).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed, cell);
    }

    #[test]
    fn test_decode_short_frame() {
        let cell = Cell::new(7, CellCommand::Netinfo, vec![0; 16]);
        let bytes = cell.encode(CellFormat::LINK_V4).unwrap();
        let err = Cell::decode(&bytes[..100], CellFormat::LINK_V4).unwrap_err();
        assert!(matches!(err, TorError::UnexpectedEof));
    }

    #[test]
    fn test_decode_unknown_command() {
        let mut bytes = vec![0, 0, 0, 1, 99];
        bytes.resize(Cell::SIZE_V4, 0);
        let err = Cell::decode(&bytes, CellFormat::LINK_V4).unwrap_err();
        assert!(matches!(err, TorError::MalformedCell(_)));
    }

    #[test]
    fn test_variable_length_ceiling() {
        let format = CellFormat {
            circ_id_len: 4,
            max_variable_len: 8,
        };
        let cell = Cell::new(1, CellCommand::Certs, vec![0; 16]);
        assert!(matches!(
            cell.encode(format),
            Err(TorError::MalformedCell(_))
        ));

        // Declared length above the ceiling fails on decode too.
        let mut bytes = vec![0, 0, 0, 1, CellCommand::Certs as u8, 0x00, 0x10];
        bytes.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            Cell::decode(&bytes, format),
            Err(TorError::MalformedCell(_))
        ));
    }

    #[test]
    fn test_relay_cell_roundtrip() {
        let relay = RelayCell::new(RelayCommand::Begin, 100, vec![5, 6, 7]);
        let bytes = relay.encode().unwrap();
        assert_eq!(bytes.len(), Cell::PAYLOAD_SIZE);

        let parsed = RelayCell::decode(&bytes).unwrap();
        assert_eq!(parsed.command, RelayCommand::Begin);
        assert_eq!(parsed.stream_id, 100);
        assert_eq!(parsed.data, vec![5, 6, 7]);
    }

    #[test]
    fn test_relay_cell_max_data() {
        let relay = RelayCell::new(RelayCommand::Data, 1, vec![0xAA; RelayCell::MAX_DATA_SIZE]);
        assert_eq!(relay.encode().unwrap().len(), Cell::PAYLOAD_SIZE);

        let oversize = RelayCell::new(
            RelayCommand::Data,
            1,
            vec![0xAA; RelayCell::MAX_DATA_SIZE + 1],
        );
        assert!(oversize.encode().is_err());
    }
}
