//! Replication wire protocol
//!
//! Every frame carries one [`Envelope`], serialized with bincode and
//! validated with CRC32.
//!
//! Format: [message_type:1][length:4][payload:N][crc32:4]

use crate::name::GclName;
use crate::record::{LogChain, RecNo, Record};
use crate::{Error, Result};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted from the wire
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Failure codes carried by [`ReplicationMessage::Failure`]
pub mod nak {
    /// Malformed or misdirected request
    pub const BAD_REQUEST: u32 = 400;
    /// Record number rejected (e.g. zero)
    pub const FORBIDDEN: u32 = 403;
    /// Log or record not present
    pub const NOT_FOUND: u32 = 404;
    /// Same record number with different content
    pub const CONFLICT: u32 = 409;
    /// Local storage or internal failure
    pub const INTERNAL: u32 = 500;
    /// Too many replicas failed for the quorum to be met
    pub const REPLICATE_FAIL: u32 = 503;
    /// Quorum not reached before the deadline
    pub const QUORUM_TIMEOUT: u32 = 504;
}

/// Replication message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationMessageType {
    /// Liveness probe
    Ping = 0x01,
    /// Liveness answer
    Pong = 0x02,
    /// Writer append to the primary
    Append = 0x10,
    /// Primary's verdict on a writer append
    Appended = 0x11,
    /// Primary forwards a committed record to a replica
    ForwardAppend = 0x20,
    /// Replica committed a record
    Created = 0x21,
    /// Replica refused a request
    Failure = 0x22,
    /// Replica ended the exchange without a result
    EndOfStream = 0x23,
    /// Request one record during sync
    FetchRecord = 0x30,
    /// Fetched record
    Content = 0x31,
    /// Requested record is not held
    NotFound = 0x32,
    /// Periodic sync beacon
    SyncBeacon = 0x40,
    /// Answer to a sync beacon
    SyncBeaconReply = 0x41,
    /// Error message
    Error = 0xFF,
}

impl TryFrom<u8> for ReplicationMessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Ping),
            0x02 => Ok(Self::Pong),
            0x10 => Ok(Self::Append),
            0x11 => Ok(Self::Appended),
            0x20 => Ok(Self::ForwardAppend),
            0x21 => Ok(Self::Created),
            0x22 => Ok(Self::Failure),
            0x23 => Ok(Self::EndOfStream),
            0x30 => Ok(Self::FetchRecord),
            0x31 => Ok(Self::Content),
            0x32 => Ok(Self::NotFound),
            0x40 => Ok(Self::SyncBeacon),
            0x41 => Ok(Self::SyncBeaconReply),
            0xFF => Ok(Self::Error),
            _ => Err(Error::protocol(format!("Unknown message type: {}", value))),
        }
    }
}

/// Replication messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Liveness probe
    Ping { timestamp: u64 },

    /// Liveness answer
    Pong { timestamp: u64 },

    /// Writer asks the primary to append `data`
    Append { log: GclName, data: Vec<u8> },

    /// Write is durable on `acks` servers (local commit included)
    Appended { log: GclName, recno: RecNo, acks: u32 },

    /// Record committed on `source`, to be stored by the receiver
    ForwardAppend {
        log: GclName,
        source: GclName,
        record: Record,
    },

    /// Record committed by the sender
    Created { log: GclName, recno: RecNo },

    /// Request refused; `code` is one of [`nak`]
    Failure {
        log: GclName,
        recno: RecNo,
        code: u32,
        message: String,
    },

    /// Exchange ended without a result
    EndOfStream { log: GclName },

    /// Ask for one record
    FetchRecord { log: GclName, recno: RecNo },

    /// Requested record
    Content { log: GclName, record: Record },

    /// Requested record is not held by the sender
    NotFound { log: GclName, recno: RecNo },

    /// Sender's view of the log: present runs and high-water mark
    SyncBeacon {
        log: GclName,
        source: GclName,
        max_recno: RecNo,
        chains: Vec<LogChain>,
    },

    /// Receiver's view of the log in answer to a beacon
    SyncBeaconReply {
        log: GclName,
        max_recno: RecNo,
        chains: Vec<LogChain>,
    },

    /// Error message
    Error { code: u32, message: String },
}

impl ReplicationMessage {
    /// Get message type
    pub fn message_type(&self) -> ReplicationMessageType {
        match self {
            Self::Ping { .. } => ReplicationMessageType::Ping,
            Self::Pong { .. } => ReplicationMessageType::Pong,
            Self::Append { .. } => ReplicationMessageType::Append,
            Self::Appended { .. } => ReplicationMessageType::Appended,
            Self::ForwardAppend { .. } => ReplicationMessageType::ForwardAppend,
            Self::Created { .. } => ReplicationMessageType::Created,
            Self::Failure { .. } => ReplicationMessageType::Failure,
            Self::EndOfStream { .. } => ReplicationMessageType::EndOfStream,
            Self::FetchRecord { .. } => ReplicationMessageType::FetchRecord,
            Self::Content { .. } => ReplicationMessageType::Content,
            Self::NotFound { .. } => ReplicationMessageType::NotFound,
            Self::SyncBeacon { .. } => ReplicationMessageType::SyncBeacon,
            Self::SyncBeaconReply { .. } => ReplicationMessageType::SyncBeaconReply,
            Self::Error { .. } => ReplicationMessageType::Error,
        }
    }

    /// Build a `Failure` answer for `err`
    pub fn failure(log: GclName, recno: RecNo, err: &Error) -> Self {
        Self::Failure {
            log,
            recno,
            code: nak_code(err),
            message: err.to_string(),
        }
    }

    /// Turn a `Failure`/`Error` answer into an [`Error::Nak`]; any other
    /// message is returned unchanged.
    pub fn into_result(self) -> Result<Self> {
        match self {
            Self::Failure { code, message, .. } | Self::Error { code, message } => {
                Err(Error::Nak { code, message })
            }
            other => Ok(other),
        }
    }
}

/// Failure code describing `err` on the wire
pub fn nak_code(err: &Error) -> u32 {
    match err {
        Error::Protocol(_) | Error::InvalidName(_) => nak::BAD_REQUEST,
        Error::UnknownLog(_) | Error::RecordMissing(_) | Error::RecordNotFound(_) => nak::NOT_FOUND,
        Error::Duplicate(_) => nak::CONFLICT,
        Error::QuorumTimeout { .. } => nak::QUORUM_TIMEOUT,
        Error::QuorumUnreachable { .. } => nak::REPLICATE_FAIL,
        Error::Nak { code, .. } => *code,
        _ => nak::INTERNAL,
    }
}

/// Framed unit: one message with its routing header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sending server
    pub src: GclName,
    /// Destination server
    pub dst: GclName,
    /// Payload
    pub message: ReplicationMessage,
}

impl Envelope {
    /// Wrap a message
    pub fn new(src: GclName, dst: GclName, message: ReplicationMessage) -> Self {
        Self { src, dst, message }
    }

    /// Encode envelope to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| Error::protocol(format!("Serialization failed: {}", e)))?;

        let mut buf = Vec::with_capacity(1 + 4 + payload.len() + 4);
        buf.push(self.message.message_type() as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        // CRC32 of type + length + payload
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        let crc = hasher.finalize();
        buf.extend_from_slice(&crc.to_le_bytes());

        Ok(buf)
    }

    /// Decode envelope from bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 9 {
            // min: type(1) + length(4) + crc(4)
            return Err(Error::protocol("Message too short"));
        }

        let crc_offset = buf.len() - 4;
        let stored_crc = read_u32(&buf[crc_offset..]);

        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Err(Error::protocol(format!(
                "CRC mismatch: expected {:x}, got {:x}",
                stored_crc, computed_crc
            )));
        }

        let msg_type = ReplicationMessageType::try_from(buf[0])?;
        let length = read_u32(&buf[1..5]) as usize;
        if buf.len() != 5 + length + 4 {
            return Err(Error::protocol("Incomplete message"));
        }

        let envelope: Envelope = bincode::deserialize(&buf[5..5 + length])
            .map_err(|e| Error::protocol(format!("Deserialization failed: {}", e)))?;

        if envelope.message.message_type() != msg_type {
            return Err(Error::protocol(format!(
                "Frame type {:?} does not match payload {:?}",
                msg_type,
                envelope.message.message_type()
            )));
        }

        Ok(envelope)
    }

    /// Write envelope to async stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read envelope from async stream
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        // Read header: type(1) + length(4)
        let mut header = [0u8; 5];
        reader.read_exact(&mut header).await?;

        let length = read_u32(&header[1..5]) as usize;
        if length > MAX_PAYLOAD_LEN {
            return Err(Error::protocol(format!("Frame too large: {} bytes", length)));
        }

        // Read payload + CRC
        let mut full_buf = vec![0u8; 5 + length + 4];
        full_buf[..5].copy_from_slice(&header);
        reader.read_exact(&mut full_buf[5..]).await?;

        Self::decode(&full_buf)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(message: ReplicationMessage) -> Envelope {
        Envelope::new(
            GclName::from_human("src"),
            GclName::from_human("dst"),
            message,
        )
    }

    #[test]
    fn test_forward_append_encode_decode() {
        let log = GclName::from_human("log");
        let record = Record::new(42, b"hello".to_vec());
        let env = envelope(ReplicationMessage::ForwardAppend {
            log,
            source: GclName::from_human("src"),
            record: record.clone(),
        });

        let encoded = env.encode().unwrap();
        assert_eq!(encoded[0], ReplicationMessageType::ForwardAppend as u8);
        let decoded = Envelope::decode(&encoded).unwrap();

        match decoded.message {
            ReplicationMessage::ForwardAppend {
                log: l, record: r, ..
            } => {
                assert_eq!(l, log);
                assert_eq!(r, record);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_beacon_carries_chains() {
        let env = envelope(ReplicationMessage::SyncBeacon {
            log: GclName::from_human("log"),
            source: GclName::from_human("src"),
            max_recno: 9,
            chains: vec![LogChain::new(1, 3), LogChain::new(7, 9)],
        });
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_crc_validation() {
        let env = envelope(ReplicationMessage::Ping { timestamp: 123 });
        let mut encoded = env.encode().unwrap();

        // Corrupt the data
        encoded[5] ^= 0xFF;

        let result = Envelope::decode(&encoded);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("CRC"));
    }

    #[test]
    fn test_truncated_frame() {
        let env = envelope(ReplicationMessage::Pong { timestamp: 1 });
        let encoded = env.encode().unwrap();
        assert!(Envelope::decode(&encoded[..4]).is_err());
    }

    #[test]
    fn test_failure_round_trips_error_class() {
        let log = GclName::from_human("log");
        let timeout = Error::QuorumTimeout {
            acked: 1,
            required: 2,
        };
        let msg = ReplicationMessage::failure(log, 5, &timeout);
        match msg.clone() {
            ReplicationMessage::Failure { code, .. } => assert_eq!(code, nak::QUORUM_TIMEOUT),
            _ => panic!("Wrong message type"),
        }
        match msg.into_result() {
            Err(Error::Nak { code, .. }) => assert_eq!(code, nak::QUORUM_TIMEOUT),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(nak_code(&Error::storage("disk")), nak::INTERNAL);
        assert_eq!(nak_code(&Error::Duplicate(3)), nak::CONFLICT);
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let env = envelope(ReplicationMessage::FetchRecord {
            log: GclName::from_human("log"),
            recno: 11,
        });
        let (mut client, mut server) = tokio::io::duplex(1024);
        env.write_to(&mut client).await.unwrap();
        let read = Envelope::read_from(&mut server).await.unwrap();
        assert_eq!(read, env);
    }
}
