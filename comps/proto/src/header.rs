// SPDX-License-Identifier: MPL-2.0

use static_assertions::const_assert_eq;
use xsan_types::{return_errno_with_msg, Errno, Result};

/// Magic number identifying XSAN messages: "XSAN" in ASCII.
pub const MAGIC: u32 = 0x5853_414E;

/// Current protocol version.
pub const VERSION: u16 = 1;

/// Protocol-level ceiling for a single message payload.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Size of the serialized message header in bytes.
pub const HEADER_SIZE: usize = 24;

const_assert_eq!(HEADER_SIZE, 4 + 2 + 2 + 4 + 8 + 4);

/// The message types implemented by the storage core.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u16)]
pub enum MessageType {
    Heartbeat = 1,
    HeartbeatAck = 2,
    ErrorResp = 500,
    ReplicaWriteBlockReq = 600,
    ReplicaWriteBlockResp = 601,
    ReplicaReadBlockReq = 602,
    ReplicaReadBlockResp = 603,
}

impl TryFrom<u16> for MessageType {
    type Error = xsan_types::Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Heartbeat),
            2 => Ok(MessageType::HeartbeatAck),
            500 => Ok(MessageType::ErrorResp),
            600 => Ok(MessageType::ReplicaWriteBlockReq),
            601 => Ok(MessageType::ReplicaWriteBlockResp),
            602 => Ok(MessageType::ReplicaReadBlockReq),
            603 => Ok(MessageType::ReplicaReadBlockResp),
            _ => Err(xsan_types::Error::with_msg(
                Errno::ProtocolGeneric,
                "unknown message type",
            )),
        }
    }
}

/// The fixed header carried by every XSAN message.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MessageHeader {
    pub magic: u32,
    pub msg_type: u16,
    pub version: u16,
    pub payload_length: u32,
    pub transaction_id: u64,
    pub checksum: u32,
}

impl MessageHeader {
    /// Initializes a header with the common values; the checksum starts at
    /// zero and is filled in once the payload is known.
    pub fn new(msg_type: MessageType, payload_length: u32, transaction_id: u64) -> Self {
        Self {
            magic: MAGIC,
            msg_type: msg_type as u16,
            version: VERSION,
            payload_length,
            transaction_id,
            checksum: 0,
        }
    }

    /// Serializes the header into its 24-byte wire form.
    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..6].copy_from_slice(&self.msg_type.to_be_bytes());
        buf[6..8].copy_from_slice(&self.version.to_be_bytes());
        buf[8..12].copy_from_slice(&self.payload_length.to_be_bytes());
        buf[12..20].copy_from_slice(&self.transaction_id.to_be_bytes());
        buf[20..24].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    /// Deserializes and validates a header from the head of `buf`.
    ///
    /// Validation covers the magic number and the payload-length ceiling;
    /// the version field is carried through so callers can decide their own
    /// compatibility policy.
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return_errno_with_msg!(Errno::MessageIncomplete, "short message header");
        }
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return_errno_with_msg!(Errno::MagicMismatch, "bad protocol magic");
        }
        let header = Self {
            magic,
            msg_type: u16::from_be_bytes(buf[4..6].try_into().unwrap()),
            version: u16::from_be_bytes(buf[6..8].try_into().unwrap()),
            payload_length: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            transaction_id: u64::from_be_bytes(buf[12..20].try_into().unwrap()),
            checksum: u32::from_be_bytes(buf[20..24].try_into().unwrap()),
        };
        if header.payload_length > MAX_PAYLOAD_SIZE {
            return_errno_with_msg!(Errno::PayloadTooLarge, "payload above protocol maximum");
        }
        Ok(header)
    }
}
