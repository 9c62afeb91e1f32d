// SPDX-License-Identifier: MPL-2.0

use xsan_types::{return_errno_with_msg, Errno, Result};

use crate::{MessageHeader, MessageType, MAX_PAYLOAD_SIZE};

/// The placeholder checksum: a modular byte sum.
///
/// Kept deliberately simple; a CRC32C upgrade only needs to preserve the
/// `checksum == 0` "verification disabled" convention.
pub fn calculate_checksum(data: &[u8]) -> u32 {
    data.iter()
        .fold(0u32, |sum, byte| sum.wrapping_add(*byte as u32))
}

/// A complete wire message: header plus owned payload bytes.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

impl Message {
    /// Builds a message and seals its checksum.
    pub fn new(msg_type: MessageType, transaction_id: u64, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE as usize {
            return_errno_with_msg!(Errno::PayloadTooLarge, "payload above protocol maximum");
        }
        let header = MessageHeader::new(msg_type, payload.len() as u32, transaction_id);
        let mut msg = Self { header, payload };
        msg.header.checksum = msg.compute_checksum();
        Ok(msg)
    }

    /// Builds a message whose payload is a structured part followed by a raw
    /// data block (e.g. a replica-write request followed by the block bytes).
    pub fn with_payload_parts(
        msg_type: MessageType,
        transaction_id: u64,
        structured: &[u8],
        data: &[u8],
    ) -> Result<Self> {
        let total = structured.len() + data.len();
        if total > MAX_PAYLOAD_SIZE as usize {
            return_errno_with_msg!(Errno::PayloadTooLarge, "payload above protocol maximum");
        }
        let mut payload = Vec::with_capacity(total);
        payload.extend_from_slice(structured);
        payload.extend_from_slice(data);
        Self::new(msg_type, transaction_id, payload)
    }

    /// Reassembles a message received off the wire. The header has already
    /// been validated by [`MessageHeader::deserialize`].
    pub fn from_parts(header: MessageHeader, payload: Vec<u8>) -> Self {
        debug_assert_eq!(header.payload_length as usize, payload.len());
        Self { header, payload }
    }

    /// The checksum over (header with checksum zeroed ∥ payload).
    fn compute_checksum(&self) -> u32 {
        let mut zeroed = self.header;
        zeroed.checksum = 0;
        let head = calculate_checksum(&zeroed.serialize());
        head.wrapping_add(calculate_checksum(&self.payload))
    }

    /// Verifies the checksum. A zero checksum field means verification is
    /// disabled and always passes.
    pub fn verify_checksum(&self) -> bool {
        if self.header.checksum == 0 {
            return true;
        }
        self.header.checksum == self.compute_checksum()
    }
}
