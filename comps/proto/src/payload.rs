// SPDX-License-Identifier: MPL-2.0

//! Structured payloads of the replica data-plane messages.
//!
//! Each payload is a fixed-size big-endian prefix; for write requests and
//! successful read responses, the raw block bytes follow immediately after.

use static_assertions::const_assert_eq;
use uuid::Uuid;
use xsan_types::{return_errno_with_msg, Errno, Result, VolumeId};

fn read_uuid(buf: &[u8]) -> Uuid {
    Uuid::from_bytes(buf[..16].try_into().unwrap())
}

/// `REPLICA_WRITE_BLOCK_REQ`: the block data follows this prefix.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ReplicaWriteReq {
    pub volume_id: VolumeId,
    pub block_lba_on_volume: u64,
    pub num_blocks: u32,
}

impl ReplicaWriteReq {
    pub const WIRE_SIZE: usize = 28;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..16].copy_from_slice(self.volume_id.0.as_bytes());
        buf[16..24].copy_from_slice(&self.block_lba_on_volume.to_be_bytes());
        buf[24..28].copy_from_slice(&self.num_blocks.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return_errno_with_msg!(Errno::MessageIncomplete, "short replica write request");
        }
        Ok(Self {
            volume_id: VolumeId(read_uuid(buf)),
            block_lba_on_volume: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            num_blocks: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
        })
    }
}

const_assert_eq!(ReplicaWriteReq::WIRE_SIZE, 16 + 8 + 4);

/// `REPLICA_WRITE_BLOCK_RESP`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ReplicaWriteResp {
    /// Zero on success, a negative wire status otherwise.
    pub status: i32,
    pub block_lba_on_volume: u64,
    pub num_blocks_processed: u32,
}

impl ReplicaWriteResp {
    pub const WIRE_SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.status.to_be_bytes());
        buf[4..12].copy_from_slice(&self.block_lba_on_volume.to_be_bytes());
        buf[12..16].copy_from_slice(&self.num_blocks_processed.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return_errno_with_msg!(Errno::MessageIncomplete, "short replica write response");
        }
        Ok(Self {
            status: i32::from_be_bytes(buf[0..4].try_into().unwrap()),
            block_lba_on_volume: u64::from_be_bytes(buf[4..12].try_into().unwrap()),
            num_blocks_processed: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

const_assert_eq!(ReplicaWriteResp::WIRE_SIZE, 4 + 8 + 4);

/// `REPLICA_READ_BLOCK_REQ`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ReplicaReadReq {
    pub volume_id: VolumeId,
    pub block_lba_on_volume: u64,
    pub num_blocks: u32,
}

impl ReplicaReadReq {
    pub const WIRE_SIZE: usize = 28;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..16].copy_from_slice(self.volume_id.0.as_bytes());
        buf[16..24].copy_from_slice(&self.block_lba_on_volume.to_be_bytes());
        buf[24..28].copy_from_slice(&self.num_blocks.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return_errno_with_msg!(Errno::MessageIncomplete, "short replica read request");
        }
        Ok(Self {
            volume_id: VolumeId(read_uuid(buf)),
            block_lba_on_volume: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            num_blocks: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
        })
    }
}

/// `REPLICA_READ_BLOCK_RESP`: on success the block data follows this prefix.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ReplicaReadResp {
    pub status: i32,
    pub volume_id: VolumeId,
    pub block_lba_on_volume: u64,
    /// Number of blocks read, or zero on error.
    pub num_blocks: u32,
}

impl ReplicaReadResp {
    pub const WIRE_SIZE: usize = 32;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.status.to_be_bytes());
        buf[4..20].copy_from_slice(self.volume_id.0.as_bytes());
        buf[20..28].copy_from_slice(&self.block_lba_on_volume.to_be_bytes());
        buf[28..32].copy_from_slice(&self.num_blocks.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return_errno_with_msg!(Errno::MessageIncomplete, "short replica read response");
        }
        Ok(Self {
            status: i32::from_be_bytes(buf[0..4].try_into().unwrap()),
            volume_id: VolumeId(read_uuid(&buf[4..20])),
            block_lba_on_volume: u64::from_be_bytes(buf[20..28].try_into().unwrap()),
            num_blocks: u32::from_be_bytes(buf[28..32].try_into().unwrap()),
        })
    }
}

const_assert_eq!(ReplicaReadResp::WIRE_SIZE, 4 + 16 + 8 + 4);

/// `ERROR_RESP`: carried when a request cannot be answered in kind.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ErrorResp {
    pub status: i32,
}

impl ErrorResp {
    pub const WIRE_SIZE: usize = 4;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        self.status.to_be_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return_errno_with_msg!(Errno::MessageIncomplete, "short error response");
        }
        Ok(Self {
            status: i32::from_be_bytes(buf[0..4].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{ReplicaReadReq, ReplicaReadResp, ReplicaWriteReq, ReplicaWriteResp};
    use xsan_types::{Errno, VolumeId};

    #[test]
    fn write_req_layout() {
        let req = ReplicaWriteReq {
            volume_id: VolumeId::generate(),
            block_lba_on_volume: 0x0102030405060708,
            num_blocks: 0x0A0B0C0D,
        };
        let wire = req.encode();
        assert_eq!(&wire[0..16], req.volume_id.0.as_bytes());
        assert_eq!(&wire[16..24], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&wire[24..28], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(ReplicaWriteReq::decode(&wire).unwrap(), req);
    }

    #[test]
    fn negative_status_survives_the_wire() {
        let resp = ReplicaWriteResp {
            status: Errno::SyncFailed.wire_code(),
            block_lba_on_volume: 2,
            num_blocks_processed: 0,
        };
        let decoded = ReplicaWriteResp::decode(&resp.encode()).unwrap();
        assert_eq!(decoded.status, -103);
    }

    #[test]
    fn read_messages_round_trip() {
        let req = ReplicaReadReq {
            volume_id: VolumeId::generate(),
            block_lba_on_volume: 77,
            num_blocks: 16,
        };
        assert_eq!(ReplicaReadReq::decode(&req.encode()).unwrap(), req);

        let resp = ReplicaReadResp {
            status: 0,
            volume_id: req.volume_id,
            block_lba_on_volume: 77,
            num_blocks: 16,
        };
        assert_eq!(ReplicaReadResp::decode(&resp.encode()).unwrap(), resp);
    }

    #[test]
    fn short_buffers_are_incomplete() {
        let req = ReplicaReadReq {
            volume_id: VolumeId::generate(),
            block_lba_on_volume: 1,
            num_blocks: 1,
        };
        let wire = req.encode();
        let err = ReplicaReadReq::decode(&wire[..20]).unwrap_err();
        assert_eq!(err.errno(), Errno::MessageIncomplete);
    }
}
