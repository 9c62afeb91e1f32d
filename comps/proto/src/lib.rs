// SPDX-License-Identifier: MPL-2.0

//! The XSAN wire protocol.
//!
//! Every message is a fixed 24-byte header followed by an opaque payload of
//! `payload_length` bytes. All multi-byte header and payload fields travel
//! in network byte order (big endian).
//!
//! ```text
//!  0: magic            u32    0x5853414E ("XSAN")
//!  4: type             u16
//!  6: version          u16    currently 1
//!  8: payload_length   u32    at most 16 MiB
//! 12: transaction_id   u64    monotonic per node
//! 20: checksum         u32    computed with this field zeroed
//! ```
//!
//! A header whose `checksum` field is zero opts out of verification; this
//! convention must survive any change of checksum algorithm.

#![deny(unsafe_code)]

mod header;
mod message;
mod payload;

pub use self::{
    header::{MessageHeader, MessageType, HEADER_SIZE, MAGIC, MAX_PAYLOAD_SIZE, VERSION},
    message::{calculate_checksum, Message},
    payload::{ErrorResp, ReplicaReadReq, ReplicaReadResp, ReplicaWriteReq, ReplicaWriteResp},
};
