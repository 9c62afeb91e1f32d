// SPDX-License-Identifier: MPL-2.0

//! Node-to-node communication for the XSAN storage core.
//!
//! One [`NodeComm`] instance runs per reactor. It owns the listening
//! socket, every established connection (accepted or outbound), and the
//! receive machinery that reassembles length-prefixed wire messages from
//! the byte stream. Fully received messages are dispatched to the handler
//! registered for their type, or to the generic fallback; **the handler
//! takes ownership of the message**.
//!
//! The module also keeps the `transaction_id -> pending operation` table
//! that correlates `REPLICA_*_RESP` messages (and connection failures)
//! back to the in-flight replicated-I/O contexts of the replication
//! coordinator.
//!
//! All operations must be invoked on the reactor thread that owns the
//! socket group.

#![deny(unsafe_code)]

mod comm;

pub use self::comm::{NodeComm, PendingOp};
pub use xsan_reactor::SockId;
