// SPDX-License-Identifier: MPL-2.0

//! The embedded metadata store of XSAN.
//!
//! An ordered key/value store holding the structural records of the storage
//! core: disks (`d:`), disk groups (`g:`), volumes (`v:`) and volume
//! allocation maps (`volmap:`). Values are opaque bytes; the managers that
//! own each prefix choose the serialization.
//!
//! The store is a write-ahead log in front of an in-memory ordered table,
//! compacted into a snapshot file once the log grows large. Every mutation
//! is durable on return under the default [`SyncPolicy::Always`]: the log
//! record is appended and fsynced before the call completes. Recovery
//! replays the snapshot and then the log, discarding a torn tail.

#![deny(unsafe_code)]

mod store;
mod wal;

pub use self::store::{MetaIter, MetaStore, SyncPolicy};
