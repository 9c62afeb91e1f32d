// SPDX-License-Identifier: MPL-2.0

//! The polled reactor substrate of XSAN.
//!
//! Every storage-core operation runs on a *reactor*: a single-threaded,
//! cooperatively scheduled event loop bound to one OS thread. A reactor tick
//! runs the registered pollers, delivers deferred completions, and then runs
//! messages posted from other threads. Nothing in the core blocks; an
//! operation either finishes immediately or arms a callback that a later
//! tick delivers.
//!
//! The substrate owns the resources whose lifetime the reactor controls:
//!
//! - named block devices and their open descriptors and I/O channels;
//! - DMA-capable buffers with device-required alignment;
//! - the socket group: non-blocking TCP listeners, connections, and
//!   asynchronous outbound connects.
//!
//! The reference backends here are userspace implementations (RAM- and
//! file-backed devices, kernel TCP sockets). They keep the contract that
//! matters to the layers above: completions are delivered from a later poll
//! tick on the submitting reactor, never inline from the submission call.

mod bdev;
mod dma;
mod reactor;
mod sock;

pub use self::{
    bdev::{BdevBackend, BdevDesc, BdevInfo, FileBdev, IoChannel, MemBdev},
    dma::DmaBuf,
    reactor::{PollStatus, PollerId, Reactor, ReactorSender},
    sock::{SockEvent, SockId},
};
