// SPDX-License-Identifier: MPL-2.0

//! The block device layer of XSAN.
//!
//! This crate wraps the reactor substrate's device registry behind the API
//! the managers consume (enumeration, lookup, DMA helpers) and owns the
//! asynchronous I/O request pipeline: one [`IoRequest`] per operation,
//! submitted with [`submit_to_bdev`], completed through a user callback
//! that fires exactly once.
//!
//! Everything here must run on a reactor thread; calls from other threads
//! fail with `Errno::ThreadContext`.

#![deny(unsafe_code)]

mod bdev;
mod io;

pub use self::{
    bdev::{buf_align, dma_alloc, enumerate, info_by_name, read_sync, write_sync},
    io::{submit_to_bdev, IoDirection, IoRequest},
};
pub use xsan_reactor::BdevInfo;
