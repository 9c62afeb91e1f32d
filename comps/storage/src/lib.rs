// SPDX-License-Identifier: MPL-2.0

//! The storage managers of XSAN.
//!
//! This crate turns raw block devices into replicated logical volumes:
//!
//! - [`DiskManager`] reconciles live block devices with the persisted disk
//!   records, pools disks into groups, and carves extents out of them;
//! - [`VolumeManager`] owns the logical volumes and their allocation maps
//!   and is the entry point for asynchronous volume I/O;
//! - [`replication`] fans a logical write out to every replica, tries
//!   replicas in order on reads, and serves the replica side of the wire
//!   protocol;
//! - [`ClusterView`] tracks the known nodes, supplies replica locations
//!   for new volumes, and keeps peers warm with heartbeats.
//!
//! Structural operations (create/delete/list) may be called from any
//! thread; the asynchronous I/O entry points must run on the reactor
//! thread that owns the node's devices and sockets.

#![deny(unsafe_code)]

mod cluster;
mod disk_manager;
mod records;
pub mod replication;
mod volume_manager;

pub use self::{
    cluster::ClusterView,
    disk_manager::DiskManager,
    records::{AllocationMap, Disk, DiskGroup, ReplicaLocation, Volume, VolumeExtent},
    volume_manager::{CreateVolumeParams, VolumeManager},
};
