// SPDX-License-Identifier: MPL-2.0

//! Shared types of the XSAN storage core.
//!
//! This crate defines what every other XSAN crate speaks: entity
//! identifiers, the error taxonomy, entity states, the cluster node model,
//! and the configuration structures consumed from the external loader.

#![deny(unsafe_code)]

mod config;
mod error;
mod id;
mod node;
mod state;

pub use self::{
    config::{ClusterConfig, NodeConfig, NvmfConfig, StorageConfig},
    error::{Errno, Error, Result},
    id::{DiskId, GroupId, NodeId, VolumeId},
    node::{parse_seed_nodes, Address, Node},
    state::{DiskKind, GroupKind, NodeState, StorageState},
};

/// Maximum number of replicas a volume may carry (FTT = 2).
pub const MAX_REPLICAS: u32 = 3;

/// Maximum number of member disks in one disk group.
pub const MAX_DISKS_PER_GROUP: usize = 32;

/// Maximum number of extents a single volume may be broken into.
pub const MAX_EXTENTS_PER_VOLUME: usize = 8;
