// SPDX-License-Identifier: MPL-2.0

//! Persisted entity records and their metadata-store keys.
//!
//! Records serialize to self-describing JSON so that adding fields stays
//! backward compatible: readers fill missing fields with defaults and
//! tolerate unknown ones.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use xsan_types::{
    DiskId, DiskKind, GroupId, GroupKind, NodeId, StorageState, VolumeId,
};

/// Key-space prefixes within the metadata store.
pub(crate) const DISK_PREFIX: &str = "d:";
pub(crate) const GROUP_PREFIX: &str = "g:";
pub(crate) const VOLUME_PREFIX: &str = "v:";
pub(crate) const VOLMAP_PREFIX: &str = "volmap:";

pub(crate) fn disk_key(id: DiskId) -> Vec<u8> {
    format!("{DISK_PREFIX}{id}").into_bytes()
}

pub(crate) fn group_key(id: GroupId) -> Vec<u8> {
    format!("{GROUP_PREFIX}{id}").into_bytes()
}

pub(crate) fn volume_key(id: VolumeId) -> Vec<u8> {
    format!("{VOLUME_PREFIX}{id}").into_bytes()
}

pub(crate) fn volmap_key(id: VolumeId) -> Vec<u8> {
    format!("{VOLMAP_PREFIX}{id}").into_bytes()
}

/// One XSAN disk, wrapping a reactor-managed block device.
///
/// A disk with a non-nil `assigned_group_id` appears in the `disk_ids`
/// list of exactly that group.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct Disk {
    pub id: DiskId,
    pub bdev_name: String,
    pub bdev_uuid: Uuid,
    #[serde(default)]
    pub assigned_group_id: GroupId,
    #[serde(default)]
    pub kind: DiskKind,
    #[serde(default)]
    pub state: StorageState,
    pub capacity_bytes: u64,
    pub block_size: u32,
    pub num_blocks: u64,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub is_rotational: bool,
    #[serde(default)]
    pub optimal_io_boundary: u32,
    #[serde(default)]
    pub has_write_cache: bool,
}

impl Disk {
    pub fn is_assigned(&self) -> bool {
        !self.assigned_group_id.is_nil()
    }
}

/// A pool of disks from which volumes carve space.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct DiskGroup {
    pub id: GroupId,
    pub name: String,
    pub kind: GroupKind,
    #[serde(default)]
    pub state: StorageState,
    pub disk_ids: Vec<DiskId>,
    pub total_capacity_bytes: u64,
    pub usable_capacity_bytes: u64,
    #[serde(default)]
    pub allocated_bytes: u64,
    /// Next free block in the group's aggregated logical space, counted in
    /// `group_block_size` units.
    #[serde(default)]
    pub next_alloc_block: u64,
    /// The group's allocation quantum: the smallest member block size.
    pub group_block_size: u32,
    /// Per-member bump cursors, in each disk's own physical blocks.
    #[serde(default)]
    pub disk_cursors: Vec<u64>,
}

impl DiskGroup {
    pub fn disk_count(&self) -> u32 {
        self.disk_ids.len() as u32
    }
}

/// Location of one volume replica. Row 0 is the primary/local replica.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct ReplicaLocation {
    pub node_id: NodeId,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub state: StorageState,
    #[serde(default)]
    pub last_contact_us: u64,
}

/// A logical volume presented externally.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct Volume {
    pub id: VolumeId,
    pub name: String,
    pub size_bytes: u64,
    /// Logical block size exposed by the volume; a power of two dividing
    /// `size_bytes`.
    pub block_size: u32,
    pub num_blocks: u64,
    #[serde(default)]
    pub state: StorageState,
    pub source_group_id: GroupId,
    #[serde(default)]
    pub thin_provisioned: bool,
    #[serde(default)]
    pub allocated_bytes: u64,
    /// Failures to tolerate; the replica count is `ftt + 1`, capped.
    #[serde(default)]
    pub ftt: u32,
    #[serde(default)]
    pub actual_replica_count: u32,
    #[serde(default)]
    pub replicas: Vec<ReplicaLocation>,
}

impl Volume {
    /// Remote replica rows (all but the primary).
    pub fn remote_replicas(&self) -> &[ReplicaLocation] {
        if self.replicas.len() <= 1 {
            &[]
        } else {
            &self.replicas[1..self.actual_replica_count.min(self.replicas.len() as u32) as usize]
        }
    }
}

/// One contiguous run of physical blocks on one disk, mapped to a
/// contiguous run of the volume's logical blocks.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct VolumeExtent {
    pub disk_id: DiskId,
    pub start_block_on_disk: u64,
    pub num_blocks_on_disk: u64,
    /// First volume-logical block this extent backs.
    pub volume_start_lba: u64,
}

/// The persisted physical layout of one volume.
///
/// Extents are ordered by `volume_start_lba` and partition
/// `[0, total_volume_blocks)` without gaps or overlap.
#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub struct AllocationMap {
    pub volume_id: VolumeId,
    pub group_id: GroupId,
    pub extents: Vec<VolumeExtent>,
    pub total_volume_blocks: u64,
    pub volume_block_size: u32,
}
