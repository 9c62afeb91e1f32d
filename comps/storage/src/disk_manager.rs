// SPDX-License-Identifier: MPL-2.0

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use xsan_metastore::MetaStore;
use xsan_types::{
    return_errno_with_msg, DiskId, DiskKind, Errno, Error, GroupId, GroupKind, Result,
    StorageState, MAX_DISKS_PER_GROUP, MAX_EXTENTS_PER_VOLUME,
};

use crate::records::{
    disk_key, group_key, Disk, DiskGroup, VolumeExtent, DISK_PREFIX, GROUP_PREFIX,
};

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|_| Error::with_msg(Errno::StorageGeneric, "record serialization failed"))
}

pub(crate) fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|_| Error::with_msg(Errno::StorageGeneric, "record deserialization failed"))
}

struct Inner {
    disks: Vec<Disk>,
    groups: Vec<DiskGroup>,
}

/// Owner of the node's disks and disk groups.
///
/// Holds the persisted `d:` and `g:` records in memory, reconciles them
/// with the live block devices, and hands out extents to the volume
/// manager. Structural operations may run on any thread;
/// [`DiskManager::scan_and_reconcile`] must run on the reactor thread
/// because it talks to the block device layer.
pub struct DiskManager {
    store: Arc<MetaStore>,
    inner: Mutex<Inner>,
}

impl DiskManager {
    /// Loads every persisted disk and group record.
    pub fn init(store: Arc<MetaStore>) -> Result<Arc<DiskManager>> {
        let mut disks: Vec<Disk> = Vec::new();
        let mut groups: Vec<DiskGroup> = Vec::new();

        let mut iter = store.iter();
        iter.seek(DISK_PREFIX.as_bytes());
        while iter.is_valid() {
            let Some(key) = iter.key() else { break };
            if !key.starts_with(DISK_PREFIX.as_bytes()) {
                break;
            }
            match iter.value().map(from_json::<Disk>) {
                Some(Ok(disk)) => disks.push(disk),
                _ => error!(
                    "skipping unreadable disk record {:?}",
                    String::from_utf8_lossy(key)
                ),
            }
            iter.next();
        }
        iter.seek(GROUP_PREFIX.as_bytes());
        while iter.is_valid() {
            let Some(key) = iter.key() else { break };
            if !key.starts_with(GROUP_PREFIX.as_bytes()) {
                break;
            }
            match iter.value().map(from_json::<DiskGroup>) {
                Some(Ok(group)) => groups.push(group),
                _ => error!(
                    "skipping unreadable group record {:?}",
                    String::from_utf8_lossy(key)
                ),
            }
            iter.next();
        }

        info!(
            "disk manager loaded {} disks, {} groups",
            disks.len(),
            groups.len()
        );
        Ok(Arc::new(DiskManager {
            store,
            inner: Mutex::new(Inner { disks, groups }),
        }))
    }

    /// Reconciles the loaded records with the live block devices.
    ///
    /// - unseen devices get fresh disk records;
    /// - loaded disks whose device is gone are marked missing;
    /// - matched disks refresh their volatile attributes.
    pub fn scan_and_reconcile(&self) -> Result<()> {
        let devices = xsan_block::enumerate()?;
        let mut inner = self.lock();

        for info in &devices {
            if let Some(disk) = inner
                .disks
                .iter_mut()
                .find(|d| d.bdev_name == info.name || d.bdev_uuid == info.uuid)
            {
                disk.bdev_uuid = info.uuid;
                disk.block_size = info.block_size;
                disk.num_blocks = info.num_blocks;
                disk.capacity_bytes = info.capacity_bytes();
                let record = disk.clone();
                self.save_disk(&record)?;
                debug!("disk '{}' matched to existing record {}", info.name, record.id);
                continue;
            }

            let disk = Disk {
                id: DiskId::generate(),
                bdev_name: info.name.clone(),
                bdev_uuid: info.uuid,
                assigned_group_id: GroupId::nil(),
                kind: DiskKind::infer(&info.product_name, info.is_rotational),
                state: StorageState::Online,
                capacity_bytes: info.capacity_bytes(),
                block_size: info.block_size,
                num_blocks: info.num_blocks,
                product_name: info.product_name.clone(),
                is_rotational: info.is_rotational,
                optimal_io_boundary: info.optimal_io_boundary,
                has_write_cache: info.write_cache,
            };
            info!(
                "registering new disk '{}' as {} ({} B)",
                disk.bdev_name, disk.id, disk.capacity_bytes
            );
            self.save_disk(&disk)?;
            inner.disks.push(disk);
        }

        for disk in inner.disks.iter_mut() {
            if devices.iter().any(|d| d.name == disk.bdev_name) {
                continue;
            }
            if disk.state != StorageState::Missing {
                warn!("disk '{}' ({}) has no backing device", disk.bdev_name, disk.id);
                disk.state = StorageState::Missing;
                let record = disk.clone();
                self.save_disk(&record)?;
            }
        }
        Ok(())
    }

    /// Creates a disk group over the named block devices.
    pub fn create_group(
        &self,
        name: &str,
        kind: GroupKind,
        bdev_names: &[&str],
    ) -> Result<GroupId> {
        if name.is_empty() || bdev_names.is_empty() {
            return_errno_with_msg!(Errno::InvalidArgs, "group needs a name and members");
        }
        if bdev_names.len() > MAX_DISKS_PER_GROUP {
            return_errno_with_msg!(Errno::InvalidArgs, "too many member disks");
        }

        let mut inner = self.lock();
        if inner.groups.iter().any(|g| g.name == name) {
            return_errno_with_msg!(Errno::AlreadyExists, "group name already exists");
        }

        let mut member_ids = Vec::with_capacity(bdev_names.len());
        let mut total = 0u64;
        let mut min_block = u32::MAX;
        for bdev_name in bdev_names {
            let Some(disk) = inner.disks.iter().find(|d| d.bdev_name == *bdev_name) else {
                return_errno_with_msg!(Errno::NotFound, "member disk not found");
            };
            if disk.state != StorageState::Online {
                return_errno_with_msg!(Errno::ResourceBusy, "member disk not online");
            }
            if disk.is_assigned() {
                return_errno_with_msg!(Errno::ResourceBusy, "member disk already grouped");
            }
            member_ids.push(disk.id);
            total += disk.capacity_bytes;
            min_block = min_block.min(disk.block_size);
        }

        let group = DiskGroup {
            id: GroupId::generate(),
            name: name.to_string(),
            kind,
            state: StorageState::Online,
            disk_cursors: vec![0; member_ids.len()],
            disk_ids: member_ids,
            total_capacity_bytes: total,
            usable_capacity_bytes: total,
            allocated_bytes: 0,
            next_alloc_block: 0,
            group_block_size: min_block,
        };
        self.save_group(&group)?;

        for disk_id in group.disk_ids.clone() {
            if let Some(disk) = inner.disks.iter_mut().find(|d| d.id == disk_id) {
                disk.assigned_group_id = group.id;
                let record = disk.clone();
                self.save_disk(&record)?;
            }
        }

        info!(
            "disk group '{}' ({}) created: {} disks, {} B raw, {} B quantum",
            group.name,
            group.id,
            group.disk_count(),
            group.total_capacity_bytes,
            group.group_block_size
        );
        let id = group.id;
        inner.groups.push(group);
        Ok(id)
    }

    /// Deletes a disk group and unassigns its members.
    ///
    /// The caller is responsible for checking that no volume still draws
    /// from the group (the volume manager guards its own deletions).
    pub fn delete_group(&self, group_id: GroupId) -> Result<()> {
        let mut inner = self.lock();
        let Some(pos) = inner.groups.iter().position(|g| g.id == group_id) else {
            return_errno_with_msg!(Errno::NotFound, "no such disk group");
        };

        let member_ids = inner.groups[pos].disk_ids.clone();
        for disk_id in member_ids {
            if let Some(disk) = inner.disks.iter_mut().find(|d| d.id == disk_id) {
                disk.assigned_group_id = GroupId::nil();
                let record = disk.clone();
                self.save_disk(&record)?;
            }
        }
        self.store.delete(&group_key(group_id))?;
        let group = inner.groups.remove(pos);
        info!("disk group '{}' ({}) deleted", group.name, group.id);
        Ok(())
    }

    pub fn find_disk_by_id(&self, id: DiskId) -> Option<Disk> {
        self.lock().disks.iter().find(|d| d.id == id).cloned()
    }

    pub fn find_disk_by_bdev_name(&self, name: &str) -> Option<Disk> {
        self.lock().disks.iter().find(|d| d.bdev_name == name).cloned()
    }

    pub fn find_group_by_id(&self, id: GroupId) -> Option<DiskGroup> {
        self.lock().groups.iter().find(|g| g.id == id).cloned()
    }

    pub fn find_group_by_name(&self, name: &str) -> Option<DiskGroup> {
        self.lock().groups.iter().find(|g| g.name == name).cloned()
    }

    pub fn list_disks(&self) -> Vec<Disk> {
        self.lock().disks.clone()
    }

    pub fn list_groups(&self) -> Vec<DiskGroup> {
        self.lock().groups.clone()
    }

    /// Marks a disk's operational state and persists the change.
    pub fn set_disk_state(&self, id: DiskId, state: StorageState) -> Result<()> {
        let mut inner = self.lock();
        let Some(disk) = inner.disks.iter_mut().find(|d| d.id == id) else {
            return_errno_with_msg!(Errno::NotFound, "no such disk");
        };
        disk.state = state;
        let record = disk.clone();
        self.save_disk(&record)
    }

    /// Reserves `blocks_needed` volume-logical blocks from a group.
    ///
    /// Walks member disks in declared order, emitting one extent per
    /// contributing disk; extents carry cumulative `volume_start_lba`
    /// values in volume-logical blocks. The bump cursors and the group's
    /// accounting are persisted before returning.
    pub fn allocate_extents(
        &self,
        group_id: GroupId,
        blocks_needed: u64,
        volume_block_size: u32,
    ) -> Result<Vec<VolumeExtent>> {
        if blocks_needed == 0 || !volume_block_size.is_power_of_two() {
            return_errno_with_msg!(Errno::InvalidArgs, "bad allocation request");
        }

        let mut inner = self.lock();
        let inner = &mut *inner;
        let Some(group) = inner.groups.iter_mut().find(|g| g.id == group_id) else {
            return_errno_with_msg!(Errno::NotFound, "no such disk group");
        };
        if group.state != StorageState::Online {
            return_errno_with_msg!(Errno::ResourceBusy, "disk group not online");
        }
        if volume_block_size < group.group_block_size
            || volume_block_size as u64 % group.group_block_size as u64 != 0
        {
            return_errno_with_msg!(
                Errno::InvalidArgs,
                "volume block size incompatible with group quantum"
            );
        }
        if group.disk_cursors.len() != group.disk_ids.len() {
            group.disk_cursors.resize(group.disk_ids.len(), 0);
        }

        let needed_bytes = blocks_needed * volume_block_size as u64;
        let needed_group_blocks = needed_bytes.div_ceil(group.group_block_size as u64);

        let saved_cursors = group.disk_cursors.clone();
        let mut extents: Vec<VolumeExtent> = Vec::new();
        let mut remaining_vol_blocks = blocks_needed;
        let mut next_volume_lba = 0u64;

        for (idx, disk_id) in group.disk_ids.iter().enumerate() {
            if remaining_vol_blocks == 0 {
                break;
            }
            if extents.len() == MAX_EXTENTS_PER_VOLUME {
                break;
            }
            let Some(disk) = inner.disks.iter().find(|d| d.id == *disk_id) else {
                warn!("group {} references unknown disk {}", group.id, disk_id);
                continue;
            };
            if disk.state != StorageState::Online {
                continue;
            }
            if volume_block_size as u64 % disk.block_size as u64 != 0 {
                group.disk_cursors = saved_cursors;
                return_errno_with_msg!(
                    Errno::InvalidArgs,
                    "volume block size incompatible with member disk"
                );
            }

            // Keep extents aligned to whole volume blocks on this disk.
            let quantum = volume_block_size as u64 / disk.block_size as u64;
            let cursor = group.disk_cursors[idx];
            let avail = disk.num_blocks.saturating_sub(cursor);
            let avail_aligned = avail - (avail % quantum);
            let take = avail_aligned.min(remaining_vol_blocks * quantum);
            if take == 0 {
                continue;
            }

            extents.push(VolumeExtent {
                disk_id: disk.id,
                start_block_on_disk: cursor,
                num_blocks_on_disk: take,
                volume_start_lba: next_volume_lba,
            });
            group.disk_cursors[idx] = cursor + take;
            let vol_blocks = take / quantum;
            next_volume_lba += vol_blocks;
            remaining_vol_blocks -= vol_blocks;
        }

        if remaining_vol_blocks > 0 {
            group.disk_cursors = saved_cursors;
            debug!(
                "allocation of {} blocks from group '{}' failed, {} unsatisfied",
                blocks_needed, group.name, remaining_vol_blocks
            );
            return_errno_with_msg!(Errno::InsufficientSpace, "group cannot satisfy allocation");
        }

        group.allocated_bytes += needed_bytes;
        group.next_alloc_block += needed_group_blocks;
        let record = group.clone();
        self.save_group(&record)?;
        Ok(extents)
    }

    /// Returns extents to the group's accounting.
    ///
    /// The bump allocator does not reuse freed space; only the allocated
    /// byte counter shrinks.
    pub fn free_extents(
        &self,
        group_id: GroupId,
        extents: &[VolumeExtent],
        volume_block_size: u32,
    ) -> Result<()> {
        let mut inner = self.lock();
        let inner = &mut *inner;
        let Some(group) = inner.groups.iter_mut().find(|g| g.id == group_id) else {
            return_errno_with_msg!(Errno::NotFound, "no such disk group");
        };

        let mut freed_bytes = 0u64;
        for extent in extents {
            let disk_block = inner
                .disks
                .iter()
                .find(|d| d.id == extent.disk_id)
                .map(|d| d.block_size)
                .unwrap_or(volume_block_size);
            freed_bytes += extent.num_blocks_on_disk * disk_block as u64;
        }
        group.allocated_bytes = group.allocated_bytes.saturating_sub(freed_bytes);
        let record = group.clone();
        self.save_group(&record)
    }

    fn save_disk(&self, disk: &Disk) -> Result<()> {
        self.store.put(&disk_key(disk.id), &to_json(disk)?)
    }

    fn save_group(&self, group: &DiskGroup) -> Result<()> {
        self.store.put(&group_key(group.id), &to_json(group)?)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use xsan_metastore::MetaStore;
    use xsan_reactor::{MemBdev, Reactor};
    use xsan_types::{Errno, GroupKind, StorageState};

    use super::DiskManager;

    fn fixture(test: impl FnOnce(Arc<DiskManager>) + Send + 'static) {
        std::thread::spawn(move || {
            let reactor = Reactor::init_current(0).unwrap();
            reactor
                .register_bdev(Box::new(MemBdev::new("mem0", 4096, 262_144)))
                .unwrap();
            reactor
                .register_bdev(Box::new(MemBdev::new("mem1", 512, 2048)))
                .unwrap();
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(MetaStore::open(dir.path().join("meta"), true).unwrap());
            let dm = DiskManager::init(store).unwrap();
            dm.scan_and_reconcile().unwrap();
            test(dm);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn scan_registers_live_devices() {
        fixture(|dm| {
            let disks = dm.list_disks();
            assert_eq!(disks.len(), 2);
            let mem0 = dm.find_disk_by_bdev_name("mem0").unwrap();
            assert_eq!(mem0.state, StorageState::Online);
            assert_eq!(mem0.block_size, 4096);
            assert_eq!(mem0.capacity_bytes, 4096 * 262_144);
            assert!(!mem0.is_assigned());
        });
    }

    #[test]
    fn group_create_validations() {
        fixture(|dm| {
            assert_eq!(
                dm.create_group("g1", GroupKind::Passthrough, &["nope"])
                    .unwrap_err()
                    .errno(),
                Errno::NotFound
            );
            let id = dm
                .create_group("g1", GroupKind::Passthrough, &["mem0"])
                .unwrap();
            assert_eq!(
                dm.create_group("g1", GroupKind::Passthrough, &["mem1"])
                    .unwrap_err()
                    .errno(),
                Errno::AlreadyExists
            );
            assert_eq!(
                dm.create_group("g2", GroupKind::Passthrough, &["mem0"])
                    .unwrap_err()
                    .errno(),
                Errno::ResourceBusy
            );

            let group = dm.find_group_by_id(id).unwrap();
            assert_eq!(group.group_block_size, 4096);
            assert_eq!(group.usable_capacity_bytes, group.total_capacity_bytes);
            assert!(dm.find_disk_by_bdev_name("mem0").unwrap().is_assigned());
        });
    }

    #[test]
    fn group_delete_unassigns_members() {
        fixture(|dm| {
            let id = dm
                .create_group("g1", GroupKind::Passthrough, &["mem0"])
                .unwrap();
            dm.delete_group(id).unwrap();
            assert!(dm.find_group_by_id(id).is_none());
            assert!(!dm.find_disk_by_bdev_name("mem0").unwrap().is_assigned());
        });
    }

    #[test]
    fn jbod_allocation_spans_members() {
        fixture(|dm| {
            // mem1 is only 1 MiB of 512-byte blocks; a 2 MiB allocation
            // must spill onto mem0.
            let id = dm
                .create_group("g1", GroupKind::Jbod, &["mem1", "mem0"])
                .unwrap();
            let extents = dm.allocate_extents(id, 512, 4096).unwrap();
            assert_eq!(extents.len(), 2);
            assert_eq!(extents[0].volume_start_lba, 0);
            assert_eq!(extents[0].num_blocks_on_disk, 2048);
            assert_eq!(extents[1].volume_start_lba, 256);
            assert_eq!(extents[1].num_blocks_on_disk, 256);

            let group = dm.find_group_by_id(id).unwrap();
            assert_eq!(group.allocated_bytes, 512 * 4096);
            assert_eq!(group.disk_cursors, vec![2048, 256]);
        });
    }

    #[test]
    fn exhaustion_is_insufficient_space_and_rolls_back() {
        fixture(|dm| {
            let id = dm
                .create_group("g1", GroupKind::Passthrough, &["mem1"])
                .unwrap();
            let before = dm.find_group_by_id(id).unwrap();
            let err = dm.allocate_extents(id, 10_000, 4096).unwrap_err();
            assert_eq!(err.errno(), Errno::InsufficientSpace);
            let after = dm.find_group_by_id(id).unwrap();
            assert_eq!(after.disk_cursors, before.disk_cursors);
            assert_eq!(after.allocated_bytes, 0);
        });
    }

    #[test]
    fn free_extents_releases_accounting_only() {
        fixture(|dm| {
            let id = dm
                .create_group("g1", GroupKind::Passthrough, &["mem0"])
                .unwrap();
            let extents = dm.allocate_extents(id, 256, 4096).unwrap();
            assert_eq!(dm.find_group_by_id(id).unwrap().allocated_bytes, 256 * 4096);
            dm.free_extents(id, &extents, 4096).unwrap();
            let group = dm.find_group_by_id(id).unwrap();
            assert_eq!(group.allocated_bytes, 0);
            // Bump allocator: the cursor does not move backwards.
            assert_eq!(group.disk_cursors[0], 256);
        });
    }
}
