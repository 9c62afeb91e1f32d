// SPDX-License-Identifier: MPL-2.0

use std::{
    cell::Cell,
    rc::Rc,
    sync::{Arc, Mutex, MutexGuard},
};

use hashbrown::HashMap;
use log::{debug, error, info, warn};
use xsan_block::{submit_to_bdev, IoRequest};
use xsan_types::{
    return_errno_with_msg, DiskId, Errno, Error, GroupId, Result, StorageState, VolumeId,
    MAX_REPLICAS,
};

use crate::{
    cluster::ClusterView,
    disk_manager::{from_json, to_json, DiskManager},
    records::{
        volmap_key, volume_key, AllocationMap, Volume, VOLMAP_PREFIX, VOLUME_PREFIX,
    },
    replication,
};

/// Inputs to [`VolumeManager::create_volume`].
#[derive(Clone, Debug)]
pub struct CreateVolumeParams {
    pub name: String,
    pub size_bytes: u64,
    pub group_id: GroupId,
    pub block_size: u32,
    pub thin_provisioned: bool,
    /// Failures to tolerate; replica count is `ftt + 1`, capped by the
    /// platform maximum and the cluster size.
    pub ftt: u32,
}

struct Inner {
    volumes: Vec<Volume>,
    maps: HashMap<VolumeId, AllocationMap>,
    /// Re-exposer reference counts (NVMe-oF namespaces, virtual block
    /// devices). A volume with a non-zero count cannot be deleted.
    export_refs: HashMap<VolumeId, u32>,
}

/// One physical submission of a volume I/O after LBA resolution.
#[derive(Clone, Debug)]
pub(crate) struct IoSegment {
    pub disk_id: DiskId,
    pub bdev_name: String,
    pub offset_bytes_on_disk: u64,
    pub length_bytes: u64,
    pub block_size: u32,
    /// Byte offset of this segment within the logical I/O.
    pub logical_offset: u64,
}

/// Owner of the logical volumes and their allocation maps; entry point
/// for asynchronous volume I/O.
pub struct VolumeManager {
    store: Arc<xsan_metastore::MetaStore>,
    disk_manager: Arc<DiskManager>,
    cluster: Arc<ClusterView>,
    inner: Mutex<Inner>,
}

impl VolumeManager {
    /// Loads `v:` and `volmap:` records and reconciles strays: a map
    /// without its volume is garbage from a crashed create and is removed;
    /// a volume without its map is a crashed delete and is completed.
    pub fn init(
        store: Arc<xsan_metastore::MetaStore>,
        disk_manager: Arc<DiskManager>,
        cluster: Arc<ClusterView>,
    ) -> Result<Arc<VolumeManager>> {
        let mut volumes: Vec<Volume> = Vec::new();
        let mut maps: HashMap<VolumeId, AllocationMap> = HashMap::new();

        let mut iter = store.iter();
        iter.seek(VOLUME_PREFIX.as_bytes());
        while iter.is_valid() {
            let Some(key) = iter.key() else { break };
            if !key.starts_with(VOLUME_PREFIX.as_bytes()) {
                break;
            }
            match iter.value().map(from_json::<Volume>) {
                Some(Ok(volume)) => volumes.push(volume),
                _ => error!(
                    "skipping unreadable volume record {:?}",
                    String::from_utf8_lossy(key)
                ),
            }
            iter.next();
        }
        iter.seek(VOLMAP_PREFIX.as_bytes());
        while iter.is_valid() {
            let Some(key) = iter.key() else { break };
            if !key.starts_with(VOLMAP_PREFIX.as_bytes()) {
                break;
            }
            match iter.value().map(from_json::<AllocationMap>) {
                Some(Ok(map)) => {
                    maps.insert(map.volume_id, map);
                }
                _ => error!(
                    "skipping unreadable allocation map {:?}",
                    String::from_utf8_lossy(key)
                ),
            }
            iter.next();
        }

        // Stray maps: creation crashed between the map and volume writes.
        let stray: Vec<VolumeId> = maps
            .keys()
            .filter(|id| !volumes.iter().any(|v| v.id == **id))
            .copied()
            .collect();
        for id in stray {
            warn!("dropping stray allocation map for absent volume {id}");
            store.delete(&volmap_key(id))?;
            maps.remove(&id);
        }
        // Volumes without maps: deletion crashed after the map went away.
        let half_deleted: Vec<VolumeId> = volumes
            .iter()
            .filter(|v| !maps.contains_key(&v.id))
            .map(|v| v.id)
            .collect();
        for id in half_deleted {
            warn!("completing interrupted deletion of volume {id}");
            store.delete(&volume_key(id))?;
            volumes.retain(|v| v.id != id);
        }

        info!("volume manager loaded {} volumes", volumes.len());
        Ok(Arc::new(VolumeManager {
            store,
            disk_manager,
            cluster,
            inner: Mutex::new(Inner {
                volumes,
                maps,
                export_refs: HashMap::new(),
            }),
        }))
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    pub fn cluster(&self) -> &Arc<ClusterView> {
        &self.cluster
    }

    /// Creates a volume: validates, reserves extents, persists the
    /// allocation map and then the volume record, and seeds the replica
    /// table from the cluster view.
    pub fn create_volume(&self, params: CreateVolumeParams) -> Result<VolumeId> {
        let CreateVolumeParams {
            name,
            size_bytes,
            group_id,
            block_size,
            thin_provisioned,
            ftt,
        } = params;

        if name.is_empty() || size_bytes == 0 || block_size == 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "bad volume parameters");
        }
        if !block_size.is_power_of_two() || size_bytes % block_size as u64 != 0 {
            return_errno_with_msg!(
                Errno::InvalidArgs,
                "block size must be a power of two dividing the volume size"
            );
        }
        let Some(group) = self.disk_manager.find_group_by_id(group_id) else {
            return_errno_with_msg!(Errno::NotFound, "source disk group not found");
        };
        if group.state != StorageState::Online {
            return_errno_with_msg!(Errno::ResourceBusy, "source disk group not online");
        }
        if !thin_provisioned && size_bytes > group.usable_capacity_bytes {
            return_errno_with_msg!(Errno::InsufficientSpace, "volume larger than usable space");
        }
        {
            let inner = self.lock();
            if inner.volumes.iter().any(|v| v.name == name) {
                return_errno_with_msg!(Errno::VolumeExists, "volume name already exists");
            }
        }

        let num_blocks = size_bytes / block_size as u64;
        let nodes = self.cluster.node_count() as u32;
        let targeted = (ftt + 1).min(MAX_REPLICAS).min(nodes.max(1));
        if targeted < ftt + 1 {
            warn!(
                "volume '{name}': ftt {ftt} wants {} replicas, only {targeted} available",
                ftt + 1
            );
        }

        let extents = self
            .disk_manager
            .allocate_extents(group_id, num_blocks, block_size)?;
        let volume_id = VolumeId::generate();
        let map = AllocationMap {
            volume_id,
            group_id,
            extents,
            total_volume_blocks: num_blocks,
            volume_block_size: block_size,
        };
        let volume = Volume {
            id: volume_id,
            name,
            size_bytes,
            block_size,
            num_blocks,
            state: StorageState::Online,
            source_group_id: group_id,
            thin_provisioned,
            allocated_bytes: if thin_provisioned { 0 } else { size_bytes },
            ftt,
            actual_replica_count: targeted,
            replicas: self.cluster.replica_locations(targeted),
        };

        // Map first, then volume: a crash in between leaves a stray map
        // that init() garbage-collects.
        self.store.put(&volmap_key(volume_id), &to_json(&map)?)?;
        if let Err(err) = self.store.put(&volume_key(volume_id), &to_json(&volume)?) {
            let _ = self.store.delete(&volmap_key(volume_id));
            let _ = self
                .disk_manager
                .free_extents(group_id, &map.extents, block_size);
            return Err(err);
        }

        info!(
            "volume '{}' ({}) created: {} B in {} extents, {} replicas",
            volume.name,
            volume.id,
            volume.size_bytes,
            map.extents.len(),
            volume.actual_replica_count
        );
        let mut inner = self.lock();
        inner.maps.insert(volume_id, map);
        inner.volumes.push(volume);
        Ok(volume_id)
    }

    /// Registers a volume whose records were produced elsewhere.
    ///
    /// This is how replica nodes receive volume metadata: the control
    /// plane ships the volume record, the receiving node lays the volume
    /// out on its own disks, and both records are persisted here (map
    /// first, like a local creation).
    pub fn adopt_volume(&self, volume: Volume, map: AllocationMap) -> Result<()> {
        if volume.id != map.volume_id
            || map.total_volume_blocks != volume.num_blocks
            || map.volume_block_size != volume.block_size
        {
            return_errno_with_msg!(Errno::InvalidArgs, "allocation map does not fit the volume");
        }
        {
            let inner = self.lock();
            if inner.volumes.iter().any(|v| v.id == volume.id) {
                return_errno_with_msg!(Errno::VolumeExists, "volume id already present");
            }
        }
        self.store.put(&volmap_key(volume.id), &to_json(&map)?)?;
        self.store.put(&volume_key(volume.id), &to_json(&volume)?)?;
        info!("adopted volume '{}' ({})", volume.name, volume.id);
        let mut inner = self.lock();
        inner.maps.insert(volume.id, map);
        inner.volumes.push(volume);
        Ok(())
    }

    /// Deletes a volume and releases its extents. Fails with `VolumeBusy`
    /// while a re-exposer holds a reference.
    pub fn delete_volume(&self, volume_id: VolumeId) -> Result<()> {
        let (map, block_size) = {
            let inner = self.lock();
            let Some(volume) = inner.volumes.iter().find(|v| v.id == volume_id) else {
                return_errno_with_msg!(Errno::VolumeNotFound, "no such volume");
            };
            if inner.export_refs.get(&volume_id).copied().unwrap_or(0) > 0 {
                return_errno_with_msg!(Errno::VolumeBusy, "volume has active exporters");
            }
            let map = inner
                .maps
                .get(&volume_id)
                .cloned()
                .ok_or(Error::new(Errno::StorageGeneric))?;
            (map, volume.block_size)
        };

        self.disk_manager
            .free_extents(map.group_id, &map.extents, block_size)?;
        self.store.delete(&volmap_key(volume_id))?;
        self.store.delete(&volume_key(volume_id))?;

        let mut inner = self.lock();
        inner.maps.remove(&volume_id);
        inner.volumes.retain(|v| v.id != volume_id);
        info!("volume {volume_id} deleted");
        Ok(())
    }

    pub fn get_volume(&self, id: VolumeId) -> Option<Volume> {
        self.lock().volumes.iter().find(|v| v.id == id).cloned()
    }

    pub fn get_volume_by_name(&self, name: &str) -> Option<Volume> {
        self.lock().volumes.iter().find(|v| v.name == name).cloned()
    }

    pub fn list_volumes(&self) -> Vec<Volume> {
        self.lock().volumes.clone()
    }

    pub fn allocation_map(&self, id: VolumeId) -> Option<AllocationMap> {
        self.lock().maps.get(&id).cloned()
    }

    /// Whether any volume still draws from the group; used to guard disk
    /// group deletion.
    pub fn group_in_use(&self, group_id: GroupId) -> bool {
        self.lock()
            .volumes
            .iter()
            .any(|v| v.source_group_id == group_id)
    }

    /// Takes a re-exposer reference on a volume.
    pub fn register_exporter(&self, id: VolumeId) -> Result<()> {
        let mut inner = self.lock();
        if !inner.volumes.iter().any(|v| v.id == id) {
            return_errno_with_msg!(Errno::VolumeNotFound, "no such volume");
        }
        *inner.export_refs.entry(id).or_insert(0) += 1;
        Ok(())
    }

    /// Drops a re-exposer reference.
    pub fn unregister_exporter(&self, id: VolumeId) {
        let mut inner = self.lock();
        if let Some(refs) = inner.export_refs.get_mut(&id) {
            *refs = refs.saturating_sub(1);
        }
    }

    /// Updates the recorded state of one replica row.
    pub fn set_replica_state(
        &self,
        volume_id: VolumeId,
        replica_index: usize,
        state: StorageState,
    ) -> Result<()> {
        let mut inner = self.lock();
        let Some(volume) = inner.volumes.iter_mut().find(|v| v.id == volume_id) else {
            return_errno_with_msg!(Errno::VolumeNotFound, "no such volume");
        };
        let Some(replica) = volume.replicas.get_mut(replica_index) else {
            return_errno_with_msg!(Errno::ReplicaNotFound, "no such replica row");
        };
        replica.state = state;
        let record = volume.clone();
        drop(inner);
        self.store.put(&volume_key(volume_id), &to_json(&record)?)
    }

    /// Resolves one volume-logical block to its physical placement.
    pub fn map_lba(
        &self,
        volume_id: VolumeId,
        logical_block: u64,
    ) -> Result<(DiskId, u64, u32)> {
        let (volume, map) = self.volume_and_map(volume_id)?;
        if logical_block >= volume.num_blocks {
            return_errno_with_msg!(Errno::OutOfBounds, "lba beyond volume");
        }

        let extent = find_extent(&map, logical_block)?;
        let Some(disk) = self.disk_manager.find_disk_by_id(extent.disk_id) else {
            return_errno_with_msg!(Errno::NotFound, "extent references unknown disk");
        };
        let quantum = (volume.block_size / disk.block_size).max(1) as u64;
        let extent_volume_blocks = extent.num_blocks_on_disk / quantum;
        if logical_block >= extent.volume_start_lba + extent_volume_blocks {
            return_errno_with_msg!(Errno::OutOfBounds, "allocation map has a gap");
        }
        let physical_block =
            extent.start_block_on_disk + (logical_block - extent.volume_start_lba) * quantum;
        if physical_block + quantum > disk.num_blocks {
            return_errno_with_msg!(Errno::OutOfBounds, "mapping beyond disk capacity");
        }
        Ok((disk.id, physical_block, disk.block_size))
    }

    /// Asynchronous volume read.
    ///
    /// With no usable remote replicas the read is dispatched locally;
    /// otherwise a replica-read coordinator tries replicas in index order
    /// with failover.
    pub fn read_async(
        self: &Arc<Self>,
        volume_id: VolumeId,
        offset_bytes: u64,
        length_bytes: u64,
        on_done: impl FnOnce(Result<Vec<u8>>) + 'static,
    ) -> Result<()> {
        let volume = match self.validate_io(volume_id, offset_bytes, length_bytes) {
            Ok(volume) => volume,
            Err(err) => {
                on_done(Err(err));
                return Err(err);
            }
        };

        let has_usable_remote = volume
            .remote_replicas()
            .iter()
            .any(|r| r.state == StorageState::Online);
        if volume.actual_replica_count <= 1 || !has_usable_remote {
            return self.local_read_async(volume_id, offset_bytes, length_bytes, on_done);
        }
        replication::submit_replicated_read(
            self.clone(),
            volume,
            offset_bytes,
            length_bytes,
            Box::new(on_done),
        )
    }

    /// Asynchronous volume write.
    ///
    /// Fans out one local write plus one replica write per remote row; the
    /// completion fires exactly once, after every targeted replica has
    /// reported in. All targeted replicas must succeed.
    pub fn write_async(
        self: &Arc<Self>,
        volume_id: VolumeId,
        offset_bytes: u64,
        data: &[u8],
        on_done: impl FnOnce(Result<()>) + 'static,
    ) -> Result<()> {
        let volume = match self.validate_io(volume_id, offset_bytes, data.len() as u64) {
            Ok(volume) => volume,
            Err(err) => {
                on_done(Err(err));
                return Err(err);
            }
        };

        if volume.actual_replica_count <= 1 {
            return self.local_write_async(volume_id, offset_bytes, data, on_done);
        }
        replication::submit_replicated_write(
            self.clone(),
            volume,
            offset_bytes,
            data,
            Box::new(on_done),
        )
    }

    /// Reads from the local replica only, resolving the volume range to
    /// per-extent physical submissions.
    pub fn local_read_async(
        self: &Arc<Self>,
        volume_id: VolumeId,
        offset_bytes: u64,
        length_bytes: u64,
        on_done: impl FnOnce(Result<Vec<u8>>) + 'static,
    ) -> Result<()> {
        let segments = match self.resolve_segments(volume_id, offset_bytes, length_bytes) {
            Ok(segments) => segments,
            Err(err) => {
                on_done(Err(err));
                return Err(err);
            }
        };

        if segments.len() == 1 {
            let segment = &segments[0];
            let request = IoRequest::read(
                volume_id,
                segment.disk_id,
                segment.bdev_name.clone(),
                segment.offset_bytes_on_disk,
                segment.length_bytes,
                segment.block_size,
                on_done,
            )?;
            let _ = submit_to_bdev(request);
            return Ok(());
        }

        // Multi-extent read: every segment lands in its slice of one
        // result buffer; the callback fires once after the last segment.
        let total = length_bytes as usize;
        let state = Rc::new(SplitRead {
            buffer: std::cell::RefCell::new(vec![0u8; total]),
            outstanding: Cell::new(segments.len() as u32),
            first_error: Cell::new(None),
            on_done: std::cell::RefCell::new(Some(Box::new(on_done))),
        });
        for segment in segments {
            let state = state.clone();
            let logical_offset = segment.logical_offset as usize;
            let segment_len = segment.length_bytes as usize;
            let request = IoRequest::read(
                volume_id,
                segment.disk_id,
                segment.bdev_name.clone(),
                segment.offset_bytes_on_disk,
                segment.length_bytes,
                segment.block_size,
                move |result| {
                    match result {
                        Ok(data) => {
                            state.buffer.borrow_mut()[logical_offset..logical_offset + segment_len]
                                .copy_from_slice(&data);
                        }
                        Err(err) => {
                            if state.first_error.get().is_none() {
                                state.first_error.set(Some(err));
                            }
                        }
                    }
                    state.segment_done();
                },
            )?;
            let _ = submit_to_bdev(request);
        }
        Ok(())
    }

    /// Writes to the local replica only.
    pub fn local_write_async(
        self: &Arc<Self>,
        volume_id: VolumeId,
        offset_bytes: u64,
        data: &[u8],
        on_done: impl FnOnce(Result<()>) + 'static,
    ) -> Result<()> {
        let segments = match self.resolve_segments(volume_id, offset_bytes, data.len() as u64) {
            Ok(segments) => segments,
            Err(err) => {
                on_done(Err(err));
                return Err(err);
            }
        };

        if segments.len() == 1 {
            let segment = &segments[0];
            let request = IoRequest::write(
                volume_id,
                segment.disk_id,
                segment.bdev_name.clone(),
                segment.offset_bytes_on_disk,
                segment.block_size,
                data,
                on_done,
            )?;
            let _ = submit_to_bdev(request);
            return Ok(());
        }

        let state = Rc::new(SplitWrite {
            outstanding: Cell::new(segments.len() as u32),
            first_error: Cell::new(None),
            on_done: std::cell::RefCell::new(Some(Box::new(on_done))),
        });
        for segment in segments {
            let state = state.clone();
            let start = segment.logical_offset as usize;
            let end = start + segment.length_bytes as usize;
            let request = IoRequest::write(
                volume_id,
                segment.disk_id,
                segment.bdev_name.clone(),
                segment.offset_bytes_on_disk,
                segment.block_size,
                &data[start..end],
                move |result| {
                    if let Err(err) = result {
                        if state.first_error.get().is_none() {
                            state.first_error.set(Some(err));
                        }
                    }
                    state.segment_done();
                },
            )?;
            let _ = submit_to_bdev(request);
        }
        Ok(())
    }

    fn validate_io(&self, volume_id: VolumeId, offset: u64, length: u64) -> Result<Volume> {
        let Some(volume) = self.get_volume(volume_id) else {
            return_errno_with_msg!(Errno::VolumeNotFound, "no such volume");
        };
        let bs = volume.block_size as u64;
        if length == 0 || offset % bs != 0 || length % bs != 0 {
            return_errno_with_msg!(
                Errno::InvalidArgs,
                "offset and length must be multiples of the volume block size"
            );
        }
        if offset + length > volume.size_bytes {
            return_errno_with_msg!(Errno::OutOfBounds, "io beyond end of volume");
        }
        Ok(volume)
    }

    /// Splits `[offset, offset+length)` into per-extent physical
    /// submissions, in logical order.
    pub(crate) fn resolve_segments(
        &self,
        volume_id: VolumeId,
        offset_bytes: u64,
        length_bytes: u64,
    ) -> Result<Vec<IoSegment>> {
        let (volume, map) = self.volume_and_map(volume_id)?;
        let bs = volume.block_size as u64;
        if offset_bytes % bs != 0 || length_bytes % bs != 0 || length_bytes == 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "unaligned volume io");
        }

        let mut segments = Vec::new();
        let mut lba = offset_bytes / bs;
        let mut remaining = length_bytes / bs;
        let mut logical_offset = 0u64;
        while remaining > 0 {
            let extent = find_extent(&map, lba)?;
            let Some(disk) = self.disk_manager.find_disk_by_id(extent.disk_id) else {
                return_errno_with_msg!(Errno::NotFound, "extent references unknown disk");
            };
            let quantum = (volume.block_size / disk.block_size).max(1) as u64;
            let extent_volume_blocks = extent.num_blocks_on_disk / quantum;
            let within = lba - extent.volume_start_lba;
            if within >= extent_volume_blocks {
                return_errno_with_msg!(Errno::OutOfBounds, "allocation map has a gap");
            }
            let span = (extent_volume_blocks - within).min(remaining);
            let physical_block = extent.start_block_on_disk + within * quantum;
            if physical_block + span * quantum > disk.num_blocks {
                return_errno_with_msg!(Errno::OutOfBounds, "mapping beyond disk capacity");
            }
            segments.push(IoSegment {
                disk_id: disk.id,
                bdev_name: disk.bdev_name.clone(),
                offset_bytes_on_disk: physical_block * disk.block_size as u64,
                length_bytes: span * bs,
                block_size: disk.block_size,
                logical_offset,
            });
            lba += span;
            remaining -= span;
            logical_offset += span * bs;
        }
        debug!(
            "volume {} io at {} for {} B resolved to {} segment(s)",
            volume_id,
            offset_bytes,
            length_bytes,
            segments.len()
        );
        Ok(segments)
    }

    fn volume_and_map(&self, volume_id: VolumeId) -> Result<(Volume, AllocationMap)> {
        let inner = self.lock();
        let Some(volume) = inner.volumes.iter().find(|v| v.id == volume_id) else {
            return_errno_with_msg!(Errno::VolumeNotFound, "no such volume");
        };
        let Some(map) = inner.maps.get(&volume_id) else {
            return_errno_with_msg!(Errno::StorageGeneric, "volume has no allocation map");
        };
        Ok((volume.clone(), map.clone()))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn find_extent(map: &AllocationMap, lba: u64) -> Result<&crate::records::VolumeExtent> {
    let idx = map
        .extents
        .partition_point(|extent| extent.volume_start_lba <= lba);
    if idx == 0 {
        return Err(Error::with_msg(Errno::BlockNotFound, "lba before first extent"));
    }
    Ok(&map.extents[idx - 1])
}

struct SplitRead {
    buffer: std::cell::RefCell<Vec<u8>>,
    outstanding: Cell<u32>,
    first_error: Cell<Option<Error>>,
    on_done: std::cell::RefCell<Option<Box<dyn FnOnce(Result<Vec<u8>>)>>>,
}

impl SplitRead {
    fn segment_done(&self) {
        let left = self.outstanding.get() - 1;
        self.outstanding.set(left);
        if left > 0 {
            return;
        }
        let Some(on_done) = self.on_done.borrow_mut().take() else {
            return;
        };
        match self.first_error.get() {
            Some(err) => on_done(Err(err)),
            None => on_done(Ok(self.buffer.borrow_mut().split_off(0))),
        }
    }
}

struct SplitWrite {
    outstanding: Cell<u32>,
    first_error: Cell<Option<Error>>,
    on_done: std::cell::RefCell<Option<Box<dyn FnOnce(Result<()>)>>>,
}

impl SplitWrite {
    fn segment_done(&self) {
        let left = self.outstanding.get() - 1;
        self.outstanding.set(left);
        if left > 0 {
            return;
        }
        let Some(on_done) = self.on_done.borrow_mut().take() else {
            return;
        };
        match self.first_error.get() {
            Some(err) => on_done(Err(err)),
            None => on_done(Ok(())),
        }
    }
}
