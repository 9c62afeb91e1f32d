// SPDX-License-Identifier: MPL-2.0

//! Single-node end-to-end scenarios: volume lifecycle, the FTT=0 I/O
//! path, mapping invariants, and restart reconciliation.

use std::{
    cell::{Cell, RefCell},
    path::Path,
    rc::Rc,
    sync::Arc,
    time::Duration,
};

use xsan_metastore::MetaStore;
use xsan_reactor::{FileBdev, MemBdev, Reactor};
use xsan_storage::{ClusterView, CreateVolumeParams, DiskManager, VolumeManager};
use xsan_types::{Address, Errno, GroupKind, Node, NodeId, StorageState};

const TICK: Duration = Duration::from_secs(10);

fn local_cluster() -> Arc<ClusterView> {
    let node = Node::from_single_endpoint(
        NodeId::generate(),
        "node-a",
        Address::new("127.0.0.1", 7700),
    );
    ClusterView::new(node.clone(), vec![node])
}

fn managers(meta_dir: &Path) -> (Arc<DiskManager>, Arc<VolumeManager>) {
    let store = Arc::new(MetaStore::open(meta_dir, true).unwrap());
    let dm = DiskManager::init(store.clone()).unwrap();
    dm.scan_and_reconcile().unwrap();
    let vm = VolumeManager::init(store, dm.clone(), local_cluster()).unwrap();
    (dm, vm)
}

fn params(name: &str, size: u64, group: xsan_types::GroupId) -> CreateVolumeParams {
    CreateVolumeParams {
        name: name.to_string(),
        size_bytes: size,
        group_id: group,
        block_size: 4096,
        thin_provisioned: false,
        ftt: 0,
    }
}

fn write_blocking(vm: &Arc<VolumeManager>, id: xsan_types::VolumeId, offset: u64, data: &[u8]) {
    let reactor = Reactor::current().unwrap();
    let done = Rc::new(Cell::new(false));
    let flag = done.clone();
    vm.write_async(id, offset, data, move |result| {
        result.unwrap();
        flag.set(true);
    })
    .unwrap();
    reactor.poll_until(TICK, || done.get()).unwrap();
}

fn read_blocking(
    vm: &Arc<VolumeManager>,
    id: xsan_types::VolumeId,
    offset: u64,
    length: u64,
) -> Vec<u8> {
    let reactor = Reactor::current().unwrap();
    let slot: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let out = slot.clone();
    vm.read_async(id, offset, length, move |result| {
        *out.borrow_mut() = Some(result.unwrap());
    })
    .unwrap();
    reactor.poll_until(TICK, || slot.borrow().is_some()).unwrap();
    let data = slot.borrow_mut().take().unwrap();
    data
}

#[test]
fn create_and_delete_accounting() {
    std::thread::spawn(|| {
        let reactor = Reactor::init_current(0).unwrap();
        // One 1 GiB disk of 4096-byte blocks.
        reactor
            .register_bdev(Box::new(MemBdev::new("mem0", 4096, 262_144)))
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (dm, vm) = managers(&dir.path().join("meta"));

        let group = dm
            .create_group("g1", GroupKind::Passthrough, &["mem0"])
            .unwrap();
        let volume = vm.create_volume(params("v1", 16 << 20, group)).unwrap();

        let all = vm.list_volumes();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, volume);
        assert_eq!(all[0].num_blocks, (16 << 20) / 4096);
        assert_eq!(dm.find_group_by_id(group).unwrap().allocated_bytes, 16 << 20);
        assert!(vm.group_in_use(group));

        vm.delete_volume(volume).unwrap();
        assert!(vm.list_volumes().is_empty());
        assert_eq!(dm.find_group_by_id(group).unwrap().allocated_bytes, 0);
        assert!(!vm.group_in_use(group));
    })
    .join()
    .unwrap();
}

#[test]
fn create_volume_validations() {
    std::thread::spawn(|| {
        let reactor = Reactor::init_current(0).unwrap();
        reactor
            .register_bdev(Box::new(MemBdev::new("mem0", 4096, 25_600)))
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (dm, vm) = managers(&dir.path().join("meta"));
        let group = dm
            .create_group("g1", GroupKind::Passthrough, &["mem0"])
            .unwrap();

        let mut bad = params("v1", 16 << 20, group);
        bad.block_size = 3000;
        assert_eq!(
            vm.create_volume(bad).unwrap_err().errno(),
            Errno::InvalidArgs
        );

        let mut oversized = params("v1", 1 << 30, group);
        oversized.thin_provisioned = false;
        assert_eq!(
            vm.create_volume(oversized).unwrap_err().errno(),
            Errno::InsufficientSpace
        );

        vm.create_volume(params("v1", 4 << 20, group)).unwrap();
        assert_eq!(
            vm.create_volume(params("v1", 4 << 20, group))
                .unwrap_err()
                .errno(),
            Errno::VolumeExists
        );
    })
    .join()
    .unwrap();
}

#[test]
fn exporter_references_block_deletion() {
    std::thread::spawn(|| {
        let reactor = Reactor::init_current(0).unwrap();
        reactor
            .register_bdev(Box::new(MemBdev::new("mem0", 4096, 25_600)))
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (dm, vm) = managers(&dir.path().join("meta"));
        let group = dm
            .create_group("g1", GroupKind::Passthrough, &["mem0"])
            .unwrap();
        let volume = vm.create_volume(params("v1", 4 << 20, group)).unwrap();

        vm.register_exporter(volume).unwrap();
        assert_eq!(
            vm.delete_volume(volume).unwrap_err().errno(),
            Errno::VolumeBusy
        );
        vm.unregister_exporter(volume);
        vm.delete_volume(volume).unwrap();
    })
    .join()
    .unwrap();
}

#[test]
fn allocation_map_partitions_the_volume() {
    std::thread::spawn(|| {
        let reactor = Reactor::init_current(0).unwrap();
        // Two small disks so the map needs more than one extent.
        reactor
            .register_bdev(Box::new(MemBdev::new("mem0", 4096, 1024)))
            .unwrap();
        reactor
            .register_bdev(Box::new(MemBdev::new("mem1", 512, 16_384)))
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (dm, vm) = managers(&dir.path().join("meta"));
        let group = dm
            .create_group("g1", GroupKind::Jbod, &["mem0", "mem1"])
            .unwrap();
        // 12 MiB: 4 MiB from mem0 plus 8 MiB from mem1.
        let volume = vm.create_volume(params("v1", 12 << 20, group)).unwrap();

        let map = vm.allocation_map(volume).unwrap();
        assert_eq!(map.extents.len(), 2);
        let mut covered = 0u64;
        for extent in &map.extents {
            assert_eq!(extent.volume_start_lba, covered);
            let disk = dm.find_disk_by_id(extent.disk_id).unwrap();
            assert!(extent.start_block_on_disk + extent.num_blocks_on_disk <= disk.num_blocks);
            covered += extent.num_blocks_on_disk * disk.block_size as u64 / 4096;
        }
        assert_eq!(covered, map.total_volume_blocks);
        assert_eq!(covered, (12 << 20) / 4096);
    })
    .join()
    .unwrap();
}

#[test]
fn lba_mapping_is_consistent() {
    std::thread::spawn(|| {
        let reactor = Reactor::init_current(0).unwrap();
        reactor
            .register_bdev(Box::new(MemBdev::new("mem0", 4096, 1024)))
            .unwrap();
        reactor
            .register_bdev(Box::new(MemBdev::new("mem1", 512, 16_384)))
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (dm, vm) = managers(&dir.path().join("meta"));
        let group = dm
            .create_group("g1", GroupKind::Jbod, &["mem0", "mem1"])
            .unwrap();
        let volume = vm.create_volume(params("v1", 12 << 20, group)).unwrap();

        let map = vm.allocation_map(volume).unwrap();
        let total = map.total_volume_blocks;
        for lba in 0..total {
            let (disk_id, physical_block, physical_bs) = vm.map_lba(volume, lba).unwrap();
            let extent = map
                .extents
                .iter()
                .rev()
                .find(|e| e.volume_start_lba <= lba)
                .unwrap();
            assert_eq!(extent.disk_id, disk_id);
            let expected_bytes = (lba - extent.volume_start_lba) * 4096;
            let got_bytes =
                (physical_block - extent.start_block_on_disk) * physical_bs as u64;
            assert_eq!(got_bytes, expected_bytes);
        }
        assert_eq!(
            vm.map_lba(volume, total).unwrap_err().errno(),
            Errno::OutOfBounds
        );
    })
    .join()
    .unwrap();
}

#[test]
fn write_then_read_single_replica() {
    std::thread::spawn(|| {
        let reactor = Reactor::init_current(0).unwrap();
        reactor
            .register_bdev(Box::new(MemBdev::new("mem0", 4096, 262_144)))
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (dm, vm) = managers(&dir.path().join("meta"));
        let group = dm
            .create_group("g1", GroupKind::Passthrough, &["mem0"])
            .unwrap();
        let volume = vm.create_volume(params("v1", 16 << 20, group)).unwrap();

        let data = vec![0x55u8; 4096];
        write_blocking(&vm, volume, 8192, &data);
        let back = read_blocking(&vm, volume, 8192, 4096);
        assert_eq!(back, data);

        // Unwritten space reads back as zeros.
        let untouched = read_blocking(&vm, volume, 0, 4096);
        assert!(untouched.iter().all(|b| *b == 0));
    })
    .join()
    .unwrap();
}

#[test]
fn io_spanning_extents() {
    std::thread::spawn(|| {
        let reactor = Reactor::init_current(0).unwrap();
        reactor
            .register_bdev(Box::new(MemBdev::new("mem0", 4096, 1024)))
            .unwrap();
        reactor
            .register_bdev(Box::new(MemBdev::new("mem1", 512, 16_384)))
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (dm, vm) = managers(&dir.path().join("meta"));
        let group = dm
            .create_group("g1", GroupKind::Jbod, &["mem0", "mem1"])
            .unwrap();
        let volume = vm.create_volume(params("v1", 12 << 20, group)).unwrap();

        // 64 KiB straddling the mem0/mem1 extent boundary at 4 MiB.
        let pattern: Vec<u8> = (0..65_536u32).map(|i| (i % 251) as u8).collect();
        let offset = (4 << 20) - 32_768;
        write_blocking(&vm, volume, offset, &pattern);
        let back = read_blocking(&vm, volume, offset, pattern.len() as u64);
        assert_eq!(back, pattern);
    })
    .join()
    .unwrap();
}

#[test]
fn io_callbacks_fire_exactly_once() {
    std::thread::spawn(|| {
        let reactor = Reactor::init_current(0).unwrap();
        reactor
            .register_bdev(Box::new(MemBdev::new("mem0", 4096, 25_600)))
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (dm, vm) = managers(&dir.path().join("meta"));
        let group = dm
            .create_group("g1", GroupKind::Passthrough, &["mem0"])
            .unwrap();
        let volume = vm.create_volume(params("v1", 4 << 20, group)).unwrap();

        let calls = Rc::new(Cell::new(0u32));
        let counter = calls.clone();
        vm.write_async(volume, 0, &[1u8; 4096], move |result| {
            result.unwrap();
            counter.set(counter.get() + 1);
        })
        .unwrap();
        reactor.poll_until(TICK, || calls.get() > 0).unwrap();
        for _ in 0..20 {
            reactor.poll();
        }
        assert_eq!(calls.get(), 1);

        // Failed submissions also report exactly once.
        let failures = Rc::new(Cell::new(0u32));
        let counter = failures.clone();
        let err = vm
            .write_async(volume, 4095, &[1u8; 4096], move |result| {
                assert!(result.is_err());
                counter.set(counter.get() + 1);
            })
            .unwrap_err();
        assert_eq!(err.errno(), Errno::InvalidArgs);
        assert_eq!(failures.get(), 1);
    })
    .join()
    .unwrap();
}

#[test]
fn restart_reconciles_disks_and_volumes() {
    let dir = tempfile::tempdir().unwrap();
    let meta = dir.path().join("meta");
    let backing = dir.path().join("disk0.img");
    let pattern = vec![0xA7u8; 8192];

    let meta1 = meta.clone();
    let backing1 = backing.clone();
    let written = std::thread::spawn(move || {
        let reactor = Reactor::init_current(0).unwrap();
        reactor
            .register_bdev(Box::new(
                FileBdev::create("file0", &backing1, 4096, 65_536).unwrap(),
            ))
            .unwrap();
        let (dm, vm) = managers(&meta1);
        let group = dm
            .create_group("g1", GroupKind::Passthrough, &["file0"])
            .unwrap();
        let volume = vm.create_volume(params("v1", 16 << 20, group)).unwrap();
        write_blocking(&vm, volume, 4096, &pattern);
        (volume, dm.find_disk_by_bdev_name("file0").unwrap().id, pattern)
    })
    .join()
    .unwrap();
    let (volume_id, disk_id, pattern) = written;

    std::thread::spawn(move || {
        let reactor = Reactor::init_current(1).unwrap();
        reactor
            .register_bdev(Box::new(FileBdev::open("file0", &backing, 4096).unwrap()))
            .unwrap();
        let (dm, vm) = managers(&meta);

        // The disk record matched by name keeps its identity.
        let disk = dm.find_disk_by_bdev_name("file0").unwrap();
        assert_eq!(disk.id, disk_id);
        assert_eq!(disk.state, StorageState::Online);
        assert_eq!(dm.list_disks().len(), 1);

        // The volume reappears with its id, size, and map intact.
        let volume = vm.get_volume(volume_id).unwrap();
        assert_eq!(volume.name, "v1");
        assert_eq!(volume.size_bytes, 16 << 20);
        let map = vm.allocation_map(volume_id).unwrap();
        assert_eq!(map.total_volume_blocks, volume.num_blocks);

        let back = read_blocking(&vm, volume_id, 4096, pattern.len() as u64);
        assert_eq!(back, pattern);
    })
    .join()
    .unwrap();
}

#[test]
fn missing_device_marks_disk_missing() {
    let dir = tempfile::tempdir().unwrap();
    let meta = dir.path().join("meta");

    let meta1 = meta.clone();
    std::thread::spawn(move || {
        let reactor = Reactor::init_current(0).unwrap();
        reactor
            .register_bdev(Box::new(MemBdev::new("volatile0", 4096, 1024)))
            .unwrap();
        let (dm, _vm) = managers(&meta1);
        assert_eq!(dm.list_disks().len(), 1);
    })
    .join()
    .unwrap();

    std::thread::spawn(move || {
        let _reactor = Reactor::init_current(1).unwrap();
        // The RAM-backed device is gone after the "restart".
        let (dm, _vm) = managers(&meta);
        let disk = dm.find_disk_by_bdev_name("volatile0").unwrap();
        assert_eq!(disk.state, StorageState::Missing);
    })
    .join()
    .unwrap();
}
