// SPDX-License-Identifier: MPL-2.0

//! Two-node replication scenarios over loopback TCP: the primary node A
//! runs on one reactor thread, the replica node B on another, each with
//! its own metadata store, devices, managers, and comm endpoint. Volume
//! metadata reaches B through `adopt_volume`, standing in for the
//! control-plane propagation that is outside the storage core.

use std::{
    cell::{Cell, RefCell},
    net::SocketAddr,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    time::Duration,
};

use xsan_comm::NodeComm;
use xsan_metastore::MetaStore;
use xsan_reactor::{MemBdev, Reactor};
use xsan_storage::{
    replication, AllocationMap, ClusterView, CreateVolumeParams, DiskManager, ReplicaLocation,
    Volume, VolumeManager,
};
use xsan_types::{Address, Errno, GroupKind, Node, NodeId, StorageState};

const TICK: Duration = Duration::from_secs(20);

struct ReplicaNode {
    addr_rx: mpsc::Receiver<SocketAddr>,
    volume_tx: mpsc::Sender<Volume>,
    ready_rx: mpsc::Receiver<()>,
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ReplicaNode {
    /// Spawns node B: it reports its comm address, then waits for one
    /// volume record, lays that volume out on its own disk, and serves
    /// replica traffic until stopped.
    fn spawn() -> Self {
        let (addr_tx, addr_rx) = mpsc::channel();
        let (volume_tx, volume_rx) = mpsc::channel::<Volume>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::spawn(move || {
            let reactor = Reactor::init_current(1).unwrap();
            reactor
                .register_bdev(Box::new(MemBdev::new("memB", 4096, 65_536)))
                .unwrap();
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(MetaStore::open(dir.path().join("meta"), true).unwrap());
            let dm = DiskManager::init(store.clone()).unwrap();
            dm.scan_and_reconcile().unwrap();

            let comm = NodeComm::init(Some(("127.0.0.1", 0))).unwrap();
            let addr = comm.listen_addr().unwrap();
            addr_tx.send(addr).unwrap();

            let local = Node::from_single_endpoint(
                NodeId::generate(),
                "node-b",
                Address::new("127.0.0.1", addr.port()),
            );
            let cluster = ClusterView::new(local.clone(), vec![]);
            let vm = VolumeManager::init(store, dm.clone(), cluster).unwrap();
            let _service = replication::install(comm.clone(), vm.clone());

            // Adopt the volume shipped from A, backed by B's own disk.
            let shipped = volume_rx.recv().unwrap();
            let group = dm
                .create_group("gB", GroupKind::Passthrough, &["memB"])
                .unwrap();
            let extents = dm
                .allocate_extents(group, shipped.num_blocks, shipped.block_size)
                .unwrap();
            let map = AllocationMap {
                volume_id: shipped.id,
                group_id: group,
                extents,
                total_volume_blocks: shipped.num_blocks,
                volume_block_size: shipped.block_size,
            };
            let mut local_volume = shipped;
            local_volume.source_group_id = group;
            local_volume.ftt = 0;
            local_volume.actual_replica_count = 1;
            local_volume.replicas = vec![ReplicaLocation {
                node_id: local.id,
                ip: "127.0.0.1".to_string(),
                port: addr.port(),
                state: StorageState::Online,
                last_contact_us: 0,
            }];
            vm.adopt_volume(local_volume, map).unwrap();
            ready_tx.send(()).unwrap();

            while !stop_flag.load(Ordering::SeqCst) {
                if reactor.poll() == 0 {
                    std::thread::sleep(Duration::from_micros(200));
                }
            }
            comm.fini();
        });

        Self {
            addr_rx,
            volume_tx,
            ready_rx,
            stop,
            handle: Some(handle),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.addr_rx.recv().unwrap()
    }

    fn adopt(&self, volume: Volume) {
        self.volume_tx.send(volume).unwrap();
        self.ready_rx.recv().unwrap();
    }
}

impl Drop for ReplicaNode {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct PrimaryNode {
    dm: Arc<DiskManager>,
    vm: Arc<VolumeManager>,
    comm: Rc<NodeComm>,
    _dir: tempfile::TempDir,
}

fn primary_node(peer: Option<SocketAddr>) -> PrimaryNode {
    let reactor = Reactor::current().unwrap();
    reactor
        .register_bdev(Box::new(MemBdev::new("memA", 4096, 65_536)))
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MetaStore::open(dir.path().join("meta"), true).unwrap());
    let dm = DiskManager::init(store.clone()).unwrap();
    dm.scan_and_reconcile().unwrap();

    let local = Node::from_single_endpoint(
        NodeId::generate(),
        "node-a",
        Address::new("127.0.0.1", 7700),
    );
    let seeds = peer
        .map(|addr| {
            vec![Node::from_single_endpoint(
                NodeId::generate(),
                "node-b",
                Address::new("127.0.0.1", addr.port()),
            )]
        })
        .unwrap_or_default();
    let cluster = ClusterView::new(local, seeds);
    let vm = VolumeManager::init(store, dm.clone(), cluster).unwrap();
    let comm = NodeComm::init(None).unwrap();
    let _service = replication::install(comm.clone(), vm.clone());
    PrimaryNode {
        dm,
        vm,
        comm,
        _dir: dir,
    }
}

fn write_blocking(
    vm: &Arc<VolumeManager>,
    id: xsan_types::VolumeId,
    offset: u64,
    data: &[u8],
) -> Result<(), Errno> {
    let reactor = Reactor::current().unwrap();
    let outcome: Rc<RefCell<Option<Result<(), Errno>>>> = Rc::new(RefCell::new(None));
    let calls = Rc::new(Cell::new(0u32));
    let slot = outcome.clone();
    let counter = calls.clone();
    let _ = vm.write_async(id, offset, data, move |result| {
        counter.set(counter.get() + 1);
        *slot.borrow_mut() = Some(result.map_err(|e| e.errno()));
    });
    reactor
        .poll_until(TICK, || outcome.borrow().is_some())
        .unwrap();
    for _ in 0..20 {
        reactor.poll();
    }
    assert_eq!(calls.get(), 1, "write callback must fire exactly once");
    let result = outcome.borrow_mut().take().unwrap();
    result
}

fn read_blocking(
    vm: &Arc<VolumeManager>,
    id: xsan_types::VolumeId,
    offset: u64,
    length: u64,
) -> Result<Vec<u8>, Errno> {
    let reactor = Reactor::current().unwrap();
    let outcome: Rc<RefCell<Option<Result<Vec<u8>, Errno>>>> = Rc::new(RefCell::new(None));
    let slot = outcome.clone();
    let _ = vm.read_async(id, offset, length, move |result| {
        *slot.borrow_mut() = Some(result.map_err(|e| e.errno()));
    });
    reactor
        .poll_until(TICK, || outcome.borrow().is_some())
        .unwrap();
    let result = outcome.borrow_mut().take().unwrap();
    result
}

fn volume_params(name: &str, size: u64, group: xsan_types::GroupId, ftt: u32) -> CreateVolumeParams {
    CreateVolumeParams {
        name: name.to_string(),
        size_bytes: size,
        group_id: group,
        block_size: 4096,
        thin_provisioned: false,
        ftt,
    }
}

#[test]
fn replicated_write_reaches_both_nodes() {
    let replica = ReplicaNode::spawn();
    let addr = replica.addr();

    std::thread::spawn(move || {
        let _reactor = Reactor::init_current(0).unwrap();
        let node = primary_node(Some(addr));
        let group = node
            .dm
            .create_group("gA", GroupKind::Passthrough, &["memA"])
            .unwrap();
        let volume = node
            .vm
            .create_volume(volume_params("v2", 32 << 20, group, 1))
            .unwrap();
        let record = node.vm.get_volume(volume).unwrap();
        assert_eq!(record.actual_replica_count, 2);
        assert_eq!(record.replicas.len(), 2);
        replica.adopt(record);

        // A 64 KiB patterned write with FTT=1 must land on both replicas;
        // an independent local read returns the pattern.
        let pattern: Vec<u8> = std::iter::repeat([0xA5u8, 0xA5])
            .flatten()
            .take(65_536)
            .collect();
        write_blocking(&node.vm, volume, 0, &pattern).unwrap();
        let local = read_blocking(&node.vm, volume, 0, pattern.len() as u64).unwrap();
        assert_eq!(local, pattern);

        // Failover: zero the local copy only, mark replica 0 offline, and
        // the coordinator must return B's copy.
        let zeros = vec![0u8; pattern.len()];
        let reactor = Reactor::current().unwrap();
        let done = Rc::new(Cell::new(false));
        let flag = done.clone();
        node.vm
            .local_write_async(volume, 0, &zeros, move |result| {
                result.unwrap();
                flag.set(true);
            })
            .unwrap();
        reactor.poll_until(TICK, || done.get()).unwrap();
        assert_eq!(
            read_blocking(&node.vm, volume, 0, pattern.len() as u64).unwrap(),
            zeros
        );

        node.vm
            .set_replica_state(volume, 0, StorageState::Offline)
            .unwrap();
        let failed_over = read_blocking(&node.vm, volume, 0, pattern.len() as u64).unwrap();
        assert_eq!(failed_over, pattern, "read must fail over to replica 1");

        node.comm.fini();
        drop(replica);
    })
    .join()
    .unwrap();
}

#[test]
fn unknown_volume_on_replica_yields_error_resp() {
    let replica = ReplicaNode::spawn();
    let addr = replica.addr();

    std::thread::spawn(move || {
        let _reactor = Reactor::init_current(0).unwrap();
        let node = primary_node(Some(addr));
        let group = node
            .dm
            .create_group("gA", GroupKind::Passthrough, &["memA"])
            .unwrap();
        let known = node
            .vm
            .create_volume(volume_params("v2", 16 << 20, group, 1))
            .unwrap();
        replica.adopt(node.vm.get_volume(known).unwrap());

        // A second replicated volume that B never learns about: its
        // replica writes come back as ERROR_RESP(volume-not-found).
        let unknown = node
            .vm
            .create_volume(volume_params("v3", 16 << 20, group, 1))
            .unwrap();
        let err = write_blocking(&node.vm, unknown, 0, &[0x11u8; 4096]).unwrap_err();
        assert_eq!(err, Errno::VolumeNotFound);

        node.comm.fini();
        drop(replica);
    })
    .join()
    .unwrap();
}

#[test]
fn heartbeats_track_peer_contact() {
    // A bare peer: comm only, which acks heartbeats by itself.
    let (addr_tx, addr_rx) = mpsc::channel();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let peer_thread = std::thread::spawn(move || {
        let reactor = Reactor::init_current(1).unwrap();
        let comm = NodeComm::init(Some(("127.0.0.1", 0))).unwrap();
        addr_tx.send(comm.listen_addr().unwrap()).unwrap();
        while !stop_flag.load(Ordering::SeqCst) {
            if reactor.poll() == 0 {
                std::thread::sleep(Duration::from_micros(200));
            }
        }
        comm.fini();
    });
    let peer_addr = addr_rx.recv().unwrap();

    std::thread::spawn(move || {
        let reactor = Reactor::init_current(0).unwrap();
        let local = Node::from_single_endpoint(
            NodeId::generate(),
            "node-a",
            Address::new("127.0.0.1", 7700),
        );
        let peer = Node::from_single_endpoint(
            NodeId::generate(),
            "node-b",
            Address::new("127.0.0.1", peer_addr.port()),
        );
        let peer_id = peer.id;
        let cluster = ClusterView::new(local, vec![peer]);
        let comm = NodeComm::init(None).unwrap();
        cluster
            .start_heartbeats(&comm, Duration::from_millis(20))
            .unwrap();

        reactor
            .poll_until(TICK, || cluster.last_contact_us(peer_id).unwrap_or(0) > 0)
            .unwrap();
        comm.fini();
    })
    .join()
    .unwrap();

    stop.store(true, Ordering::SeqCst);
    peer_thread.join().unwrap();
}

#[test]
fn write_with_unreachable_replica_fails_but_persists_locally() {
    // Replica 1's address points at a dead port.
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    std::thread::spawn(move || {
        let _reactor = Reactor::init_current(0).unwrap();
        let node = primary_node(Some(SocketAddr::from(([127, 0, 0, 1], dead_port))));
        let group = node
            .dm
            .create_group("gA", GroupKind::Passthrough, &["memA"])
            .unwrap();
        let volume = node
            .vm
            .create_volume(volume_params("v2", 16 << 20, group, 1))
            .unwrap();

        let data = vec![0x6Bu8; 4096];
        let err = write_blocking(&node.vm, volume, 0, &data).unwrap_err();
        assert!(
            matches!(
                err,
                Errno::ConnectionRefused | Errno::Network | Errno::SyncFailed | Errno::ConnectionLost
            ),
            "unexpected error kind {err:?}"
        );

        // The local replica still holds the data.
        let reactor = Reactor::current().unwrap();
        let slot: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
        let out = slot.clone();
        node.vm
            .local_read_async(volume, 0, 4096, move |result| {
                *out.borrow_mut() = Some(result.unwrap());
            })
            .unwrap();
        reactor.poll_until(TICK, || slot.borrow().is_some()).unwrap();
        assert_eq!(slot.borrow_mut().take().unwrap(), data);

        node.comm.fini();
    })
    .join()
    .unwrap();
}

#[test]
fn read_fails_when_no_replica_is_usable() {
    std::thread::spawn(|| {
        let _reactor = Reactor::init_current(0).unwrap();
        let node = primary_node(None);
        let group = node
            .dm
            .create_group("gA", GroupKind::Passthrough, &["memA"])
            .unwrap();
        let volume = node
            .vm
            .create_volume(volume_params("v1", 4 << 20, group, 0))
            .unwrap();

        node.vm
            .set_replica_state(volume, 0, StorageState::Offline)
            .unwrap();
        // FTT=0 with the only replica offline still reads locally: the
        // local dispatch path does not consult the replica table.
        let data = read_blocking(&node.vm, volume, 0, 4096).unwrap();
        assert_eq!(data.len(), 4096);

        node.comm.fini();
    })
    .join()
    .unwrap();
}
