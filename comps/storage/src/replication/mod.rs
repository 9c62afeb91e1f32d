// SPDX-License-Identifier: MPL-2.0

//! The replication coordinator.
//!
//! Writes fan out to every targeted replica: one local submission through
//! the I/O pipeline plus one `REPLICA_WRITE_BLOCK_REQ` per remote row. The
//! shared write context counts completions and fires the user callback
//! exactly once, after every sub-operation has reported in; the write
//! succeeds only if **all** targeted replicas succeeded.
//!
//! Reads try replicas strictly in ascending index order (the local
//! replica is row 0), failing over to the next row until one attempt
//! succeeds or every row has been tried.
//!
//! Replica traffic is correlated by transaction id through the node-comm
//! pending table; the response handlers installed here resolve pending
//! operations, and connection teardown fails them. Since every callback
//! of one logical operation runs on the submitting reactor thread, the
//! shared contexts use plain `Cell` counters.

mod service;

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    sync::Arc,
};

use log::{debug, warn};
use xsan_comm::NodeComm;
use xsan_proto::{
    ErrorResp, Message, MessageType, ReplicaReadReq, ReplicaReadResp, ReplicaWriteReq,
    ReplicaWriteResp,
};
use xsan_reactor::DmaBuf;
use xsan_types::{Errno, Error, Result, StorageState, VolumeId};

use crate::{records::ReplicaLocation, Volume, VolumeManager};

pub use self::service::ReplicationService;

thread_local! {
    static CURRENT: RefCell<Option<Rc<ReplicationService>>> = const { RefCell::new(None) };
}

/// Installs the replication service on the current reactor: registers the
/// replica request/response handlers on `comm` and makes the service
/// available to the volume manager's fan-out paths.
pub fn install(comm: Rc<NodeComm>, volumes: Arc<VolumeManager>) -> Rc<ReplicationService> {
    let service = ReplicationService::new(comm, volumes);
    CURRENT.with(|current| *current.borrow_mut() = Some(service.clone()));
    service
}

/// Removes the service installed on this reactor.
pub fn uninstall() {
    CURRENT.with(|current| current.borrow_mut().take());
}

fn current() -> Option<Rc<ReplicationService>> {
    CURRENT.with(|current| current.borrow().clone())
}

type WriteCompletion = Box<dyn FnOnce(Result<()>)>;
type ReadCompletion = Box<dyn FnOnce(Result<Vec<u8>>)>;

/// Shared state across the fan-out of one logical write.
struct WriteCtx {
    volume_id: VolumeId,
    transaction_id: u64,
    total: u32,
    outstanding: Cell<u32>,
    successes: Cell<u32>,
    failures: Cell<u32>,
    first_error: Cell<Option<Error>>,
    on_done: RefCell<Option<WriteCompletion>>,
}

impl WriteCtx {
    /// Joins one sub-operation's outcome; the final decision is made when
    /// the last one reports in.
    fn sub_done(&self, result: Result<()>) {
        match result {
            Ok(()) => self.successes.set(self.successes.get() + 1),
            Err(err) => {
                self.failures.set(self.failures.get() + 1);
                if self.first_error.get().is_none() {
                    self.first_error.set(Some(err));
                }
            }
        }
        let left = self.outstanding.get() - 1;
        self.outstanding.set(left);
        if left > 0 {
            return;
        }

        let Some(on_done) = self.on_done.borrow_mut().take() else {
            warn!("replicated write context completed twice");
            return;
        };
        debug!(
            "replicated write tid {} on {} finished: {}/{} ok",
            self.transaction_id,
            self.volume_id,
            self.successes.get(),
            self.total
        );
        if self.successes.get() == self.total {
            on_done(Ok(()));
        } else {
            let err = self
                .first_error
                .get()
                .unwrap_or(Error::new(Errno::SyncFailed));
            on_done(Err(err));
        }
    }
}

/// Fans one logical write out to the local replica and every remote row.
pub(crate) fn submit_replicated_write(
    volumes: Arc<VolumeManager>,
    volume: Volume,
    offset_bytes: u64,
    data: &[u8],
    on_done: WriteCompletion,
) -> Result<()> {
    let Some(service) = current() else {
        let err = Error::with_msg(Errno::ClusterNotReady, "replication service not installed");
        on_done(Err(err));
        return Err(err);
    };
    let comm = service.comm().clone();
    let remotes: Vec<ReplicaLocation> = volume.remote_replicas().to_vec();
    let transaction_id = comm.next_transaction_id();

    let ctx = Rc::new(WriteCtx {
        volume_id: volume.id,
        transaction_id,
        total: 1 + remotes.len() as u32,
        outstanding: Cell::new(1 + remotes.len() as u32),
        successes: Cell::new(0),
        failures: Cell::new(0),
        first_error: Cell::new(None),
        on_done: RefCell::new(Some(on_done)),
    });

    // Local replica: one pipeline submission whose completion is the
    // local-write-done hook. A synchronous submission failure already
    // reports through the same callback, so the return value is moot.
    let local_ctx = ctx.clone();
    let _ = volumes.local_write_async(volume.id, offset_bytes, data, move |result| {
        local_ctx.sub_done(result)
    });

    let block_lba = offset_bytes / volume.block_size as u64;
    let num_blocks = (data.len() as u64 / volume.block_size as u64) as u32;
    for replica in remotes {
        if replica.state != StorageState::Online {
            ctx.sub_done(Err(Error::new(Errno::ReplicaNotFound)));
            continue;
        }
        let request = ReplicaWriteReq {
            volume_id: volume.id,
            block_lba_on_volume: block_lba,
            num_blocks,
        };
        let tid = comm.next_transaction_id();
        let message = match Message::with_payload_parts(
            MessageType::ReplicaWriteBlockReq,
            tid,
            &request.encode(),
            data,
        ) {
            Ok(message) => message,
            Err(err) => {
                ctx.sub_done(Err(err));
                continue;
            }
        };

        let ctx_for_connect = ctx.clone();
        let connect_result = comm.connect(&replica.ip, replica.port, move |comm, result| {
            let sock = match result {
                Ok(sock) => sock,
                Err(err) => {
                    ctx_for_connect.sub_done(Err(err));
                    return;
                }
            };
            let ctx_for_resp = ctx_for_connect.clone();
            comm.register_pending(
                tid,
                sock,
                Box::new(move |comm, result| {
                    ctx_for_resp.sub_done(result.and_then(|msg| parse_write_resp(&msg)));
                    comm.disconnect(sock);
                }),
            );
            let comm_for_send = comm.clone();
            let _ = comm.send_msg(sock, &message, move |sent| {
                if sent.is_err() {
                    // The response will never come; fail the armed
                    // operation now.
                    if let Some(op) = comm_for_send.take_pending(tid) {
                        op(&comm_for_send, Err(Error::new(Errno::ConnectionLost)));
                    }
                }
            });
        });
        if let Err(err) = connect_result {
            ctx.sub_done(Err(err));
        }
    }
    Ok(())
}

fn parse_write_resp(msg: &Message) -> Result<()> {
    if msg.header.msg_type == MessageType::ErrorResp as u16 {
        let status = ErrorResp::decode(&msg.payload)?.status;
        return Errno::from_wire(status).and(Err(Error::new(Errno::ReplicationGeneric)));
    }
    let resp = ReplicaWriteResp::decode(&msg.payload)?;
    Errno::from_wire(resp.status)
}

/// Shared state of one read that may fail over between replicas.
struct ReadCtx {
    volumes: Arc<VolumeManager>,
    volume: Volume,
    offset_bytes: u64,
    length_bytes: u64,
    replica_idx: Cell<u32>,
    last_error: Cell<Option<Error>>,
    on_done: RefCell<Option<ReadCompletion>>,
}

impl ReadCtx {
    fn finish(&self, result: Result<Vec<u8>>) {
        if let Some(on_done) = self.on_done.borrow_mut().take() {
            on_done(result);
        }
    }

    fn fail_attempt(self: &Rc<Self>, err: Error) {
        self.last_error.set(Some(err));
        self.replica_idx.set(self.replica_idx.get() + 1);
        self.try_next();
    }

    /// Tries replicas in ascending index order until one succeeds.
    fn try_next(self: &Rc<Self>) {
        loop {
            let idx = self.replica_idx.get();
            let total = self
                .volume
                .actual_replica_count
                .min(self.volume.replicas.len() as u32);
            if idx >= total {
                let err = self
                    .last_error
                    .get()
                    .unwrap_or(Error::new(Errno::NotEnoughReplicas));
                self.finish(Err(err));
                return;
            }

            let replica = self.volume.replicas[idx as usize].clone();
            if replica.state != StorageState::Online {
                debug!(
                    "read on {}: skipping replica {} (state {:?})",
                    self.volume.id, idx, replica.state
                );
                self.last_error.set(Some(Error::new(Errno::ReplicaNotFound)));
                self.replica_idx.set(idx + 1);
                continue;
            }

            if idx == 0 {
                let ctx = self.clone();
                let _ = self.volumes.local_read_async(
                    self.volume.id,
                    self.offset_bytes,
                    self.length_bytes,
                    move |result| match result {
                        Ok(data) => ctx.finish(Ok(data)),
                        Err(err) => ctx.fail_attempt(err),
                    },
                );
            } else {
                self.remote_attempt(replica);
            }
            return;
        }
    }

    fn remote_attempt(self: &Rc<Self>, replica: ReplicaLocation) {
        let Some(service) = current() else {
            self.fail_attempt(Error::new(Errno::ClusterNotReady));
            return;
        };
        let comm = service.comm().clone();
        let tid = comm.next_transaction_id();
        let request = ReplicaReadReq {
            volume_id: self.volume.id,
            block_lba_on_volume: self.offset_bytes / self.volume.block_size as u64,
            num_blocks: (self.length_bytes / self.volume.block_size as u64) as u32,
        };
        let message = match Message::new(
            MessageType::ReplicaReadBlockReq,
            tid,
            request.encode().to_vec(),
        ) {
            Ok(message) => message,
            Err(err) => {
                self.fail_attempt(err);
                return;
            }
        };

        let ctx = self.clone();
        let connect_result = comm.connect(&replica.ip, replica.port, move |comm, result| {
            let sock = match result {
                Ok(sock) => sock,
                Err(err) => {
                    ctx.fail_attempt(err);
                    return;
                }
            };
            let ctx_for_resp = ctx.clone();
            let length_bytes = ctx.length_bytes;
            let block_size = ctx.volume.block_size;
            comm.register_pending(
                tid,
                sock,
                Box::new(move |comm, result| {
                    comm.disconnect(sock);
                    match result.and_then(|msg| parse_read_resp(&msg, length_bytes, block_size)) {
                        Ok(data) => ctx_for_resp.finish(Ok(data)),
                        Err(err) => ctx_for_resp.fail_attempt(err),
                    }
                }),
            );
            let comm_for_send = comm.clone();
            let _ = comm.send_msg(sock, &message, move |sent| {
                if sent.is_err() {
                    if let Some(op) = comm_for_send.take_pending(tid) {
                        op(&comm_for_send, Err(Error::new(Errno::ConnectionLost)));
                    }
                }
            });
        });
        if let Err(err) = connect_result {
            self.fail_attempt(err);
        }
    }
}

/// Extracts the data blocks from a replica read response.
///
/// Remote data must land in DMA-capable memory before it reaches the
/// caller's buffer.
fn parse_read_resp(msg: &Message, length_bytes: u64, block_size: u32) -> Result<Vec<u8>> {
    if msg.header.msg_type == MessageType::ErrorResp as u16 {
        let status = ErrorResp::decode(&msg.payload)?.status;
        Errno::from_wire(status)?;
        return Err(Error::new(Errno::ReplicationGeneric));
    }
    let resp = ReplicaReadResp::decode(&msg.payload)?;
    Errno::from_wire(resp.status)?;

    let data = &msg.payload[ReplicaReadResp::WIRE_SIZE..];
    if data.len() as u64 != length_bytes {
        return Err(Error::with_msg(
            Errno::MessageIncomplete,
            "replica returned a short read",
        ));
    }
    let mut dma = DmaBuf::alloc(length_bytes as usize, block_size as usize)?;
    dma.as_mut_slice().copy_from_slice(data);
    Ok(dma.as_slice().to_vec())
}

/// Starts a replica-read coordinator seeded at replica index 0.
pub(crate) fn submit_replicated_read(
    volumes: Arc<VolumeManager>,
    volume: Volume,
    offset_bytes: u64,
    length_bytes: u64,
    on_done: ReadCompletion,
) -> Result<()> {
    let ctx = Rc::new(ReadCtx {
        volumes,
        volume,
        offset_bytes,
        length_bytes,
        replica_idx: Cell::new(0),
        last_error: Cell::new(None),
        on_done: RefCell::new(Some(on_done)),
    });
    ctx.try_next();
    Ok(())
}
