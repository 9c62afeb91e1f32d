// SPDX-License-Identifier: MPL-2.0

//! The replica side of the data plane: serving `REPLICA_*_REQ` messages
//! against the local volumes, and routing `REPLICA_*_RESP` messages back
//! into the pending-transaction table on the primary side.

use std::{rc::Rc, sync::Arc};

use log::{debug, warn};
use xsan_comm::{NodeComm, SockId};
use xsan_proto::{
    ErrorResp, Message, MessageType, ReplicaReadReq, ReplicaReadResp, ReplicaWriteReq,
    ReplicaWriteResp,
};
use xsan_types::{Errno, Error};

use crate::VolumeManager;

/// The per-reactor replication endpoint. Created via
/// [`crate::replication::install`].
pub struct ReplicationService {
    comm: Rc<NodeComm>,
    volumes: Arc<VolumeManager>,
}

impl ReplicationService {
    pub(super) fn new(comm: Rc<NodeComm>, volumes: Arc<VolumeManager>) -> Rc<Self> {
        let service = Rc::new(ReplicationService {
            comm: comm.clone(),
            volumes,
        });

        // Response types resolve armed transactions on the primary side.
        for resp_type in [
            MessageType::ReplicaWriteBlockResp,
            MessageType::ReplicaReadBlockResp,
            MessageType::ErrorResp,
        ] {
            comm.register_message_handler(resp_type, move |comm, _sock, msg| {
                let tid = msg.header.transaction_id;
                match comm.take_pending(tid) {
                    Some(op) => op(comm, Ok(msg)),
                    None => warn!("stray response (type {}, tid {tid})", msg.header.msg_type),
                }
            });
        }

        // Request types serve the replica side.
        let write_service = service.clone();
        comm.register_message_handler(MessageType::ReplicaWriteBlockReq, move |comm, sock, msg| {
            write_service.handle_write_req(comm, sock, msg);
        });
        let read_service = service.clone();
        comm.register_message_handler(MessageType::ReplicaReadBlockReq, move |comm, sock, msg| {
            read_service.handle_read_req(comm, sock, msg);
        });

        service
    }

    pub fn comm(&self) -> &Rc<NodeComm> {
        &self.comm
    }

    fn handle_write_req(&self, comm: &Rc<NodeComm>, sock: SockId, msg: Message) {
        let tid = msg.header.transaction_id;
        let request = match ReplicaWriteReq::decode(&msg.payload) {
            Ok(request) => request,
            Err(err) => {
                send_error_resp(comm, sock, tid, err);
                return;
            }
        };
        let Some(volume) = self.volumes.get_volume(request.volume_id) else {
            send_error_resp(comm, sock, tid, Error::new(Errno::VolumeNotFound));
            return;
        };
        let data = &msg.payload[ReplicaWriteReq::WIRE_SIZE..];
        let expected = request.num_blocks as u64 * volume.block_size as u64;
        if data.len() as u64 != expected {
            send_error_resp(comm, sock, tid, Error::new(Errno::InvalidSize));
            return;
        }
        debug!(
            "replica write: volume {}, lba {}, {} blocks",
            request.volume_id, request.block_lba_on_volume, request.num_blocks
        );

        let offset = request.block_lba_on_volume * volume.block_size as u64;
        let comm = comm.clone();
        let submit = self.volumes.local_write_async(
            volume.id,
            offset,
            data,
            move |result| {
                let status = match &result {
                    Ok(()) => 0,
                    Err(err) => err.errno().wire_code(),
                };
                let resp = ReplicaWriteResp {
                    status,
                    block_lba_on_volume: request.block_lba_on_volume,
                    num_blocks_processed: if result.is_ok() {
                        request.num_blocks
                    } else {
                        0
                    },
                };
                match Message::new(
                    MessageType::ReplicaWriteBlockResp,
                    tid,
                    resp.encode().to_vec(),
                ) {
                    Ok(message) => {
                        let _ = comm.send_msg(sock, &message, |_| {});
                    }
                    Err(err) => warn!("failed to build replica write response: {err}"),
                }
            },
        );
        if let Err(err) = submit {
            debug!("replica write submission failed: {err}");
        }
    }

    fn handle_read_req(&self, comm: &Rc<NodeComm>, sock: SockId, msg: Message) {
        let tid = msg.header.transaction_id;
        let request = match ReplicaReadReq::decode(&msg.payload) {
            Ok(request) => request,
            Err(err) => {
                send_error_resp(comm, sock, tid, err);
                return;
            }
        };
        let Some(volume) = self.volumes.get_volume(request.volume_id) else {
            send_error_resp(comm, sock, tid, Error::new(Errno::VolumeNotFound));
            return;
        };
        debug!(
            "replica read: volume {}, lba {}, {} blocks",
            request.volume_id, request.block_lba_on_volume, request.num_blocks
        );

        let offset = request.block_lba_on_volume * volume.block_size as u64;
        let length = request.num_blocks as u64 * volume.block_size as u64;
        let comm = comm.clone();
        let submit = self.volumes.local_read_async(
            volume.id,
            offset,
            length,
            move |result| {
                let (resp, data) = match &result {
                    Ok(data) => (
                        ReplicaReadResp {
                            status: 0,
                            volume_id: request.volume_id,
                            block_lba_on_volume: request.block_lba_on_volume,
                            num_blocks: request.num_blocks,
                        },
                        data.as_slice(),
                    ),
                    Err(err) => (
                        ReplicaReadResp {
                            status: err.errno().wire_code(),
                            volume_id: request.volume_id,
                            block_lba_on_volume: request.block_lba_on_volume,
                            num_blocks: 0,
                        },
                        &[][..],
                    ),
                };
                match Message::with_payload_parts(
                    MessageType::ReplicaReadBlockResp,
                    tid,
                    &resp.encode(),
                    data,
                ) {
                    Ok(message) => {
                        let _ = comm.send_msg(sock, &message, |_| {});
                    }
                    Err(err) => warn!("failed to build replica read response: {err}"),
                }
            },
        );
        if let Err(err) = submit {
            debug!("replica read submission failed: {err}");
        }
    }
}

fn send_error_resp(comm: &Rc<NodeComm>, sock: SockId, tid: u64, err: Error) {
    warn!("replica request failed before submission: {err}");
    let payload = ErrorResp {
        status: err.errno().wire_code(),
    }
    .encode()
    .to_vec();
    match Message::new(MessageType::ErrorResp, tid, payload) {
        Ok(message) => {
            let _ = comm.send_msg(sock, &message, |_| {});
        }
        Err(build_err) => warn!("failed to build error response: {build_err}"),
    }
}
