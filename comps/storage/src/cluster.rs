// SPDX-License-Identifier: MPL-2.0

use std::{
    rc::{Rc, Weak},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use log::{debug, trace, warn};
use xsan_comm::NodeComm;
use xsan_proto::{Message, MessageType};
use xsan_reactor::{PollStatus, Reactor};
use xsan_types::{Node, NodeId, NodeState, Result, StorageState};

use crate::records::ReplicaLocation;

struct Member {
    node: Node,
    last_contact_us: u64,
}

struct Inner {
    members: Vec<Member>,
}

/// The node's view of the cluster.
///
/// Built from the configured seed list with the local node pinned first.
/// Cluster membership consensus is out of scope; the view only tracks what
/// this node has been told and what its heartbeats observe.
pub struct ClusterView {
    local: Node,
    inner: Mutex<Inner>,
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl ClusterView {
    /// Builds the view from the local node and the parsed seed list. The
    /// local node is always member 0, whether or not it appears among the
    /// seeds.
    pub fn new(mut local: Node, seed_nodes: Vec<Node>) -> Arc<ClusterView> {
        local.state = NodeState::Active;
        let mut members = vec![Member {
            node: local.clone(),
            last_contact_us: now_us(),
        }];
        for node in seed_nodes {
            if node.id == local.id {
                continue;
            }
            members.push(Member {
                node,
                last_contact_us: 0,
            });
        }
        Arc::new(ClusterView {
            local,
            inner: Mutex::new(Inner { members }),
        })
    }

    pub fn local_node(&self) -> &Node {
        &self.local
    }

    /// Snapshot of all known nodes, local first.
    pub fn nodes(&self) -> Vec<Node> {
        self.lock().members.iter().map(|m| m.node.clone()).collect()
    }

    pub fn node_count(&self) -> usize {
        self.lock().members.len()
    }

    pub fn set_node_state(&self, id: NodeId, state: NodeState) {
        let mut inner = self.lock();
        if let Some(member) = inner.members.iter_mut().find(|m| m.node.id == id) {
            member.node.state = state;
        }
    }

    /// Records a successful interaction with a node.
    pub fn mark_contact(&self, id: NodeId) {
        let mut inner = self.lock();
        if let Some(member) = inner.members.iter_mut().find(|m| m.node.id == id) {
            member.last_contact_us = now_us();
            if member.node.state != NodeState::Active {
                debug!("node {} is reachable again", id);
                member.node.state = NodeState::Active;
            }
        }
    }

    pub fn last_contact_us(&self, id: NodeId) -> Option<u64> {
        self.lock()
            .members
            .iter()
            .find(|m| m.node.id == id)
            .map(|m| m.last_contact_us)
    }

    /// Replica-location rows for a new volume: the local node first, then
    /// the other known nodes in seed order, `count` rows in total.
    pub fn replica_locations(&self, count: u32) -> Vec<ReplicaLocation> {
        self.lock()
            .members
            .iter()
            .take(count as usize)
            .map(|member| ReplicaLocation {
                node_id: member.node.id,
                ip: member.node.storage_addr.ip.clone(),
                port: member.node.storage_addr.port,
                state: StorageState::Online,
                last_contact_us: member.last_contact_us,
            })
            .collect()
    }

    /// Starts the heartbeat poller on the current reactor.
    ///
    /// Every `interval`, one heartbeat round is sent to each remote node:
    /// connect, send `HEARTBEAT`, await the ack, disconnect. Acks update
    /// the node's last-contact time through the pending-transaction table.
    pub fn start_heartbeats(
        self: &Arc<Self>,
        comm: &Rc<NodeComm>,
        interval: Duration,
    ) -> Result<()> {
        let reactor = Reactor::current()?;
        let view = self.clone();
        let weak_comm: Weak<NodeComm> = Rc::downgrade(comm);

        comm.register_message_handler(MessageType::HeartbeatAck, |comm, _sock, msg| {
            if let Some(op) = comm.take_pending(msg.header.transaction_id) {
                op(comm, Ok(msg));
            }
        });

        let mut last_round: Option<Instant> = None;
        reactor.register_poller("cluster_heartbeat", move || {
            let due = last_round
                .map(|t| t.elapsed() >= interval)
                .unwrap_or(true);
            if !due {
                return PollStatus::Idle;
            }
            last_round = Some(Instant::now());
            let Some(comm) = weak_comm.upgrade() else {
                return PollStatus::Idle;
            };
            view.heartbeat_round(&comm);
            PollStatus::Busy
        });
        Ok(())
    }

    fn heartbeat_round(self: &Arc<Self>, comm: &Rc<NodeComm>) {
        let peers: Vec<Node> = self
            .lock()
            .members
            .iter()
            .skip(1)
            .map(|m| m.node.clone())
            .collect();
        for peer in peers {
            let view = self.clone();
            let node_id = peer.id;
            let addr = peer.storage_addr.clone();
            let (ip, port) = (addr.ip.clone(), addr.port);
            trace!("heartbeating {node_id} at {addr}");
            let connect_result = comm.connect(&ip, port, move |comm, result| {
                let sock = match result {
                    Ok(sock) => sock,
                    Err(err) => {
                        debug!("heartbeat connect to {addr} failed: {err}");
                        view.set_node_state(node_id, NodeState::Failed);
                        return;
                    }
                };
                let tid = comm.next_transaction_id();
                let ack_view = view.clone();
                comm.register_pending(
                    tid,
                    sock,
                    Box::new(move |comm, result| {
                        if result.is_ok() {
                            ack_view.mark_contact(node_id);
                        } else {
                            ack_view.set_node_state(node_id, NodeState::Failed);
                        }
                        comm.disconnect(sock);
                    }),
                );
                match Message::new(MessageType::Heartbeat, tid, Vec::new()) {
                    Ok(heartbeat) => {
                        let comm_for_send = comm.clone();
                        let _ = comm.send_msg(sock, &heartbeat, move |sent| {
                            if sent.is_err() {
                                if let Some(op) = comm_for_send.take_pending(tid) {
                                    op(&comm_for_send, Err(xsan_types::Error::new(
                                        xsan_types::Errno::ConnectionLost,
                                    )));
                                }
                            }
                        });
                    }
                    Err(err) => warn!("failed to build heartbeat: {err}"),
                }
            });
            if let Err(err) = connect_result {
                debug!("heartbeat connect to node {node_id} not started: {err}");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
