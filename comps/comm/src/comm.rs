// SPDX-License-Identifier: MPL-2.0

use std::{
    cell::{Cell, RefCell},
    io::{self, IoSlice},
    net::SocketAddr,
    rc::{Rc, Weak},
};

use hashbrown::HashMap;
use log::{debug, error, info, trace, warn};
use xsan_proto::{Message, MessageHeader, MessageType, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use xsan_reactor::{PollStatus, PollerId, Reactor, SockEvent, SockId};
use xsan_types::{Errno, Error, Result};

/// Ceiling for a connection's receive buffer: one maximal message plus a
/// little slack for the next header.
const RECV_BUF_CEILING: usize = MAX_PAYLOAD_SIZE as usize + HEADER_SIZE + 4096;

/// Read chunk size per `recv` call.
const RECV_CHUNK: usize = 16 * 1024;

type SpecificHandler = Rc<dyn Fn(&Rc<NodeComm>, SockId, Message)>;
type FallbackHandler = Rc<dyn Fn(&Rc<NodeComm>, SockId, &str, Message)>;
type SendCb = Box<dyn FnOnce(Result<()>)>;

/// A pending-operation continuation, armed before a request is sent and
/// resolved by the matching response or by connection teardown.
pub type PendingOp = Box<dyn FnOnce(&Rc<NodeComm>, Result<Message>)>;

/// Per-connection receive and send state.
struct ConnCtx {
    peer: String,
    recv_buf: Vec<u8>,
    /// Header of the message currently being reassembled.
    partial_header: Option<MessageHeader>,
    /// Remainder of a partially written send, plus its completion.
    send_pending: Option<(Vec<u8>, usize, SendCb)>,
    /// Transaction ids armed on this connection. Entries may already be
    /// resolved; teardown skips ids no longer in the pending table.
    pending_tids: Vec<u64>,
}

impl ConnCtx {
    fn new(peer: String) -> Self {
        Self {
            peer,
            recv_buf: Vec::with_capacity(HEADER_SIZE + 4096),
            partial_header: None,
            send_pending: None,
            pending_tids: Vec::new(),
        }
    }
}

/// The per-reactor node communication module. See the crate docs.
pub struct NodeComm {
    reactor: Rc<Reactor>,
    listen_addr: Option<SocketAddr>,
    poller: Cell<Option<PollerId>>,
    conns: RefCell<HashMap<SockId, ConnCtx>>,
    handlers: RefCell<HashMap<u16, SpecificHandler>>,
    fallback: RefCell<Option<FallbackHandler>>,
    pending: RefCell<HashMap<u64, PendingOp>>,
    next_tid: Cell<u64>,
}

impl NodeComm {
    /// Initializes node communication on the current reactor, optionally
    /// listening on `(ip, port)`. Port 0 binds an ephemeral port; the bound
    /// address is available via [`NodeComm::listen_addr`].
    pub fn init(listen: Option<(&str, u16)>) -> Result<Rc<NodeComm>> {
        let reactor = Reactor::current()?;
        let listen_addr = match listen {
            Some((ip, port)) => Some(reactor.sock_listen(ip, port)?),
            None => None,
        };

        let comm = Rc::new(NodeComm {
            reactor: reactor.clone(),
            listen_addr,
            poller: Cell::new(None),
            conns: RefCell::new(HashMap::new()),
            handlers: RefCell::new(HashMap::new()),
            fallback: RefCell::new(None),
            pending: RefCell::new(HashMap::new()),
            next_tid: Cell::new(1),
        });

        let weak: Weak<NodeComm> = Rc::downgrade(&comm);
        let poller = reactor.register_poller("node_comm", move || match weak.upgrade() {
            Some(comm) => comm.poll_tick(),
            None => PollStatus::Idle,
        });
        comm.poller.set(Some(poller));
        info!(
            "node comm initialized{}",
            comm.listen_addr
                .map(|a| format!(", listening on {a}"))
                .unwrap_or_default()
        );
        Ok(comm)
    }

    /// Tears the module down: stops polling, closes every connection, and
    /// fails every pending operation.
    pub fn fini(self: &Rc<Self>) {
        if let Some(poller) = self.poller.take() {
            self.reactor.unregister_poller(poller);
        }
        let socks: Vec<SockId> = self.conns.borrow().keys().copied().collect();
        for sock in socks {
            self.teardown(sock, Error::new(Errno::ConnectionLost));
        }
        info!("node comm finalized");
    }

    pub fn reactor(&self) -> &Rc<Reactor> {
        &self.reactor
    }

    /// The bound listening address, if a listener was requested.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Allocates the next transaction id (monotonic per node).
    pub fn next_transaction_id(&self) -> u64 {
        let tid = self.next_tid.get();
        self.next_tid.set(tid + 1);
        tid
    }

    /// Installs the handler for one message type. The handler owns the
    /// message it receives.
    pub fn register_message_handler(
        &self,
        msg_type: MessageType,
        handler: impl Fn(&Rc<NodeComm>, SockId, Message) + 'static,
    ) {
        self.handlers
            .borrow_mut()
            .insert(msg_type as u16, Rc::new(handler));
        debug!("message handler registered for type {}", msg_type as u16);
    }

    /// Installs the generic fallback for message types with no specific
    /// handler. Receives the peer address string alongside the message.
    pub fn set_fallback_handler(
        &self,
        handler: impl Fn(&Rc<NodeComm>, SockId, &str, Message) + 'static,
    ) {
        *self.fallback.borrow_mut() = Some(Rc::new(handler));
    }

    /// Arms a pending operation under `tid`, associated with `sock` so the
    /// operation fails if that connection goes away first.
    pub fn register_pending(&self, tid: u64, sock: SockId, op: PendingOp) {
        self.pending.borrow_mut().insert(tid, op);
        if let Some(conn) = self.conns.borrow_mut().get_mut(&sock) {
            conn.pending_tids.push(tid);
        }
    }

    /// Removes and returns the pending operation armed under `tid`.
    pub fn take_pending(&self, tid: u64) -> Option<PendingOp> {
        self.pending.borrow_mut().remove(&tid)
    }

    /// Starts an outbound connection; the callback receives the new socket
    /// id once the connection is established and adopted.
    pub fn connect(
        self: &Rc<Self>,
        ip: &str,
        port: u16,
        on_connect: impl FnOnce(&Rc<NodeComm>, Result<SockId>) + 'static,
    ) -> Result<()> {
        let weak = Rc::downgrade(self);
        let target = format!("{ip}:{port}");
        self.reactor.sock_connect(ip, port, move |result| {
            let Some(comm) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(sock) => {
                    comm.adopt(sock);
                    on_connect(&comm, Ok(sock));
                }
                Err(err) => {
                    debug!("connect to {target} failed: {err}");
                    on_connect(&comm, Err(err));
                }
            }
        })
    }

    /// Sends a message on a connection.
    ///
    /// The caller retains ownership of `msg`. At most one send may be
    /// outstanding per connection; a concurrent call fails with
    /// `Errno::ResourceBusy`. The completion fires once the full message
    /// has been handed to the socket.
    pub fn send_msg(
        &self,
        sock: SockId,
        msg: &Message,
        on_sent: impl FnOnce(Result<()>) + 'static,
    ) -> Result<()> {
        enum Outcome {
            Done(SendCb),
            Queued,
            Failed(SendCb, Error),
        }

        let on_sent: SendCb = Box::new(on_sent);
        let outcome = {
            let mut conns = self.conns.borrow_mut();
            let Some(conn) = conns.get_mut(&sock) else {
                return Err(Error::with_msg(Errno::InvalidArgs, "no such connection"));
            };
            if conn.send_pending.is_some() {
                return Err(Error::new(Errno::ResourceBusy));
            }

            let header = msg.header.serialize();
            let total = HEADER_SIZE + msg.payload.len();
            let iov = [IoSlice::new(&header), IoSlice::new(&msg.payload)];
            match self.reactor.sock_send_vectored(sock, &iov) {
                Ok(n) if n >= total => Outcome::Done(on_sent),
                Ok(n) => {
                    let mut remainder = Vec::with_capacity(total);
                    remainder.extend_from_slice(&header);
                    remainder.extend_from_slice(&msg.payload);
                    conn.send_pending = Some((remainder, n, on_sent));
                    trace!("partial send to {} ({n}/{total}), queued", conn.peer);
                    Outcome::Queued
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let mut remainder = Vec::with_capacity(total);
                    remainder.extend_from_slice(&header);
                    remainder.extend_from_slice(&msg.payload);
                    conn.send_pending = Some((remainder, 0, on_sent));
                    Outcome::Queued
                }
                Err(err) => Outcome::Failed(on_sent, err.into()),
            }
        };

        match outcome {
            Outcome::Done(on_sent) => {
                on_sent(Ok(()));
                Ok(())
            }
            Outcome::Queued => Ok(()),
            Outcome::Failed(on_sent, err) => {
                warn!("send on sock {sock} failed: {err}");
                on_sent(Err(err));
                Err(err)
            }
        }
    }

    /// Closes a connection and fails its pending operations.
    pub fn disconnect(self: &Rc<Self>, sock: SockId) {
        self.teardown(sock, Error::new(Errno::ConnectionLost));
    }

    /// Number of currently established connections.
    pub fn connection_count(&self) -> usize {
        self.conns.borrow().len()
    }

    fn poll_tick(self: Rc<Self>) -> PollStatus {
        let mut events = Vec::new();
        self.reactor.poll_sockets(&mut |event| events.push(event));
        let busy = !events.is_empty();
        for event in events {
            match event {
                SockEvent::Accepted { sock, peer } => {
                    info!("accepted connection from {peer}");
                    self.conns.borrow_mut().insert(sock, ConnCtx::new(peer));
                }
                SockEvent::Readable(sock) => self.on_readable(sock),
                SockEvent::Closed(sock) => {
                    if self.conns.borrow().contains_key(&sock) {
                        self.teardown(sock, Error::new(Errno::ConnectionLost));
                    }
                }
            }
        }
        let flushed = self.flush_pending_sends();
        if busy || flushed {
            PollStatus::Busy
        } else {
            PollStatus::Idle
        }
    }

    fn adopt(&self, sock: SockId) {
        let peer = self
            .reactor
            .sock_peer(sock)
            .unwrap_or_else(|| "unknown_peer".to_string());
        self.conns.borrow_mut().insert(sock, ConnCtx::new(peer));
    }

    /// Drains the socket and dispatches every fully reassembled message.
    fn on_readable(self: &Rc<Self>, sock: SockId) {
        loop {
            let mut chunk = [0u8; RECV_CHUNK];
            let n = match self.reactor.sock_recv(sock, &mut chunk) {
                Ok(0) => {
                    let peer = self.peer_of(sock);
                    info!("connection {peer} closed by peer");
                    self.teardown(sock, Error::new(Errno::ConnectionLost));
                    return;
                }
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!("recv error on sock {sock}: {err}");
                    self.teardown(sock, Error::new(Errno::ConnectionLost));
                    return;
                }
            };

            let extracted = {
                let mut conns = self.conns.borrow_mut();
                let Some(conn) = conns.get_mut(&sock) else {
                    return;
                };
                if conn.recv_buf.len() + n > RECV_BUF_CEILING {
                    Err(Error::with_msg(
                        Errno::PayloadTooLarge,
                        "receive buffer ceiling exceeded",
                    ))
                } else {
                    conn.recv_buf.extend_from_slice(&chunk[..n]);
                    extract_messages(conn)
                }
            };

            match extracted {
                Ok(messages) => {
                    for msg in messages {
                        self.dispatch(sock, msg);
                    }
                }
                Err(err) => {
                    let peer = self.peer_of(sock);
                    warn!("framing violation from {peer}: {err}; closing");
                    self.teardown(sock, err);
                    return;
                }
            }
        }
    }

    fn dispatch(self: &Rc<Self>, sock: SockId, msg: Message) {
        if !msg.verify_checksum() {
            let peer = self.peer_of(sock);
            warn!("checksum mismatch from {peer}; closing");
            self.teardown(sock, Error::new(Errno::ChecksumInvalid));
            return;
        }
        let msg_type = msg.header.msg_type;
        trace!(
            "dispatching message type {msg_type}, tid {}, {} payload bytes",
            msg.header.transaction_id,
            msg.payload.len()
        );

        let handler = self.handlers.borrow().get(&msg_type).cloned();
        if let Some(handler) = handler {
            handler(self, sock, msg);
            return;
        }

        // Heartbeats are answered by the module itself unless a handler
        // took them over.
        if msg_type == MessageType::Heartbeat as u16 {
            let tid = msg.header.transaction_id;
            match Message::new(MessageType::HeartbeatAck, tid, Vec::new()) {
                Ok(ack) => {
                    let _ = self.send_msg(sock, &ack, |_| {});
                }
                Err(err) => error!("failed to build heartbeat ack: {err}"),
            }
            return;
        }

        let fallback = self.fallback.borrow().clone();
        if let Some(fallback) = fallback {
            let peer = self.peer_of(sock);
            fallback(self, sock, &peer, msg);
        } else {
            debug!("no handler for message type {msg_type}; discarding");
        }
    }

    fn flush_pending_sends(self: &Rc<Self>) -> bool {
        let socks: Vec<SockId> = {
            let conns = self.conns.borrow();
            conns
                .iter()
                .filter(|(_, c)| c.send_pending.is_some())
                .map(|(s, _)| *s)
                .collect()
        };
        if socks.is_empty() {
            return false;
        }

        for sock in socks {
            let mut finished: Option<(SendCb, Result<()>)> = None;
            let mut failed = false;
            {
                let mut conns = self.conns.borrow_mut();
                let Some(conn) = conns.get_mut(&sock) else {
                    continue;
                };
                let Some((buf, mut offset, callback)) = conn.send_pending.take() else {
                    continue;
                };
                match self
                    .reactor
                    .sock_send_vectored(sock, &[IoSlice::new(&buf[offset..])])
                {
                    Ok(n) => {
                        offset += n;
                        if offset >= buf.len() {
                            finished = Some((callback, Ok(())));
                        } else {
                            conn.send_pending = Some((buf, offset, callback));
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        conn.send_pending = Some((buf, offset, callback));
                    }
                    Err(err) => {
                        finished = Some((callback, Err(err.into())));
                        failed = true;
                    }
                }
            }
            if let Some((callback, status)) = finished {
                callback(status);
            }
            if failed {
                self.teardown(sock, Error::new(Errno::ConnectionLost));
            }
        }
        true
    }

    /// Removes a connection and fails every operation armed on it.
    fn teardown(self: &Rc<Self>, sock: SockId, err: Error) {
        let removed = self.conns.borrow_mut().remove(&sock);
        let Some(conn) = removed else {
            return;
        };
        self.reactor.sock_close(sock);
        debug!("connection {} torn down: {err}", conn.peer);

        if let Some((_, _, callback)) = conn.send_pending {
            callback(Err(err));
        }
        for tid in conn.pending_tids {
            if let Some(op) = self.take_pending(tid) {
                op(self, Err(err));
            }
        }
    }

    fn peer_of(&self, sock: SockId) -> String {
        self.conns
            .borrow()
            .get(&sock)
            .map(|c| c.peer.clone())
            .unwrap_or_else(|| "unknown_peer".to_string())
    }
}

/// Pulls every complete message out of the connection's receive buffer.
///
/// Framing errors (bad magic, oversized payload) are returned so the
/// caller can close the connection; the declared payload is never
/// allocated in that case.
fn extract_messages(conn: &mut ConnCtx) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    loop {
        if conn.partial_header.is_none() {
            if conn.recv_buf.len() < HEADER_SIZE {
                break;
            }
            let header = MessageHeader::deserialize(&conn.recv_buf)?;
            conn.recv_buf.drain(..HEADER_SIZE);
            conn.partial_header = Some(header);
        }

        let Some(header) = conn.partial_header else {
            break;
        };
        let payload_len = header.payload_length as usize;
        if conn.recv_buf.len() < payload_len {
            break;
        }
        let payload: Vec<u8> = conn.recv_buf.drain(..payload_len).collect();
        conn.partial_header = None;
        messages.push(Message::from_parts(header, payload));
    }
    Ok(messages)
}
