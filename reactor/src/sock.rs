// SPDX-License-Identifier: MPL-2.0

use std::{
    cell::RefCell,
    io::{self, IoSlice, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
};

use hashbrown::HashMap;
use log::{debug, trace, warn};
use xsan_types::{return_errno_with_msg, Errno, Result};

use crate::Reactor;

/// Identifier of a socket within its reactor's socket group.
pub type SockId = u64;

/// Events delivered by [`Reactor::poll_sockets`].
#[derive(Debug)]
pub enum SockEvent {
    /// A listener accepted a new connection.
    Accepted { sock: SockId, peer: String },
    /// A connection has readable data pending.
    Readable(SockId),
    /// The peer closed the connection or it failed.
    Closed(SockId),
}

struct Conn {
    stream: TcpStream,
    peer: String,
}

type ConnectCb = Box<dyn FnOnce(Result<SockId>)>;

struct SockInner {
    next_id: SockId,
    listeners: Vec<TcpListener>,
    conns: HashMap<SockId, Conn>,
    pending_connects: HashMap<u64, ConnectCb>,
    next_connect_token: u64,
}

/// The per-reactor group of non-blocking TCP sockets.
pub(crate) struct SockGroup {
    inner: RefCell<SockInner>,
}

impl SockGroup {
    pub(crate) fn new() -> Self {
        Self {
            inner: RefCell::new(SockInner {
                next_id: 1,
                listeners: Vec::new(),
                conns: HashMap::new(),
                pending_connects: HashMap::new(),
                next_connect_token: 1,
            }),
        }
    }
}

impl Reactor {
    /// Opens a listening socket on `(ip, port)`; returns the bound address
    /// (useful with port 0).
    pub fn sock_listen(&self, ip: &str, port: u16) -> Result<SocketAddr> {
        let listener = TcpListener::bind((ip, port))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        debug!("reactor {}: listening on {addr}", self.id());
        self.socks.inner.borrow_mut().listeners.push(listener);
        Ok(addr)
    }

    /// Starts an asynchronous outbound connect.
    ///
    /// The callback runs on a later tick of this reactor with either the new
    /// socket id or the connect error. The OS-level connect happens on a
    /// short-lived helper thread; its result re-enters the reactor through
    /// the posted-message queue.
    pub fn sock_connect(
        &self,
        ip: &str,
        port: u16,
        on_connect: impl FnOnce(Result<SockId>) + 'static,
    ) -> Result<()> {
        if ip.is_empty() || port == 0 {
            return_errno_with_msg!(Errno::InvalidArgs, "bad connect target");
        }
        let token = {
            let mut inner = self.socks.inner.borrow_mut();
            let token = inner.next_connect_token;
            inner.next_connect_token += 1;
            inner.pending_connects.insert(token, Box::new(on_connect));
            token
        };
        let target = format!("{ip}:{port}");
        let sender = self.sender();
        std::thread::spawn(move || {
            let result = TcpStream::connect(&target);
            sender.post(move || {
                // Back on the reactor thread that initiated the connect.
                let Ok(reactor) = Reactor::current() else {
                    return;
                };
                reactor.finish_connect(token, result);
            });
        });
        Ok(())
    }

    fn finish_connect(&self, token: u64, result: io::Result<TcpStream>) {
        let Some(callback) = self.socks.inner.borrow_mut().pending_connects.remove(&token) else {
            warn!("reactor {}: stray connect completion", self.id());
            return;
        };
        match result {
            Ok(stream) => match self.adopt_stream(stream) {
                Ok((sock, peer)) => {
                    trace!("reactor {}: connected to {peer} as sock {sock}", self.id());
                    callback(Ok(sock));
                }
                Err(err) => callback(Err(err)),
            },
            Err(err) => {
                debug!("reactor {}: connect failed: {err}", self.id());
                callback(Err(err.into()));
            }
        }
    }

    fn adopt_stream(&self, stream: TcpStream) -> Result<(SockId, String)> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown_peer".to_string());
        let mut inner = self.socks.inner.borrow_mut();
        let sock = inner.next_id;
        inner.next_id += 1;
        inner.conns.insert(
            sock,
            Conn {
                stream,
                peer: peer.clone(),
            },
        );
        Ok((sock, peer))
    }

    /// One readiness pass over the socket group: accepts pending
    /// connections and reports readable or closed sockets. Returns the
    /// number of events delivered.
    pub fn poll_sockets(&self, handler: &mut dyn FnMut(SockEvent)) -> usize {
        let mut events = Vec::new();
        let mut accepted = Vec::new();
        {
            let mut inner = self.socks.inner.borrow_mut();
            for listener in &inner.listeners {
                loop {
                    match listener.accept() {
                        Ok((stream, _addr)) => accepted.push(stream),
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            warn!("reactor {}: accept failed: {err}", self.id());
                            break;
                        }
                    }
                }
            }
            let mut probe = [0u8; 1];
            for (sock, conn) in inner.conns.iter() {
                match conn.stream.peek(&mut probe) {
                    Ok(0) => events.push(SockEvent::Closed(*sock)),
                    Ok(_) => events.push(SockEvent::Readable(*sock)),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(_) => events.push(SockEvent::Closed(*sock)),
                }
            }
        }
        for stream in accepted {
            match self.adopt_stream(stream) {
                Ok((sock, peer)) => events.push(SockEvent::Accepted { sock, peer }),
                Err(err) => warn!("reactor {}: dropping accepted socket: {err}", self.id()),
            }
        }

        let count = events.len();
        for event in events {
            handler(event);
        }
        count
    }

    /// Non-blocking receive into `buf`. `Ok(0)` means the peer closed;
    /// `WouldBlock` means no data is currently available.
    pub fn sock_recv(&self, sock: SockId, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.socks.inner.borrow_mut();
        let conn = inner
            .conns
            .get_mut(&sock)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such socket"))?;
        conn.stream.read(buf)
    }

    /// Non-blocking vectored send; may write fewer bytes than offered.
    pub fn sock_send_vectored(&self, sock: SockId, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut inner = self.socks.inner.borrow_mut();
        let conn = inner
            .conns
            .get_mut(&sock)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such socket"))?;
        conn.stream.write_vectored(bufs)
    }

    /// The peer address string of a connection, if it is still open.
    pub fn sock_peer(&self, sock: SockId) -> Option<String> {
        self.socks
            .inner
            .borrow()
            .conns
            .get(&sock)
            .map(|conn| conn.peer.clone())
    }

    /// Closes and forgets a connection.
    pub fn sock_close(&self, sock: SockId) {
        if let Some(conn) = self.socks.inner.borrow_mut().conns.remove(&sock) {
            trace!("reactor {}: closed sock {sock} ({})", self.id(), conn.peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        io::IoSlice,
        rc::Rc,
        time::Duration,
    };

    use super::SockEvent;
    use crate::Reactor;

    #[test]
    fn loopback_connect_accept_and_exchange() {
        std::thread::spawn(|| {
            let reactor = Reactor::init_current(0).unwrap();
            let addr = reactor.sock_listen("127.0.0.1", 0).unwrap();

            let client: Rc<Cell<Option<u64>>> = Rc::new(Cell::new(None));
            let client2 = client.clone();
            reactor
                .sock_connect(&addr.ip().to_string(), addr.port(), move |result| {
                    client2.set(Some(result.unwrap()));
                })
                .unwrap();
            reactor
                .poll_until(Duration::from_secs(5), || client.get().is_some())
                .unwrap();
            let client_sock = client.get().unwrap();

            let server: Rc<Cell<Option<u64>>> = Rc::new(Cell::new(None));
            let server2 = server.clone();
            reactor
                .poll_until(Duration::from_secs(5), || {
                    reactor.poll_sockets(&mut |event| {
                        if let SockEvent::Accepted { sock, .. } = event {
                            server2.set(Some(sock));
                        }
                    });
                    server.get().is_some()
                })
                .unwrap();
            let server_sock = server.get().unwrap();

            reactor
                .sock_send_vectored(client_sock, &[IoSlice::new(b"ping")])
                .unwrap();

            let received = Rc::new(RefCell::new(Vec::new()));
            let received2 = received.clone();
            reactor
                .poll_until(Duration::from_secs(5), || {
                    reactor.poll_sockets(&mut |event| {
                        if let SockEvent::Readable(sock) = event {
                            let mut buf = [0u8; 16];
                            if let Ok(n) = Reactor::current().unwrap().sock_recv(sock, &mut buf) {
                                received2.borrow_mut().extend_from_slice(&buf[..n]);
                            }
                        }
                    });
                    received.borrow().len() >= 4
                })
                .unwrap();
            assert_eq!(&received.borrow()[..], b"ping");
            assert!(reactor
                .sock_peer(server_sock)
                .unwrap()
                .starts_with("127.0.0.1:"));

            reactor.sock_close(client_sock);
            let closed = Rc::new(Cell::new(false));
            let closed2 = closed.clone();
            reactor
                .poll_until(Duration::from_secs(5), || {
                    reactor.poll_sockets(&mut |event| {
                        if let SockEvent::Closed(sock) = event {
                            if sock == server_sock {
                                closed2.set(true);
                            }
                        }
                    });
                    closed.get()
                })
                .unwrap();
            reactor.sock_close(server_sock);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn connect_to_dead_port_reports_error() {
        std::thread::spawn(|| {
            let reactor = Reactor::init_current(0).unwrap();
            // Bind-then-drop to find a port with no listener.
            let port = {
                let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                l.local_addr().unwrap().port()
            };
            let failed = Rc::new(Cell::new(false));
            let failed2 = failed.clone();
            reactor
                .sock_connect("127.0.0.1", port, move |result| {
                    assert!(result.is_err());
                    failed2.set(true);
                })
                .unwrap();
            reactor
                .poll_until(Duration::from_secs(5), || failed.get())
                .unwrap();
        })
        .join()
        .unwrap();
    }
}
