// SPDX-License-Identifier: MPL-2.0

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
    sync::mpsc::{channel, Receiver, Sender},
    time::{Duration, Instant},
};

use log::{debug, trace};
use xsan_types::{return_errno_with_msg, Errno, Error, Result};

use crate::{bdev::BdevTable, sock::SockGroup};

/// What a poller reports about its tick.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PollStatus {
    /// The poller made progress this tick.
    Busy,
    /// Nothing to do.
    Idle,
}

/// Handle to a registered poller.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PollerId(u64);

struct Poller {
    id: PollerId,
    name: &'static str,
    func: Box<dyn FnMut() -> PollStatus>,
}

type Deferred = Box<dyn FnOnce()>;
type Posted = Box<dyn FnOnce() + Send>;

/// A single-threaded polled event loop bound to one OS thread.
///
/// A thread becomes a reactor thread via [`Reactor::init_current`]; reactor
/// APIs called from any other thread fail with `Errno::ThreadContext`.
pub struct Reactor {
    id: u32,
    pollers: RefCell<Vec<Poller>>,
    added_pollers: RefCell<Vec<Poller>>,
    removed_pollers: RefCell<Vec<PollerId>>,
    next_poller_id: Cell<u64>,
    deferred: RefCell<VecDeque<Deferred>>,
    posted_tx: Sender<Posted>,
    posted_rx: Receiver<Posted>,
    pub(crate) bdevs: BdevTable,
    pub(crate) socks: SockGroup,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<Reactor>>> = const { RefCell::new(None) };
}

impl Reactor {
    /// Makes the calling thread a reactor thread and returns its reactor.
    pub fn init_current(id: u32) -> Result<Rc<Reactor>> {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if current.is_some() {
                return_errno_with_msg!(Errno::AlreadyExists, "thread already runs a reactor");
            }
            let (posted_tx, posted_rx) = channel();
            let reactor = Rc::new(Reactor {
                id,
                pollers: RefCell::new(Vec::new()),
                added_pollers: RefCell::new(Vec::new()),
                removed_pollers: RefCell::new(Vec::new()),
                next_poller_id: Cell::new(1),
                deferred: RefCell::new(VecDeque::new()),
                posted_tx,
                posted_rx,
                bdevs: BdevTable::new(),
                socks: SockGroup::new(),
            });
            *current = Some(reactor.clone());
            debug!("reactor {id} initialized");
            Ok(reactor)
        })
    }

    /// Returns the reactor owning the calling thread.
    pub fn current() -> Result<Rc<Reactor>> {
        CURRENT.with(|current| {
            current
                .borrow()
                .clone()
                .ok_or(Error::with_msg(Errno::ThreadContext, "not a reactor thread"))
        })
    }

    /// Returns `true` if the calling thread runs a reactor.
    pub fn is_reactor_thread() -> bool {
        CURRENT.with(|current| current.borrow().is_some())
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Registers a poller invoked on every tick.
    pub fn register_poller(
        &self,
        name: &'static str,
        func: impl FnMut() -> PollStatus + 'static,
    ) -> PollerId {
        let id = PollerId(self.next_poller_id.get());
        self.next_poller_id.set(id.0 + 1);
        let poller = Poller {
            id,
            name,
            func: Box::new(func),
        };
        // Registration from inside a running tick lands in the side list and
        // is merged at the end of the tick.
        if let Ok(mut pollers) = self.pollers.try_borrow_mut() {
            pollers.push(poller);
        } else {
            self.added_pollers.borrow_mut().push(poller);
        }
        trace!("reactor {}: poller '{name}' registered", self.id);
        id
    }

    /// Unregisters a poller. Safe to call from inside the poller itself;
    /// the removal then takes effect at the end of the running tick.
    pub fn unregister_poller(&self, id: PollerId) {
        self.removed_pollers.borrow_mut().push(id);
        if let Ok(mut pollers) = self.pollers.try_borrow_mut() {
            pollers.retain(|p| p.id != id);
        }
    }

    /// Queues a closure to run on a later tick of this reactor.
    ///
    /// This is how the substrate defers completion callbacks so they never
    /// run inline from a submission call.
    pub fn defer(&self, func: impl FnOnce() + 'static) {
        self.deferred.borrow_mut().push_back(Box::new(func));
    }

    /// Returns a cloneable handle other threads use to post work here.
    pub fn sender(&self) -> ReactorSender {
        ReactorSender {
            tx: self.posted_tx.clone(),
        }
    }

    /// Runs one tick: pollers, then deferred completions, then posted
    /// messages. Returns the amount of busy work observed.
    pub fn poll(&self) -> usize {
        let mut busy = 0;

        let mut pollers = std::mem::take(&mut *self.pollers.borrow_mut());
        for poller in pollers.iter_mut() {
            if (poller.func)() == PollStatus::Busy {
                busy += 1;
            }
        }
        // Merge registrations and removals made while the tick ran.
        {
            let mut slot = self.pollers.borrow_mut();
            pollers.append(&mut slot);
            pollers.append(&mut self.added_pollers.borrow_mut());
            let removed = std::mem::take(&mut *self.removed_pollers.borrow_mut());
            if !removed.is_empty() {
                pollers.retain(|p| !removed.contains(&p.id));
            }
            *slot = pollers;
        }

        let completions: Vec<Deferred> = self.deferred.borrow_mut().drain(..).collect();
        busy += completions.len();
        for completion in completions {
            completion();
        }

        while let Ok(msg) = self.posted_rx.try_recv() {
            busy += 1;
            msg();
        }

        busy
    }

    /// Ticks this reactor until `cond` holds or the timeout elapses.
    ///
    /// Bootstrap and test helper; not for the hot I/O path.
    pub fn poll_until(&self, timeout: Duration, mut cond: impl FnMut() -> bool) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if cond() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return_errno_with_msg!(Errno::Timeout, "condition not reached before deadline");
            }
            if self.poll() == 0 {
                std::thread::sleep(Duration::from_micros(100));
            }
        }
    }
}

/// Thread-safe handle for posting work onto a reactor.
#[derive(Clone)]
pub struct ReactorSender {
    tx: Sender<Posted>,
}

impl ReactorSender {
    /// Posts a closure; it runs on a later tick of the target reactor.
    /// Posting to a reactor that has gone away is silently dropped.
    pub fn post(&self, func: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Box::new(func));
    }
}
