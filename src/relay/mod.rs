//! The TCP relay: listener, handler table and the idle-timeout ring.
//!
//! One `TcpRelay` owns one listening port. Every fd the relay or its
//! handlers own is registered on the event loop with the relay itself as
//! the handler; dispatch to the per-connection [`TcpRelayHandler`]s happens
//! here, through the fd table.

mod handler;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::{self, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, info, trace, warn};

use crate::config::{Mode, RelayConfig};
use crate::dns::DnsResolver;
use crate::event::Ready;
use crate::event_loop::{EventHandler, EventLoop, PeriodicCallback, TIMEOUT_PRECISION};
use crate::net::{accept, bind, listen, set_fastopen, LISTEN_BACKLOG};

use self::handler::TcpRelayHandler;

/// At most this many consumed ring slots accumulate before a sweep may
/// compact the ring.
const TIMEOUTS_CLEAN_SIZE: usize = 512;

/// Callback reporting `(listen_port, bytes)` of relayed traffic.
pub type StatCallback = Box<dyn Fn(u16, usize)>;

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// An append-only aging index over values touched in coarse activity
/// order.
///
/// `touch` tombstones the previous slot of a key and appends a fresh one,
/// so slot order equals activity order and a sweep only ever inspects a
/// prefix. The cursor never moves backwards; once the consumed prefix
/// outgrows both [`TIMEOUTS_CLEAN_SIZE`] and half the ring it is dropped
/// and the live slots are rebased, which bounds memory and keeps the
/// per-entry cost amortized constant.
struct TimeoutRing<T> {
    entries: Vec<Option<(usize, T)>>,
    index: HashMap<usize, usize>,
    offset: usize,
}

impl<T> TimeoutRing<T> {
    fn new() -> TimeoutRing<T> {
        TimeoutRing {
            entries: Vec::new(),
            index: HashMap::new(),
            offset: 0,
        }
    }

    /// Moves `key` to the newest slot.
    fn touch(&mut self, key: usize, value: T) {
        if let Some(slot) = self.index.get(&key) {
            // Removal by slot is O(n), so tombstone instead.
            self.entries[*slot] = None;
        }
        self.index.insert(key, self.entries.len());
        self.entries.push(Some((key, value)));
    }

    fn remove(&mut self, key: usize) {
        if let Some(slot) = self.index.remove(&key) {
            self.entries[slot] = None;
        }
    }

    /// Unlinks and returns every value whose last activity is at least
    /// `timeout` seconds old, then compacts the consumed prefix when it
    /// dominates the ring.
    fn sweep<F>(&mut self, now: u64, timeout: u64, last_activity: F) -> Vec<T>
    where
        F: Fn(&T) -> u64,
    {
        let mut expired = Vec::new();
        let mut pos = self.offset;
        while pos < self.entries.len() {
            match self.entries[pos].take() {
                Some((key, value)) => {
                    if now.saturating_sub(last_activity(&value)) < timeout {
                        // Everything behind this slot is newer still.
                        self.entries[pos] = Some((key, value));
                        break;
                    }
                    self.index.remove(&key);
                    expired.push(value);
                    pos += 1;
                }
                None => pos += 1,
            }
        }
        if pos > TIMEOUTS_CLEAN_SIZE && pos > self.entries.len() / 2 {
            self.entries.drain(..pos);
            for slot in self.index.values_mut() {
                *slot -= pos;
            }
            pos = 0;
        }
        self.offset = pos;
        expired
    }
}

/// An encrypted TCP relay bound to one listening port.
///
/// Construct with [`TcpRelay::new`], wire it up with
/// [`add_to_loop`](TcpRelay::add_to_loop), then drive the loop. All state
/// lives on the loop's thread.
pub struct TcpRelay {
    config: Rc<RelayConfig>,
    resolver: Rc<DnsResolver>,
    listen_sock: RefCell<Option<net::TcpListener>>,
    listen_port: u16,
    local_addr: SocketAddr,
    fast_open: Cell<bool>,
    closed: Cell<bool>,
    added_to_loop: Cell<bool>,
    handlers: RefCell<HashMap<RawFd, Rc<TcpRelayHandler>>>,
    timeouts: RefCell<TimeoutRing<Rc<TcpRelayHandler>>>,
    stat_callback: Option<StatCallback>,
    self_weak: RefCell<Weak<TcpRelay>>,
}

impl TcpRelay {
    /// Binds the listening socket (with `SO_REUSEADDR`, non-blocking,
    /// backlog 1024) and prepares the relay. Fast-open degrades silently
    /// when the OS refuses it.
    pub fn new(
        config: RelayConfig,
        resolver: Rc<DnsResolver>,
        stat_callback: Option<StatCallback>,
    ) -> io::Result<Rc<TcpRelay>> {
        if config.timeout == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "timeout must be positive",
            ));
        }
        if config.mode == Mode::Client
            && (config.peer_addrs.is_empty() || config.peer_ports.is_empty())
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "client mode requires at least one peer address and port",
            ));
        }

        let addr = (config.listen_addr.as_str(), config.listen_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!(
                        "can't get addrinfo for {}:{}",
                        config.listen_addr, config.listen_port
                    ),
                )
            })?;

        let socket = bind(addr)?;
        let mut fast_open = config.fast_open;
        if fast_open {
            if let Err(err) = set_fastopen(&socket) {
                warn!("fast open is not available: {}", err);
                fast_open = false;
            }
        }
        let listener = listen(socket, LISTEN_BACKLOG)?;
        let local_addr = listener.local_addr()?;

        let relay = Rc::new(TcpRelay {
            config: Rc::new(config),
            resolver,
            listen_sock: RefCell::new(Some(listener)),
            listen_port: local_addr.port(),
            local_addr,
            fast_open: Cell::new(fast_open),
            closed: Cell::new(false),
            added_to_loop: Cell::new(false),
            handlers: RefCell::new(HashMap::new()),
            timeouts: RefCell::new(TimeoutRing::new()),
            stat_callback,
            self_weak: RefCell::new(Weak::new()),
        });
        *relay.self_weak.borrow_mut() = Rc::downgrade(&relay);
        Ok(relay)
    }

    /// The address the listener actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registers the listening socket and the periodic sweeper. Fails when
    /// called twice or after `close`.
    pub fn add_to_loop(self: &Rc<Self>, event_loop: &EventLoop) -> io::Result<()> {
        if self.added_to_loop.replace(true) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "already added to loop",
            ));
        }
        if self.closed.get() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "already closed"));
        }
        let fd = match self.listen_sock.borrow().as_ref() {
            Some(listener) => listener.as_raw_fd(),
            None => return Err(io::Error::new(io::ErrorKind::NotConnected, "already closed")),
        };
        event_loop.add(fd, Ready::IN | Ready::ERR, Rc::clone(self) as Rc<dyn EventHandler>)?;
        event_loop.add_periodic(Rc::clone(self) as Rc<dyn PeriodicCallback>);
        Ok(())
    }

    /// Closes the relay. With `drain` the listener is shut on the next
    /// periodic tick and existing sessions run until the last one ends,
    /// which then stops the loop; without it everything is torn down now.
    pub fn close(&self, event_loop: &EventLoop, drain: bool) {
        debug!("TCP close");
        self.closed.set(true);
        if drain {
            return;
        }
        if let Some(this) = self.self_weak.borrow().upgrade() {
            event_loop.remove_periodic(&(this as Rc<dyn PeriodicCallback>));
        }
        self.close_listener(event_loop);
        let handlers: Vec<_> = self.handlers.borrow().values().cloned().collect();
        for handler in handlers {
            handler.destroy(event_loop);
        }
    }

    fn close_listener(&self, event_loop: &EventLoop) {
        if let Some(listener) = self.listen_sock.borrow_mut().take() {
            let _ = event_loop.remove(listener.as_raw_fd());
            info!("closed TCP port {}", self.listen_port);
        }
    }

    pub(crate) fn config(&self) -> Rc<RelayConfig> {
        Rc::clone(&self.config)
    }

    pub(crate) fn resolver(&self) -> Rc<DnsResolver> {
        Rc::clone(&self.resolver)
    }

    pub(crate) fn fast_open(&self) -> bool {
        self.fast_open.get()
    }

    pub(crate) fn disable_fast_open(&self) {
        self.fast_open.set(false);
    }

    pub(crate) fn event_handler(&self) -> Option<Rc<dyn EventHandler>> {
        self.self_weak
            .borrow()
            .upgrade()
            .map(|this| this as Rc<dyn EventHandler>)
    }

    /// Links a handler-owned fd to its handler.
    pub(crate) fn register_handler(&self, fd: RawFd, handler: Rc<TcpRelayHandler>) {
        self.handlers.borrow_mut().insert(fd, handler);
    }

    /// Unlinks one handler-owned fd.
    pub(crate) fn forget_fd(&self, fd: RawFd) {
        self.handlers.borrow_mut().remove(&fd);
    }

    /// Reports relayed bytes and refreshes the handler's slot in the aging
    /// ring, rate-limited to once per `TIMEOUT_PRECISION` to keep ring
    /// churn off the per-read path.
    pub(crate) fn update_activity(&self, handler: &Rc<TcpRelayHandler>, data_len: usize) {
        if data_len > 0 {
            if let Some(callback) = &self.stat_callback {
                callback(self.listen_port, data_len);
            }
        }
        let now = unix_now();
        if now.saturating_sub(handler.last_activity()) < TIMEOUT_PRECISION {
            return;
        }
        handler.set_last_activity(now);
        self.timeouts
            .borrow_mut()
            .touch(handler.key(), Rc::clone(handler));
    }

    /// Forgets a handler's ring slot; called from the handler's destroy.
    pub(crate) fn remove_handler(&self, handler: &TcpRelayHandler) {
        self.timeouts.borrow_mut().remove(handler.key());
    }

    fn sweep_timeouts(&self, event_loop: &EventLoop) {
        let expired = {
            let mut ring = self.timeouts.borrow_mut();
            if ring.entries.is_empty() {
                return;
            }
            trace!("sweeping timeouts");
            ring.sweep(unix_now(), self.config.timeout, |handler| {
                handler.last_activity()
            })
        };
        for handler in expired {
            match handler.remote_addr() {
                Some((host, port)) => warn!("timed out: {}:{}", host, port),
                None => warn!("timed out"),
            }
            handler.destroy(event_loop);
        }
    }

    fn accept_loop(&self, event_loop: &EventLoop) {
        let listener = self.listen_sock.borrow();
        let listener = match listener.as_ref() {
            Some(listener) => listener,
            None => return,
        };
        loop {
            match accept(listener) {
                Ok((stream, client_addr)) => {
                    debug!("accept {}", client_addr);
                    if let Err(err) = TcpRelayHandler::create(self, event_loop, stream, client_addr)
                    {
                        error!("failed to set up connection from {}: {}", client_addr, err);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("accept: {}", err);
                    break;
                }
            }
        }
    }
}

impl EventHandler for TcpRelay {
    fn handle_event(&self, event_loop: &EventLoop, fd: RawFd, ready: Ready) -> io::Result<()> {
        trace!("fd {} {:?}", fd, ready);
        let listen_fd = self
            .listen_sock
            .borrow()
            .as_ref()
            .map(|listener| listener.as_raw_fd());
        if Some(fd) == listen_fd {
            if ready.is_error() {
                let err = self
                    .listen_sock
                    .borrow()
                    .as_ref()
                    .and_then(|listener| listener.take_error().ok().flatten())
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "listen socket error"));
                error!("listen socket error on port {}: {}", self.listen_port, err);
                event_loop.stop();
                return Err(err);
            }
            self.accept_loop(event_loop);
        } else {
            let handler = self.handlers.borrow().get(&fd).cloned();
            match handler {
                Some(handler) => handler.handle_event(event_loop, fd, ready),
                None => warn!("poll removed fd {}", fd),
            }
        }
        Ok(())
    }
}

impl PeriodicCallback for TcpRelay {
    fn periodic(&self, event_loop: &EventLoop) {
        if self.closed.get() {
            self.close_listener(event_loop);
            if self.handlers.borrow().is_empty() {
                info!("stopping");
                event_loop.stop();
            }
        }
        self.sweep_timeouts(event_loop);
    }
}

#[cfg(test)]
mod tests {
    use super::TimeoutRing;

    #[test]
    fn touch_moves_to_newest_slot() {
        let mut ring: TimeoutRing<u64> = TimeoutRing::new();
        ring.touch(1, 10);
        ring.touch(2, 20);
        ring.touch(1, 30);
        assert_eq!(ring.entries.len(), 3);
        assert!(ring.entries[0].is_none());
        assert_eq!(ring.index[&1], 2);

        // Only key 2 (activity 20) is old enough to expire.
        let expired = ring.sweep(100, 75, |&v| v);
        assert_eq!(expired, vec![20]);
        assert!(ring.index.contains_key(&1));
    }

    #[test]
    fn sweep_stops_at_first_fresh_entry() {
        let mut ring: TimeoutRing<u64> = TimeoutRing::new();
        for key in 0..10 {
            ring.touch(key, key as u64);
        }
        // Timeout 5 at now 8: activities 0..=3 expired, 4 is fresh and the
        // sweep must not look past it.
        let expired = ring.sweep(8, 5, |&v| v);
        assert_eq!(expired, vec![0, 1, 2, 3]);
        assert_eq!(ring.offset, 4);
        assert_eq!(ring.index.len(), 6);
    }

    #[test]
    fn remove_tombstones_slot() {
        let mut ring: TimeoutRing<u64> = TimeoutRing::new();
        ring.touch(7, 1);
        ring.remove(7);
        assert!(ring.index.is_empty());
        assert!(ring.entries[0].is_none());
        let expired = ring.sweep(100, 1, |&v| v);
        assert!(expired.is_empty());
    }

    #[test]
    fn compaction_bounds_ring_and_rebases_index() {
        let mut ring: TimeoutRing<u64> = TimeoutRing::new();
        for key in 0..2000 {
            ring.touch(key, key as u64);
        }
        let expired = ring.sweep(u64::MAX, 1, |&v| v);
        assert_eq!(expired.len(), 2000);
        assert!(ring.entries.len() <= 1024);
        assert!(ring.index.is_empty());
        assert_eq!(ring.offset, 0);

        // Survivors keep pointing at themselves after a rebase.
        for key in 0..700u64 {
            ring.touch(key as usize, key);
        }
        let expired = ring.sweep(1000, 400, |&v| v);
        assert_eq!(expired.len(), 601);
        for (key, slot) in ring.index.iter() {
            match &ring.entries[*slot] {
                Some((k, v)) => {
                    assert_eq!(k, key);
                    assert_eq!(*v as usize, *key);
                }
                None => panic!("index points at tombstone"),
            }
        }
    }
}
