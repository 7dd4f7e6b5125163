//! Per-connection relay handler.
//!
//! One handler owns two sockets: `local` towards whoever connected to the
//! listener, `remote` towards the peer relay (client mode) or the origin
//! (server mode). The handler walks the stages below, then relays bytes in
//! both directions until either side goes away.
//!
//! Client mode:
//!   INIT        SOCKS greeting received, greeting reply sent
//!   ADDR        SOCKS request parsed, peer lookup started
//!   UDP_ASSOC   UDP associate reply sent, TCP side held open
//!   DNS         suspended on the resolver
//!   CONNECTING  peer socket connecting, early payload buffered
//!   STREAM      piping local and remote
//!
//! Server mode is the same without the SOCKS exchange: the first decrypted
//! record carries the destination header directly.
//!
//! Upstream is the client→remote direction, downstream remote→client. Each
//! direction waits for reading, writing or both, and the two wait states
//! together determine both sockets' interest masks.

use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::mem;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use log::{debug, error, info, warn};
use rand::seq::IndexedRandom;

use crate::config::{Mode, RelayConfig};
use crate::crypto::Encryptor;
use crate::dns::{DnsCallback, DnsResolver};
use crate::event::Ready;
use crate::event_loop::EventLoop;
use crate::net::{connect, new_stream, sendto_fastopen};
use crate::socks;

use super::TcpRelay;

const BUF_SIZE: usize = 32 * 1024;

/// Reply to a SOCKS CONNECT: success, bound to 0.0.0.0:4112.
const CONNECT_REPLY: &[u8] = b"\x05\x00\x00\x01\x00\x00\x00\x00\x10\x10";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Stage {
    Init,
    Addr,
    UdpAssoc,
    Dns,
    Connecting,
    Stream,
    Destroyed,
}

#[derive(Copy, Clone, PartialEq)]
enum Direction {
    Up,
    Down,
}

#[derive(Copy, Clone, PartialEq)]
enum Sock {
    Local,
    Remote,
}

const WAIT_INIT: u8 = 0;
const WAIT_READING: u8 = 0b01;
const WAIT_WRITING: u8 = 0b10;
const WAIT_READWRITING: u8 = WAIT_READING | WAIT_WRITING;

fn is_transient_read(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
    )
}

pub(crate) struct TcpRelayHandler {
    relay: Weak<TcpRelay>,
    resolver: Rc<DnsResolver>,
    config: Rc<RelayConfig>,
    is_local: bool,
    stage: Cell<Stage>,
    encryptor: RefCell<Encryptor>,
    local_sock: RefCell<Option<TcpStream>>,
    remote_sock: RefCell<Option<TcpStream>>,
    buf_to_local: RefCell<Vec<u8>>,
    buf_to_remote: RefCell<Vec<u8>>,
    upstream_status: Cell<u8>,
    downstream_status: Cell<u8>,
    client_addr: SocketAddr,
    remote_addr: RefCell<Option<(String, u16)>>,
    chosen_peer: Option<(String, u16)>,
    // Resolved peer kept for the deferred fast-open connect.
    fastopen_target: RefCell<Option<(String, u16)>>,
    fastopen_connected: Cell<bool>,
    last_activity: Cell<u64>,
    self_weak: RefCell<Weak<TcpRelayHandler>>,
}

impl TcpRelayHandler {
    /// Sets up a handler for a freshly accepted connection: TCP_NODELAY,
    /// registration for `IN | ERR`, and a slot in the aging ring.
    pub(crate) fn create(
        relay: &TcpRelay,
        event_loop: &EventLoop,
        local_sock: TcpStream,
        client_addr: SocketAddr,
    ) -> io::Result<()> {
        let config = relay.config();
        let is_local = config.mode == Mode::Client;
        local_sock.set_nodelay(true)?;
        let chosen_peer = if is_local {
            Some(choose_peer(&config)?)
        } else {
            None
        };
        let fd = local_sock.as_raw_fd();
        let encryptor = Encryptor::new(&config.password, config.method);

        let handler = Rc::new(TcpRelayHandler {
            relay: relay.self_weak.borrow().clone(),
            resolver: relay.resolver(),
            config,
            is_local,
            stage: Cell::new(Stage::Init),
            encryptor: RefCell::new(encryptor),
            local_sock: RefCell::new(Some(local_sock)),
            remote_sock: RefCell::new(None),
            buf_to_local: RefCell::new(Vec::new()),
            buf_to_remote: RefCell::new(Vec::new()),
            upstream_status: Cell::new(WAIT_READING),
            downstream_status: Cell::new(WAIT_INIT),
            client_addr,
            remote_addr: RefCell::new(None),
            chosen_peer,
            fastopen_target: RefCell::new(None),
            fastopen_connected: Cell::new(false),
            last_activity: Cell::new(0),
            self_weak: RefCell::new(Weak::new()),
        });
        *handler.self_weak.borrow_mut() = Rc::downgrade(&handler);

        let dispatcher = relay
            .event_handler()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "relay not initialized"))?;
        event_loop.add(fd, Ready::IN | Ready::ERR, dispatcher)?;
        relay.register_handler(fd, Rc::clone(&handler));
        handler.update_activity(0);
        Ok(())
    }

    /// Identity of this handler, stable while any strong reference exists.
    pub(crate) fn key(&self) -> usize {
        self as *const TcpRelayHandler as usize
    }

    pub(crate) fn last_activity(&self) -> u64 {
        self.last_activity.get()
    }

    pub(crate) fn set_last_activity(&self, now: u64) {
        self.last_activity.set(now);
    }

    pub(crate) fn remote_addr(&self) -> Option<(String, u16)> {
        self.remote_addr.borrow().clone()
    }

    fn destroyed(&self) -> bool {
        self.stage.get() == Stage::Destroyed
    }

    fn update_activity(&self, data_len: usize) {
        if let (Some(relay), Some(this)) = (self.relay.upgrade(), self.self_weak.borrow().upgrade())
        {
            relay.update_activity(&this, data_len);
        }
    }

    /// Re-arms both sockets' interest masks after a direction changed what
    /// it waits for. Only dirty transitions reach the event loop.
    fn update_stream(&self, event_loop: &EventLoop, direction: Direction, status: u8) {
        let dirty = match direction {
            Direction::Down => {
                if self.downstream_status.get() != status {
                    self.downstream_status.set(status);
                    true
                } else {
                    false
                }
            }
            Direction::Up => {
                if self.upstream_status.get() != status {
                    self.upstream_status.set(status);
                    true
                } else {
                    false
                }
            }
        };
        if !dirty {
            return;
        }
        if let Some(sock) = self.local_sock.borrow().as_ref() {
            let mut mask = Ready::ERR;
            if self.downstream_status.get() & WAIT_WRITING != 0 {
                mask |= Ready::OUT;
            }
            if self.upstream_status.get() & WAIT_READING != 0 {
                mask |= Ready::IN;
            }
            if let Err(err) = event_loop.modify(sock.as_raw_fd(), mask) {
                debug!("modify local sock: {}", err);
            }
        }
        if let Some(sock) = self.remote_sock.borrow().as_ref() {
            let mut mask = Ready::ERR;
            if self.downstream_status.get() & WAIT_READING != 0 {
                mask |= Ready::IN;
            }
            if self.upstream_status.get() & WAIT_WRITING != 0 {
                mask |= Ready::OUT;
            }
            if let Err(err) = event_loop.modify(sock.as_raw_fd(), mask) {
                debug!("modify remote sock: {}", err);
            }
        }
    }

    /// Writes as much of `data` as the socket takes; the rest is buffered
    /// and the direction switched to waiting for writability.
    fn write_to_sock(&self, event_loop: &EventLoop, data: &[u8], target: Sock) -> bool {
        if data.is_empty() {
            return false;
        }
        let result = {
            let sock = match target {
                Sock::Local => self.local_sock.borrow(),
                Sock::Remote => self.remote_sock.borrow(),
            };
            match sock.as_ref() {
                Some(mut stream) => stream.write(data),
                None => return false,
            }
        };
        let (incomplete, written) = match result {
            Ok(n) if n < data.len() => (true, n),
            Ok(_) => (false, data.len()),
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.raw_os_error() == Some(libc::EINPROGRESS) =>
            {
                (true, 0)
            }
            Err(err) => {
                self.log_error(&err);
                self.destroy(event_loop);
                return false;
            }
        };
        match (incomplete, target) {
            (true, Sock::Local) => {
                self.buf_to_local
                    .borrow_mut()
                    .extend_from_slice(&data[written..]);
                self.update_stream(event_loop, Direction::Down, WAIT_WRITING);
            }
            (true, Sock::Remote) => {
                self.buf_to_remote
                    .borrow_mut()
                    .extend_from_slice(&data[written..]);
                self.update_stream(event_loop, Direction::Up, WAIT_WRITING);
            }
            (false, Sock::Local) => self.update_stream(event_loop, Direction::Down, WAIT_READING),
            (false, Sock::Remote) => self.update_stream(event_loop, Direction::Up, WAIT_READING),
        }
        true
    }

    /// More payload arrived while the peer connection is still being set
    /// up; buffer it, and in the fast-open case this is the moment the
    /// connection actually starts.
    fn handle_stage_connecting(&self, event_loop: &EventLoop, data: &[u8]) {
        if self.is_local {
            let encrypted = self.encryptor.borrow_mut().encrypt(data);
            self.buf_to_remote.borrow_mut().extend_from_slice(&encrypted);
        } else {
            self.buf_to_remote.borrow_mut().extend_from_slice(data);
        }

        let relay = match self.relay.upgrade() {
            Some(relay) => relay,
            None => return,
        };
        if !(self.is_local && !self.fastopen_connected.get() && relay.fast_open()) {
            return;
        }
        // Connect only once.
        self.fastopen_connected.set(true);
        let target = self.fastopen_target.borrow().clone();
        let (ip, port) = match target {
            Some(target) => target,
            None => {
                self.destroy(event_loop);
                return;
            }
        };
        let addr = match self.create_remote_socket(&ip, port) {
            Ok(addr) => addr,
            Err(err) => {
                self.log_error(&err);
                self.destroy(event_loop);
                return;
            }
        };
        let remote_fd = match self.remote_sock.borrow().as_ref() {
            Some(sock) => sock.as_raw_fd(),
            None => {
                self.destroy(event_loop);
                return;
            }
        };
        let dispatcher = match relay.event_handler() {
            Some(dispatcher) => dispatcher,
            None => {
                self.destroy(event_loop);
                return;
            }
        };
        if let Err(err) = event_loop.add(remote_fd, Ready::ERR, dispatcher) {
            self.log_error(&err);
            self.destroy(event_loop);
            return;
        }

        let pending = mem::take(&mut *self.buf_to_remote.borrow_mut());
        let sent = {
            let sock = self.remote_sock.borrow();
            match sock.as_ref() {
                Some(sock) => sendto_fastopen(sock, &pending, addr),
                None => return,
            }
        };
        match sent {
            Ok(n) if n < pending.len() => {
                *self.buf_to_remote.borrow_mut() = pending[n..].to_vec();
            }
            Ok(_) => {}
            Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {
                // Nothing was sent; keep it all for the OUT event.
                *self.buf_to_remote.borrow_mut() = pending;
            }
            Err(ref err)
                if err.raw_os_error() == Some(libc::ENOTCONN)
                    || err.kind() == io::ErrorKind::Unsupported =>
            {
                error!("fast open not supported on this OS");
                relay.disable_fast_open();
                self.destroy(event_loop);
                return;
            }
            Err(err) => {
                self.log_error(&err);
                self.destroy(event_loop);
                return;
            }
        }
        self.update_stream(event_loop, Direction::Up, WAIT_READWRITING);
    }

    /// Parses the destination (after the SOCKS request prefix in client
    /// mode), answers the client, and suspends on the resolver.
    fn handle_stage_addr(&self, event_loop: &EventLoop, data: &[u8]) {
        let mut data = data;
        if self.is_local {
            let cmd = match data.get(1) {
                Some(&cmd) => cmd,
                None => {
                    warn!("truncated SOCKS request from {}", self.client_addr);
                    self.destroy(event_loop);
                    return;
                }
            };
            match cmd {
                socks::CMD_UDP_ASSOCIATE => {
                    debug!("UDP associate");
                    let reply = match self.udp_associate_reply() {
                        Ok(reply) => reply,
                        Err(err) => {
                            self.log_error(&err);
                            self.destroy(event_loop);
                            return;
                        }
                    };
                    self.write_to_sock(event_loop, &reply, Sock::Local);
                    if !self.destroyed() {
                        self.stage.set(Stage::UdpAssoc);
                    }
                    // Just wait for the client to disconnect.
                    return;
                }
                socks::CMD_CONNECT => {
                    // Trim VER CMD RSV.
                    data = match data.get(3..) {
                        Some(rest) => rest,
                        None => {
                            warn!("truncated SOCKS request from {}", self.client_addr);
                            self.destroy(event_loop);
                            return;
                        }
                    };
                }
                _ => {
                    error!("unknown command {}", cmd);
                    self.destroy(event_loop);
                    return;
                }
            }
        }

        let header = match socks::parse_header(data) {
            Some(header) => header,
            None => {
                warn!(
                    "can not parse header when handling connection from {}",
                    self.client_addr
                );
                self.destroy(event_loop);
                return;
            }
        };
        info!(
            "connecting {}:{} from {}",
            header.host, header.port, self.client_addr
        );
        *self.remote_addr.borrow_mut() = Some((header.host.clone(), header.port));
        // Pause reading from the client until the tunnel stands.
        self.update_stream(event_loop, Direction::Up, WAIT_WRITING);
        self.stage.set(Stage::Dns);

        let callback: Rc<dyn DnsCallback> = match self.self_weak.borrow().upgrade() {
            Some(this) => this,
            None => return,
        };
        if self.is_local {
            self.write_to_sock(event_loop, CONNECT_REPLY, Sock::Local);
            if self.destroyed() {
                return;
            }
            let encrypted = self.encryptor.borrow_mut().encrypt(data);
            self.buf_to_remote.borrow_mut().extend_from_slice(&encrypted);
            let peer = match &self.chosen_peer {
                Some((host, _)) => host.clone(),
                None => {
                    self.destroy(event_loop);
                    return;
                }
            };
            // May re-enter dns_resolved before returning.
            self.resolver.resolve(event_loop, &peer, callback);
        } else {
            if data.len() > header.len {
                self.buf_to_remote
                    .borrow_mut()
                    .extend_from_slice(&data[header.len..]);
            }
            // May re-enter dns_resolved before returning.
            self.resolver.resolve(event_loop, &header.host, callback);
        }
    }

    fn udp_associate_reply(&self) -> io::Result<Vec<u8>> {
        let sock = self.local_sock.borrow();
        let local = sock
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no local socket"))?
            .local_addr()?;
        let mut reply = vec![socks::VERSION, 0, 0];
        match local {
            SocketAddr::V4(addr) => {
                reply.push(socks::ATYP_IPV4);
                reply.extend_from_slice(&addr.ip().octets());
            }
            SocketAddr::V6(addr) => {
                reply.push(socks::ATYP_IPV6);
                reply.extend_from_slice(&addr.ip().octets());
            }
        }
        reply.extend_from_slice(&local.port().to_be_bytes());
        Ok(reply)
    }

    /// Creates the outbound socket towards `ip:port`, enforcing the
    /// forbidden-IP policy, and links its fd to this handler. Registration
    /// with the loop is the caller's business, the masks differ per path.
    fn create_remote_socket(&self, ip: &str, port: u16) -> io::Result<SocketAddr> {
        let ip_addr: IpAddr = ip.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid remote address {}", ip),
            )
        })?;
        if self.config.forbidden_ips.contains(ip) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("IP {} is in forbidden list, reject", ip),
            ));
        }
        let relay = self
            .relay
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "relay is gone"))?;
        let this = self
            .self_weak
            .borrow()
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "handler is gone"))?;

        let addr = SocketAddr::new(ip_addr, port);
        let stream = new_stream(&addr)?;
        stream.set_nodelay(true)?;
        relay.register_handler(stream.as_raw_fd(), this);
        *self.remote_sock.borrow_mut() = Some(stream);
        Ok(addr)
    }

    fn on_local_read(&self, event_loop: &EventLoop) {
        let mut buf = [0u8; BUF_SIZE];
        let read = {
            let sock = self.local_sock.borrow();
            match sock.as_ref() {
                Some(mut stream) => stream.read(&mut buf),
                None => return,
            }
        };
        let n = match read {
            Ok(0) => {
                self.destroy(event_loop);
                return;
            }
            Ok(n) => n,
            Err(ref err) if is_transient_read(err) => return,
            Err(err) => {
                self.log_error(&err);
                self.destroy(event_loop);
                return;
            }
        };
        self.update_activity(n);

        let mut data = buf[..n].to_vec();
        if !self.is_local {
            data = self.encryptor.borrow_mut().decrypt(&data);
            if data.is_empty() {
                return;
            }
        }
        match self.stage.get() {
            Stage::Stream => {
                if self.is_local {
                    data = self.encryptor.borrow_mut().encrypt(&data);
                }
                self.write_to_sock(event_loop, &data, Sock::Remote);
            }
            Stage::Init if self.is_local => {
                if data.first() != Some(&socks::VERSION) {
                    warn!("bad SOCKS greeting from {}", self.client_addr);
                    self.destroy(event_loop);
                    return;
                }
                self.write_to_sock(event_loop, &[socks::VERSION, 0], Sock::Local);
                if !self.destroyed() {
                    self.stage.set(Stage::Addr);
                }
            }
            Stage::Connecting => self.handle_stage_connecting(event_loop, &data),
            // First record in server mode carries the destination header.
            Stage::Init => self.handle_stage_addr(event_loop, &data),
            Stage::Addr if self.is_local => self.handle_stage_addr(event_loop, &data),
            _ => {}
        }
    }

    fn on_remote_read(&self, event_loop: &EventLoop) {
        let mut buf = [0u8; BUF_SIZE];
        let read = {
            let sock = self.remote_sock.borrow();
            match sock.as_ref() {
                Some(mut stream) => stream.read(&mut buf),
                None => return,
            }
        };
        let n = match read {
            Ok(0) => {
                self.destroy(event_loop);
                return;
            }
            Ok(n) => n,
            Err(ref err) if is_transient_read(err) => return,
            Err(err) => {
                self.log_error(&err);
                self.destroy(event_loop);
                return;
            }
        };
        self.update_activity(n);

        let data = if self.is_local {
            self.encryptor.borrow_mut().decrypt(&buf[..n])
        } else {
            self.encryptor.borrow_mut().encrypt(&buf[..n])
        };
        if data.is_empty() {
            return;
        }
        self.write_to_sock(event_loop, &data, Sock::Local);
    }

    fn on_local_write(&self, event_loop: &EventLoop) {
        let data = mem::take(&mut *self.buf_to_local.borrow_mut());
        if data.is_empty() {
            self.update_stream(event_loop, Direction::Down, WAIT_READING);
        } else {
            self.write_to_sock(event_loop, &data, Sock::Local);
        }
    }

    fn on_remote_write(&self, event_loop: &EventLoop) {
        // Writability on the peer socket is what completes the connect.
        self.stage.set(Stage::Stream);
        let data = mem::take(&mut *self.buf_to_remote.borrow_mut());
        if data.is_empty() {
            self.update_stream(event_loop, Direction::Up, WAIT_READING);
        } else {
            self.write_to_sock(event_loop, &data, Sock::Remote);
        }
    }

    fn on_local_error(&self, event_loop: &EventLoop) {
        debug!("got local error");
        if let Some(sock) = self.local_sock.borrow().as_ref() {
            if let Ok(Some(err)) = sock.take_error() {
                error!(
                    "local socket error when handling connection from {}: {}",
                    self.client_addr, err
                );
            }
        }
        self.destroy(event_loop);
    }

    fn on_remote_error(&self, event_loop: &EventLoop) {
        debug!("got remote error");
        if let Some(sock) = self.remote_sock.borrow().as_ref() {
            if let Ok(Some(err)) = sock.take_error() {
                error!(
                    "remote socket error when handling connection from {}: {}",
                    self.client_addr, err
                );
            }
        }
        self.destroy(event_loop);
    }

    /// Dispatches one readiness event. Order matters: errors first, then
    /// reads (a HUP may still have data buffered), then writes, re-checking
    /// for destruction in between.
    pub(crate) fn handle_event(&self, event_loop: &EventLoop, fd: RawFd, ready: Ready) {
        if self.destroyed() {
            debug!("ignore handle_event: destroyed");
            return;
        }
        let local_fd = self.local_sock.borrow().as_ref().map(|s| s.as_raw_fd());
        let remote_fd = self.remote_sock.borrow().as_ref().map(|s| s.as_raw_fd());
        if Some(fd) == remote_fd {
            if ready.is_error() {
                self.on_remote_error(event_loop);
                if self.destroyed() {
                    return;
                }
            }
            if ready.is_readable() || ready.is_hup() {
                self.on_remote_read(event_loop);
                if self.destroyed() {
                    return;
                }
            }
            if ready.is_writable() {
                self.on_remote_write(event_loop);
            }
        } else if Some(fd) == local_fd {
            if ready.is_error() {
                self.on_local_error(event_loop);
                if self.destroyed() {
                    return;
                }
            }
            if ready.is_readable() || ready.is_hup() {
                self.on_local_read(event_loop);
                if self.destroyed() {
                    return;
                }
            }
            if ready.is_writable() {
                self.on_local_write(event_loop);
            }
        } else {
            warn!("unknown socket for fd {}", fd);
        }
    }

    fn log_error(&self, err: &io::Error) {
        error!(
            "{} when handling connection from {}",
            err, self.client_addr
        );
        if self.config.verbose {
            debug!(
                "stage: {:?}, upstream: {}, downstream: {}",
                self.stage.get(),
                self.upstream_status.get(),
                self.downstream_status.get()
            );
        }
    }

    /// Releases everything this handler owns.
    ///
    /// Promises: never calls itself recursively, a second call is a no-op,
    /// and it never fails. A broken promise here is a bug, most likely a
    /// leak.
    pub(crate) fn destroy(&self, event_loop: &EventLoop) {
        if self.destroyed() {
            debug!("already destroyed");
            return;
        }
        self.stage.set(Stage::Destroyed);
        match &*self.remote_addr.borrow() {
            Some((host, port)) => debug!("destroy: {}:{}", host, port),
            None => debug!("destroy"),
        }
        let relay = self.relay.upgrade();
        if let Some(sock) = self.remote_sock.borrow_mut().take() {
            debug!("destroying remote");
            let fd = sock.as_raw_fd();
            if let Err(err) = event_loop.remove(fd) {
                debug!("remove remote fd {}: {}", fd, err);
            }
            if let Some(relay) = relay.as_ref() {
                relay.forget_fd(fd);
            }
        }
        if let Some(sock) = self.local_sock.borrow_mut().take() {
            debug!("destroying local");
            let fd = sock.as_raw_fd();
            if let Err(err) = event_loop.remove(fd) {
                debug!("remove local fd {}: {}", fd, err);
            }
            if let Some(relay) = relay.as_ref() {
                relay.forget_fd(fd);
            }
        }
        self.resolver.remove_callback(self);
        if let Some(relay) = relay {
            relay.remove_handler(self);
        }
    }
}

impl DnsCallback for TcpRelayHandler {
    fn dns_resolved(&self, event_loop: &EventLoop, result: io::Result<(String, String)>) {
        if self.destroyed() {
            return;
        }
        let ip = match result {
            Ok((_, ip)) if !ip.is_empty() => ip,
            Ok(_) => {
                self.destroy(event_loop);
                return;
            }
            Err(err) => {
                self.log_error(&err);
                self.destroy(event_loop);
                return;
            }
        };
        self.stage.set(Stage::Connecting);

        let port = if self.is_local {
            self.chosen_peer.as_ref().map(|peer| peer.1)
        } else {
            self.remote_addr.borrow().as_ref().map(|addr| addr.1)
        };
        let port = match port {
            Some(port) => port,
            None => {
                self.destroy(event_loop);
                return;
            }
        };
        let relay = match self.relay.upgrade() {
            Some(relay) => relay,
            None => {
                self.destroy(event_loop);
                return;
            }
        };

        if self.is_local && relay.fast_open() {
            // Defer the connect: the first payload travels in the SYN.
            *self.fastopen_target.borrow_mut() = Some((ip, port));
            self.update_stream(event_loop, Direction::Up, WAIT_READING);
            return;
        }

        let addr = match self.create_remote_socket(&ip, port) {
            Ok(addr) => addr,
            Err(err) => {
                self.log_error(&err);
                self.destroy(event_loop);
                return;
            }
        };
        let connected = {
            let sock = self.remote_sock.borrow();
            match sock.as_ref() {
                Some(sock) => connect(sock, addr).map(|()| sock.as_raw_fd()),
                None => return,
            }
        };
        let remote_fd = match connected {
            Ok(fd) => fd,
            Err(err) => {
                self.log_error(&err);
                self.destroy(event_loop);
                return;
            }
        };
        let dispatcher = match relay.event_handler() {
            Some(dispatcher) => dispatcher,
            None => {
                self.destroy(event_loop);
                return;
            }
        };
        if let Err(err) = event_loop.add(remote_fd, Ready::ERR | Ready::OUT, dispatcher) {
            self.log_error(&err);
            self.destroy(event_loop);
            return;
        }
        self.update_stream(event_loop, Direction::Up, WAIT_READWRITING);
        self.update_stream(event_loop, Direction::Down, WAIT_READING);
    }
}

fn choose_peer(config: &RelayConfig) -> io::Result<(String, u16)> {
    let mut rng = rand::rng();
    match (
        config.peer_addrs.choose(&mut rng),
        config.peer_ports.choose(&mut rng),
    ) {
        (Some(addr), Some(port)) => {
            debug!("chosen peer: {}:{}", addr, port);
            Ok((addr.clone(), *port))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no peer configured",
        )),
    }
}
