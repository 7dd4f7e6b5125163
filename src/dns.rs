//! Asynchronous DNS resolution on the event loop.
//!
//! The relay consumes the [`DnsCallback`] contract: `resolve` invokes the
//! callback exactly once on the loop thread, possibly before `resolve`
//! returns (numeric addresses, `/etc/hosts` entries and cache hits resolve
//! synchronously-in-effect). Everything else goes out as an A query on a
//! non-blocking UDP socket registered with the loop.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::event::Ready;
use crate::event_loop::{EventHandler, EventLoop, PeriodicCallback};

const QTYPE_A: u16 = 1;
const QCLASS_IN: u16 = 1;

/// How long a positive answer stays in the cache.
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Receiver of one resolution outcome.
///
/// Invoked exactly once per [`DnsResolver::resolve`] call, on the loop
/// thread, with `Ok((hostname, ip))` or the failure. Re-entrant invocation
/// from inside `resolve` itself must be tolerated by implementors.
pub trait DnsCallback {
    fn dns_resolved(&self, event_loop: &EventLoop, result: io::Result<(String, String)>);
}

struct PendingQuery {
    id: u16,
    callbacks: Vec<Rc<dyn DnsCallback>>,
}

/// Non-blocking resolver registered on the event loop.
pub struct DnsResolver {
    sock: RefCell<UdpSocket>,
    servers: Vec<SocketAddr>,
    hosts: HashMap<String, String>,
    cache: RefCell<HashMap<String, (String, Instant)>>,
    waiting: RefCell<HashMap<String, PendingQuery>>,
    self_weak: RefCell<Weak<DnsResolver>>,
}

impl DnsResolver {
    /// Creates a resolver using the system's `/etc/resolv.conf` nameservers
    /// (with a public-resolver fallback) and `/etc/hosts` entries.
    pub fn new() -> io::Result<DnsResolver> {
        let sock = UdpSocket::bind(("0.0.0.0", 0))?;
        sock.set_nonblocking(true)?;
        Ok(DnsResolver {
            sock: RefCell::new(sock),
            servers: parse_resolv_conf(),
            hosts: parse_hosts(),
            cache: RefCell::new(HashMap::new()),
            waiting: RefCell::new(HashMap::new()),
            self_weak: RefCell::new(Weak::new()),
        })
    }

    /// Registers the resolver's socket and cache sweeper. Must be called
    /// before the first non-numeric `resolve`.
    pub fn add_to_loop(self: &Rc<Self>, event_loop: &EventLoop) -> io::Result<()> {
        *self.self_weak.borrow_mut() = Rc::downgrade(self);
        let fd = self.sock.borrow().as_raw_fd();
        event_loop.add(fd, Ready::IN | Ready::ERR, Rc::clone(self) as Rc<dyn EventHandler>)?;
        event_loop.add_periodic(Rc::clone(self) as Rc<dyn PeriodicCallback>);
        Ok(())
    }

    /// Resolves `hostname`, invoking `callback` exactly once on the loop
    /// thread. Numeric addresses, hosts-file entries and cached answers
    /// call back before `resolve` returns.
    pub fn resolve(&self, event_loop: &EventLoop, hostname: &str, callback: Rc<dyn DnsCallback>) {
        if hostname.is_empty() {
            callback.dns_resolved(
                event_loop,
                Err(io::Error::new(io::ErrorKind::InvalidInput, "empty hostname")),
            );
            return;
        }
        if hostname.parse::<IpAddr>().is_ok() {
            callback.dns_resolved(
                event_loop,
                Ok((hostname.to_owned(), hostname.to_owned())),
            );
            return;
        }
        if let Some(ip) = self.hosts.get(hostname) {
            callback.dns_resolved(event_loop, Ok((hostname.to_owned(), ip.clone())));
            return;
        }
        let cached = self.cache.borrow().get(hostname).map(|(ip, _)| ip.clone());
        if let Some(ip) = cached {
            debug!("hit dns cache: {} {}", hostname, ip);
            callback.dns_resolved(event_loop, Ok((hostname.to_owned(), ip)));
            return;
        }
        if !is_valid_hostname(hostname) {
            callback.dns_resolved(
                event_loop,
                Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid hostname: {}", hostname),
                )),
            );
            return;
        }

        let mut waiting = self.waiting.borrow_mut();
        match waiting.get_mut(hostname) {
            Some(pending) => pending.callbacks.push(callback),
            None => {
                let id: u16 = rand::random();
                waiting.insert(
                    hostname.to_owned(),
                    PendingQuery {
                        id,
                        callbacks: vec![callback],
                    },
                );
                drop(waiting);
                self.send_request(id, hostname);
            }
        }
    }

    /// Prevents a pending callback from firing. Callbacks are compared by
    /// object identity.
    pub fn remove_callback(&self, callback: &dyn DnsCallback) {
        let mut waiting = self.waiting.borrow_mut();
        for pending in waiting.values_mut() {
            pending
                .callbacks
                .retain(|cb| !std::ptr::eq(Rc::as_ptr(cb) as *const (), callback as *const _ as *const ()));
        }
        waiting.retain(|_, pending| !pending.callbacks.is_empty());
    }

    fn send_request(&self, id: u16, hostname: &str) {
        debug!("resolving {}", hostname);
        let packet = build_request(id, hostname);
        let sock = self.sock.borrow();
        for server in &self.servers {
            if let Err(err) = sock.send_to(&packet, server) {
                if err.kind() != io::ErrorKind::WouldBlock {
                    warn!("dns send to {}: {}", server, err);
                }
            }
        }
    }

    fn handle_response(&self, event_loop: &EventLoop, packet: &[u8]) {
        let response = match parse_response(packet) {
            Some(response) => response,
            None => {
                warn!("invalid dns response");
                return;
            }
        };

        let pending = {
            let mut waiting = self.waiting.borrow_mut();
            let id_matches = waiting
                .get(&response.hostname)
                .map_or(false, |pending| pending.id == response.id);
            if !id_matches {
                return;
            }
            waiting.remove(&response.hostname)
        };
        let pending = match pending {
            Some(pending) => pending,
            None => return,
        };

        match response.ip {
            Some(ip) => {
                self.cache
                    .borrow_mut()
                    .insert(response.hostname.clone(), (ip.clone(), Instant::now()));
                for callback in pending.callbacks {
                    callback.dns_resolved(
                        event_loop,
                        Ok((response.hostname.clone(), ip.clone())),
                    );
                }
            }
            None => {
                for callback in pending.callbacks {
                    callback.dns_resolved(
                        event_loop,
                        Err(io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("unknown hostname {}", response.hostname),
                        )),
                    );
                }
            }
        }
    }

    // The socket raised an error; replace it and move the registration
    // over, keeping pending queries (they will be answered on the new
    // socket or age out with their handlers).
    fn renew_socket(&self, event_loop: &EventLoop) -> io::Result<()> {
        let this = match self.self_weak.borrow().upgrade() {
            Some(this) => this,
            None => return Ok(()),
        };
        let old_fd = self.sock.borrow().as_raw_fd();
        let _ = event_loop.remove(old_fd);

        let sock = UdpSocket::bind(("0.0.0.0", 0))?;
        sock.set_nonblocking(true)?;
        let fd = sock.as_raw_fd();
        *self.sock.borrow_mut() = sock;
        event_loop.add(fd, Ready::IN | Ready::ERR, this as Rc<dyn EventHandler>)
    }
}

impl EventHandler for DnsResolver {
    fn handle_event(&self, event_loop: &EventLoop, _fd: RawFd, ready: Ready) -> io::Result<()> {
        if ready.is_error() {
            error!("dns socket error, renewing");
            return self.renew_socket(event_loop);
        }
        let mut buf = [0u8; 1024];
        loop {
            let received = {
                let sock = self.sock.borrow();
                sock.recv_from(&mut buf)
            };
            match received {
                Ok((n, from)) => {
                    if !self.servers.iter().any(|server| *server == from) {
                        warn!("received dns response from unknown server {}", from);
                        continue;
                    }
                    self.handle_response(event_loop, &buf[..n]);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!("dns recv: {}", err);
                    break;
                }
            }
        }
        Ok(())
    }
}

impl PeriodicCallback for DnsResolver {
    fn periodic(&self, _event_loop: &EventLoop) {
        let now = Instant::now();
        self.cache
            .borrow_mut()
            .retain(|_, (_, born)| now.duration_since(*born) < CACHE_TTL);
    }
}

fn parse_resolv_conf() -> Vec<SocketAddr> {
    let mut servers = Vec::new();
    if let Ok(content) = std::fs::read_to_string("/etc/resolv.conf") {
        for line in content.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("nameserver") {
                if let Ok(ip) = rest.trim().parse::<IpAddr>() {
                    servers.push(SocketAddr::new(ip, 53));
                }
            }
        }
    }
    if servers.is_empty() {
        servers.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53));
        servers.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)), 53));
    }
    servers
}

fn parse_hosts() -> HashMap<String, String> {
    let mut hosts = HashMap::new();
    hosts.insert("localhost".to_owned(), "127.0.0.1".to_owned());
    if let Ok(content) = std::fs::read_to_string("/etc/hosts") {
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("");
            let mut parts = line.split_whitespace();
            let ip = match parts.next() {
                Some(ip) if ip.parse::<IpAddr>().is_ok() => ip,
                _ => continue,
            };
            for name in parts {
                hosts.insert(name.to_owned(), ip.to_owned());
            }
        }
    }
    hosts
}

fn is_valid_hostname(hostname: &str) -> bool {
    if hostname.is_empty() || hostname.len() > 255 {
        return false;
    }
    hostname.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

fn build_request(id: u16, hostname: &str) -> Vec<u8> {
    let mut packet = Vec::with_capacity(hostname.len() + 18);
    packet.extend_from_slice(&id.to_be_bytes());
    // Flags: standard query, recursion desired.
    packet.extend_from_slice(&[0x01, 0x00]);
    // QDCOUNT 1, ANCOUNT/NSCOUNT/ARCOUNT 0.
    packet.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
    for label in hostname.trim_end_matches('.').split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&QTYPE_A.to_be_bytes());
    packet.extend_from_slice(&QCLASS_IN.to_be_bytes());
    packet
}

struct Response {
    id: u16,
    hostname: String,
    ip: Option<String>,
}

fn read_u16(packet: &[u8], offset: usize) -> Option<u16> {
    Some(u16::from_be_bytes([
        *packet.get(offset)?,
        *packet.get(offset + 1)?,
    ]))
}

/// Decodes a possibly compressed name, returning it and the offset just
/// past its in-place encoding.
fn parse_name(packet: &[u8], mut offset: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    let mut jumped = false;
    let mut end = offset;
    let mut jumps = 0;
    loop {
        let len = *packet.get(offset)? as usize;
        if len == 0 {
            if !jumped {
                end = offset + 1;
            }
            return Some((name, end));
        }
        if len & 0xc0 == 0xc0 {
            // Compression pointer; bounded to avoid loops.
            jumps += 1;
            if jumps > 16 {
                return None;
            }
            let pointer = (read_u16(packet, offset)? & 0x3fff) as usize;
            if !jumped {
                end = offset + 2;
                jumped = true;
            }
            offset = pointer;
            continue;
        }
        let label = packet.get(offset + 1..offset + 1 + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(std::str::from_utf8(label).ok()?);
        offset += 1 + len;
    }
}

fn parse_response(packet: &[u8]) -> Option<Response> {
    let id = read_u16(packet, 0)?;
    let flags = read_u16(packet, 2)?;
    // Must be a response.
    if flags & 0x8000 == 0 {
        return None;
    }
    let qdcount = read_u16(packet, 4)?;
    let ancount = read_u16(packet, 6)?;

    let mut offset = 12;
    let mut hostname = None;
    for _ in 0..qdcount {
        let (name, next) = parse_name(packet, offset)?;
        hostname.get_or_insert(name);
        offset = next + 4;
    }
    let hostname = hostname?;

    let mut ip = None;
    for _ in 0..ancount {
        let (_, next) = parse_name(packet, offset)?;
        let rtype = read_u16(packet, next)?;
        let rclass = read_u16(packet, next + 2)?;
        let rdlength = read_u16(packet, next + 8)? as usize;
        let rdata = packet.get(next + 10..next + 10 + rdlength)?;
        if rtype == QTYPE_A && rclass == QCLASS_IN && rdlength == 4 {
            let octets: [u8; 4] = rdata.try_into().ok()?;
            ip.get_or_insert_with(|| Ipv4Addr::from(octets).to_string());
        }
        offset = next + 10 + rdlength;
    }

    Some(Response { id, hostname, ip })
}
