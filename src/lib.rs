//! Lightweight encrypted SOCKS5/TCP relay built on non-blocking I/O.
//!
//! A relay terminates a SOCKS5 session on one side, tunnels an encrypted
//! stream to a peer relay (or, acting as server, straight to the origin)
//! and pipes plaintext between the two. Everything runs on a
//! single-threaded, readiness-driven [`EventLoop`] backed by epoll, kqueue
//! or `select(2)`; sockets are non-blocking throughout and DNS resolution
//! is asynchronous on the same loop.
//!
//! # Examples
//!
//! A client-side relay forwarding through a peer at `198.51.100.7:8388`:
//!
//! ```no_run
//! # use std::error::Error;
//! # use std::rc::Rc;
//! # fn main() -> Result<(), Box<dyn Error>> {
//! use cloak::{DnsResolver, EventLoop, Mode, RelayConfig, TcpRelay};
//!
//! let mut config = RelayConfig::new(Mode::Client, "127.0.0.1", 1080, "barfoo!");
//! config.peer_addrs = vec!["198.51.100.7".to_owned()];
//! config.peer_ports = vec![8388];
//!
//! let event_loop = EventLoop::new()?;
//! let resolver = Rc::new(DnsResolver::new()?);
//! resolver.add_to_loop(&event_loop)?;
//!
//! let relay = TcpRelay::new(config, resolver, None)?;
//! relay.add_to_loop(&event_loop)?;
//! event_loop.run()?;
//! #     Ok(())
//! # }
//! ```
//!
//! The matching server side runs the same way with [`Mode::Server`] and no
//! peers. Several relays may share one loop; one process may run several
//! loops on separate threads, each owning its relays outright.

#![cfg(unix)]

mod config;
mod crypto;
mod dns;
mod event;
mod event_loop;
mod net;
mod relay;
mod sys;

pub mod socks;

pub use config::{Mode, RelayConfig};
pub use crypto::{Encryptor, Method};
pub use dns::{DnsCallback, DnsResolver};
pub use event::{Event, Ready};
pub use event_loop::{EventHandler, EventLoop, PeriodicCallback, TIMEOUT_PRECISION};
pub use relay::{StatCallback, TcpRelay};
