// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::{mpsc, Once};
use std::thread;
use std::time::Duration;

use cloak::{DnsResolver, EventLoop, Method, Mode, RelayConfig, TcpRelay};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

pub fn server_config(password: &str, method: Method) -> RelayConfig {
    let mut config = RelayConfig::new(Mode::Server, "127.0.0.1", 0, password);
    config.method = method;
    config
}

pub fn client_config(password: &str, method: Method, peer: SocketAddr) -> RelayConfig {
    let mut config = RelayConfig::new(Mode::Client, "127.0.0.1", 0, password);
    config.method = method;
    config.peer_addrs = vec![peer.ip().to_string()];
    config.peer_ports = vec![peer.port()];
    config
}

/// Spawns a relay with its own event loop and resolver on a fresh thread,
/// returning the address it listens on. The thread runs until the test
/// binary exits.
pub fn start_relay(config: RelayConfig) -> SocketAddr {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let event_loop = EventLoop::new().expect("unable to create event loop");
        let resolver = Rc::new(DnsResolver::new().expect("unable to create resolver"));
        resolver
            .add_to_loop(&event_loop)
            .expect("unable to register resolver");
        let relay = TcpRelay::new(config, resolver, None).expect("unable to create relay");
        relay
            .add_to_loop(&event_loop)
            .expect("unable to register relay");
        tx.send(relay.local_addr()).expect("test went away");
        event_loop.run().expect("event loop failed");
    });
    rx.recv().expect("relay thread failed to start")
}

/// A client-relay → server-relay chain sharing one password and method.
/// Returns the client relay's address.
pub fn start_chain(password: &str, method: Method) -> SocketAddr {
    let server_addr = start_relay(server_config(password, method));
    start_relay(client_config(password, method, server_addr))
}

/// Plain TCP echo server, one thread per connection.
pub fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("unable to bind echo server");
    let addr = listener.local_addr().expect("no local address");
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => continue,
            };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Runs the SOCKS5 no-auth handshake plus an IPv4 CONNECT to `target`
/// against the relay at `relay`, asserting the canonical replies.
pub fn socks_connect(relay: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(relay).expect("unable to connect to relay");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("unable to set read timeout");

    stream.write_all(b"\x05\x01\x00").expect("greeting failed");
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).expect("no greeting reply");
    assert_eq!(reply, [5, 0]);

    let mut request = vec![5, 1, 0];
    match target {
        SocketAddr::V4(addr) => {
            request.push(1);
            request.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            request.push(4);
            request.extend_from_slice(&addr.ip().octets());
        }
    }
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).expect("request failed");

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).expect("no connect reply");
    assert_eq!(&reply, b"\x05\x00\x00\x01\x00\x00\x00\x00\x10\x10");
    stream
}
