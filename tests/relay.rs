mod util;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use cloak::Method;

#[test]
fn greeting_only() {
    util::init();
    let relay = util::start_relay(util::client_config(
        "pw",
        Method::Rc4Md5,
        "127.0.0.1:1".parse().unwrap(),
    ));

    let mut stream = TcpStream::connect(relay).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream.write_all(b"\x05\x01\x00").unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [5, 0]);
}

#[test]
fn bad_greeting_closes_connection() {
    util::init();
    let relay = util::start_relay(util::client_config(
        "pw",
        Method::Rc4Md5,
        "127.0.0.1:1".parse().unwrap(),
    ));

    let mut stream = TcpStream::connect(relay).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream.write_all(b"\x04\x01\x00").unwrap();
    let n = stream.read(&mut [0u8; 16]).unwrap();
    assert_eq!(n, 0);
}

#[test]
fn unknown_command_closes_connection() {
    util::init();
    let relay = util::start_relay(util::client_config(
        "pw",
        Method::Rc4Md5,
        "127.0.0.1:1".parse().unwrap(),
    ));

    let mut stream = TcpStream::connect(relay).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream.write_all(b"\x05\x01\x00").unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [5, 0]);

    // BIND is not supported.
    stream
        .write_all(b"\x05\x02\x00\x01\x7f\x00\x00\x01\x00\x50")
        .unwrap();
    let n = stream.read(&mut [0u8; 16]).unwrap();
    assert_eq!(n, 0);
}

#[test]
fn ipv4_connect_round_trip() {
    util::init();
    let origin = util::start_echo_server();
    let relay = util::start_chain("the password", Method::Rc4Md5);

    let mut stream = util::socks_connect(relay, origin);
    stream.write_all(b"hello relay").unwrap();
    let mut buf = [0u8; 11];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello relay");

    // Later records must use the running cipher state, not a fresh one.
    stream.write_all(b"second record").unwrap();
    let mut buf = [0u8; 13];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"second record");
}

#[test]
fn table_method_round_trip() {
    util::init();
    let origin = util::start_echo_server();
    let relay = util::start_chain("another password", Method::Table);

    let mut stream = util::socks_connect(relay, origin);
    stream.write_all(b"substitute me").unwrap();
    let mut buf = [0u8; 13];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"substitute me");
}

#[test]
fn large_transfer_is_ordered_and_complete() {
    util::init();
    let origin = util::start_echo_server();
    let relay = util::start_chain("pw", Method::Rc4Md5);

    let mut stream = util::socks_connect(relay, origin);
    stream
        .set_read_timeout(Some(Duration::from_secs(60)))
        .unwrap();

    // Large enough to fill socket buffers and force short writes along the
    // whole chain.
    let data: Vec<u8> = (0..1_000_000usize).map(|i| (i % 251) as u8).collect();
    let mut writer = stream.try_clone().unwrap();
    let payload = data.clone();
    let sender = thread::spawn(move || {
        writer.write_all(&payload).unwrap();
    });

    let mut received = vec![0u8; data.len()];
    stream.read_exact(&mut received).unwrap();
    sender.join().unwrap();
    assert!(received == data);
}

#[test]
fn domain_connect_round_trip() {
    util::init();
    let origin = util::start_echo_server();
    let relay = util::start_chain("pw", Method::Rc4Md5);

    let mut stream = TcpStream::connect(relay).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream.write_all(b"\x05\x01\x00").unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [5, 0]);

    let name = b"localhost";
    let mut request = vec![5, 1, 0, 3, name.len() as u8];
    request.extend_from_slice(name);
    request.extend_from_slice(&origin.port().to_be_bytes());
    stream.write_all(&request).unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"\x05\x00\x00\x01\x00\x00\x00\x00\x10\x10");

    stream.write_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
}

#[test]
fn forbidden_ip_rejected_listener_survives() {
    util::init();
    let origin = util::start_echo_server();
    let mut config = util::server_config("pw", Method::Plain);
    config.forbidden_ips.insert("127.0.0.1".to_owned());
    let relay = util::start_relay(config);

    // Server mode with the plain method takes the bare destination header.
    let mut header = vec![1u8, 127, 0, 0, 1];
    header.extend_from_slice(&origin.port().to_be_bytes());

    let mut stream = TcpStream::connect(relay).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream.write_all(&header).unwrap();
    let n = stream.read(&mut [0u8; 16]).unwrap();
    assert_eq!(n, 0);

    // The rejection tore down one handler, not the relay.
    let mut second = TcpStream::connect(relay).unwrap();
    second
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    second.write_all(&header).unwrap();
    let n = second.read(&mut [0u8; 16]).unwrap();
    assert_eq!(n, 0);
}

#[test]
fn idle_connection_times_out() {
    util::init();
    let mut config = util::server_config("pw", Method::Plain);
    config.timeout = 1;
    let relay = util::start_relay(config);

    let mut stream = TcpStream::connect(relay).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();
    let start = Instant::now();
    let n = stream.read(&mut [0u8; 1]).unwrap();
    let elapsed = start.elapsed();
    assert_eq!(n, 0);
    assert!(elapsed >= Duration::from_secs(1), "swept early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(25), "swept late: {:?}", elapsed);
}

#[test]
fn udp_associate_holds_tcp_session() {
    util::init();
    let relay = util::start_relay(util::client_config(
        "pw",
        Method::Rc4Md5,
        "127.0.0.1:1".parse().unwrap(),
    ));

    let mut stream = TcpStream::connect(relay).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream.write_all(b"\x05\x01\x00").unwrap();
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [5, 0]);

    stream
        .write_all(b"\x05\x03\x00\x01\x00\x00\x00\x00\x00\x00")
        .unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply[..4], &[5, 0, 0, 1]);
    assert_eq!(&reply[4..8], &[127, 0, 0, 1]);
    assert_eq!(u16::from_be_bytes([reply[8], reply[9]]), relay.port());

    // The TCP side stays open, passively.
    stream
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    match stream.read(&mut [0u8; 1]) {
        Ok(0) => panic!("session closed"),
        Ok(_) => panic!("unexpected data"),
        Err(err) => assert!(matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        )),
    }
}
