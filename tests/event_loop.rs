mod util;

use std::cell::Cell;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use cloak::{EventHandler, EventLoop, Ready};

struct NoteReadable {
    seen: Cell<bool>,
}

impl EventHandler for NoteReadable {
    fn handle_event(&self, event_loop: &EventLoop, _fd: RawFd, ready: Ready) -> io::Result<()> {
        if ready.is_readable() {
            self.seen.set(true);
            event_loop.stop();
        }
        Ok(())
    }
}

#[test]
fn dispatches_readiness_to_the_registered_handler() {
    util::init();
    let event_loop = EventLoop::new().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let handler = Rc::new(NoteReadable {
        seen: Cell::new(false),
    });
    event_loop
        .add(
            listener.as_raw_fd(),
            Ready::IN | Ready::ERR,
            Rc::clone(&handler) as Rc<dyn EventHandler>,
        )
        .unwrap();

    // A pending connection makes the listener readable; level-triggered
    // reporting keeps it readable until accepted.
    let _stream = TcpStream::connect(addr).unwrap();
    event_loop.run().unwrap();
    assert!(handler.seen.get());
}

struct Phases {
    was_writable: Cell<bool>,
    was_readable: Cell<bool>,
}

impl EventHandler for Phases {
    fn handle_event(&self, event_loop: &EventLoop, fd: RawFd, ready: Ready) -> io::Result<()> {
        if ready.is_readable() {
            self.was_readable.set(true);
            event_loop.stop();
        } else if ready.is_writable() && !self.was_writable.get() {
            self.was_writable.set(true);
            // Drop the write interest; pending inbound data must surface
            // on the next poll.
            event_loop.modify(fd, Ready::IN | Ready::ERR)?;
        }
        Ok(())
    }
}

#[test]
fn modify_rearms_the_interest_mask() {
    util::init();
    let event_loop = EventLoop::new().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_nonblocking(true).unwrap();
    let (mut accepted, _) = listener.accept().unwrap();

    use std::io::Write;
    accepted.write_all(b"x").unwrap();

    let handler = Rc::new(Phases {
        was_writable: Cell::new(false),
        was_readable: Cell::new(false),
    });
    event_loop
        .add(
            stream.as_raw_fd(),
            Ready::OUT | Ready::ERR,
            Rc::clone(&handler) as Rc<dyn EventHandler>,
        )
        .unwrap();

    event_loop.run().unwrap();
    assert!(handler.was_writable.get());
    assert!(handler.was_readable.get());
}

#[test]
fn remove_forgets_the_handler() {
    util::init();
    let event_loop = EventLoop::new().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();

    let handler = Rc::new(NoteReadable {
        seen: Cell::new(false),
    });
    event_loop
        .add(
            listener.as_raw_fd(),
            Ready::IN | Ready::ERR,
            Rc::clone(&handler) as Rc<dyn EventHandler>,
        )
        .unwrap();
    event_loop.remove(listener.as_raw_fd()).unwrap();

    // Re-registering after a remove must succeed.
    event_loop
        .add(
            listener.as_raw_fd(),
            Ready::IN | Ready::ERR,
            Rc::clone(&handler) as Rc<dyn EventHandler>,
        )
        .unwrap();
}
