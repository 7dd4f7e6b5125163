use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, error, trace};

use crate::event::{Event, Ready};
use crate::sys;

/// Periodic callbacks run at least every `TIMEOUT_PRECISION` seconds while
/// the loop runs, and immediately after an interrupted poll.
pub const TIMEOUT_PRECISION: u64 = 10;

/// Receiver of readiness events dispatched by [`EventLoop::run`].
///
/// One object may be registered for many file descriptors; the dispatched
/// `fd` tells it which one fired. Errors returned here are logged by the
/// loop and swallowed; a handler is responsible for its own teardown.
pub trait EventHandler {
    fn handle_event(&self, event_loop: &EventLoop, fd: RawFd, ready: Ready) -> io::Result<()>;
}

/// Callback invoked on the loop's periodic tick.
pub trait PeriodicCallback {
    fn periodic(&self, event_loop: &EventLoop);
}

/// A single-threaded readiness event loop.
///
/// File descriptors are registered with an interest mask and a handler
/// object; [`run`] blocks in the OS selector and dispatches level-triggered
/// readiness to the handlers. All registered handlers live on the loop's
/// thread; the loop itself is `!Send` by construction.
///
/// [`run`]: EventLoop::run
pub struct EventLoop {
    selector: sys::Selector,
    handlers: RefCell<HashMap<RawFd, Rc<dyn EventHandler>>>,
    periodic: RefCell<Vec<Rc<dyn PeriodicCallback>>>,
    stopping: Cell<bool>,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        let selector = sys::Selector::new()?;
        debug!("using event model: {}", MODEL);
        Ok(EventLoop {
            selector,
            handlers: RefCell::new(HashMap::new()),
            periodic: RefCell::new(Vec::new()),
            stopping: Cell::new(false),
        })
    }

    /// Registers `fd` for the readiness kinds in `mode`, dispatching to
    /// `handler`. Error and hang-up readiness are always reported.
    pub fn add(&self, fd: RawFd, mode: Ready, handler: Rc<dyn EventHandler>) -> io::Result<()> {
        trace!("registering fd {} for {:?}", fd, mode);
        self.selector.register(fd, mode)?;
        self.handlers.borrow_mut().insert(fd, handler);
        Ok(())
    }

    /// Changes the interest mask of an already registered `fd`.
    pub fn modify(&self, fd: RawFd, mode: Ready) -> io::Result<()> {
        trace!("modifying fd {} to {:?}", fd, mode);
        self.selector.reregister(fd, mode)
    }

    /// Deregisters `fd` and forgets its handler.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        trace!("deregistering fd {}", fd);
        self.handlers.borrow_mut().remove(&fd);
        self.selector.deregister(fd)
    }

    pub fn add_periodic(&self, callback: Rc<dyn PeriodicCallback>) {
        self.periodic.borrow_mut().push(callback);
    }

    /// Removes a periodic callback by object identity.
    pub fn remove_periodic(&self, callback: &Rc<dyn PeriodicCallback>) {
        self.periodic
            .borrow_mut()
            .retain(|cb| !Rc::ptr_eq(cb, callback));
    }

    /// Makes [`run`] return after the current iteration.
    ///
    /// [`run`]: EventLoop::run
    pub fn stop(&self) {
        self.stopping.set(true);
    }

    /// Runs the loop until [`stop`] is called.
    ///
    /// Each iteration polls the selector with a `TIMEOUT_PRECISION` timeout,
    /// dispatches every ready event to its handler, then invokes the
    /// periodic callbacks if at least `TIMEOUT_PRECISION` elapsed since the
    /// last tick or the poll was interrupted.
    ///
    /// [`stop`]: EventLoop::stop
    pub fn run(&self) -> io::Result<()> {
        let mut events: Vec<Event> = Vec::with_capacity(sys::MAX_EVENTS);
        let precision = Duration::from_secs(TIMEOUT_PRECISION);
        let mut last_tick = Instant::now();

        while !self.stopping.get() {
            let mut asap = false;
            if let Err(err) = self.selector.select(&mut events, Some(precision)) {
                events.clear();
                if err.kind() == io::ErrorKind::Interrupted
                    || err.raw_os_error() == Some(libc::EPIPE)
                {
                    // EPIPE: happens when the client closes the connection.
                    // EINTR: happens on signal delivery.
                    // Handle pending timeouts as soon as possible.
                    debug!("poll: {}", err);
                    asap = true;
                } else {
                    error!("poll: {}", err);
                    continue;
                }
            }

            for event in &events {
                // Look the handler up per event: an earlier dispatch in this
                // batch may have deregistered the fd.
                let handler = self.handlers.borrow().get(&event.fd).cloned();
                if let Some(handler) = handler {
                    if let Err(err) = handler.handle_event(self, event.fd, event.ready) {
                        error!("handle_event for fd {}: {}", event.fd, err);
                    }
                }
            }

            if asap || last_tick.elapsed() >= precision {
                let callbacks: Vec<_> = self.periodic.borrow().clone();
                for callback in callbacks {
                    callback.periodic(self);
                }
                last_tick = Instant::now();
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("selector", &self.selector)
            .field("handlers", &self.handlers.borrow().len())
            .field("stopping", &self.stopping.get())
            .finish()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const MODEL: &str = "epoll";
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
const MODEL: &str = "kqueue";
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
const MODEL: &str = "select";
