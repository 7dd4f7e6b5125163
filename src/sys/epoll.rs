use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT};

use crate::event::{Event, Ready};
use crate::sys::MAX_EVENTS;

/// Readiness selector backed by `epoll(7)`.
///
/// Registrations are level-triggered: a readable fd keeps producing
/// [`Ready::IN`] events until either the data is drained or the interest is
/// dropped with `reregister`/`deregister`.
#[derive(Debug)]
pub struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub fn register(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: fd as u64,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub fn reregister(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: fd as u64,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            ptr::null_mut(),
        ))
        .map(|_| ())
    }

    pub fn select(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout
            .map(|to| {
                // `Duration::as_millis` truncates, so round up. This avoids
                // turning sub-millisecond timeouts into a zero timeout,
                // unless the caller explicitly requests that by specifying a
                // zero timeout.
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        let mut raw: [libc::epoll_event; MAX_EVENTS] =
            unsafe { std::mem::zeroed() };
        let n = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            raw.as_mut_ptr(),
            MAX_EVENTS as libc::c_int,
            timeout,
        ))?;

        events.clear();
        for ev in raw.iter().take(n as usize) {
            events.push(Event {
                fd: ev.u64 as RawFd,
                ready: epoll_to_ready(ev.events),
            });
        }
        Ok(())
    }
}

fn interest_to_epoll(interest: Ready) -> u32 {
    // ERR and HUP are implicit for epoll; registering them is a no-op but
    // keeps the mask faithful to what the caller asked for.
    let mut kind = 0;
    if interest.is_readable() {
        kind |= EPOLLIN;
    }
    if interest.is_writable() {
        kind |= EPOLLOUT;
    }
    kind as u32
}

fn epoll_to_ready(events: u32) -> Ready {
    let events = events as libc::c_int;
    let mut ready = Ready::NONE;
    if events & EPOLLIN != 0 {
        ready |= Ready::IN;
    }
    if events & EPOLLOUT != 0 {
        ready |= Ready::OUT;
    }
    if events & EPOLLERR != 0 {
        ready |= Ready::ERR;
    }
    if events & EPOLLHUP != 0 {
        ready |= Ready::HUP;
    }
    ready
}
