use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use std::{cmp, io, ptr};

use crate::event::{Event, Ready};
use crate::sys::MAX_EVENTS;

// Type of the `nchanges` and `nevents` parameters in the `kevent` function.
#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

// Type of the `filter` field in the `kevent` structure.
#[cfg(any(target_os = "dragonfly", target_os = "freebsd", target_os = "openbsd"))]
type Filter = libc::c_short;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;

// Type of the `data` field in the `kevent` structure.
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos"
))]
type Data = libc::intptr_t;
#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
type Data = i64;

// Type of the `udata` field in the `kevent` structure.
#[cfg(not(target_os = "netbsd"))]
type UData = *mut libc::c_void;
#[cfg(target_os = "netbsd")]
type UData = libc::intptr_t;

macro_rules! kevent {
    ($id: expr, $filter: expr, $flags: expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags,
            fflags: 0,
            data: 0,
            udata: 0 as UData,
        }
    };
}

/// Readiness selector backed by `kqueue(2)`.
///
/// kqueue keeps one filter per direction, so a [`Ready`] mask maps to up to
/// two `kevent` changes. Filters are level-triggered (no `EV_CLEAR`).
#[derive(Debug)]
pub struct Selector {
    kq: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())
            .and_then(|kq| syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC)).map(|_| kq))?;
        // SAFETY: `kqueue(2)` ensures the fd is valid.
        Ok(Selector {
            kq: unsafe { OwnedFd::from_raw_fd(kq) },
        })
    }

    pub fn register(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        let flags = libc::EV_RECEIPT | libc::EV_ADD;
        let mut changes: Vec<libc::kevent> = Vec::with_capacity(2);
        if interest.is_readable() {
            changes.push(kevent!(fd, libc::EVFILT_READ, flags));
        }
        if interest.is_writable() {
            changes.push(kevent!(fd, libc::EVFILT_WRITE, flags));
        }

        // Older versions of macOS can return EPIPE when registering a fd
        // whose other end has already disappeared, yet still report events
        // for it, so EPIPE is ignored here.
        kevent_register(self.kq.as_raw_fd(), &mut changes, &[libc::EPIPE as Data])
    }

    pub fn reregister(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        let flags = libc::EV_RECEIPT;
        let read_flags = if interest.is_readable() {
            flags | libc::EV_ADD
        } else {
            flags | libc::EV_DELETE
        };
        let write_flags = if interest.is_writable() {
            flags | libc::EV_ADD
        } else {
            flags | libc::EV_DELETE
        };

        let mut changes: [libc::kevent; 2] = [
            kevent!(fd, libc::EVFILT_READ, read_flags),
            kevent!(fd, libc::EVFILT_WRITE, write_flags),
        ];

        // There is no way to ask with which interests the fd was registered,
        // so both filters are modified: added when required, deleted
        // otherwise. ENOENT informs us that a filter we tried to delete
        // wasn't there in the first place, which is the state we wanted.
        kevent_register(
            self.kq.as_raw_fd(),
            &mut changes,
            &[libc::ENOENT as Data, libc::EPIPE as Data],
        )
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let flags = libc::EV_RECEIPT | libc::EV_DELETE;
        let mut changes: [libc::kevent; 2] = [
            kevent!(fd, libc::EVFILT_READ, flags),
            kevent!(fd, libc::EVFILT_WRITE, flags),
        ];
        kevent_register(self.kq.as_raw_fd(), &mut changes, &[libc::ENOENT as Data])
    }

    pub fn select(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout.map(|to| libc::timespec {
            tv_sec: cmp::min(to.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
        });
        let timeout = timeout
            .as_ref()
            .map(|s| s as *const _)
            .unwrap_or(ptr::null());

        let mut raw: [libc::kevent; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let n = syscall!(kevent(
            self.kq.as_raw_fd(),
            ptr::null(),
            0,
            raw.as_mut_ptr(),
            MAX_EVENTS as Count,
            timeout,
        ))?;

        // kqueue reports one event per (fd, filter) pair; merge them back
        // into a single mask per fd so the dispatch order the loop sees is
        // independent of the backend.
        events.clear();
        for ev in raw.iter().take(n as usize) {
            let fd = ev.ident as RawFd;
            let mut ready = Ready::NONE;
            if ev.filter == libc::EVFILT_READ as Filter {
                ready |= Ready::IN;
            } else if ev.filter == libc::EVFILT_WRITE as Filter {
                ready |= Ready::OUT;
            }
            if ev.flags & libc::EV_ERROR != 0 {
                ready |= Ready::ERR;
            }
            if ev.flags & libc::EV_EOF != 0 {
                ready |= Ready::HUP;
                // When the read end is closed with an error pending, kqueue
                // sets EV_EOF and puts the errno in `fflags`.
                if ev.fflags != 0 {
                    ready |= Ready::ERR;
                }
            }
            match events.iter_mut().find(|e| e.fd == fd) {
                Some(e) => e.ready |= ready,
                None => events.push(Event { fd, ready }),
            }
        }
        Ok(())
    }
}

/// Register `changes` with `kq`ueue, using `EV_RECEIPT` to collect per-change
/// results, ignoring the errors in `ignored_errors`.
fn kevent_register(
    kq: RawFd,
    changes: &mut [libc::kevent],
    ignored_errors: &[Data],
) -> io::Result<()> {
    syscall!(kevent(
        kq,
        changes.as_ptr(),
        changes.len() as Count,
        changes.as_mut_ptr(),
        changes.len() as Count,
        ptr::null(),
    ))
    .map(|_| ())
    .or_else(|err| {
        // According to the manual page of FreeBSD: "When kevent() call fails
        // with EINTR error, all changes in the changelist have been applied",
        // so we can safely ignore it.
        if err.raw_os_error() == Some(libc::EINTR) {
            Ok(())
        } else {
            Err(err)
        }
    })
    .and_then(|()| check_errors(changes, ignored_errors))
}

/// Check all events for possible errors, it returns the first error found.
fn check_errors(events: &[libc::kevent], ignored_errors: &[Data]) -> io::Result<()> {
    for event in events {
        // We can't use references to packed structures (in checking the ignored
        // errors), so we need copy the data out before use.
        let data = event.data as Data;
        // Check for the error flag, the actual error will be in the `data`
        // field.
        if (event.flags & libc::EV_ERROR != 0) && data != 0 && !ignored_errors.contains(&data) {
            return Err(io::Error::from_raw_os_error(data as i32));
        }
    }
    Ok(())
}
