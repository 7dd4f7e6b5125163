use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use crate::event::{Event, Ready};

/// Readiness selector backed by `select(2)`, for platforms with neither
/// epoll nor kqueue.
///
/// Interest masks live in user space; every `select` call rebuilds the
/// read/write/error fd sets from the registration table. Capacity is
/// bounded by `FD_SETSIZE`.
#[derive(Debug)]
pub struct Selector {
    fds: RefCell<HashMap<RawFd, Ready>>,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        Ok(Selector {
            fds: RefCell::new(HashMap::new()),
        })
    }

    pub fn register(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        if fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "fd too large for select(2)",
            ));
        }
        self.fds.borrow_mut().insert(fd, interest);
        Ok(())
    }

    pub fn reregister(&self, fd: RawFd, interest: Ready) -> io::Result<()> {
        match self.fds.borrow_mut().get_mut(&fd) {
            Some(mode) => {
                *mode = interest;
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "fd not registered")),
        }
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        match self.fds.borrow_mut().remove(&fd) {
            Some(_) => Ok(()),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "fd not registered")),
        }
    }

    pub fn select(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<()> {
        let mut read_set = unsafe {
            let mut set = MaybeUninit::<libc::fd_set>::uninit();
            libc::FD_ZERO(set.as_mut_ptr());
            set.assume_init()
        };
        let mut write_set = read_set;
        let mut error_set = read_set;

        let mut max_fd = -1;
        for (&fd, &interest) in self.fds.borrow().iter() {
            if interest.is_readable() {
                unsafe { libc::FD_SET(fd, &mut read_set) };
            }
            if interest.is_writable() {
                unsafe { libc::FD_SET(fd, &mut write_set) };
            }
            // Error readiness is implicit for every registration.
            unsafe { libc::FD_SET(fd, &mut error_set) };
            max_fd = std::cmp::max(max_fd, fd);
        }

        let mut timeval = timeout.map(|to| libc::timeval {
            tv_sec: to.as_secs() as libc::time_t,
            tv_usec: to.subsec_micros() as libc::suseconds_t,
        });
        let timeval = timeval
            .as_mut()
            .map(|tv| tv as *mut _)
            .unwrap_or(ptr::null_mut());

        syscall!(select(
            max_fd + 1,
            &mut read_set,
            &mut write_set,
            &mut error_set,
            timeval,
        ))?;

        events.clear();
        for &fd in self.fds.borrow().keys() {
            let mut ready = Ready::NONE;
            if unsafe { libc::FD_ISSET(fd, &read_set) } {
                ready |= Ready::IN;
            }
            if unsafe { libc::FD_ISSET(fd, &write_set) } {
                ready |= Ready::OUT;
            }
            if unsafe { libc::FD_ISSET(fd, &error_set) } {
                ready |= Ready::ERR;
            }
            if !ready.is_empty() {
                events.push(Event { fd, ready });
            }
        }
        Ok(())
    }
}
