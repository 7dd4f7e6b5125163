use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::unix::io::RawFd;

/// A set of readiness kinds a file descriptor can be registered for, or
/// observed with.
///
/// `Ready` is a bit set of [`Ready::IN`], [`Ready::OUT`], [`Ready::ERR`] and
/// [`Ready::HUP`]. Error and hang-up readiness are always reported by the
/// selectors, whether or not they were part of the registered interest.
///
/// # Examples
///
/// ```
/// use cloak::Ready;
///
/// let mask = Ready::IN | Ready::ERR;
/// assert!(mask.is_readable());
/// assert!(!mask.is_writable());
/// ```
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ready(u8);

const IN: u8 = 0b0001;
const OUT: u8 = 0b0010;
const ERR: u8 = 0b0100;
const HUP: u8 = 0b1000;

impl Ready {
    /// Empty set, no readiness.
    pub const NONE: Ready = Ready(0);
    /// Readable readiness.
    pub const IN: Ready = Ready(IN);
    /// Writable readiness.
    pub const OUT: Ready = Ready(OUT);
    /// Error readiness.
    pub const ERR: Ready = Ready(ERR);
    /// Hang-up readiness: the peer closed its end of the connection.
    pub const HUP: Ready = Ready(HUP);

    /// Returns true if the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.0 & IN != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & OUT != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & ERR != 0
    }

    pub fn is_hup(self) -> bool {
        self.0 & HUP != 0
    }

    /// Returns true if `self` contains all readiness kinds in `other`.
    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl BitOrAssign for Ready {
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl BitAnd for Ready {
    type Output = Ready;

    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return fmt.write_str("NONE");
        }
        let mut one = false;
        let flags = [
            (Ready(IN), "IN"),
            (Ready(OUT), "OUT"),
            (Ready(ERR), "ERR"),
            (Ready(HUP), "HUP"),
        ];
        for (flag, msg) in &flags {
            if self.contains(*flag) {
                if one {
                    fmt.write_str(" | ")?
                }
                fmt.write_str(msg)?;
                one = true;
            }
        }
        Ok(())
    }
}

/// A readiness event produced by a selector backend, consumed by
/// [`EventLoop::run`].
///
/// [`EventLoop::run`]: crate::EventLoop::run
#[derive(Copy, Clone, Debug)]
pub struct Event {
    pub fd: RawFd,
    pub ready: Ready,
}

#[cfg(test)]
mod tests {
    use super::Ready;

    #[test]
    fn ready_bit_ops() {
        let mask = Ready::IN | Ready::OUT;
        assert!(mask.is_readable());
        assert!(mask.is_writable());
        assert!(!mask.is_error());
        assert!(mask.contains(Ready::IN));
        assert!(mask.contains(Ready::IN | Ready::OUT));
        assert!(!mask.contains(Ready::IN | Ready::ERR));

        let mut mask = Ready::NONE;
        assert!(mask.is_empty());
        mask |= Ready::HUP;
        assert!(mask.is_hup());

        assert_eq!(mask & Ready::HUP, Ready::HUP);
        assert_eq!(mask & Ready::IN, Ready::NONE);
    }

    #[test]
    fn ready_debug() {
        assert_eq!(format!("{:?}", Ready::NONE), "NONE");
        assert_eq!(format!("{:?}", Ready::IN | Ready::ERR), "IN | ERR");
    }
}
