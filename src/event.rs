//! Readiness event masks.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// A bitset of readiness events.
///
/// The numeric values are part of the public surface and stable:
/// `READABLE = 1`, `PRIORITY = 2`, `WRITABLE = 4`, `ERROR = 8`,
/// `HANGUP = 16`, `EXIT = 32`.
///
/// `ERROR` and `HANGUP` are never requested explicitly; on readiness they
/// are folded into `READABLE` so that hang-up is observable by a reader.
/// `EXIT` is used by the kqueue backend to distinguish process-exit events
/// from file descriptor events.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Events(u8);

impl Events {
    /// The associated file descriptor has data available to read.
    pub const READABLE: Events = Events(1);
    /// Out-of-band data is available.
    pub const PRIORITY: Events = Events(2);
    /// The associated file descriptor can accept writes.
    pub const WRITABLE: Events = Events(4);
    /// An error condition was reported.
    pub const ERROR: Events = Events(8);
    /// The far end hung up.
    pub const HANGUP: Events = Events(16);
    /// A watched process exited.
    pub const EXIT: Events = Events(32);

    /// The empty set.
    pub const fn empty() -> Events {
        Events(0)
    }

    /// Returns the raw bit pattern.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Reconstructs a set from a raw bit pattern, keeping only known bits.
    pub const fn from_bits(bits: u8) -> Events {
        Events(bits & 0b11_1111)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if every event in `other` is present in `self`.
    pub const fn contains(self, other: Events) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if `self` and `other` share any event.
    pub const fn intersects(self, other: Events) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_readable(self) -> bool {
        self.intersects(Events::READABLE)
    }

    pub const fn is_writable(self) -> bool {
        self.intersects(Events::WRITABLE)
    }

    pub const fn is_priority(self) -> bool {
        self.intersects(Events::PRIORITY)
    }
}

impl BitOr for Events {
    type Output = Events;

    fn bitor(self, other: Events) -> Events {
        Events(self.0 | other.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, other: Events) {
        self.0 |= other.0;
    }
}

impl BitAnd for Events {
    type Output = Events;

    fn bitand(self, other: Events) -> Events {
        Events(self.0 & other.0)
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "(empty)");
        }

        let mut first = true;
        let mut check = |bit: Events, name: &str| -> fmt::Result {
            if self.intersects(bit) {
                if !first {
                    write!(f, " | ")?;
                }
                first = false;
                write!(f, "{}", name)?;
            }
            Ok(())
        };

        check(Events::READABLE, "READABLE")?;
        check(Events::PRIORITY, "PRIORITY")?;
        check(Events::WRITABLE, "WRITABLE")?;
        check(Events::ERROR, "ERROR")?;
        check(Events::HANGUP, "HANGUP")?;
        check(Events::EXIT, "EXIT")
    }
}
