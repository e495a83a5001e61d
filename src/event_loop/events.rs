use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::sys::{Event, Filter};

/// Bitmask of readiness kinds delivered to an I/O event callback.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct EventFlags(u8);

impl EventFlags {
    /// The descriptor has bytes ready to read.
    pub const READABLE: EventFlags = EventFlags(1 << 0);
    /// The descriptor can accept bytes without blocking.
    pub const WRITABLE: EventFlags = EventFlags(1 << 1);
    /// The peer end has shut down. May accompany data readiness in the
    /// same callback.
    pub const CLOSED: EventFlags = EventFlags(1 << 2);
    /// The kernel reported an error for the descriptor, or the
    /// subscription failed to register.
    pub const ERROR: EventFlags = EventFlags(1 << 3);

    /// The empty mask.
    #[inline]
    pub const fn empty() -> EventFlags {
        EventFlags(0)
    }

    /// Returns `true` if no flag is set.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if every flag in `other` is also set in `self`.
    #[inline]
    pub const fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EventFlags {
    type Output = EventFlags;

    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventFlags {
    fn bitor_assign(&mut self, rhs: EventFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for EventFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(empty)");
        }

        let mut first = true;
        for (flag, name) in [
            (EventFlags::READABLE, "READABLE"),
            (EventFlags::WRITABLE, "WRITABLE"),
            (EventFlags::CLOSED, "CLOSED"),
            (EventFlags::ERROR, "ERROR"),
        ] {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }

        Ok(())
    }
}

/// Readiness flags to report for one kernel event.
///
/// An error report maps to `ERROR` alone. Otherwise readiness is
/// reported only when the payload is non-zero, and end-of-file maps to
/// `CLOSED`, possibly paired with data readiness from the same event.
pub(crate) fn event_flags_from(event: &Event) -> EventFlags {
    if event.error {
        return EventFlags::ERROR;
    }

    let mut flags = EventFlags::empty();

    match event.filter {
        Filter::Read => {
            if event.payload != 0 {
                flags |= EventFlags::READABLE;
            }
            if event.eof {
                flags |= EventFlags::CLOSED;
            }
        }
        Filter::Write => {
            if event.payload != 0 {
                flags |= EventFlags::WRITABLE;
            }
            if event.eof {
                flags |= EventFlags::CLOSED;
            }
        }
    }

    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(filter: Filter, payload: i64, eof: bool, error: bool) -> Event {
        Event {
            fd: 3,
            filter,
            payload,
            eof,
            error,
            token: 0,
        }
    }

    #[test]
    fn error_takes_precedence() {
        let flags = event_flags_from(&event(Filter::Read, 128, true, true));
        assert_eq!(flags, EventFlags::ERROR);
    }

    #[test]
    fn readable_requires_nonzero_payload() {
        let flags = event_flags_from(&event(Filter::Read, 0, false, false));
        assert!(flags.is_empty());

        let flags = event_flags_from(&event(Filter::Read, 64, false, false));
        assert_eq!(flags, EventFlags::READABLE);
    }

    #[test]
    fn eof_without_data_is_closed_only() {
        let flags = event_flags_from(&event(Filter::Read, 0, true, false));
        assert_eq!(flags, EventFlags::CLOSED);
    }

    #[test]
    fn eof_pairs_with_data_readiness() {
        let flags = event_flags_from(&event(Filter::Read, 16, true, false));
        assert_eq!(flags, EventFlags::READABLE | EventFlags::CLOSED);
    }

    #[test]
    fn writable_mirrors_readable_rules() {
        let flags = event_flags_from(&event(Filter::Write, 4096, false, false));
        assert_eq!(flags, EventFlags::WRITABLE);

        let flags = event_flags_from(&event(Filter::Write, 0, true, false));
        assert_eq!(flags, EventFlags::CLOSED);
    }

    #[test]
    fn contains_and_or() {
        let flags = EventFlags::READABLE | EventFlags::CLOSED;
        assert!(flags.contains(EventFlags::READABLE));
        assert!(flags.contains(EventFlags::CLOSED));
        assert!(!flags.contains(EventFlags::WRITABLE));
        assert!(flags.contains(EventFlags::empty()));
    }

    #[test]
    fn debug_lists_set_flags() {
        let flags = EventFlags::READABLE | EventFlags::WRITABLE;
        assert_eq!(format!("{flags:?}"), "READABLE | WRITABLE");
        assert_eq!(format!("{:?}", EventFlags::empty()), "(empty)");
    }
}
