//! Identity types for the pipeline system.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one pipeline run.
///
/// Device-failure events carry the session that produced them, so a failure
/// left in the bus by an earlier run cannot tear down a later one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    pub const INVALID: SessionId = SessionId(0);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "SessionId(INVALID)")
        } else {
            write!(f, "SessionId({})", self.0)
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out increasing session ids, starting at 1.
#[derive(Debug, Default)]
pub struct SessionIdAllocator {
    last: AtomicU64,
}

impl SessionIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> SessionId {
        SessionId(self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
