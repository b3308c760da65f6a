/// A set of readiness conditions for a file descriptor.
///
/// Names which of the three watchable conditions a reactor call touches:
/// readable, writable, and exceptional. Both reactor back-ends translate
/// this set into their own encoding (`select` bit-vectors, `poll` event
/// masks).
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct Interest(u8);

const READ: u8 = 0b001;
const WRITE: u8 = 0b010;
const EXCEPT: u8 = 0b100;

impl Interest {
    /// Adds the readable condition.
    pub const fn read(self) -> Self {
        Self(self.0 | READ)
    }

    /// Adds the writable condition.
    pub const fn write(self) -> Self {
        Self(self.0 | WRITE)
    }

    /// Adds the exceptional condition (out-of-band data, error states).
    pub const fn except(self) -> Self {
        Self(self.0 | EXCEPT)
    }

    /// All three conditions.
    pub const fn all() -> Self {
        Self(READ | WRITE | EXCEPT)
    }

    pub const fn is_read(self) -> bool {
        self.0 & READ != 0
    }

    pub const fn is_write(self) -> bool {
        self.0 & WRITE != 0
    }

    pub const fn is_except(self) -> bool {
        self.0 & EXCEPT != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Creates a new, empty [`Interest`] set to configure fluently:
/// `interest().read().except()`.
pub const fn interest() -> Interest {
    Interest(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates() {
        let i = interest().read().except();
        assert!(i.is_read());
        assert!(!i.is_write());
        assert!(i.is_except());
        assert!(!i.is_empty());
        assert_eq!(Interest::all(), interest().read().write().except());
    }
}
