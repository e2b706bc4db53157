//! Wire versions.
//!
//! The session frame protocol and the storage envelope are versioned apart.
//! Only the major number is written into an envelope; a reader accepts any
//! envelope whose major matches its own.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Session frame protocol, reported by `/api/config/info`.
pub const PROTOCOL_VERSION: Version = Version::new(1, 0);

/// Storage envelope. `major` is the `v` field of every envelope.
pub const ENVELOPE_VERSION: Version = Version::new(1, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Whether data stamped with major `v` can be read by this version.
    #[must_use]
    pub const fn accepts(self, v: u8) -> bool {
        self.major == v
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
