//! Control link versioning.
//!
//! A channel announces its version in `ServerRequestAllocation`. Center
//! accepts any channel speaking the same major version and refuses the
//! registration otherwise; minor bumps only add messages an older peer never
//! receives unasked.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Version spoken by this build.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

/// A registering peer speaks a protocol this process cannot serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("peer speaks protocol {peer}, expected {local}")]
pub struct VersionMismatch {
    pub local: Version,
    pub peer: Version,
}

impl Version {
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Versions are compatible if they share the same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// Decide whether a peer announcing `peer` may register with a process
    /// speaking `self`.
    ///
    /// # Errors
    ///
    /// Returns [`VersionMismatch`] when the major versions differ.
    pub fn admit_peer(self, peer: Version) -> Result<(), VersionMismatch> {
        if self.is_compatible_with(&peer) {
            Ok(())
        } else {
            Err(VersionMismatch { local: self, peer })
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
