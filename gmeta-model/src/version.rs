//! Global version counter and the `(version, checksum)` stamp exchanged at join time.

use crate::types::Hash;
use borsh::{BorshDeserialize, BorshSerialize};
use std::fmt;

/// Strictly increasing, cluster-global update counter.
///
/// `Version(0)` means no update has been applied yet. Every applied write or
/// remove consumes exactly one version.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    BorshSerialize,
    BorshDeserialize,
)]
pub struct Version(pub u64);

impl Version {
    pub const INITIAL: Version = Version(0);

    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(v: u64) -> Self {
        Version(v)
    }
}

/// A version together with the cumulative checksum of all history up to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VersionStamp {
    pub version: Version,
    pub checksum: Hash,
}

impl VersionStamp {
    /// Stamp of an empty history.
    pub const INITIAL: VersionStamp = VersionStamp {
        version: Version::INITIAL,
        checksum: Hash::ZERO,
    };

    pub fn new(version: Version, checksum: Hash) -> Self {
        Self { version, checksum }
    }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.version, self.checksum.short())
    }
}
