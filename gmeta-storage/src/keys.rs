//! Reserved key namespace.
//!
//! Distributed bookkeeping lives in the same physical table as per-node local
//! metadata. Every reserved key starts with NUL and can only be built through
//! the [`ReservedKey`] constructors; [`LocalKey::new`] refuses anything that
//! starts with NUL, so the two key spaces cannot overlap.

use crate::StorageError;
use gmeta_model::Version;
use std::fmt;

pub const RESERVED_PREFIX: char = '\0';

const VALUE_PREFIX: &str = "\0key-";
const HISTORY_PREFIX: &str = "\0hist-";
const VERSION_KEY: &str = "\0ver";
const LAST_UPDATE_KEY: &str = "\0upd";

/// Groups of reserved keys that can be scanned or cleared together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservedNamespace {
    /// Current values of distributed keys.
    Values,
    /// Retained history records.
    History,
}

impl ReservedNamespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            ReservedNamespace::Values => VALUE_PREFIX,
            ReservedNamespace::History => HISTORY_PREFIX,
        }
    }
}

/// A key inside the reserved namespace.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReservedKey(String);

impl ReservedKey {
    /// Current value of a distributed key.
    pub fn value(key: &str) -> Self {
        Self(format!("{VALUE_PREFIX}{key}"))
    }

    /// History record at `version`. Zero-padded so lexical order is version order.
    pub fn history(version: Version) -> Self {
        Self(format!("{HISTORY_PREFIX}{:020}", version.0))
    }

    /// Persisted version stamp, history boundary and state digest.
    pub fn version_state() -> Self {
        Self(VERSION_KEY.to_string())
    }

    /// Copy of the most recently applied record, re-applied after a crash.
    pub fn last_update() -> Self {
        Self(LAST_UPDATE_KEY.to_string())
    }

    pub(crate) fn from_stored(raw: &str) -> Option<Self> {
        raw.starts_with(RESERVED_PREFIX).then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The distributed key, if this is a value key.
    pub fn user_key(&self) -> Option<&str> {
        self.0.strip_prefix(VALUE_PREFIX)
    }

    /// The version, if this is a history key.
    pub fn history_version(&self) -> Option<Version> {
        self.0
            .strip_prefix(HISTORY_PREFIX)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Version)
    }
}

impl fmt::Debug for ReservedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReservedKey({:?})", self.0)
    }
}

/// A per-node local metadata key. Never enters the reserved namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalKey(String);

impl LocalKey {
    pub fn new(key: impl Into<String>) -> Result<Self, StorageError> {
        let key = key.into();
        if key.starts_with(RESERVED_PREFIX) {
            return Err(StorageError::ReservedKey(key));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
