//! Checkpoint-style lock shared by every writer of the local store.
//!
//! Writers hold the shared (read) side for the duration of their reads and
//! writes; a checkpointer takes the exclusive side to see a quiescent store.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
pub struct CheckpointLock {
    inner: RwLock<()>,
}

impl CheckpointLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> CheckpointReadGuard<'_> {
        CheckpointReadGuard { owner: self, _guard: self.inner.read() }
    }

    pub fn try_read(&self) -> Option<CheckpointReadGuard<'_>> {
        self.inner
            .try_read()
            .map(|g| CheckpointReadGuard { owner: self, _guard: g })
    }

    pub fn write(&self) -> CheckpointWriteGuard<'_> {
        CheckpointWriteGuard { _guard: self.inner.write() }
    }
}

/// Proof that the shared side of a [`CheckpointLock`] is held.
/// Released on drop, on every exit path.
pub struct CheckpointReadGuard<'a> {
    owner: &'a CheckpointLock,
    _guard: RwLockReadGuard<'a, ()>,
}

impl CheckpointReadGuard<'_> {
    pub fn is_for(&self, lock: &CheckpointLock) -> bool {
        std::ptr::eq(self.owner, lock)
    }
}

pub struct CheckpointWriteGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}
