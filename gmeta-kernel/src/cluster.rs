//! Cluster-wide coordination shared by every node handle.

use std::sync::atomic::{AtomicBool, Ordering};

/// The cluster activation flag.
///
/// False at boot and set by an external activation call. Writes and removes
/// are refused while it is false; reads are not affected.
#[derive(Debug, Default)]
pub struct ClusterContext {
    active: AtomicBool,
}

impl ClusterContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            tracing::info!("Cluster activated");
        }
    }

    /// Back to the boot state, as after a full-cluster restart.
    pub fn deactivate(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            tracing::info!("Cluster deactivated");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
