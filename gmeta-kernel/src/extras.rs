//! StartupExtras: broadcasts that arrive while the node is still joining.
//!
//! Filled during negotiation, drained exactly once when the node settles.

use gmeta_model::ClusterMessage;
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Startup extras full ({capacity} deliveries)")]
pub struct ExtrasOverflow {
    pub capacity: usize,
}

#[derive(Debug)]
pub struct StartupExtras {
    queue: VecDeque<(u64, ClusterMessage)>,
    capacity: usize,
}

impl StartupExtras {
    pub fn new(capacity: usize) -> Self {
        Self { queue: VecDeque::new(), capacity }
    }

    /// Queue a delivery in arrival order.
    pub fn push(&mut self, seq: u64, message: ClusterMessage) -> Result<(), ExtrasOverflow> {
        if self.queue.len() >= self.capacity {
            return Err(ExtrasOverflow { capacity: self.capacity });
        }
        self.queue.push_back((seq, message));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Deliveries newer than `watermark`, in arrival order. Older ones are
    /// already reflected in the state the node settled on.
    pub fn drain_after(self, watermark: u64) -> Vec<(u64, ClusterMessage)> {
        self.queue.into_iter().filter(|(seq, _)| *seq > watermark).collect()
    }
}
