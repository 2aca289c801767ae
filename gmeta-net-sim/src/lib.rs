//! gmeta Net Sim
//!
//! In-memory `ClusterMessenger` for tests and the demo daemon.
//! A shared `SimNetwork` broker connects multiple `SimMessenger` instances
//! and gives every broadcast one cluster-wide delivery order.

mod network;

pub use network::{SimMessenger, SimNetwork};
