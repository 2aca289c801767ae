//! gmeta Net Types
//!
//! Transport abstraction between the metastorage kernel and whatever carries
//! its messages. The messenger delivers messages; it does not interpret them.
//!
//! This crate provides:
//! - `ClusterMessenger`: total-order broadcast plus join request/response
//! - `Delivery`: what arrives in a node's inbox
//! - `MessengerError`

mod messenger;

pub use messenger::{ClusterMessenger, Connection, Delivery, MessengerError};
