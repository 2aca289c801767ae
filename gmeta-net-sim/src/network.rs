//! SimNetwork: total-order broadcast broker.
//!
//! Broadcasts are sequenced and fanned out under one lock, so every inbox
//! receives them in the same order. Join requests are pushed into the target
//! inbox under the same lock, behind every broadcast it already holds.

use gmeta_model::{ClusterMessage, JoinReply, JoinRequest, NodeId};
use gmeta_net_types::{ClusterMessenger, Connection, Delivery, MessengerError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

struct Member {
    tx: mpsc::UnboundedSender<Delivery>,
    drop_join_requests: Arc<AtomicU32>,
}

#[derive(Default)]
struct Broker {
    next_seq: u64,
    members: BTreeMap<NodeId, Member>,
}

/// Shared broker. Clone to hand to every node of the simulated cluster.
#[derive(Clone, Default)]
pub struct SimNetwork {
    broker: Arc<Mutex<Broker>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messenger for one node.
    pub fn messenger(&self, id: NodeId) -> SimMessenger {
        SimMessenger {
            id,
            network: self.clone(),
            drop_join_requests: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Currently connected nodes.
    pub fn connected(&self) -> Vec<NodeId> {
        self.broker.lock().members.keys().copied().collect()
    }

    /// Sequence of the most recent broadcast.
    pub fn last_seq(&self) -> u64 {
        self.broker.lock().next_seq
    }
}

/// One node's view of a [`SimNetwork`].
#[derive(Clone)]
pub struct SimMessenger {
    id: NodeId,
    network: SimNetwork,
    drop_join_requests: Arc<AtomicU32>,
}

impl SimMessenger {
    /// Drop the next `n` join requests addressed to this node. Senders see
    /// [`MessengerError::NoReply`].
    pub fn drop_next_incoming_join_requests(&self, n: u32) {
        self.drop_join_requests.fetch_add(n, Ordering::SeqCst);
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait::async_trait]
impl ClusterMessenger for SimMessenger {
    fn local_id(&self) -> NodeId {
        self.id
    }

    async fn connect(&self) -> Result<Connection, MessengerError> {
        let (tx, inbox) = mpsc::unbounded_channel();
        let mut broker = self.network.broker.lock();
        let member = Member { tx, drop_join_requests: self.drop_join_requests.clone() };
        if broker.members.insert(self.id, member).is_some() {
            tracing::warn!(node = %self.id, "Replacing existing connection");
        }
        Ok(Connection { inbox, joined_at: broker.next_seq })
    }

    fn peers(&self) -> Vec<NodeId> {
        self.network
            .broker
            .lock()
            .members
            .keys()
            .copied()
            .filter(|id| *id != self.id)
            .collect()
    }

    async fn broadcast(&self, message: ClusterMessage) -> Result<u64, MessengerError> {
        let mut broker = self.network.broker.lock();
        if !broker.members.contains_key(&self.id) {
            return Err(MessengerError::NotConnected);
        }
        broker.next_seq += 1;
        let seq = broker.next_seq;
        for (id, member) in &broker.members {
            let delivery = Delivery::Broadcast { seq, message: message.clone() };
            if member.tx.send(delivery).is_err() {
                tracing::debug!(node = %id, seq, "Inbox closed, delivery skipped");
            }
        }
        Ok(seq)
    }

    async fn request_join(
        &self,
        peer: NodeId,
        request: JoinRequest,
    ) -> Result<JoinReply, MessengerError> {
        let rx = {
            let broker = self.network.broker.lock();
            let member = broker
                .members
                .get(&peer)
                .ok_or(MessengerError::PeerUnreachable(peer))?;
            if take_one(&member.drop_join_requests) {
                tracing::debug!(from = %self.id, to = %peer, "Dropping join request");
                return Err(MessengerError::NoReply(peer));
            }
            let (reply, rx) = oneshot::channel();
            member
                .tx
                .send(Delivery::JoinRequest { request, reply })
                .map_err(|_| MessengerError::PeerUnreachable(peer))?;
            rx
        };
        rx.await.map_err(|_| MessengerError::NoReply(peer))
    }

    async fn disconnect(&self) {
        self.network.broker.lock().members.remove(&self.id);
    }
}
