use gmeta_model::{ClusterMessage, JoinReply, JoinRequest, NodeId};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("Peer {0} unreachable")]
    PeerUnreachable(NodeId),
    #[error("Peer {0} dropped the request")]
    NoReply(NodeId),
    #[error("Not connected")]
    NotConnected,
}

/// An item in a node's inbox.
#[derive(Debug)]
pub enum Delivery {
    /// A broadcast message. `seq` is the cluster-wide delivery order; every
    /// connected node sees the same messages with the same sequence numbers.
    Broadcast { seq: u64, message: ClusterMessage },
    /// A join request from a peer. Answer through `reply`.
    JoinRequest {
        request: JoinRequest,
        reply: oneshot::Sender<JoinReply>,
    },
}

/// An open membership in the cluster.
#[derive(Debug)]
pub struct Connection {
    pub inbox: mpsc::UnboundedReceiver<Delivery>,
    /// Delivery sequence at connect time. Every broadcast delivered to this
    /// inbox has a larger sequence.
    pub joined_at: u64,
}

/// Cluster messaging used by the metastorage.
///
/// Requirements on implementations:
/// - `broadcast` delivers to every connected node, the sender included, in one
///   total order.
/// - A join request sent to a peer is queued behind every broadcast already
///   delivered to that peer's inbox.
#[async_trait::async_trait]
pub trait ClusterMessenger: Send + Sync + 'static {
    fn local_id(&self) -> NodeId;

    async fn connect(&self) -> Result<Connection, MessengerError>;

    /// Other connected nodes.
    fn peers(&self) -> Vec<NodeId>;

    /// Returns the delivery sequence assigned to the message.
    async fn broadcast(&self, message: ClusterMessage) -> Result<u64, MessengerError>;

    async fn request_join(
        &self,
        peer: NodeId,
        request: JoinRequest,
    ) -> Result<JoinReply, MessengerError>;

    async fn disconnect(&self);
}
