//! Session transport contracts injected by the caller.
//!
//! The dispatcher does not own a codec: the embedding application supplies a
//! dialer that yields fully framed, typed sessions (and must support onion
//! or other overlay addresses if its backend connects through them), plus a
//! way to list the backend node's current peers.

use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::NetResult;
use crate::message::NetworkMessage;
use crate::services::PeerDescriptor;

/// A typed duplex session with one remote peer.
///
/// `outbound` accepts messages to transmit; `inbound` yields decoded messages
/// as they arrive. Dropping either half tears the session down, and the
/// `inbound` stream ending means the remote side is gone.
pub struct PeerSession {
    /// Messages to send to the peer.
    pub outbound: mpsc::Sender<NetworkMessage>,
    /// Messages received from the peer.
    pub inbound: mpsc::Receiver<NetworkMessage>,
}

/// Establishes a session with the peer at the given address.
///
/// Any error aborts the one connection attempt; the candidate stays eligible
/// for later refresh passes.
pub type DialFn = Arc<dyn Fn(String) -> BoxFuture<'static, NetResult<PeerSession>> + Send + Sync>;

/// Retrieves the set of peers the backend node is currently connected to.
pub type GetPeersFn =
    Arc<dyn Fn() -> BoxFuture<'static, NetResult<Vec<PeerDescriptor>>> + Send + Sync>;
