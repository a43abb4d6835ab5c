//! The outbound query peer handle.
//!
//! A [`QueryPeer`] wraps one dialed session for the duration of its life:
//! it drives the version handshake, reports the peer's clock sample, and
//! then forwards block messages to its single subscriber (the work manager's
//! worker). Three signals describe the lifecycle: `ready` fires once the
//! version exchange completes, the message channel carries blocks while the
//! peer is operational, and the disconnect token fires when the session ends
//! for any reason.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use quarry_chain::MedianTime;

use crate::error::{NetError, NetResult};
use crate::message::{NetworkMessage, VersionMessage, PROTOCOL_VERSION, USER_AGENT};
use crate::services::ServiceFlags;
use crate::PeerSession;

/// Shared context a peer handle is constructed with.
#[derive(Clone)]
pub struct QueryPeerConfig {
    /// Clock fed with the peer's version timestamp.
    pub time_source: Arc<MedianTime>,
    /// Accept a session whose version nonce matches our own. Test harnesses
    /// dial themselves on purpose; production never should.
    pub allow_self_conns: bool,
    /// Dispatcher-wide shutdown signal.
    pub shutdown: CancellationToken,
}

struct PeerShared {
    addr: String,
    services: ServiceFlags,
    outbound: mpsc::Sender<NetworkMessage>,
    msgs_rx: Mutex<Option<mpsc::Receiver<NetworkMessage>>>,
    disconnect: CancellationToken,
}

/// Handle to one live outbound peer. Cheap to clone; all clones observe the
/// same lifecycle.
#[derive(Clone)]
pub struct QueryPeer {
    shared: Arc<PeerShared>,
}

impl QueryPeer {
    /// Build a handle over a freshly dialed session.
    ///
    /// Returns the handle, the one-shot `ready` signal that fires on the
    /// peer's version acknowledgement, and the run future the caller must
    /// spawn. The run future owns the session; it exits (cancelling the
    /// disconnect token) when the session ends, the handle is disconnected,
    /// or shutdown fires.
    pub fn new(
        addr: String,
        services: ServiceFlags,
        session: PeerSession,
        config: &QueryPeerConfig,
    ) -> (Self, oneshot::Receiver<()>, impl Future<Output = ()> + Send) {
        let (ready_tx, ready_rx) = oneshot::channel();
        // Capacity 1: delivery to the subscriber is a rendezvous, so an
        // unread block exerts backpressure on the session instead of
        // piling up here.
        let (msgs_tx, msgs_rx) = mpsc::channel(1);

        let shared = Arc::new(PeerShared {
            addr,
            services,
            outbound: session.outbound.clone(),
            msgs_rx: Mutex::new(Some(msgs_rx)),
            disconnect: CancellationToken::new(),
        });

        let peer = Self {
            shared: Arc::clone(&shared),
        };
        let run = run_peer(shared, session, msgs_tx, ready_tx, config.clone());
        (peer, ready_rx, run)
    }

    /// The peer's address.
    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    /// Services the backend reported for this peer.
    pub fn services(&self) -> ServiceFlags {
        self.shared.services
    }

    /// Send a message to the remote peer.
    pub async fn send(&self, msg: NetworkMessage) -> NetResult<()> {
        self.shared
            .outbound
            .send(msg)
            .await
            .map_err(|_| NetError::Disconnected)
    }

    /// Take the received-messages channel. There is a single subscriber per
    /// peer; later calls return `None`.
    pub fn subscribe_recv(&self) -> Option<mpsc::Receiver<NetworkMessage>> {
        self.shared.msgs_rx.lock().take()
    }

    /// Token cancelled when the peer disconnects.
    pub fn on_disconnect(&self) -> CancellationToken {
        self.shared.disconnect.clone()
    }

    /// Whether the peer has not yet disconnected.
    pub fn is_connected(&self) -> bool {
        !self.shared.disconnect.is_cancelled()
    }

    /// Tear the connection down.
    pub fn disconnect(&self) {
        self.shared.disconnect.cancel();
    }
}

/// Drive one peer session: handshake, then message filtering until the
/// session dies.
async fn run_peer(
    shared: Arc<PeerShared>,
    mut session: PeerSession,
    msgs_tx: mpsc::Sender<NetworkMessage>,
    ready_tx: oneshot::Sender<()>,
    config: QueryPeerConfig,
) {
    let our_nonce: u64 = rand::random();
    let version = NetworkMessage::Version(VersionMessage {
        protocol_version: PROTOCOL_VERSION,
        services: ServiceFlags::NONE,
        timestamp: unix_now(),
        nonce: our_nonce,
        user_agent: USER_AGENT.to_string(),
        start_height: 0,
        // We only ever ask for blocks; unsolicited transaction relay is
        // disabled outright.
        relay_txs: false,
    });
    if session.outbound.send(version).await.is_err() {
        debug!(peer = %shared.addr, "Session closed before version could be sent");
        shared.disconnect.cancel();
        return;
    }

    let mut ready_tx = Some(ready_tx);
    let mut saw_version = false;

    loop {
        let msg = tokio::select! {
            _ = shared.disconnect.cancelled() => break,
            _ = config.shutdown.cancelled() => break,
            msg = session.inbound.recv() => match msg {
                Some(msg) => msg,
                None => {
                    debug!(peer = %shared.addr, "Connection closed by peer");
                    break;
                }
            },
        };

        match msg {
            NetworkMessage::Version(version) if !saw_version => {
                if version.nonce == our_nonce && !config.allow_self_conns {
                    warn!(peer = %shared.addr, "Disconnecting self connection");
                    break;
                }
                saw_version = true;
                config
                    .time_source
                    .add_time_sample(&shared.addr, version.timestamp);
                if session.outbound.send(NetworkMessage::VerAck).await.is_err() {
                    break;
                }
            }
            NetworkMessage::VerAck => {
                if let Some(tx) = ready_tx.take() {
                    debug!(peer = %shared.addr, "Version exchange complete");
                    let _ = tx.send(());
                }
            }
            // Repeated handshake chatter is discarded without comment.
            NetworkMessage::Version(_) => {}
            NetworkMessage::Block(block) => {
                tokio::select! {
                    res = msgs_tx.send(NetworkMessage::Block(block)) => {
                        if res.is_err() {
                            // Subscriber gone; nobody is left to serve.
                            break;
                        }
                    }
                    _ = shared.disconnect.cancelled() => break,
                    _ = config.shutdown.cancelled() => break,
                }
            }
            other => {
                debug!(
                    peer = %shared.addr,
                    command = other.command(),
                    "Ignoring unexpected message"
                );
            }
        }
    }

    shared.disconnect.cancel();
    debug!(peer = %shared.addr, "Peer loop exited");
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_chain::{Block, BlockHash, BlockHeader};
    use tokio::time::{timeout, Duration};

    fn test_config() -> QueryPeerConfig {
        QueryPeerConfig {
            time_source: Arc::new(MedianTime::new()),
            allow_self_conns: false,
            shutdown: CancellationToken::new(),
        }
    }

    /// A session pair: the remote ends let the test act as the peer.
    fn session_pair() -> (
        PeerSession,
        mpsc::Receiver<NetworkMessage>,
        mpsc::Sender<NetworkMessage>,
    ) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        (
            PeerSession {
                outbound: out_tx,
                inbound: in_rx,
            },
            out_rx,
            in_tx,
        )
    }

    fn dummy_block() -> Block {
        Block {
            header: BlockHeader {
                version: 4,
                prev_block: BlockHash::zero(),
                merkle_root: BlockHash::zero(),
                timestamp: 0,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions: Vec::new(),
        }
    }

    async fn complete_handshake(
        remote_rx: &mut mpsc::Receiver<NetworkMessage>,
        remote_tx: &mpsc::Sender<NetworkMessage>,
    ) -> VersionMessage {
        let msg = remote_rx.recv().await.expect("our version");
        let NetworkMessage::Version(ours) = msg else {
            panic!("expected version, got {}", msg.command());
        };
        remote_tx
            .send(NetworkMessage::Version(VersionMessage {
                nonce: ours.nonce.wrapping_add(1),
                ..ours.clone()
            }))
            .await
            .unwrap();
        remote_tx.send(NetworkMessage::VerAck).await.unwrap();
        ours
    }

    #[tokio::test]
    async fn test_handshake_fires_ready_and_sends_verack() {
        let (session, mut remote_rx, remote_tx) = session_pair();
        let config = test_config();
        let (peer, ready, run) =
            QueryPeer::new("p:8333".into(), ServiceFlags::NONE, session, &config);
        let task = tokio::spawn(run);

        let ours = complete_handshake(&mut remote_rx, &remote_tx).await;
        assert!(!ours.relay_txs);

        timeout(Duration::from_secs(1), ready)
            .await
            .expect("ready in time")
            .expect("ready fired");

        // Our side must have acknowledged the remote version.
        let ack = remote_rx.recv().await.unwrap();
        assert!(matches!(ack, NetworkMessage::VerAck));

        assert!(peer.is_connected());
        peer.disconnect();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_blocks_forwarded_other_messages_dropped() {
        let (session, mut remote_rx, remote_tx) = session_pair();
        let config = test_config();
        let (peer, _ready, run) =
            QueryPeer::new("p:8333".into(), ServiceFlags::NONE, session, &config);
        tokio::spawn(run);
        complete_handshake(&mut remote_rx, &remote_tx).await;

        let mut msgs = peer.subscribe_recv().expect("first subscriber");
        assert!(peer.subscribe_recv().is_none(), "single subscriber only");

        remote_tx.send(NetworkMessage::Ping(1)).await.unwrap();
        remote_tx.send(NetworkMessage::Inv(Vec::new())).await.unwrap();
        remote_tx
            .send(NetworkMessage::Block(dummy_block()))
            .await
            .unwrap();

        let forwarded = timeout(Duration::from_secs(1), msgs.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(forwarded, NetworkMessage::Block(_)));
    }

    #[tokio::test]
    async fn test_self_connection_rejected() {
        let (session, mut remote_rx, remote_tx) = session_pair();
        let config = test_config();
        let (peer, _ready, run) =
            QueryPeer::new("p:8333".into(), ServiceFlags::NONE, session, &config);
        let task = tokio::spawn(run);

        let msg = remote_rx.recv().await.unwrap();
        let NetworkMessage::Version(ours) = msg else {
            panic!("expected version");
        };
        // Echo our own nonce back, as a self connection would.
        remote_tx
            .send(NetworkMessage::Version(ours))
            .await
            .unwrap();

        task.await.unwrap();
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn test_remote_close_fires_disconnect() {
        let (session, mut remote_rx, remote_tx) = session_pair();
        let config = test_config();
        let (peer, _ready, run) =
            QueryPeer::new("p:8333".into(), ServiceFlags::NONE, session, &config);
        let task = tokio::spawn(run);
        complete_handshake(&mut remote_rx, &remote_tx).await;

        drop(remote_tx);
        task.await.unwrap();
        assert!(!peer.is_connected());

        let disconnect = peer.on_disconnect();
        timeout(Duration::from_secs(1), disconnect.cancelled())
            .await
            .expect("disconnect observed");
    }

    #[tokio::test]
    async fn test_version_timestamp_feeds_time_source() {
        let (session, mut remote_rx, remote_tx) = session_pair();
        let config = test_config();
        let (_peer, ready, run) =
            QueryPeer::new("p:8333".into(), ServiceFlags::NONE, session, &config);
        tokio::spawn(run);
        complete_handshake(&mut remote_rx, &remote_tx).await;
        // Ready fires after the version was processed, so the sample is in.
        timeout(Duration::from_secs(1), ready).await.unwrap().unwrap();
        for i in 0..4 {
            config
                .time_source
                .add_time_sample(&format!("other{i}"), unix_now() + 600);
        }
        // peer sample (≈0 offset) + four 600s samples: median is 600.
        assert!(config.time_source.offset_secs() >= 599);
    }
}
