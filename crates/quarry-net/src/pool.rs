//! The peer pool.
//!
//! Maintains up to a target number of live query peers by polling the
//! backend node for its current connections, filtering and shuffling the
//! candidates, and dialing the survivors. Every successfully negotiated
//! peer is advertised exactly once on the pool's outbound channel before it
//! is recorded, so the consumer sees each connection event in order.
//!
//! The remote peer set is a moving target: peers churn on the backend, our
//! own connections drop, and misbehaving peers get banned. The refresh task
//! reconciles against the target on every tick where the pool is short.

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use quarry_chain::MedianTime;

use crate::error::{NetError, NetResult};
use crate::peer::{QueryPeer, QueryPeerConfig};
use crate::services::{filter_eligible, PeerDescriptor, ServiceFlags};
use crate::ticker::RefreshTicker;
use crate::{DialFn, GetPeersFn};

/// Peer pool configuration.
pub struct PoolConfig {
    /// Number of peers to maintain connections with.
    pub num_target_peers: usize,
    /// Establishes sessions with candidate peers.
    pub dial: DialFn,
    /// Lists the backend node's current peers.
    pub get_peers: GetPeersFn,
    /// How long to wait for a dialed peer's version exchange.
    pub peer_ready_timeout: Duration,
    /// Accept self connections (test harnesses only).
    pub allow_self_conns: bool,
    /// Clock fed by peer version timestamps.
    pub time_source: Arc<MedianTime>,
}

struct PoolState {
    /// Live peers by address.
    connected: HashMap<String, QueryPeer>,
    /// Addresses never to be dialed again within this process.
    banned: HashSet<String>,
}

/// Maintains the set of connected query peers.
pub struct PeerPool {
    config: PoolConfig,
    state: Arc<Mutex<PoolState>>,
    /// Advertises each newly connected peer, one handle per connection
    /// event. Sends block until the consumer accepts the peer.
    connected_tx: mpsc::Sender<QueryPeer>,
    shutdown: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl PeerPool {
    /// Create a pool. No I/O happens until [`PeerPool::start`].
    pub fn new(
        config: PoolConfig,
        connected_tx: mpsc::Sender<QueryPeer>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Arc::new(Mutex::new(PoolState {
                connected: HashMap::new(),
                banned: HashSet::new(),
            })),
            connected_tx,
            shutdown,
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    /// Spawn the refresh task: an initial connection pass, then one pass per
    /// tick whenever the pool is below target.
    pub fn start(self: Arc<Self>, ticker: RefreshTicker) {
        let pool = Arc::clone(&self);
        pool.spawn(async move { self.refresh_loop(ticker).await });
    }

    async fn refresh_loop(self: Arc<Self>, mut ticker: RefreshTicker) {
        if let Err(err) = self.connection_pass().await {
            if matches!(err, NetError::ShuttingDown) {
                return;
            }
            warn!(error = %err, "Unable to establish peer connections");
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                tick = ticker.tick() => {
                    if tick.is_none() {
                        debug!("Refresh ticker ended");
                        return;
                    }
                }
            }

            // Skip the pass outright when the pool is already at target.
            let needed = {
                let state = self.state.lock();
                self.config.num_target_peers.saturating_sub(state.connected.len())
            };
            if needed == 0 {
                continue;
            }

            match self.connection_pass().await {
                Ok(()) => {}
                Err(NetError::ShuttingDown) => return,
                Err(err) => warn!(error = %err, "Unable to establish peer connections"),
            }
        }
    }

    /// One connection pass: refresh the candidate list and dial until the
    /// target count is reached or the candidates run out.
    async fn connection_pass(&self) -> NetResult<()> {
        let peers = (self.config.get_peers)().await?;
        let mut candidates = filter_eligible(peers);
        debug!(candidates = candidates.len(), "Refreshed backend peer list");

        // Uniform shuffle: several dispatcher instances sharing one backend
        // must not all pile onto the same candidates.
        candidates.shuffle(&mut rand::thread_rng());

        for candidate in candidates {
            {
                let state = self.state.lock();
                if state.banned.contains(&candidate.addr)
                    || state.connected.contains_key(&candidate.addr)
                {
                    continue;
                }
            }

            let peer = match self.connect(&candidate).await {
                Ok(peer) => peer,
                Err(NetError::ShuttingDown) => return Err(NetError::ShuttingDown),
                Err(err) => {
                    debug!(peer = %candidate.addr, error = %err, "Failed connecting to peer");
                    continue;
                }
            };

            // Hand the peer to the consumer before recording it; the send
            // blocks until the work manager has taken ownership of it.
            tokio::select! {
                res = self.connected_tx.send(peer.clone()) => {
                    if res.is_err() {
                        peer.disconnect();
                        return Err(NetError::ShuttingDown);
                    }
                }
                _ = self.shutdown.cancelled() => {
                    peer.disconnect();
                    return Err(NetError::ShuttingDown);
                }
            }

            let num_connected = {
                let mut state = self.state.lock();
                state
                    .connected
                    .insert(peer.addr().to_string(), peer.clone());
                state.connected.len()
            };
            self.observe_disconnect(&peer);
            debug!(peer = %peer.addr(), num_connected, "Connected to new query peer");

            if num_connected == self.config.num_target_peers {
                break;
            }
        }

        Ok(())
    }

    /// Dial one candidate and wait for it to become ready.
    async fn connect(&self, candidate: &PeerDescriptor) -> NetResult<QueryPeer> {
        let session = (self.config.dial)(candidate.addr.clone()).await?;
        let services = ServiceFlags::from_hex(&candidate.services).unwrap_or_default();

        let peer_config = QueryPeerConfig {
            time_source: Arc::clone(&self.config.time_source),
            allow_self_conns: self.config.allow_self_conns,
            shutdown: self.shutdown.clone(),
        };
        let (peer, ready, run) =
            QueryPeer::new(candidate.addr.clone(), services, session, &peer_config);
        self.spawn(run);

        tokio::select! {
            res = ready => match res {
                Ok(()) => Ok(peer),
                Err(_) => {
                    peer.disconnect();
                    Err(NetError::Disconnected)
                }
            },
            _ = tokio::time::sleep(self.config.peer_ready_timeout) => {
                peer.disconnect();
                Err(NetError::HandshakeTimeout)
            }
            _ = self.shutdown.cancelled() => {
                peer.disconnect();
                Err(NetError::ShuttingDown)
            }
        }
    }

    /// Remove the pool entry once the peer's disconnect signal fires.
    fn observe_disconnect(&self, peer: &QueryPeer) {
        let state = Arc::clone(&self.state);
        let disconnect = peer.on_disconnect();
        let addr = peer.addr().to_string();
        self.spawn(async move {
            disconnect.cancelled().await;
            state.lock().connected.remove(&addr);
            debug!(peer = %addr, "Removed disconnected peer");
        });
    }

    /// Ban a peer: never dial it again and drop any live connection to it.
    pub fn ban(&self, addr: &str) {
        let peer = {
            let mut state = self.state.lock();
            state.banned.insert(addr.to_string());
            state.connected.remove(addr)
        };
        if let Some(peer) = peer {
            peer.disconnect();
        }
        warn!(peer = %addr, "Banned peer");
    }

    /// Whether the address is banned.
    pub fn is_banned(&self, addr: &str) -> bool {
        self.state.lock().banned.contains(addr)
    }

    /// Number of currently connected peers.
    pub fn connected_count(&self) -> usize {
        self.state.lock().connected.len()
    }

    /// Addresses of the currently connected peers.
    pub fn connected_addrs(&self) -> Vec<String> {
        self.state.lock().connected.keys().cloned().collect()
    }

    /// Disconnect everything and wait for every pool task to finish. The
    /// shutdown token must already be cancelled.
    pub async fn shutdown(&self) {
        let peers: Vec<QueryPeer> = {
            let state = self.state.lock();
            state.connected.values().cloned().collect()
        };
        for peer in peers {
            peer.disconnect();
        }

        // The refresh task may still be mid-pass and spawn a last observer;
        // keep draining until nothing new appears.
        loop {
            let mut tasks = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            while tasks.join_next().await.is_some() {}
        }
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        let mut tasks = self.tasks.lock();
        // Reap whatever already finished so the set does not grow without
        // bound across peer churn.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }
}
