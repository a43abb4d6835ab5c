//! The pruned block dispatcher facade.
//!
//! Owns the peer pool, the work manager, the request registry, and the
//! median time source, and wires the validation path between them: every
//! block a peer returns is sanity-checked before it is fanned out to the
//! callers waiting on it, and a peer caught serving an invalid block is
//! disconnected and banned for the life of the process.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use quarry_chain::{check_block_sanity, Block, BlockHash, ChainParams, MedianTime};
use quarry_net::{
    DialFn, GetPeersFn, NetworkMessage, PeerPool, PoolConfig, QueryPeer, RefreshTicker,
    MAX_INV_PER_MSG,
};

use crate::error::{DispatchError, DispatchResult};
use crate::registry::{PendingBlocks, ResolveOutcome};
use crate::work::{Progress, QueryError, QueryOptions, ResponseHandler, WorkManager};

/// Default wait for a dialed peer's version exchange.
pub const DEFAULT_PEER_READY_TIMEOUT: Duration = Duration::from_secs(15);

/// Default interval between peer-set refresh passes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of peers to maintain connections with.
pub const DEFAULT_NUM_TARGET_PEERS: usize = 4;

/// Dispatcher configuration.
pub struct DispatcherConfig {
    /// Parameters of the active chain; the proof-of-work limit backs block
    /// sanity validation.
    pub chain_params: ChainParams,
    /// Number of peers to maintain connections with. Connecting to every
    /// backend peer would be wasteful; one small bounded subset suffices.
    pub num_target_peers: usize,
    /// Establishes sessions with peers. Must support whatever overlay
    /// addresses the backend reports (onion services included).
    pub dial: DialFn,
    /// Lists the backend node's current peers.
    pub get_peers: GetPeersFn,
    /// How long to wait for a dialed peer to become ready. Peers cannot
    /// answer queries until the version exchange completes.
    pub peer_ready_timeout: Duration,
    /// Drives peer-set refresh passes.
    pub refresh_ticker: RefreshTicker,
    /// Accept self connections (test harnesses only).
    pub allow_self_conns: bool,
    /// How many inventory entries fit in a single request. Exists so tests
    /// can exercise queries spanning several requests.
    pub max_request_invs: usize,
}

impl DispatcherConfig {
    /// Configuration with the stock knobs: [`DEFAULT_NUM_TARGET_PEERS`]
    /// peers, [`DEFAULT_PEER_READY_TIMEOUT`], a wall-clock refresh ticker at
    /// [`DEFAULT_REFRESH_INTERVAL`], self connections rejected, and requests
    /// batched at the protocol inventory limit. Override fields as needed
    /// before handing the config to [`PrunedBlockDispatcher::new`].
    pub fn new(chain_params: ChainParams, dial: DialFn, get_peers: GetPeersFn) -> Self {
        Self {
            chain_params,
            num_target_peers: DEFAULT_NUM_TARGET_PEERS,
            dial,
            get_peers,
            peer_ready_timeout: DEFAULT_PEER_READY_TIMEOUT,
            refresh_ticker: RefreshTicker::interval(DEFAULT_REFRESH_INTERVAL),
            allow_self_conns: false,
            max_request_invs: MAX_INV_PER_MSG,
        }
    }
}

/// Fetches blocks the backend node has pruned by querying its peers
/// directly.
pub struct PrunedBlockDispatcher {
    pool: Arc<PeerPool>,
    registry: Arc<PendingBlocks>,
    handler: ResponseHandler,
    work_manager: Option<WorkManager>,
    /// Taken by [`PrunedBlockDispatcher::start`].
    peers_rx: Option<mpsc::Receiver<QueryPeer>>,
    refresh_ticker: Option<RefreshTicker>,
    fanout: Arc<Mutex<JoinSet<()>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for PrunedBlockDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrunedBlockDispatcher").finish_non_exhaustive()
    }
}

impl PrunedBlockDispatcher {
    /// Validate the configuration and wire up all state. No I/O happens
    /// until [`PrunedBlockDispatcher::start`].
    pub fn new(config: DispatcherConfig) -> DispatchResult<Self> {
        if config.num_target_peers < 1 {
            return Err(DispatchError::InvalidTargetPeers);
        }
        if config.max_request_invs > MAX_INV_PER_MSG {
            return Err(DispatchError::MaxRequestInvsTooLarge {
                got: config.max_request_invs,
                max: MAX_INV_PER_MSG,
            });
        }

        let shutdown = CancellationToken::new();
        let time_source = Arc::new(MedianTime::new());
        let params = Arc::new(config.chain_params);
        let registry = Arc::new(PendingBlocks::new(config.max_request_invs));
        let fanout = Arc::new(Mutex::new(JoinSet::new()));

        let (peers_tx, peers_rx) = mpsc::channel(1);
        let pool = PeerPool::new(
            PoolConfig {
                num_target_peers: config.num_target_peers,
                dial: config.dial,
                get_peers: config.get_peers,
                peer_ready_timeout: config.peer_ready_timeout,
                allow_self_conns: config.allow_self_conns,
                time_source: Arc::clone(&time_source),
            },
            peers_tx,
            shutdown.clone(),
        );

        let handler = response_handler(
            Arc::clone(&registry),
            Arc::clone(&pool),
            params,
            time_source,
            Arc::clone(&fanout),
            shutdown.clone(),
        );

        Ok(Self {
            pool,
            registry,
            handler,
            work_manager: None,
            peers_rx: Some(peers_rx),
            refresh_ticker: Some(config.refresh_ticker),
            fanout,
            shutdown,
        })
    }

    /// Start serving: launch the work manager and the peer-pool refresh
    /// task.
    pub fn start(&mut self) {
        debug!("Starting pruned block dispatcher");
        if let (Some(peers_rx), Some(ticker)) =
            (self.peers_rx.take(), self.refresh_ticker.take())
        {
            self.work_manager = Some(WorkManager::start(peers_rx, self.shutdown.clone()));
            Arc::clone(&self.pool).start(ticker);
        }
    }

    /// Stop accepting requests and wait for every background task.
    pub async fn stop(&mut self) {
        debug!("Stopping pruned block dispatcher");
        self.shutdown.cancel();

        loop {
            let mut fanout = std::mem::take(&mut *self.fanout.lock());
            if fanout.is_empty() {
                break;
            }
            while fanout.join_next().await.is_some() {}
        }

        self.pool.shutdown().await;
        if let Some(work_manager) = &self.work_manager {
            work_manager.stop().await;
        }
    }

    /// Request the given blocks from the network.
    ///
    /// Returns the delivery channel (buffered to `hashes.len()`, blocks
    /// arrive in network order) and, when any hash needed a fresh network
    /// request, the work manager's error channel for this query. `None`
    /// means every hash was already in flight for an earlier caller.
    ///
    /// The dispatcher must have been started.
    pub fn query(
        &self,
        hashes: &[BlockHash],
        options: QueryOptions,
    ) -> (mpsc::Receiver<Block>, Option<mpsc::Receiver<QueryError>>) {
        let (requests, block_rx) = self.registry.new_request(hashes, &self.handler);
        let error_rx = if requests.is_empty() {
            None
        } else {
            self.work_manager
                .as_ref()
                .map(|work_manager| work_manager.query(requests, options))
        };
        (block_rx, error_rx)
    }

    /// Whether the address has been banned for serving invalid data.
    pub fn is_banned(&self, addr: &str) -> bool {
        self.pool.is_banned(addr)
    }

    /// Number of currently connected query peers.
    pub fn connected_count(&self) -> usize {
        self.pool.connected_count()
    }
}

/// Build the response handler the work manager calls for every message
/// received on a peer with an outstanding request.
fn response_handler(
    registry: Arc<PendingBlocks>,
    pool: Arc<PeerPool>,
    params: Arc<ChainParams>,
    time_source: Arc<MedianTime>,
    fanout: Arc<Mutex<JoinSet<()>>>,
    shutdown: CancellationToken,
) -> ResponseHandler {
    Arc::new(move |request, response, peer_addr| {
        const NO_PROGRESS: Progress = Progress {
            progressed: false,
            finished: false,
        };

        // Only block messages answer our queries.
        let NetworkMessage::Block(block) = response else {
            return NO_PROGRESS;
        };
        // And we only ever issue getdata requests.
        let NetworkMessage::GetData(get_data) = request else {
            return NO_PROGRESS;
        };

        let outcome = registry.resolve(block, get_data, |block| {
            check_block_sanity(block, &params.pow_limit, &time_source)
        });

        match outcome {
            ResolveOutcome::NotPending => NO_PROGRESS,
            ResolveOutcome::Invalid(err) => {
                warn!(
                    block = %block.block_hash(),
                    peer = %peer_addr,
                    error = %err,
                    "Received invalid block from peer"
                );
                // The ban disconnects the peer; the work manager reroutes
                // the request to another one.
                pool.ban(peer_addr);
                NO_PROGRESS
            }
            ResolveOutcome::Delivered {
                receivers,
                finished,
            } => {
                // Fan out off the worker thread so a slow caller cannot
                // stall the work manager's job queue.
                let block = block.clone();
                let shutdown = shutdown.clone();
                let mut fanout = fanout.lock();
                while fanout.try_join_next().is_some() {}
                fanout.spawn(async move {
                    for receiver in receivers {
                        tokio::select! {
                            res = receiver.send(block.clone()) => {
                                // A caller that dropped its channel simply
                                // misses the block.
                                let _ = res;
                            }
                            _ = shutdown.cancelled() => return,
                        }
                    }
                });
                Progress {
                    progressed: true,
                    finished,
                }
            }
        }
    })
}
