//! Peer-backed query dispatch.
//!
//! The work manager pairs queued requests with connected peers. Each peer
//! advertised by the pool gets a worker task; a coordinator task queues
//! incoming query batches, hands each request to the best-ranked idle
//! worker, and reroutes requests whose peer timed out, disconnected, or
//! answered with something the response handler rejected. A request whose
//! retry budget runs out produces one error on its batch's error channel;
//! requests that already succeeded are unaffected.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use quarry_net::{NetworkMessage, QueryPeer};

use crate::ranking::PeerRanking;

/// How a response handler judged one incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// The message moved the request forward (it answered part of it).
    pub progressed: bool,
    /// The request as a whole is satisfied; the worker is free again.
    pub finished: bool,
}

/// Judges every message a peer sends while it owns a request.
///
/// Arguments: the request message, the received message, the peer address.
/// Runs on the worker task; it must validate and return quickly, handing any
/// heavier processing off to another task.
pub type ResponseHandler =
    Arc<dyn Fn(&NetworkMessage, &NetworkMessage, &str) -> Progress + Send + Sync>;

/// One dispatchable request.
pub struct Request {
    /// The message to send to the chosen peer.
    pub message: NetworkMessage,
    /// Handler deciding when the request is answered.
    pub handle_response: ResponseHandler,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("message", &self.message.command())
            .finish_non_exhaustive()
    }
}

/// Per-query knobs.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    /// How long a worker waits for a response before the request is
    /// rescheduled onto another peer. Progressing responses extend the
    /// deadline.
    pub response_timeout: Duration,
    /// How many times a request may be retried after its first attempt.
    pub max_retries: u8,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(20),
            max_retries: 2,
        }
    }
}

/// Fatal per-request failures reported on a query's error channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The request failed on every attempt the retry budget allowed.
    #[error("request {request} exhausted its retry budget after {attempts} attempts")]
    Exhausted { request: usize, attempts: u32 },

    /// The work manager was not running to take the query.
    #[error("work manager unavailable")]
    NotRunning,
}

struct QueryBatch {
    requests: Vec<Request>,
    options: QueryOptions,
    error_tx: mpsc::Sender<QueryError>,
}

struct Job {
    /// Index of the request within its batch, as reported in errors.
    index: usize,
    batch_id: u64,
    request: Arc<Request>,
    attempts: u32,
    options: QueryOptions,
}

enum JobOutcome {
    Finished,
    Timeout,
    Disconnected,
    SendFailed,
}

enum WorkerEvent {
    JobDone {
        addr: String,
        job: Job,
        outcome: JobOutcome,
    },
    Exited {
        addr: String,
    },
}

struct WorkerHandle {
    job_tx: mpsc::Sender<Job>,
    busy: bool,
}

struct BatchState {
    remaining: usize,
    error_tx: mpsc::Sender<QueryError>,
}

/// Dispatches queries over the peers advertised by the pool.
pub struct WorkManager {
    query_tx: mpsc::Sender<QueryBatch>,
    shutdown: CancellationToken,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl WorkManager {
    /// Spawn the coordinator over the given stream of connected peers.
    pub fn start(peers_rx: mpsc::Receiver<QueryPeer>, shutdown: CancellationToken) -> Self {
        let (query_tx, query_rx) = mpsc::channel(64);
        let tasks = Arc::new(Mutex::new(JoinSet::new()));

        let coordinator = Coordinator {
            peers_rx,
            query_rx,
            workers: HashMap::new(),
            ranking: PeerRanking::new(),
            work: VecDeque::new(),
            batches: HashMap::new(),
            next_batch_id: 0,
            shutdown: shutdown.clone(),
            tasks: Arc::clone(&tasks),
        };
        tasks.lock().spawn(coordinator.run());

        Self {
            query_tx,
            shutdown,
            tasks,
        }
    }

    /// Submit a batch of requests.
    ///
    /// The returned channel reports one fatal error per request whose retry
    /// budget runs out, then closes once every request in the batch is
    /// accounted for. On shutdown it closes without further errors.
    pub fn query(&self, requests: Vec<Request>, options: QueryOptions) -> mpsc::Receiver<QueryError> {
        let count = requests.len();
        let (error_tx, error_rx) = mpsc::channel(count.max(1));
        let batch = QueryBatch {
            requests,
            options,
            error_tx,
        };
        if let Err(err) = self.query_tx.try_send(batch) {
            warn!(requests = count, "Work manager rejected query batch");
            let batch = err.into_inner();
            // The channel is buffered to the request count, so these all fit.
            for _ in 0..count {
                let _ = batch.error_tx.try_send(QueryError::NotRunning);
            }
        }
        error_rx
    }

    /// Cancel outstanding work and wait for the coordinator and all workers.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        loop {
            let mut tasks = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                break;
            }
            while tasks.join_next().await.is_some() {}
        }
    }
}

struct Coordinator {
    peers_rx: mpsc::Receiver<QueryPeer>,
    query_rx: mpsc::Receiver<QueryBatch>,
    workers: HashMap<String, WorkerHandle>,
    ranking: PeerRanking,
    work: VecDeque<Job>,
    batches: HashMap<u64, BatchState>,
    next_batch_id: u64,
    shutdown: CancellationToken,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl Coordinator {
    async fn run(mut self) {
        let (events_tx, mut events_rx) = mpsc::channel::<WorkerEvent>(64);
        let mut peers_open = true;
        let mut queries_open = true;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                peer = self.peers_rx.recv(), if peers_open => match peer {
                    Some(peer) => self.register_peer(peer, &events_tx),
                    None => peers_open = false,
                },

                batch = self.query_rx.recv(), if queries_open => match batch {
                    Some(batch) => self.enqueue_batch(batch),
                    None => queries_open = false,
                },

                event = events_rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    // Unreachable: we hold a sender for the workers.
                    None => break,
                },
            }

            self.assign_work();
        }

        debug!("Work manager coordinator exited");
    }

    fn register_peer(&mut self, peer: QueryPeer, events_tx: &mpsc::Sender<WorkerEvent>) {
        let addr = peer.addr().to_string();
        if self.workers.contains_key(&addr) {
            debug!(peer = %addr, "Ignoring duplicate worker for peer");
            return;
        }

        let (job_tx, job_rx) = mpsc::channel(1);
        self.workers.insert(
            addr.clone(),
            WorkerHandle {
                job_tx,
                busy: false,
            },
        );
        self.ranking.add_peer(&addr);

        let events_tx = events_tx.clone();
        let shutdown = self.shutdown.clone();
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(worker_loop(peer, job_rx, events_tx, shutdown));
        debug!(peer = %addr, workers = self.workers.len(), "Registered query worker");
    }

    fn enqueue_batch(&mut self, batch: QueryBatch) {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        if batch.requests.is_empty() {
            return;
        }

        self.batches.insert(
            batch_id,
            BatchState {
                remaining: batch.requests.len(),
                error_tx: batch.error_tx,
            },
        );
        for (index, request) in batch.requests.into_iter().enumerate() {
            self.work.push_back(Job {
                index,
                batch_id,
                request: Arc::new(request),
                attempts: 0,
                options: batch.options,
            });
        }
        debug!(batch = batch_id, queued = self.work.len(), "Queued query batch");
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::JobDone { addr, job, outcome } => {
                if let Some(worker) = self.workers.get_mut(&addr) {
                    worker.busy = false;
                }
                match outcome {
                    JobOutcome::Finished => {
                        self.ranking.reward(&addr);
                        self.settle_request(job.batch_id);
                    }
                    JobOutcome::Timeout | JobOutcome::Disconnected | JobOutcome::SendFailed => {
                        self.ranking.punish(&addr);
                        self.retry_or_fail(job);
                    }
                }
            }
            WorkerEvent::Exited { addr } => {
                // Scores survive worker churn; a returning peer keeps its
                // track record.
                self.workers.remove(&addr);
                debug!(peer = %addr, workers = self.workers.len(), "Query worker exited");
            }
        }
    }

    /// One request of the batch finished; close the batch out once all have.
    fn settle_request(&mut self, batch_id: u64) {
        if let Some(batch) = self.batches.get_mut(&batch_id) {
            batch.remaining -= 1;
            if batch.remaining == 0 {
                // Dropping the sender closes the caller's error channel.
                self.batches.remove(&batch_id);
                debug!(batch = batch_id, "Query batch complete");
            }
        }
    }

    fn retry_or_fail(&mut self, mut job: Job) {
        job.attempts += 1;
        if job.attempts <= u32::from(job.options.max_retries) {
            debug!(
                request = job.index,
                batch = job.batch_id,
                attempts = job.attempts,
                "Rescheduling failed request"
            );
            // Retries go to the front so stalled requests recover first.
            self.work.push_front(job);
            return;
        }

        warn!(
            request = job.index,
            batch = job.batch_id,
            attempts = job.attempts,
            "Request exhausted its retry budget"
        );
        if let Some(batch) = self.batches.get(&job.batch_id) {
            let _ = batch.error_tx.try_send(QueryError::Exhausted {
                request: job.index,
                attempts: job.attempts,
            });
        }
        self.settle_request(job.batch_id);
    }

    /// Hand queued jobs to idle workers, best-ranked first.
    fn assign_work(&mut self) {
        while !self.work.is_empty() {
            let mut idle: Vec<String> = self
                .workers
                .iter()
                .filter(|(_, worker)| !worker.busy)
                .map(|(addr, _)| addr.clone())
                .collect();
            if idle.is_empty() {
                return;
            }
            self.ranking.order(&mut idle);
            let addr = &idle[0];

            let job = match self.work.pop_front() {
                Some(job) => job,
                None => return,
            };
            let worker = match self.workers.get_mut(addr) {
                Some(worker) => worker,
                None => {
                    self.work.push_front(job);
                    return;
                }
            };
            match worker.job_tx.try_send(job) {
                Ok(()) => worker.busy = true,
                Err(mpsc::error::TrySendError::Full(job)) => {
                    // An idle worker has channel capacity; treat a full
                    // channel as busy and try the next candidate.
                    worker.busy = true;
                    self.work.push_front(job);
                }
                Err(mpsc::error::TrySendError::Closed(job)) => {
                    self.work.push_front(job);
                    self.workers.remove(addr);
                }
            }
        }
    }
}

/// Serve jobs against one peer until it disconnects or shutdown.
async fn worker_loop(
    peer: QueryPeer,
    mut job_rx: mpsc::Receiver<Job>,
    events_tx: mpsc::Sender<WorkerEvent>,
    shutdown: CancellationToken,
) {
    let addr = peer.addr().to_string();
    let disconnect = peer.on_disconnect();
    let Some(mut msgs) = peer.subscribe_recv() else {
        warn!(peer = %addr, "Peer message stream already taken");
        let _ = events_tx.send(WorkerEvent::Exited { addr }).await;
        return;
    };

    'serve: loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = disconnect.cancelled() => break,
            job = job_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        if peer.send(job.request.message.clone()).await.is_err() {
            let _ = events_tx
                .send(WorkerEvent::JobDone {
                    addr: addr.clone(),
                    job,
                    outcome: JobOutcome::SendFailed,
                })
                .await;
            break;
        }

        let mut deadline = tokio::time::Instant::now() + job.options.response_timeout;
        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break 'serve,
                _ = disconnect.cancelled() => break JobOutcome::Disconnected,
                _ = tokio::time::sleep_until(deadline) => break JobOutcome::Timeout,
                msg = msgs.recv() => {
                    let Some(msg) = msg else { break JobOutcome::Disconnected };
                    let progress =
                        (job.request.handle_response)(&job.request.message, &msg, &addr);
                    if progress.finished {
                        break JobOutcome::Finished;
                    }
                    if progress.progressed {
                        // Partial answers buy the peer a fresh deadline.
                        deadline =
                            tokio::time::Instant::now() + job.options.response_timeout;
                    }
                }
            }
        };

        let disconnected = matches!(outcome, JobOutcome::Disconnected);
        if events_tx
            .send(WorkerEvent::JobDone {
                addr: addr.clone(),
                job,
                outcome,
            })
            .await
            .is_err()
        {
            break;
        }
        if disconnected {
            break;
        }
    }

    let _ = events_tx.send(WorkerEvent::Exited { addr }).await;
}
