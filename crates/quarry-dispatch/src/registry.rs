//! Pending block requests and inventory batching.
//!
//! The registry maps every block hash with at least one waiting caller to
//! the delivery channels of those callers. A hash enters the map when the
//! first caller asks for it and leaves atomically with a validated
//! delivery, so two callers asking for the same block produce exactly one
//! network request but both get the block.

use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use quarry_chain::{Block, BlockHash, ValidationError};
use quarry_net::{GetDataMessage, InvVect, NetworkMessage, MAX_INV_PER_MSG};

use crate::work::{Request, ResponseHandler};

/// What a locked lookup of an incoming block concluded.
#[derive(Debug)]
pub enum ResolveOutcome {
    /// Nobody asked for this block (stale or unsolicited).
    NotPending,
    /// The block failed sanity validation; the pending entry is kept so a
    /// retry on another peer can still satisfy the callers.
    Invalid(ValidationError),
    /// The block was accepted; the entry was removed and these channels
    /// await delivery. `finished` is true when no other hash of the
    /// originating request is still pending.
    Delivered {
        receivers: Vec<mpsc::Sender<Block>>,
        finished: bool,
    },
}

/// Registry of blocks with outstanding callers.
pub struct PendingBlocks {
    pending: Mutex<HashMap<BlockHash, Vec<mpsc::Sender<Block>>>>,
    max_request_invs: usize,
}

impl PendingBlocks {
    /// Create a registry batching inventory at `max_request_invs` entries
    /// per request (clamped to the protocol limit).
    pub fn new(max_request_invs: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            max_request_invs: max_request_invs.min(MAX_INV_PER_MSG),
        }
    }

    /// Register a caller for `hashes` and assemble the inventory requests.
    ///
    /// The returned channel is buffered to the full requested count, so
    /// delivery never blocks on a slow reader. Hashes already pending from
    /// an earlier caller are not re-requested; the in-flight work satisfies
    /// them, and this caller's channel is simply added to their entries.
    pub fn new_request(
        &self,
        hashes: &[BlockHash],
        handler: &ResponseHandler,
    ) -> (Vec<Request>, mpsc::Receiver<Block>) {
        let (block_tx, block_rx) = mpsc::channel(hashes.len().max(1));

        let mut requests = Vec::new();
        let mut get_data = GetDataMessage::new();
        let mut pending = self.pending.lock();

        for (i, hash) in hashes.iter().enumerate() {
            match pending.entry(*hash) {
                Entry::Vacant(entry) => {
                    debug!(block = %hash, "Queuing new block for request");
                    get_data.inventory.push(InvVect::block(*hash));
                    entry.insert(vec![block_tx.clone()]);
                }
                Entry::Occupied(mut entry) => {
                    debug!(block = %hash, "Joining pending query for block");
                    entry.get_mut().push(block_tx.clone());
                }
            }

            // Emit the batch at the size limit, or at the end of the input
            // if anything accumulated.
            if (!get_data.is_empty() && i == hashes.len() - 1)
                || get_data.len() == self.max_request_invs
            {
                requests.push(Request {
                    message: NetworkMessage::GetData(std::mem::take(&mut get_data)),
                    handle_response: Arc::clone(handler),
                });
            }
        }

        (requests, block_rx)
    }

    /// Look up an incoming block under the registry lock, validate it, and
    /// on success atomically remove its entry.
    ///
    /// `validate` runs while the lock is held: removal must be atomic with
    /// validation so a concurrent [`PendingBlocks::new_request`] cannot
    /// observe a half-removed hash. Validation is pure CPU work.
    pub fn resolve(
        &self,
        block: &Block,
        request: &GetDataMessage,
        validate: impl FnOnce(&Block) -> Result<(), ValidationError>,
    ) -> ResolveOutcome {
        let hash = block.block_hash();
        let mut pending = self.pending.lock();

        if !pending.contains_key(&hash) {
            return ResolveOutcome::NotPending;
        }

        if let Err(err) = validate(block) {
            return ResolveOutcome::Invalid(err);
        }

        let receivers = pending.remove(&hash).unwrap_or_default();

        // The request finishes as a whole only once none of its other
        // inventory entries are still awaited.
        let finished = !request
            .inventory
            .iter()
            .any(|inv| pending.contains_key(&inv.hash));

        ResolveOutcome::Delivered {
            receivers,
            finished,
        }
    }

    /// Number of block hashes currently awaited.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether the given hash has waiting callers.
    pub fn is_pending(&self, hash: &BlockHash) -> bool {
        self.pending.lock().contains_key(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::Progress;
    use quarry_chain::sha256d;

    fn noop_handler() -> ResponseHandler {
        Arc::new(|_, _, _| Progress {
            progressed: false,
            finished: false,
        })
    }

    fn hash(tag: u8) -> BlockHash {
        BlockHash(sha256d(&[tag]))
    }

    fn inv_hashes(request: &Request) -> Vec<BlockHash> {
        match &request.message {
            NetworkMessage::GetData(get_data) => {
                get_data.inventory.iter().map(|inv| inv.hash).collect()
            }
            other => panic!("expected getdata, got {}", other.command()),
        }
    }

    fn dummy_block() -> Block {
        use quarry_chain::{BlockHeader, Transaction, TxIn, TxOut};
        Block {
            header: BlockHeader {
                version: 4,
                prev_block: BlockHash::zero(),
                merkle_root: BlockHash::zero(),
                timestamp: 0,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions: vec![Transaction {
                version: 1,
                inputs: vec![TxIn {
                    prev_txid: BlockHash::zero(),
                    prev_vout: u32::MAX,
                    script_sig: vec![0x01],
                    sequence: u32::MAX,
                    witness: Vec::new(),
                }],
                outputs: vec![TxOut {
                    value: 0,
                    script_pubkey: vec![0x51],
                }],
                lock_time: 0,
            }],
        }
    }

    #[test]
    fn test_batches_split_at_limit_in_input_order() {
        let registry = PendingBlocks::new(2);
        let handler = noop_handler();
        let hashes: Vec<BlockHash> = (1u8..=5).map(hash).collect();

        let (requests, _blocks) = registry.new_request(&hashes, &handler);

        assert_eq!(requests.len(), 3);
        assert_eq!(inv_hashes(&requests[0]), vec![hashes[0], hashes[1]]);
        assert_eq!(inv_hashes(&requests[1]), vec![hashes[2], hashes[3]]);
        assert_eq!(inv_hashes(&requests[2]), vec![hashes[4]]);
        assert_eq!(registry.pending_count(), 5);
    }

    #[test]
    fn test_pending_hashes_not_rerequested() {
        let registry = PendingBlocks::new(MAX_INV_PER_MSG);
        let handler = noop_handler();
        let (h1, h2, h3) = (hash(1), hash(2), hash(3));

        let (first, _blocks_a) = registry.new_request(&[h1, h2], &handler);
        assert_eq!(first.len(), 1);
        assert_eq!(inv_hashes(&first[0]), vec![h1, h2]);

        // The second caller overlaps on h2: only h3 needs the network.
        let (second, _blocks_b) = registry.new_request(&[h2, h3], &handler);
        assert_eq!(second.len(), 1);
        assert_eq!(inv_hashes(&second[0]), vec![h3]);
        assert_eq!(registry.pending_count(), 3);
    }

    #[test]
    fn test_fully_pending_query_emits_no_requests() {
        let registry = PendingBlocks::new(MAX_INV_PER_MSG);
        let handler = noop_handler();
        let h1 = hash(1);

        let (_first, _blocks_a) = registry.new_request(&[h1], &handler);
        let (second, _blocks_b) = registry.new_request(&[h1], &handler);
        assert!(second.is_empty());
    }

    #[test]
    fn test_trailing_duplicates_do_not_emit_empty_batch() {
        let registry = PendingBlocks::new(2);
        let handler = noop_handler();
        let (h1, h2) = (hash(1), hash(2));

        let (_first, _blocks_a) = registry.new_request(&[h1], &handler);
        // h2 is new, h1 already pending: one batch carrying only h2, and no
        // empty trailing batch for h1's slot.
        let (second, _blocks_b) = registry.new_request(&[h2, h1], &handler);
        assert_eq!(second.len(), 1);
        assert_eq!(inv_hashes(&second[0]), vec![h2]);
    }

    #[test]
    fn test_resolve_unknown_block_is_not_pending() {
        let registry = PendingBlocks::new(MAX_INV_PER_MSG);
        let block = dummy_block();
        let request = GetDataMessage::new();
        let outcome = registry.resolve(&block, &request, |_| Ok(()));
        assert!(matches!(outcome, ResolveOutcome::NotPending));
    }

    #[tokio::test]
    async fn test_resolve_delivers_to_all_callers() {
        let registry = PendingBlocks::new(MAX_INV_PER_MSG);
        let handler = noop_handler();
        let block = dummy_block();
        let block_hash = block.block_hash();

        let (requests, mut blocks_a) = registry.new_request(&[block_hash], &handler);
        let (_none, mut blocks_b) = registry.new_request(&[block_hash], &handler);

        let request = match &requests[0].message {
            NetworkMessage::GetData(get_data) => get_data.clone(),
            _ => unreachable!(),
        };
        let outcome = registry.resolve(&block, &request, |_| Ok(()));
        let ResolveOutcome::Delivered {
            receivers,
            finished,
        } = outcome
        else {
            panic!("expected delivery");
        };
        assert!(finished);
        assert_eq!(receivers.len(), 2);
        assert!(!registry.is_pending(&block_hash));

        for receiver in receivers {
            receiver.send(block.clone()).await.unwrap();
        }
        assert_eq!(blocks_a.recv().await.unwrap().block_hash(), block_hash);
        assert_eq!(blocks_b.recv().await.unwrap().block_hash(), block_hash);
    }

    #[test]
    fn test_resolve_invalid_block_keeps_entry() {
        let registry = PendingBlocks::new(MAX_INV_PER_MSG);
        let handler = noop_handler();
        let block = dummy_block();
        let block_hash = block.block_hash();

        let (requests, _blocks) = registry.new_request(&[block_hash], &handler);
        let request = match &requests[0].message {
            NetworkMessage::GetData(get_data) => get_data.clone(),
            _ => unreachable!(),
        };

        let outcome = registry.resolve(&block, &request, |_| {
            Err(ValidationError::NoTransactions)
        });
        assert!(matches!(outcome, ResolveOutcome::Invalid(_)));
        // The retry on another peer still has callers to satisfy.
        assert!(registry.is_pending(&block_hash));
    }

    #[test]
    fn test_requery_after_delivery_hits_the_network_again() {
        let registry = PendingBlocks::new(MAX_INV_PER_MSG);
        let handler = noop_handler();
        let block = dummy_block();
        let block_hash = block.block_hash();

        let (requests, _blocks) = registry.new_request(&[block_hash], &handler);
        let request = match &requests[0].message {
            NetworkMessage::GetData(get_data) => get_data.clone(),
            _ => unreachable!(),
        };
        let outcome = registry.resolve(&block, &request, |_| Ok(()));
        assert!(matches!(outcome, ResolveOutcome::Delivered { .. }));

        // Nothing is cached: a later caller triggers a fresh fetch.
        let (again, _blocks) = registry.new_request(&[block_hash], &handler);
        assert_eq!(again.len(), 1);
        assert_eq!(inv_hashes(&again[0]), vec![block_hash]);
    }

    #[test]
    fn test_resolve_reports_unfinished_while_siblings_pending() {
        let registry = PendingBlocks::new(MAX_INV_PER_MSG);
        let handler = noop_handler();
        let block = dummy_block();
        let sibling = hash(99);

        let (requests, _blocks) =
            registry.new_request(&[block.block_hash(), sibling], &handler);
        let request = match &requests[0].message {
            NetworkMessage::GetData(get_data) => get_data.clone(),
            _ => unreachable!(),
        };

        let ResolveOutcome::Delivered { finished, .. } =
            registry.resolve(&block, &request, |_| Ok(()))
        else {
            panic!("expected delivery");
        };
        assert!(!finished, "sibling hash is still awaited");
        assert!(registry.is_pending(&sibling));
    }
}
