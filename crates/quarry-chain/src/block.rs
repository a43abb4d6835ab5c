//! Block, header, and transaction structures.
//!
//! Only the pieces the dispatcher needs exist here: the canonical hashing
//! serialization (so block and transaction ids can be recomputed and checked
//! against what a peer claims) and the structural accessors used by sanity
//! validation. Script execution and chain connection are out of scope.

use crate::hash::{sha256d, BlockHash};

/// An 80-byte block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block version.
    pub version: i32,
    /// Hash of the previous block.
    pub prev_block: BlockHash,
    /// Merkle root over the block's transaction ids.
    pub merkle_root: BlockHash,
    /// Block time in unix seconds.
    pub timestamp: u32,
    /// Compact-encoded proof-of-work target.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u32,
}

impl BlockHeader {
    /// Compute the block hash: double SHA-256 over the canonical 80-byte
    /// little-endian serialization.
    pub fn block_hash(&self) -> BlockHash {
        let mut buf = Vec::with_capacity(80);
        put_i32(&mut buf, self.version);
        buf.extend_from_slice(self.prev_block.as_bytes());
        buf.extend_from_slice(self.merkle_root.as_bytes());
        put_u32(&mut buf, self.timestamp);
        put_u32(&mut buf, self.bits);
        put_u32(&mut buf, self.nonce);
        BlockHash(sha256d(&buf))
    }
}

/// A transaction input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    /// Id of the transaction whose output is spent.
    pub prev_txid: BlockHash,
    /// Output index within that transaction.
    pub prev_vout: u32,
    /// Unlocking script.
    pub script_sig: Vec<u8>,
    /// Input sequence number.
    pub sequence: u32,
    /// Segregated-witness stack. Not part of the transaction id, but
    /// required to reconstruct historical blocks post-segwit.
    pub witness: Vec<Vec<u8>>,
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    /// Output value in base units.
    pub value: i64,
    /// Locking script.
    pub script_pubkey: Vec<u8>,
}

/// A transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Transaction version.
    pub version: i32,
    /// Inputs.
    pub inputs: Vec<TxIn>,
    /// Outputs.
    pub outputs: Vec<TxOut>,
    /// Lock time.
    pub lock_time: u32,
}

impl Transaction {
    /// Compute the transaction id: double SHA-256 over the witness-stripped
    /// serialization.
    pub fn txid(&self) -> BlockHash {
        let mut buf = Vec::new();
        put_i32(&mut buf, self.version);
        put_var_int(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            buf.extend_from_slice(input.prev_txid.as_bytes());
            put_u32(&mut buf, input.prev_vout);
            put_var_int(&mut buf, input.script_sig.len() as u64);
            buf.extend_from_slice(&input.script_sig);
            put_u32(&mut buf, input.sequence);
        }
        put_var_int(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            put_i64(&mut buf, output.value);
            put_var_int(&mut buf, output.script_pubkey.len() as u64);
            buf.extend_from_slice(&output.script_pubkey);
        }
        put_u32(&mut buf, self.lock_time);
        BlockHash(sha256d(&buf))
    }

    /// A coinbase spends exactly one input referencing the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].prev_txid == BlockHash::zero()
            && self.inputs[0].prev_vout == u32::MAX
    }
}

/// A full block: header plus ordered transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Block header.
    pub header: BlockHeader,
    /// Transactions, coinbase first.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The block's content id (hash of the header).
    pub fn block_hash(&self) -> BlockHash {
        self.header.block_hash()
    }

    /// Recompute the merkle root over the block's transaction ids.
    pub fn compute_merkle_root(&self) -> BlockHash {
        let txids: Vec<BlockHash> = self.transactions.iter().map(|tx| tx.txid()).collect();
        merkle_root(&txids)
    }
}

/// Compute the merkle root of a list of transaction ids.
///
/// Each level pairs adjacent hashes with double SHA-256; an odd entry at the
/// end of a level is paired with itself. An empty list yields the zero hash.
pub fn merkle_root(txids: &[BlockHash]) -> BlockHash {
    if txids.is_empty() {
        return BlockHash::zero();
    }

    let mut level: Vec<BlockHash> = txids.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = pair[0];
            // An odd trailing entry pairs with itself.
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(left.as_bytes());
            buf[32..].copy_from_slice(right.as_bytes());
            next.push(BlockHash(sha256d(&buf)));
        }
        level = next;
    }
    level[0]
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Compact variable-length integer used for list and script lengths.
fn put_var_int(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => buf.push(value as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }
}
