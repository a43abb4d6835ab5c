//! Stateless block sanity validation.
//!
//! These checks establish that a block is structurally plausible without
//! reference to any chain state: the proof of work meets its own target and
//! the chain limit, the timestamp is not absurdly far in the future, and the
//! transaction list is internally consistent with the header. Connecting the
//! block to a chain is someone else's job.

use crate::block::Block;
use crate::error::{ValidationError, ValidationResult};
use crate::hash::BlockHash;
use crate::timesource::MedianTime;
use crate::{BlockHeader, MAX_FUTURE_BLOCK_TIME_SECS};
use num_bigint::BigUint;
use num_traits::Zero;
use std::collections::HashSet;

/// Decode a compact-encoded target into the full 256-bit value.
///
/// Returns `None` for encodings with the sign bit set or a zero mantissa;
/// neither describes a target any block can meet.
pub fn compact_to_target(bits: u32) -> Option<BigUint> {
    let mantissa = bits & 0x007f_ffff;
    if mantissa == 0 || bits & 0x0080_0000 != 0 {
        return None;
    }

    let exponent = bits >> 24;
    let target = if exponent <= 3 {
        BigUint::from(mantissa >> (8 * (3 - exponent)))
    } else {
        BigUint::from(mantissa) << (8 * (exponent - 3))
    };

    if target.is_zero() {
        None
    } else {
        Some(target)
    }
}

/// Check that a header's hash satisfies its own claimed target and that the
/// target does not exceed the chain's proof-of-work limit.
pub fn check_proof_of_work(
    header: &BlockHeader,
    pow_limit: &BigUint,
) -> ValidationResult<()> {
    let target = compact_to_target(header.bits)
        .ok_or(ValidationError::InvalidTarget { bits: header.bits })?;

    if &target > pow_limit {
        return Err(ValidationError::TargetAboveLimit { bits: header.bits });
    }

    let hash = header.block_hash();
    // Hashes compare as little-endian integers.
    if BigUint::from_bytes_le(hash.as_bytes()) > target {
        return Err(ValidationError::InsufficientPow { hash });
    }

    Ok(())
}

/// Run the full set of stateless sanity checks against a block.
///
/// Pure CPU work on an in-memory block; callers may hold locks across it.
pub fn check_block_sanity(
    block: &Block,
    pow_limit: &BigUint,
    time_source: &MedianTime,
) -> ValidationResult<()> {
    check_proof_of_work(&block.header, pow_limit)?;

    let adjusted = time_source.adjusted_time();
    let timestamp = i64::from(block.header.timestamp);
    if timestamp > adjusted + MAX_FUTURE_BLOCK_TIME_SECS {
        return Err(ValidationError::TimestampTooFar { timestamp, adjusted });
    }

    if block.transactions.is_empty() {
        return Err(ValidationError::NoTransactions);
    }
    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::MissingCoinbase);
    }
    for (index, tx) in block.transactions.iter().enumerate().skip(1) {
        if tx.is_coinbase() {
            return Err(ValidationError::UnexpectedCoinbase { index });
        }
    }

    let mut txids: Vec<BlockHash> = Vec::with_capacity(block.transactions.len());
    let mut seen: HashSet<BlockHash> = HashSet::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        let txid = tx.txid();
        if !seen.insert(txid) {
            return Err(ValidationError::DuplicateTransaction { txid });
        }
        txids.push(txid);
    }

    let computed = crate::block::merkle_root(&txids);
    if computed != block.header.merkle_root {
        return Err(ValidationError::MerkleMismatch {
            computed,
            expected: block.header.merkle_root,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{merkle_root, Transaction, TxIn, TxOut};
    use crate::params::ChainParams;
    use crate::BlockHeader;

    /// Compact bits used by regtest blocks; decodes near the regtest limit.
    const REGTEST_BITS: u32 = 0x207f_ffff;

    fn coinbase(tag: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prev_txid: BlockHash::zero(),
                prev_vout: u32::MAX,
                script_sig: vec![tag],
                sequence: u32::MAX,
                witness: Vec::new(),
            }],
            outputs: vec![TxOut {
                value: 50_0000_0000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn spend(tag: u8) -> Transaction {
        Transaction {
            version: 2,
            inputs: vec![TxIn {
                prev_txid: BlockHash(crate::sha256d(&[tag])),
                prev_vout: 0,
                script_sig: Vec::new(),
                sequence: u32::MAX,
                witness: Vec::new(),
            }],
            outputs: vec![TxOut {
                value: 1_0000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    /// Assemble a block over `transactions` and grind the nonce until the
    /// regtest target is met. The easy target makes this a handful of tries.
    fn mine_block(transactions: Vec<Transaction>, timestamp: u32) -> Block {
        let txids: Vec<BlockHash> = transactions.iter().map(|tx| tx.txid()).collect();
        let mut header = BlockHeader {
            version: 4,
            prev_block: BlockHash::zero(),
            merkle_root: merkle_root(&txids),
            timestamp,
            bits: REGTEST_BITS,
            nonce: 0,
        };
        let params = ChainParams::regtest();
        while check_proof_of_work(&header, &params.pow_limit).is_err() {
            header.nonce += 1;
        }
        Block {
            header,
            transactions,
        }
    }

    fn now_ts() -> u32 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32
    }

    #[test]
    fn test_compact_target_decodes_known_values() {
        // Exponent 3 keeps the mantissa as-is.
        assert_eq!(compact_to_target(0x0300_ffff), Some(BigUint::from(0xffffu32)));
        // The classic genesis difficulty.
        let genesis = compact_to_target(0x1d00_ffff).unwrap();
        assert_eq!(genesis, BigUint::from(0xffffu32) << (8 * 26));
    }

    #[test]
    fn test_compact_target_rejects_degenerate_encodings() {
        assert_eq!(compact_to_target(0x0400_0000), None); // zero mantissa
        assert_eq!(compact_to_target(0x0480_0001), None); // sign bit
        assert_eq!(compact_to_target(0x0100_0012), None); // shifts to zero
    }

    #[test]
    fn test_valid_block_passes_sanity() {
        let block = mine_block(vec![coinbase(1), spend(2)], now_ts());
        let params = ChainParams::regtest();
        let time = MedianTime::new();
        assert_eq!(check_block_sanity(&block, &params.pow_limit, &time), Ok(()));
    }

    #[test]
    fn test_target_above_chain_limit_rejected() {
        let block = mine_block(vec![coinbase(1)], now_ts());
        // Mainnet's limit is far below the regtest bits the block carries.
        let params = ChainParams::mainnet();
        let time = MedianTime::new();
        assert_eq!(
            check_block_sanity(&block, &params.pow_limit, &time),
            Err(ValidationError::TargetAboveLimit { bits: REGTEST_BITS })
        );
    }

    #[test]
    fn test_insufficient_pow_rejected() {
        let mut block = mine_block(vec![coinbase(1)], now_ts());
        // A nonce that no longer meets even the regtest target exists within
        // a few tries of the mined one; find it.
        let params = ChainParams::regtest();
        loop {
            block.header.nonce = block.header.nonce.wrapping_add(1);
            if check_proof_of_work(&block.header, &params.pow_limit).is_err() {
                break;
            }
        }
        let time = MedianTime::new();
        let err = check_block_sanity(&block, &params.pow_limit, &time).unwrap_err();
        assert!(matches!(err, ValidationError::InsufficientPow { .. }));
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let far_future = now_ts() + (MAX_FUTURE_BLOCK_TIME_SECS as u32) + 600;
        let block = mine_block(vec![coinbase(1)], far_future);
        let params = ChainParams::regtest();
        let time = MedianTime::new();
        let err = check_block_sanity(&block, &params.pow_limit, &time).unwrap_err();
        assert!(matches!(err, ValidationError::TimestampTooFar { .. }));
    }

    #[test]
    fn test_missing_coinbase_rejected() {
        let block = mine_block(vec![spend(1)], now_ts());
        let params = ChainParams::regtest();
        let time = MedianTime::new();
        assert_eq!(
            check_block_sanity(&block, &params.pow_limit, &time),
            Err(ValidationError::MissingCoinbase)
        );
    }

    #[test]
    fn test_second_coinbase_rejected() {
        let block = mine_block(vec![coinbase(1), coinbase(2)], now_ts());
        let params = ChainParams::regtest();
        let time = MedianTime::new();
        assert_eq!(
            check_block_sanity(&block, &params.pow_limit, &time),
            Err(ValidationError::UnexpectedCoinbase { index: 1 })
        );
    }

    #[test]
    fn test_duplicate_transaction_rejected() {
        let block = mine_block(vec![coinbase(1), spend(2), spend(2)], now_ts());
        let params = ChainParams::regtest();
        let time = MedianTime::new();
        let err = check_block_sanity(&block, &params.pow_limit, &time).unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateTransaction { .. }));
    }

    #[test]
    fn test_tampered_merkle_root_rejected() {
        let mut block = mine_block(vec![coinbase(1), spend(2)], now_ts());
        // Swap in a transaction the header never committed to. The header
        // itself is untouched, so only the merkle check can fail.
        block.transactions[1] = spend(9);
        let params = ChainParams::regtest();
        let time = MedianTime::new();
        let err = check_block_sanity(&block, &params.pow_limit, &time).unwrap_err();
        assert!(matches!(err, ValidationError::MerkleMismatch { .. }));
    }
}
