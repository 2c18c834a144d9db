use crate::error::LedgerError;
use std::collections::HashSet;

use super::chain::{Block, ProofOfWork, GENESIS_PREVIOUS_HASH};

/// Check that a block's stored hash matches its content and meets the proof-of-work target.
pub fn verify_block(block: &Block, pow: &ProofOfWork) -> Result<(), LedgerError> {
    let recomputed = block.compute_hash()?;
    if recomputed != block.hash {
        return Err(LedgerError::ChainIntegrityViolation(format!(
            "Block {} hash mismatch. Stored {}, recomputed {}.",
            block.index, block.hash, recomputed
        )));
    }
    if !pow.is_satisfied_by(&block.hash) {
        return Err(LedgerError::ChainIntegrityViolation(format!(
            "Block {} hash {} does not meet proof-of-work prefix {:?}.",
            block.index, block.hash, pow.prefix
        )));
    }
    Ok(())
}

/// Walk a block sequence checking genesis shape, index continuity, hash
/// linkage and every block's proof-of-work.
pub fn verify_chain(blocks: &[Block], pow: &ProofOfWork) -> Result<(), LedgerError> {
    let genesis = blocks
        .first()
        .ok_or_else(|| LedgerError::ChainIntegrityViolation("Chain has no genesis block.".to_string()))?;

    if genesis.index != 0 || genesis.previous_hash != GENESIS_PREVIOUS_HASH || !genesis.transactions.is_empty() {
        return Err(LedgerError::ChainIntegrityViolation(
            "Genesis block must have index 0, previous hash \"0\" and no transactions.".to_string(),
        ));
    }

    for (position, block) in blocks.iter().enumerate() {
        if block.index != position as u64 {
            return Err(LedgerError::ChainIntegrityViolation(format!(
                "Block at position {} carries index {}.",
                position, block.index
            )));
        }
        if position > 0 {
            let previous = &blocks[position - 1];
            if block.previous_hash != previous.hash {
                return Err(LedgerError::ChainIntegrityViolation(format!(
                    "Block {} previous hash {} does not match block {} hash {}.",
                    block.index, block.previous_hash, previous.index, previous.hash
                )));
            }
            if block.transactions.is_empty() {
                return Err(LedgerError::ChainIntegrityViolation(format!(
                    "Block {} carries no transactions.",
                    block.index
                )));
            }
        }
        verify_block(block, pow)?;
    }
    Ok(())
}

/// Like [`verify_chain`], as a plain predicate.
pub fn is_valid_chain(blocks: &[Block], pow: &ProofOfWork) -> bool {
    verify_chain(blocks, pow).is_ok()
}

/// Record every `tx_id` in `blocks` into `seen`, failing on the first repeat.
pub fn collect_tx_ids<'a>(
    blocks: impl IntoIterator<Item = &'a Block>,
    seen: &mut HashSet<String>,
) -> Result<(), LedgerError> {
    for block in blocks {
        for record in &block.transactions {
            if !seen.insert(record.tx_id.clone()) {
                return Err(LedgerError::ChainIntegrityViolation(format!(
                    "Transaction {} appears in more than one block (again in block {}).",
                    record.tx_id, block.index
                )));
            }
        }
    }
    Ok(())
}
