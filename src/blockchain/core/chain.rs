use crate::error::{LedgerError, Result};
use crate::hasher::block_digest;
use crate::transaction::PendingRecord;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::validation::{verify_block, verify_chain};

/// `previous_hash` of every genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";
pub const DEFAULT_POW_PREFIX: &str = "00";
pub const DEFAULT_MAX_NONCE: u64 = 50_000_000;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Proof-of-work predicate: a block hash must start with `prefix`.
///
/// This is an anti-spam throttle, not a security mechanism. `max_nonce`
/// bounds the search so a bad prefix cannot stall the ledger forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOfWork {
    pub prefix: String,
    pub max_nonce: u64,
}

impl Default for ProofOfWork {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_POW_PREFIX.to_string(),
            max_nonce: DEFAULT_MAX_NONCE,
        }
    }
}

impl ProofOfWork {
    pub fn new(prefix: impl Into<String>, max_nonce: u64) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.len() > 8 {
            return Err(LedgerError::Config(format!(
                "pow_prefix must be 1 to 8 characters, got {:?}",
                prefix
            )));
        }
        if !prefix.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(LedgerError::Config(format!(
                "pow_prefix must be lowercase hex, got {:?}",
                prefix
            )));
        }
        if max_nonce == 0 {
            return Err(LedgerError::Config("max_nonce must be greater than zero".to_string()));
        }
        Ok(Self { prefix, max_nonce })
    }

    pub fn is_satisfied_by(&self, hash: &str) -> bool {
        hash.starts_with(&self.prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub timestamp: u64,
    pub transactions: Vec<PendingRecord>,
    pub previous_hash: String,
    pub nonce: u64,
    pub hash: String,
}

impl Block {
    /// Recompute the digest of this block's content fields.
    pub fn compute_hash(&self) -> Result<String> {
        block_digest(
            self.index,
            self.timestamp,
            &self.transactions,
            &self.previous_hash,
            self.nonce,
        )
    }

    /// Build and mine a block stamped with the current time.
    pub fn seal(
        index: u64,
        previous_hash: &str,
        transactions: Vec<PendingRecord>,
        pow: &ProofOfWork,
    ) -> Result<Block> {
        Self::seal_at(index, now_millis(), previous_hash, transactions, pow)
    }

    /// Mine a block with a fixed timestamp: nonces are tried from 0 upward
    /// until the hash satisfies `pow`. Identical inputs give identical blocks.
    pub fn seal_at(
        index: u64,
        timestamp: u64,
        previous_hash: &str,
        transactions: Vec<PendingRecord>,
        pow: &ProofOfWork,
    ) -> Result<Block> {
        for nonce in 0..pow.max_nonce {
            let hash = block_digest(index, timestamp, &transactions, previous_hash, nonce)?;
            if pow.is_satisfied_by(&hash) {
                debug!("Sealed block {} with nonce {} ({})", index, nonce, hash);
                return Ok(Block {
                    index,
                    timestamp,
                    transactions,
                    previous_hash: previous_hash.to_string(),
                    nonce,
                    hash,
                });
            }
        }

        Err(LedgerError::NonceExhausted {
            index,
            max_nonce: pow.max_nonce,
        })
    }

    pub fn genesis(pow: &ProofOfWork) -> Result<Block> {
        Self::seal(0, GENESIS_PREVIOUS_HASH, Vec::new(), pow)
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }
}

/// An append-only, hash-linked sequence of blocks that always starts with a genesis block.
#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    blocks: Vec<Block>,
    pow: ProofOfWork,
}

impl Chain {
    /// A fresh chain holding only a newly mined genesis block.
    pub fn new(pow: ProofOfWork) -> Result<Self> {
        let genesis = Block::genesis(&pow)?;
        Ok(Self {
            blocks: vec![genesis],
            pow,
        })
    }

    /// Adopt previously stored blocks after checking every link and proof.
    pub fn from_blocks(blocks: Vec<Block>, pow: ProofOfWork) -> Result<Self> {
        verify_chain(&blocks, &pow)?;
        Ok(Self { blocks, pow })
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<Block> {
        self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn last(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn get(&self, index: u64) -> Option<&Block> {
        self.blocks.get(usize::try_from(index).ok()?)
    }

    pub fn pow(&self) -> &ProofOfWork {
        &self.pow
    }

    /// Mine a block on top of the current tail and append it.
    pub fn seal_next(&mut self, transactions: Vec<PendingRecord>) -> Result<Block> {
        let (index, previous_hash) = match self.blocks.last() {
            Some(last) => (last.index + 1, last.hash.clone()),
            None => (0, GENESIS_PREVIOUS_HASH.to_string()),
        };
        let block = Block::seal(index, &previous_hash, transactions, &self.pow)?;
        self.append(block.clone())?;
        Ok(block)
    }

    /// Append a sealed block. It must extend the current tail.
    pub fn append(&mut self, block: Block) -> Result<()> {
        match self.blocks.last() {
            Some(last) => {
                if block.index != last.index + 1 {
                    return Err(LedgerError::ChainIntegrityViolation(format!(
                        "Invalid block index. Expected {}, but got {}.",
                        last.index + 1,
                        block.index
                    )));
                }
                if block.previous_hash != last.hash {
                    return Err(LedgerError::ChainIntegrityViolation(format!(
                        "Invalid previous block hash. Expected {}, but got {}.",
                        last.hash, block.previous_hash
                    )));
                }
            }
            None => {
                if block.index != 0 || block.previous_hash != GENESIS_PREVIOUS_HASH {
                    return Err(LedgerError::ChainIntegrityViolation(
                        "First block of a chain must be a genesis block.".to_string(),
                    ));
                }
            }
        }

        verify_block(&block, &self.pow)?;
        self.blocks.push(block);
        Ok(())
    }

    /// Walk the whole chain checking linkage and proof-of-work.
    pub fn verify(&self) -> bool {
        verify_chain(&self.blocks, &self.pow).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{TransactionRequest, TxStatus};
    use serde_json::json;

    fn cheap_pow() -> ProofOfWork {
        ProofOfWork::new("0", 1_000_000).unwrap()
    }

    fn record(tx_id: &str) -> PendingRecord {
        PendingRecord {
            tx_id: tx_id.to_string(),
            tx: TransactionRequest::from_parts(
                "register_vehicle",
                json!({"vin": "VIN1", "owner": "dana"}),
                "dana",
                1,
            )
            .unwrap(),
            time_submitted: 1,
            status: TxStatus::Accepted,
        }
    }

    #[test]
    fn test_genesis_shape() {
        let pow = cheap_pow();
        let chain = Chain::new(pow.clone()).unwrap();
        let genesis = &chain.blocks()[0];
        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.previous_hash, GENESIS_PREVIOUS_HASH);
        assert!(genesis.transactions.is_empty());
        assert!(pow.is_satisfied_by(&genesis.hash));
        assert!(chain.verify());
    }

    #[test]
    fn test_seal_is_deterministic() {
        let pow = cheap_pow();
        let a = Block::seal_at(3, 1_700_000_000_000, "abc", vec![record("t1")], &pow).unwrap();
        let b = Block::seal_at(3, 1_700_000_000_000, "abc", vec![record("t1")], &pow).unwrap();
        assert_eq!(a.nonce, b.nonce);
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.hash, a.compute_hash().unwrap());
    }

    #[test]
    fn test_seal_next_links_to_tail() {
        let mut chain = Chain::new(cheap_pow()).unwrap();
        let first = chain.seal_next(vec![record("t1")]).unwrap();
        let second = chain.seal_next(vec![record("t2")]).unwrap();
        assert_eq!(first.index, 1);
        assert_eq!(second.previous_hash, first.hash);
        assert_eq!(chain.len(), 3);
        assert!(chain.verify());
    }

    #[test]
    fn test_append_rejects_wrong_previous_hash() {
        let pow = cheap_pow();
        let mut chain = Chain::new(pow.clone()).unwrap();
        let stray = Block::seal(1, "not-the-tail", vec![record("t1")], &pow).unwrap();
        let result = chain.append(stray);
        assert!(matches!(result, Err(LedgerError::ChainIntegrityViolation(_))));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_tampered_block_fails_verification() {
        let mut chain = Chain::new(cheap_pow()).unwrap();
        chain.seal_next(vec![record("t1")]).unwrap();

        chain.seal_next(vec![record("t2")]).unwrap();
        let tampers: [fn(&mut Block); 7] = [
            |b| b.timestamp += 1,
            |b| b.nonce += 1,
            |b| b.index += 1,
            |b| b.previous_hash = "0".repeat(64),
            |b| b.transactions[0].tx_id = "forged".to_string(),
            |b| b.transactions[0].time_submitted += 1,
            |b| b.hash = "0".repeat(64),
        ];

        for tamper in tampers {
            let mut blocks = chain.clone().into_blocks();
            tamper(&mut blocks[1]);
            assert!(Chain::from_blocks(blocks, cheap_pow()).is_err());
        }
        assert!(Chain::from_blocks(chain.into_blocks(), cheap_pow()).is_ok());
    }

    #[test]
    fn test_nonce_bound_is_enforced() {
        let pow = ProofOfWork::new("ffffffff", 10).unwrap();
        let result = Block::genesis(&pow);
        assert!(matches!(result, Err(LedgerError::NonceExhausted { index: 0, max_nonce: 10 })));
    }

    #[test]
    fn test_pow_prefix_validation() {
        assert!(ProofOfWork::new("", 10).is_err());
        assert!(ProofOfWork::new("0G", 10).is_err());
        assert!(ProofOfWork::new("00", 0).is_err());
        assert!(ProofOfWork::new("0a", 10).is_ok());
    }
}
