//! Per-vehicle sub-chains for service records
//!
//! Each vehicle identifier gets its own genesis block and its own hash
//! linkage, independent of the global chain and of every other vehicle.
//! A sub-chain is written to storage as its own unit on every change.

use crate::blockchain::{Block, Chain, ProofOfWork};
use crate::error::Result;
use crate::persistence::Persistence;
use crate::transaction::PendingRecord;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct VehicleChains {
    chains: BTreeMap<String, Chain>,
    pow: ProofOfWork,
    persistence: Arc<dyn Persistence>,
}

impl VehicleChains {
    pub fn new(pow: ProofOfWork, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            chains: BTreeMap::new(),
            pow,
            persistence,
        }
    }

    /// Load every stored sub-chain, verifying each one.
    ///
    /// A record that cannot be decoded is skipped with a warning. A record
    /// that decodes but fails verification aborts the load.
    pub fn restore(pow: ProofOfWork, persistence: Arc<dyn Persistence>) -> Result<Self> {
        let mut chains = BTreeMap::new();
        for vin in persistence.vehicle_ids()? {
            match persistence.load_vehicle_chain(&vin) {
                Ok(Some(blocks)) => {
                    let chain = Chain::from_blocks(blocks, pow.clone())?;
                    chains.insert(vin, chain);
                }
                Ok(None) => {}
                Err(e @ crate::error::LedgerError::CorruptRecord(_)) => {
                    warn!("Ignoring unreadable sub-chain for vehicle {}: {}", vin, e);
                }
                Err(e) => return Err(e),
            }
        }
        info!("Restored {} vehicle sub-chain(s)", chains.len());
        Ok(Self {
            chains,
            pow,
            persistence,
        })
    }

    /// Create the vehicle's genesis block if it has none. Returns whether a
    /// chain was created.
    pub fn ensure(&mut self, vin: &str) -> Result<bool> {
        if self.chains.contains_key(vin) {
            return Ok(false);
        }
        let chain = Chain::new(self.pow.clone())?;
        self.persistence.save_vehicle_chain(vin, chain.blocks())?;
        self.chains.insert(vin.to_string(), chain);
        info!("Created sub-chain for vehicle {}", vin);
        Ok(true)
    }

    /// Seal a block holding exactly `record` onto the vehicle's own tail and
    /// persist the vehicle's chain.
    pub fn append_service_block(&mut self, vin: &str, record: PendingRecord) -> Result<Block> {
        let mut staged = match self.chains.get(vin) {
            Some(chain) => chain.clone(),
            None => {
                info!("Created sub-chain for vehicle {}", vin);
                Chain::new(self.pow.clone())?
            }
        };
        let block = staged.seal_next(vec![record])?;
        // In-memory state only moves once the unit is durable.
        self.persistence.save_vehicle_chain(vin, staged.blocks())?;
        self.chains.insert(vin.to_string(), staged);

        info!(
            "Appended service block {} for vehicle {} ({})",
            block.index, vin, block.hash
        );
        Ok(block)
    }

    /// The vehicle's blocks, oldest first. Empty if it has no chain yet.
    pub fn read(&self, vin: &str) -> Vec<Block> {
        self.chains
            .get(vin)
            .map(|chain| chain.blocks().to_vec())
            .unwrap_or_default()
    }

    pub fn chains(&self) -> impl Iterator<Item = (&str, &Chain)> {
        self.chains.iter().map(|(vin, chain)| (vin.as_str(), chain))
    }

    pub fn verify(&self) -> bool {
        self.chains.values().all(Chain::verify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;
    use crate::transaction::{TransactionRequest, TxStatus};
    use serde_json::json;

    fn cheap_pow() -> ProofOfWork {
        ProofOfWork::new("0", 1_000_000).unwrap()
    }

    fn service(tx_id: &str, vin: &str) -> PendingRecord {
        PendingRecord {
            tx_id: tx_id.to_string(),
            tx: TransactionRequest::from_parts(
                "add_service",
                json!({"vin": vin, "garage": "g1", "description": "brake pads"}),
                "g1",
                5,
            )
            .unwrap(),
            time_submitted: 5,
            status: TxStatus::Accepted,
        }
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let mut store = VehicleChains::new(cheap_pow(), Arc::new(InMemoryPersistence::new()));
        assert!(store.ensure("VIN1").unwrap());
        let genesis = store.read("VIN1");
        assert!(!store.ensure("VIN1").unwrap());
        assert_eq!(store.read("VIN1"), genesis);
        assert_eq!(genesis.len(), 1);
    }

    #[test]
    fn test_read_unknown_vehicle_is_empty() {
        let store = VehicleChains::new(cheap_pow(), Arc::new(InMemoryPersistence::new()));
        assert!(store.read("nope").is_empty());
    }

    #[test]
    fn test_sub_chains_are_independent() {
        let persistence = InMemoryPersistence::new();
        let mut store = VehicleChains::new(cheap_pow(), Arc::new(persistence.clone()));

        let a = store.append_service_block("VIN1", service("t1", "VIN1")).unwrap();
        let b = store.append_service_block("VIN2", service("t2", "VIN2")).unwrap();
        let a2 = store.append_service_block("VIN1", service("t3", "VIN1")).unwrap();

        assert_eq!(a.index, 1);
        assert_eq!(b.index, 1);
        assert_eq!(a2.previous_hash, a.hash);
        assert_eq!(a.transactions.len(), 1);
        assert_eq!(store.read("VIN1").len(), 3);
        assert!(store.verify());

        let stored = persistence.load_vehicle_chain("VIN1").unwrap().unwrap();
        assert_eq!(stored, store.read("VIN1"));
    }

    #[test]
    fn test_restore_round_trip() {
        let persistence = InMemoryPersistence::new();
        let mut store = VehicleChains::new(cheap_pow(), Arc::new(persistence.clone()));
        store.append_service_block("VIN1", service("t1", "VIN1")).unwrap();

        let restored = VehicleChains::restore(cheap_pow(), Arc::new(persistence)).unwrap();
        assert_eq!(restored.read("VIN1"), store.read("VIN1"));
    }

    #[test]
    fn test_restore_rejects_tampered_chain() {
        let persistence = InMemoryPersistence::new();
        let mut store = VehicleChains::new(cheap_pow(), Arc::new(persistence.clone()));
        store.append_service_block("VIN1", service("t1", "VIN1")).unwrap();

        let mut blocks = store.read("VIN1");
        blocks[1].transactions[0].tx.requested_by = "mallory".to_string();
        persistence.save_vehicle_chain("VIN1", &blocks).unwrap();

        let result = VehicleChains::restore(cheap_pow(), Arc::new(persistence));
        assert!(matches!(
            result,
            Err(crate::error::LedgerError::ChainIntegrityViolation(_))
        ));
    }
}
