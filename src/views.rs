//! Read-only projections over finalized blocks.

use crate::blockchain::Block;
use crate::transaction::{ServiceRecord, TransactionKind};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// A global-chain transaction that mentions a vehicle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEvent {
    pub block_index: u64,
    pub tx_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub timestamp: u64,
}

/// Everything known about one vehicle: its global events plus its own sub-chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleHistory {
    pub vin: String,
    pub global_events: Vec<HistoryEvent>,
    pub vehicle_chain: Vec<Block>,
}

impl VehicleHistory {
    pub fn service_records(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.vehicle_chain
            .iter()
            .flat_map(|block| &block.transactions)
            .filter_map(|record| match &record.tx.kind {
                TransactionKind::AddService(service) => Some(service),
                _ => None,
            })
    }

    pub fn is_empty(&self) -> bool {
        self.global_events.is_empty() && self.vehicle_chain.is_empty()
    }
}

fn apply_ownership(owners: &mut BTreeMap<String, String>, kind: &TransactionKind) {
    match kind {
        TransactionKind::RegisterVehicle(p) => {
            owners.insert(p.vin.clone(), p.owner.clone());
        }
        TransactionKind::TransferOwnership(p) => {
            // Transfers of unregistered vehicles have no effect.
            if let Some(owner) = owners.get_mut(&p.vin) {
                owner.clone_from(&p.to);
            }
        }
        _ => {}
    }
}

/// vehicle -> current owner, from a forward scan of the global chain.
pub fn ownership_index(chain: &[Block]) -> BTreeMap<String, String> {
    let mut owners = BTreeMap::new();
    for record in chain.iter().flat_map(|block| &block.transactions) {
        apply_ownership(&mut owners, &record.tx.kind);
    }
    owners
}

pub fn current_owner(chain: &[Block], vin: &str) -> Option<String> {
    let mut owners = BTreeMap::new();
    for record in chain.iter().flat_map(|block| &block.transactions) {
        if record.tx.kind.vin() == Some(vin) {
            apply_ownership(&mut owners, &record.tx.kind);
        }
    }
    owners.remove(vin)
}

/// Vehicles whose current owner is `identity`, sorted.
pub fn vehicles_owned_by(chain: &[Block], identity: &str) -> Vec<String> {
    ownership_index(chain)
        .into_iter()
        .filter(|(_, owner)| owner == identity)
        .map(|(vin, _)| vin)
        .collect()
}

pub fn global_events(chain: &[Block], vin: &str) -> Vec<HistoryEvent> {
    chain
        .iter()
        .flat_map(|block| block.transactions.iter().map(move |record| (block, record)))
        .filter(|(_, record)| record.tx.kind.vin() == Some(vin))
        .map(|(block, record)| HistoryEvent {
            block_index: block.index,
            tx_id: record.tx_id.clone(),
            kind: record.tx.type_name().to_string(),
            payload: record.tx.kind.payload(),
            timestamp: block.timestamp,
        })
        .collect()
}

pub fn vehicle_history(chain: &[Block], vin: &str, vehicle_chain: Vec<Block>) -> VehicleHistory {
    VehicleHistory {
        vin: vin.to_string(),
        global_events: global_events(chain, vin),
        vehicle_chain,
    }
}
