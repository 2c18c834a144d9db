//! Transaction and vote ledger
//!
//! Owns the global chain, the pending set, the vote tallies, the voter sets
//! and the vehicle sub-chains. A transaction moves from pending to accepted or
//! rejected exactly once, when its approve or reject count first reaches the
//! majority of the voter set responsible for its type. Every successful
//! mutation is durably snapshotted before it returns.

use crate::blockchain::{collect_tx_ids, now_millis, Block, Chain, ProofOfWork};
use crate::error::{LedgerError, Result};
use crate::hasher::{canonical_json, sha256_hex};
use crate::persistence::{LedgerSnapshot, Persistence};
use crate::subchain::VehicleChains;
use crate::transaction::{validate_request, PendingRecord, TransactionKind, TransactionRequest, TxStatus};
use crate::views::{self, VehicleHistory};
use crate::voting::{count, Decision, Finalization, VoteOutcome, VoteTally, VoterRole, VoterSets};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Reported when a tally reaches majority but its transaction is no longer pending.
pub const ORPHANED_TALLY: &str = "tx not in pending list";

pub struct Ledger {
    chain: Chain,
    pending: Vec<PendingRecord>,
    votes: BTreeMap<String, VoteTally>,
    voters: VoterSets,
    vehicles: VehicleChains,
    persistence: Arc<dyn Persistence>,
}

impl Ledger {
    /// Restore the ledger from `persistence`, or start a new one with a
    /// genesis block and `default_voters` when nothing usable is stored.
    /// Unreadable stored state is not overwritten until the first mutation.
    pub fn open(
        persistence: Arc<dyn Persistence>,
        pow: ProofOfWork,
        default_voters: VoterSets,
    ) -> Result<Self> {
        let (snapshot, corrupt) = match persistence.load_snapshot() {
            Ok(snapshot) => (snapshot, false),
            Err(LedgerError::CorruptRecord(reason)) => {
                error!(
                    "Stored ledger state is unreadable ({}); starting from genesis. \
                     The stored state is left untouched until the first mutation.",
                    reason
                );
                (None, true)
            }
            Err(e) => return Err(e),
        };

        let vehicles = VehicleChains::restore(pow.clone(), persistence.clone())?;

        match snapshot {
            Some(snapshot) => Self::from_snapshot(snapshot, pow, vehicles, persistence),
            None => {
                let ledger = Self {
                    chain: Chain::new(pow)?,
                    pending: Vec::new(),
                    votes: BTreeMap::new(),
                    voters: default_voters,
                    vehicles,
                    persistence,
                };
                if !corrupt {
                    ledger.persist()?;
                }
                info!(
                    "Created new ledger with genesis block {}",
                    ledger.chain.last().map(|b| b.hash.as_str()).unwrap_or_default()
                );
                Ok(ledger)
            }
        }
    }

    fn from_snapshot(
        snapshot: LedgerSnapshot,
        pow: ProofOfWork,
        vehicles: VehicleChains,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self> {
        let chain = Chain::from_blocks(snapshot.chain, pow)?;

        let mut global_ids = HashSet::new();
        collect_tx_ids(chain.blocks(), &mut global_ids)?;
        let mut finalized_ids = global_ids.clone();
        for (_, vehicle_chain) in vehicles.chains() {
            collect_tx_ids(vehicle_chain.blocks(), &mut finalized_ids)?;
        }

        let mut votes = snapshot.votes;
        let mut pending = Vec::with_capacity(snapshot.pending_transactions.len());
        let mut pending_ids = HashSet::new();
        for record in snapshot.pending_transactions {
            if global_ids.contains(&record.tx_id) {
                return Err(LedgerError::ChainIntegrityViolation(format!(
                    "Transaction {} is both pending and in the global chain.",
                    record.tx_id
                )));
            }
            if finalized_ids.contains(&record.tx_id) {
                // The service block was written but the global snapshot was not.
                warn!(
                    "Transaction {} already sealed in a vehicle sub-chain; dropping it from pending",
                    record.tx_id
                );
                votes.remove(&record.tx_id);
                continue;
            }
            if !pending_ids.insert(record.tx_id.clone()) {
                return Err(LedgerError::ChainIntegrityViolation(format!(
                    "Transaction {} is pending twice.",
                    record.tx_id
                )));
            }
            pending.push(record);
        }

        info!(
            "Restored ledger: {} block(s), {} pending transaction(s), {} admin(s), {} garage(s)",
            chain.len(),
            pending.len(),
            snapshot.admins.len(),
            snapshot.garages.len()
        );

        Ok(Self {
            chain,
            pending,
            votes,
            voters: VoterSets {
                admins: snapshot.admins,
                garages: snapshot.garages,
            },
            vehicles,
            persistence,
        })
    }

    /// Capture the global state as one storable unit.
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            chain: self.chain.blocks().to_vec(),
            pending_transactions: self.pending.clone(),
            votes: self.votes.clone(),
            admins: self.voters.admins.clone(),
            garages: self.voters.garages.clone(),
        }
    }

    fn persist(&self) -> Result<()> {
        self.persistence.save_snapshot(&self.snapshot())?;
        debug!(
            "Snapshot written: {} block(s), {} pending",
            self.chain.len(),
            self.pending.len()
        );
        Ok(())
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Register a new pending transaction with an empty tally and return its id.
    pub fn submit(&mut self, request: TransactionRequest) -> Result<String> {
        validate_request(&request)?;

        let time_submitted = now_millis();
        let tx_id = generate_tx_id(&request, time_submitted)?;
        let kind = request.type_name().to_string();

        self.pending.push(PendingRecord {
            tx_id: tx_id.clone(),
            tx: request,
            time_submitted,
            status: TxStatus::Pending,
        });
        self.votes.insert(tx_id.clone(), VoteTally::new());

        if let Err(e) = self.persist() {
            self.pending.pop();
            self.votes.remove(&tx_id);
            return Err(e);
        }

        info!("Submitted {} transaction {}", kind, tx_id);
        Ok(tx_id)
    }

    /// Record `voter`'s decision, given in wire form (`"approve"` / `"reject"`).
    pub fn cast_vote(&mut self, tx_id: &str, voter: &str, vote: &str) -> Result<VoteOutcome> {
        self.ensure_known(tx_id)?;
        let decision: Decision = vote.parse()?;
        self.cast_decision(tx_id, voter, decision)
    }

    /// Record `voter`'s decision and finalize the transaction if a majority is reached.
    pub fn cast_decision(&mut self, tx_id: &str, voter: &str, decision: Decision) -> Result<VoteOutcome> {
        self.ensure_known(tx_id)?;

        let tally = self.votes.entry(tx_id.to_string()).or_default();
        tally.insert(voter.to_string(), decision);
        let (approve_count, reject_count) = count(tally);

        let Some(position) = self.pending.iter().position(|r| r.tx_id == tx_id) else {
            return self.orphaned_vote(tx_id, approve_count, reject_count);
        };

        let role = self.pending[position].kind().voter_role();
        let majority = self.voters.majority(role);
        debug!(
            "Vote on {} by {}: {:?} ({} approve, {} reject, majority {})",
            tx_id, voter, decision, approve_count, reject_count, majority
        );

        if approve_count >= majority {
            return self.accept(position, approve_count, reject_count, majority);
        }
        if reject_count >= majority {
            return self.reject(position, approve_count, reject_count, majority);
        }

        self.persist()?;
        Ok(VoteOutcome::open(approve_count, reject_count, majority))
    }

    fn ensure_known(&self, tx_id: &str) -> Result<()> {
        if self.votes.contains_key(tx_id) || self.pending.iter().any(|r| r.tx_id == tx_id) {
            Ok(())
        } else {
            Err(LedgerError::TransactionNotFound(tx_id.to_string()))
        }
    }

    /// A tally with no pending record behind it: the vote is kept and counted
    /// against the admin set, but nothing can be finalized.
    fn orphaned_vote(&mut self, tx_id: &str, approve_count: usize, reject_count: usize) -> Result<VoteOutcome> {
        let majority = self.voters.majority(VoterRole::Admins);
        self.persist()?;

        let mut outcome = VoteOutcome::open(approve_count, reject_count, majority);
        if approve_count >= majority || reject_count >= majority {
            warn!("Tally for {} reached majority but the transaction is not pending", tx_id);
            outcome.error = Some(ORPHANED_TALLY.to_string());
        }
        Ok(outcome)
    }

    fn accept(
        &mut self,
        position: usize,
        approve_count: usize,
        reject_count: usize,
        majority: usize,
    ) -> Result<VoteOutcome> {
        let mut record = self.pending[position].clone();
        record.status = TxStatus::Accepted;

        // Seal before touching the pending set so a failed nonce search leaves it intact.
        let block = match &record.tx.kind {
            TransactionKind::AddService(service) => {
                let vin = service.vin.clone();
                self.vehicles.append_service_block(&vin, record.clone())?
            }
            _ => self.chain.seal_next(vec![record.clone()])?,
        };

        self.pending.remove(position);
        self.votes.remove(&record.tx_id);
        self.persist()?;

        info!(
            "Accepted {} transaction {} into block {} ({})",
            record.tx.type_name(),
            record.tx_id,
            block.index,
            if record.tx.kind.voter_role() == VoterRole::Garages {
                "vehicle sub-chain"
            } else {
                "global chain"
            }
        );

        Ok(VoteOutcome {
            approve_count,
            reject_count,
            majority,
            finalized: Finalization::Accepted,
            tx: Some(record),
            block: Some(block),
            error: None,
        })
    }

    fn reject(
        &mut self,
        position: usize,
        approve_count: usize,
        reject_count: usize,
        majority: usize,
    ) -> Result<VoteOutcome> {
        let mut record = self.pending.remove(position);
        self.votes.remove(&record.tx_id);
        record.status = TxStatus::Rejected;
        self.persist()?;

        info!("Rejected {} transaction {}", record.tx.type_name(), record.tx_id);

        Ok(VoteOutcome {
            approve_count,
            reject_count,
            majority,
            finalized: Finalization::Rejected,
            tx: Some(record),
            block: None,
            error: None,
        })
    }

    /// Add an identity to the admin set. Returns whether it was new.
    pub fn add_admin(&mut self, identity: &str) -> Result<bool> {
        let added = self.voters.admins.insert(identity.to_string());
        if added {
            self.persist()?;
            info!("Admin {} added ({} total)", identity, self.voters.admins.len());
        }
        Ok(added)
    }

    /// Add an identity to the garage set. Returns whether it was new.
    pub fn add_garage(&mut self, identity: &str) -> Result<bool> {
        let added = self.voters.garages.insert(identity.to_string());
        if added {
            self.persist()?;
            info!("Garage {} added ({} total)", identity, self.voters.garages.len());
        }
        Ok(added)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn chain(&self) -> &[Block] {
        self.chain.blocks()
    }

    pub fn block(&self, index: u64) -> Option<&Block> {
        self.chain.get(index)
    }

    pub fn pending(&self) -> &[PendingRecord] {
        &self.pending
    }

    pub fn votes_for(&self, tx_id: &str) -> Option<&VoteTally> {
        self.votes.get(tx_id)
    }

    pub fn voters(&self) -> &VoterSets {
        &self.voters
    }

    pub fn pow(&self) -> &ProofOfWork {
        self.chain.pow()
    }

    pub fn vehicle_chain(&self, vin: &str) -> Vec<Block> {
        self.vehicles.read(vin)
    }

    pub fn vehicle_history(&self, vin: &str) -> VehicleHistory {
        views::vehicle_history(self.chain.blocks(), vin, self.vehicles.read(vin))
    }

    pub fn current_owner(&self, vin: &str) -> Option<String> {
        views::current_owner(self.chain.blocks(), vin)
    }

    pub fn vehicles_owned_by(&self, identity: &str) -> Vec<String> {
        views::vehicles_owned_by(self.chain.blocks(), identity)
    }

    /// Check the global chain and every vehicle sub-chain.
    pub fn verify(&self) -> bool {
        self.chain.verify() && self.vehicles.verify()
    }
}

/// Digest of the request content, the submission time and 16 random bytes,
/// so identical requests submitted in the same millisecond still differ.
fn generate_tx_id(request: &TransactionRequest, time_submitted: u64) -> Result<String> {
    let salt: [u8; 16] = rand::random();
    let material = format!("{}{}{}", canonical_json(request)?, time_submitted, hex::encode(salt));
    Ok(sha256_hex(material.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;
    use serde_json::json;

    fn ledger_with(admins: &[&str], garages: &[&str]) -> Ledger {
        Ledger::open(
            Arc::new(InMemoryPersistence::new()),
            ProofOfWork::new("0", 1_000_000).unwrap(),
            VoterSets::new(admins.iter().copied(), garages.iter().copied()),
        )
        .unwrap()
    }

    fn register(vin: &str, owner: &str) -> TransactionRequest {
        TransactionRequest::from_parts("register_vehicle", json!({"vin": vin, "owner": owner}), owner, 1).unwrap()
    }

    #[test]
    fn test_submit_creates_pending_record_and_empty_tally() {
        let mut ledger = ledger_with(&["alice", "bob", "carol"], &[]);
        let tx_id = ledger.submit(register("VIN1", "dana")).unwrap();

        assert_eq!(tx_id.len(), 64);
        assert_eq!(ledger.pending().len(), 1);
        assert_eq!(ledger.pending()[0].status, TxStatus::Pending);
        assert_eq!(ledger.votes_for(&tx_id), Some(&VoteTally::new()));
    }

    #[test]
    fn test_identical_submissions_get_distinct_ids() {
        let mut ledger = ledger_with(&["alice"], &[]);
        let a = ledger.submit(register("VIN1", "dana")).unwrap();
        let b = ledger.submit(register("VIN1", "dana")).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_not_found_precedes_invalid_decision() {
        let mut ledger = ledger_with(&["alice"], &[]);
        assert_eq!(
            ledger.cast_vote("missing", "alice", "maybe"),
            Err(LedgerError::TransactionNotFound("missing".to_string()))
        );

        let tx_id = ledger.submit(register("VIN1", "dana")).unwrap();
        assert_eq!(
            ledger.cast_vote(&tx_id, "alice", "maybe"),
            Err(LedgerError::InvalidDecision("maybe".to_string()))
        );
        assert!(ledger.votes_for(&tx_id).unwrap().is_empty());
    }

    #[test]
    fn test_membership_change_affects_in_flight_vote() {
        let mut ledger = ledger_with(&["alice"], &[]);
        let tx_id = ledger.submit(register("VIN1", "dana")).unwrap();

        ledger.add_admin("bob").unwrap();
        ledger.add_admin("carol").unwrap();

        let outcome = ledger.cast_vote(&tx_id, "alice", "approve").unwrap();
        assert_eq!(outcome.majority, 2);
        assert_eq!(outcome.finalized, Finalization::Open);
    }

    #[test]
    fn test_unknown_type_uses_admin_quorum() {
        let mut ledger = ledger_with(&["alice", "bob", "carol"], &["g1"]);
        let request = TransactionRequest::from_parts("recall_notice", json!({"vin": "VIN1"}), "alice", 1).unwrap();
        let tx_id = ledger.submit(request).unwrap();

        let outcome = ledger.cast_vote(&tx_id, "g1", "approve").unwrap();
        assert_eq!(outcome.majority, 2);
        let outcome = ledger.cast_vote(&tx_id, "alice", "approve").unwrap();
        assert_eq!(outcome.finalized, Finalization::Accepted);
        assert_eq!(ledger.chain().len(), 2);
    }

    #[test]
    fn test_lone_garage_finalizes_service_record() {
        let mut ledger = ledger_with(&["alice", "bob", "carol"], &[]);
        let request = TransactionRequest::from_parts(
            "add_service",
            json!({"vin": "VIN1", "garage": "g1", "description": "tyres"}),
            "g1",
            1,
        )
        .unwrap();
        let tx_id = ledger.submit(request).unwrap();

        let outcome = ledger.cast_vote(&tx_id, "g1", "approve").unwrap();
        assert_eq!(outcome.majority, 1);
        assert_eq!(outcome.finalized, Finalization::Accepted);
        assert_eq!(ledger.chain().len(), 1);
        assert_eq!(ledger.vehicle_chain("VIN1").len(), 2);
    }

    #[test]
    fn test_orphaned_tally_is_reported_not_finalized() {
        let persistence = InMemoryPersistence::new();
        let pow = ProofOfWork::new("0", 1_000_000).unwrap();
        let voters = VoterSets::new(["alice", "bob", "carol"], Vec::<String>::new());
        {
            let mut ledger = Ledger::open(Arc::new(persistence.clone()), pow.clone(), voters.clone()).unwrap();
            ledger.submit(register("VIN1", "dana")).unwrap();
        }

        // Drop the pending record but keep its tally.
        let mut snapshot = persistence.load_snapshot().unwrap().unwrap();
        let orphan = snapshot.pending_transactions.remove(0).tx_id;
        persistence.save_snapshot(&snapshot).unwrap();

        let mut ledger = Ledger::open(Arc::new(persistence), pow, voters).unwrap();
        let first = ledger.cast_vote(&orphan, "alice", "approve").unwrap();
        assert_eq!(first.error, None);
        let second = ledger.cast_vote(&orphan, "bob", "approve").unwrap();
        assert_eq!(second.finalized, Finalization::Open);
        assert_eq!(second.error.as_deref(), Some(ORPHANED_TALLY));
        assert_eq!(ledger.chain().len(), 1);
        assert_eq!(ledger.votes_for(&orphan).map(|t| t.len()), Some(2));
    }
}
