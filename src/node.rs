use crate::blockchain::Block;
use crate::config::{Config, StorageBackend, StorageConfig};
use crate::error::{LedgerError, Result};
use crate::ledger::Ledger;
use crate::persistence::{Database, InMemoryPersistence, JsonFileStore, Persistence};
use crate::transaction::{PendingRecord, TransactionRequest};
use crate::views::VehicleHistory;
use crate::voting::{Decision, VoteOutcome, VoteTally, VoterSets};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{error, info};

struct NodeState {
    ledger: Ledger,
    /// Set after a fatal error; every later mutation is refused with it.
    halted: Option<LedgerError>,
}

/// Thread-safe handle to one authoritative ledger.
///
/// All mutations (submission, voting, sealing, snapshotting) run under a
/// single write lock, so two votes on the same transaction can never both see
/// the pre-update tally. Reads take the shared lock and return owned copies.
#[derive(Clone)]
pub struct LedgerNode {
    pub config: Arc<Config>,
    state: Arc<RwLock<NodeState>>,
}

impl LedgerNode {
    /// Install the fmt subscriber at `level`. Safe to call more than once.
    pub fn init_tracing(level: &str) {
        let level = level.parse::<tracing::Level>().unwrap_or(tracing::Level::INFO);
        let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
    }

    pub fn open_persistence(storage: &StorageConfig) -> Result<Arc<dyn Persistence>> {
        let persistence: Arc<dyn Persistence> = match storage.backend {
            StorageBackend::Sqlite => Arc::new(Database::open(&storage.path)?),
            StorageBackend::Json => Arc::new(JsonFileStore::open(&storage.path)?),
            StorageBackend::Memory => Arc::new(InMemoryPersistence::new()),
        };
        Ok(persistence)
    }

    pub fn init(config: Config) -> Result<Self> {
        let persistence = Self::open_persistence(&config.storage)?;
        info!(
            "Opening ledger ({:?} storage at {})",
            config.storage.backend, config.storage.path
        );
        Self::with_persistence(config, persistence)
    }

    pub fn with_persistence(config: Config, persistence: Arc<dyn Persistence>) -> Result<Self> {
        let pow = config.consensus.proof_of_work()?;
        let ledger = Ledger::open(persistence, pow, config.voters.voter_sets()).map_err(|e| {
            error!("Refusing to start: {}", e);
            e
        })?;

        info!(
            "Ledger ready: chain height {}, {} pending",
            ledger.chain().len(),
            ledger.pending().len()
        );

        Ok(Self {
            config: Arc::new(config),
            state: Arc::new(RwLock::new(NodeState { ledger, halted: None })),
        })
    }

    fn mutate<T>(&self, op: impl FnOnce(&mut Ledger) -> Result<T>) -> Result<T> {
        let mut state = self.state.write();
        if let Some(reason) = &state.halted {
            return Err(reason.clone());
        }
        let result = op(&mut state.ledger);
        if let Err(e) = &result {
            if e.is_fatal() {
                error!("Halting ledger after fatal error: {}", e);
                state.halted = Some(e.clone());
            }
        }
        result
    }

    /// Run `f` against a consistent view of the ledger.
    pub fn read<T>(&self, f: impl FnOnce(&Ledger) -> T) -> T {
        f(&self.state.read().ledger)
    }

    pub fn is_halted(&self) -> bool {
        self.state.read().halted.is_some()
    }

    pub fn submit(&self, request: TransactionRequest) -> Result<String> {
        self.mutate(|ledger| ledger.submit(request))
    }

    pub fn cast_vote(&self, tx_id: &str, voter: &str, vote: &str) -> Result<VoteOutcome> {
        self.mutate(|ledger| ledger.cast_vote(tx_id, voter, vote))
    }

    pub fn cast_decision(&self, tx_id: &str, voter: &str, decision: Decision) -> Result<VoteOutcome> {
        self.mutate(|ledger| ledger.cast_decision(tx_id, voter, decision))
    }

    pub fn add_admin(&self, identity: &str) -> Result<bool> {
        self.mutate(|ledger| ledger.add_admin(identity))
    }

    pub fn add_garage(&self, identity: &str) -> Result<bool> {
        self.mutate(|ledger| ledger.add_garage(identity))
    }

    pub fn chain(&self) -> Vec<Block> {
        self.read(|ledger| ledger.chain().to_vec())
    }

    pub fn block(&self, index: u64) -> Option<Block> {
        self.read(|ledger| ledger.block(index).cloned())
    }

    pub fn pending(&self) -> Vec<PendingRecord> {
        self.read(|ledger| ledger.pending().to_vec())
    }

    pub fn votes_for(&self, tx_id: &str) -> Option<VoteTally> {
        self.read(|ledger| ledger.votes_for(tx_id).cloned())
    }

    pub fn voters(&self) -> VoterSets {
        self.read(|ledger| ledger.voters().clone())
    }

    pub fn vehicle_history(&self, vin: &str) -> VehicleHistory {
        self.read(|ledger| ledger.vehicle_history(vin))
    }

    pub fn current_owner(&self, vin: &str) -> Option<String> {
        self.read(|ledger| ledger.current_owner(vin))
    }

    pub fn vehicles_owned_by(&self, identity: &str) -> Vec<String> {
        self.read(|ledger| ledger.vehicles_owned_by(identity))
    }

    pub fn verify(&self) -> bool {
        self.read(Ledger::verify)
    }
}
