//! Durable storage for ledger state
//!
//! The global state (chain, pending set, vote tallies, voter sets) is always
//! written as one atomic unit. Each vehicle sub-chain is its own unit.

use crate::blockchain::Block;
use crate::error::{LedgerError, Result};
use crate::transaction::PendingRecord;
use crate::voting::{Decision, VoteTally};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Everything the ledger needs to resume, apart from vehicle sub-chains.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub chain: Vec<Block>,
    pub pending_transactions: Vec<PendingRecord>,
    pub votes: BTreeMap<String, VoteTally>,
    pub admins: BTreeSet<String>,
    pub garages: BTreeSet<String>,
}

/// Abstraction for persistence backends. `save_snapshot` must be atomic: a
/// later `load_snapshot` sees either the previous snapshot or the new one.
pub trait Persistence: Send + Sync {
    fn save_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<()>;
    /// `Ok(None)` when nothing has been stored yet.
    fn load_snapshot(&self) -> Result<Option<LedgerSnapshot>>;
    fn save_vehicle_chain(&self, vin: &str, blocks: &[Block]) -> Result<()>;
    fn load_vehicle_chain(&self, vin: &str) -> Result<Option<Vec<Block>>>;
    fn vehicle_ids(&self) -> Result<Vec<String>>;
}

fn poisoned<T>(_: PoisonError<T>) -> LedgerError {
    LedgerError::PersistenceFailure("Mutex poisoned".to_string())
}

fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> LedgerError {
    move |e| LedgerError::PersistenceFailure(format!("{}: {}", context, e))
}

fn encode<T: Serialize + ?Sized>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| LedgerError::PersistenceFailure(format!("Failed to serialize {}: {}", what, e)))
}

fn decode<T: serde::de::DeserializeOwned>(json: &str, what: &str) -> Result<T> {
    serde_json::from_str(json)
        .map_err(|e| LedgerError::CorruptRecord(format!("Failed to deserialize {}: {}", what, e)))
}

// ============================================================================
// SQLite
// ============================================================================

pub struct Database {
    conn: Mutex<Connection>,
}

struct BlockRow {
    height: i64,
    hash: String,
    previous_hash: String,
    timestamp: i64,
    nonce: i64,
    transactions: String,
}

impl BlockRow {
    fn from_block(block: &Block) -> Result<Self> {
        Ok(Self {
            height: block.index as i64,
            hash: block.hash.clone(),
            previous_hash: block.previous_hash.clone(),
            timestamp: block.timestamp as i64,
            nonce: block.nonce as i64,
            transactions: encode(&block.transactions, "transactions")?,
        })
    }

    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            height: row.get(0)?,
            hash: row.get(1)?,
            previous_hash: row.get(2)?,
            timestamp: row.get(3)?,
            nonce: row.get(4)?,
            transactions: row.get(5)?,
        })
    }

    fn into_block(self) -> Result<Block> {
        Ok(Block {
            index: self.height as u64,
            timestamp: self.timestamp as u64,
            transactions: decode(&self.transactions, "transactions")?,
            previous_hash: self.previous_hash,
            nonce: self.nonce as u64,
            // Stored digest is kept as-is; the ledger re-verifies it on restore.
            hash: self.hash,
        })
    }
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && path != ":memory:" {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(db_err("Failed to open database"))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blocks (
                height INTEGER PRIMARY KEY,
                hash TEXT NOT NULL,
                previous_hash TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                nonce INTEGER NOT NULL,
                transactions TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS pending (
                position INTEGER PRIMARY KEY,
                tx_id TEXT NOT NULL UNIQUE,
                record TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS votes (
                tx_id TEXT NOT NULL,
                voter TEXT NOT NULL,
                decision TEXT NOT NULL,
                PRIMARY KEY (tx_id, voter)
            );
            CREATE TABLE IF NOT EXISTS voters (
                role TEXT NOT NULL,
                identity TEXT NOT NULL,
                PRIMARY KEY (role, identity)
            );
            CREATE TABLE IF NOT EXISTS vehicle_blocks (
                vin TEXT NOT NULL,
                height INTEGER NOT NULL,
                hash TEXT NOT NULL,
                previous_hash TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                nonce INTEGER NOT NULL,
                transactions TEXT NOT NULL,
                PRIMARY KEY (vin, height)
            );",
        )
        .map_err(db_err("Failed to create tables"))?;

        Ok(Database { conn: Mutex::new(conn) })
    }

    /// Atomically replaces the stored global state with `snapshot`.
    pub fn save_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        let conn_guard = self.conn.lock().map_err(poisoned)?;
        let tx = conn_guard
            .unchecked_transaction()
            .map_err(db_err("Failed to start transaction"))?;

        tx.execute("DELETE FROM blocks WHERE height >= ?1", params![snapshot.chain.len() as i64])
            .map_err(db_err("Failed to trim blocks"))?;
        for block in &snapshot.chain {
            let row = BlockRow::from_block(block)?;
            tx.execute(
                "INSERT OR REPLACE INTO blocks (height, hash, previous_hash, timestamp, nonce, transactions)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![row.height, row.hash, row.previous_hash, row.timestamp, row.nonce, row.transactions],
            )
            .map_err(db_err("Failed to save block"))?;
        }

        tx.execute("DELETE FROM pending", []).map_err(db_err("Failed to clear pending"))?;
        for (position, record) in snapshot.pending_transactions.iter().enumerate() {
            tx.execute(
                "INSERT INTO pending (position, tx_id, record) VALUES (?1, ?2, ?3)",
                params![position as i64, record.tx_id, encode(record, "pending record")?],
            )
            .map_err(db_err("Failed to save pending record"))?;
        }

        tx.execute("DELETE FROM votes", []).map_err(db_err("Failed to clear votes"))?;
        for (tx_id, tally) in &snapshot.votes {
            for (voter, decision) in tally {
                let decision = match decision {
                    Decision::Approve => "approve",
                    Decision::Reject => "reject",
                };
                tx.execute(
                    "INSERT INTO votes (tx_id, voter, decision) VALUES (?1, ?2, ?3)",
                    params![tx_id, voter, decision],
                )
                .map_err(db_err("Failed to save vote"))?;
            }
        }

        tx.execute("DELETE FROM voters", []).map_err(db_err("Failed to clear voters"))?;
        let roles = [("admin", &snapshot.admins), ("garage", &snapshot.garages)];
        for (role, identities) in roles {
            for identity in identities {
                tx.execute(
                    "INSERT INTO voters (role, identity) VALUES (?1, ?2)",
                    params![role, identity],
                )
                .map_err(db_err("Failed to save voter"))?;
            }
        }

        tx.commit().map_err(db_err("Failed to commit transaction"))?;
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<Option<LedgerSnapshot>> {
        let conn_guard = self.conn.lock().map_err(poisoned)?;

        let mut stmt = conn_guard
            .prepare(
                "SELECT height, hash, previous_hash, timestamp, nonce, transactions
                 FROM blocks ORDER BY height ASC",
            )
            .map_err(db_err("Failed to prepare query"))?;
        let rows = stmt
            .query_map([], BlockRow::read)
            .map_err(db_err("Failed to query blocks"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Failed to read block"))?;
        if rows.is_empty() {
            return Ok(None);
        }
        let chain = rows.into_iter().map(BlockRow::into_block).collect::<Result<Vec<_>>>()?;

        let mut stmt = conn_guard
            .prepare("SELECT record FROM pending ORDER BY position ASC")
            .map_err(db_err("Failed to prepare query"))?;
        let records = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err("Failed to query pending"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Failed to read pending record"))?;
        let pending_transactions = records
            .iter()
            .map(|json| decode(json, "pending record"))
            .collect::<Result<Vec<PendingRecord>>>()?;

        let mut stmt = conn_guard
            .prepare("SELECT tx_id, voter, decision FROM votes")
            .map_err(db_err("Failed to prepare query"))?;
        let vote_rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })
            .map_err(db_err("Failed to query votes"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Failed to read vote"))?;
        let mut votes: BTreeMap<String, VoteTally> = BTreeMap::new();
        for (tx_id, voter, decision) in vote_rows {
            let decision: Decision = decision
                .parse()
                .map_err(|e| LedgerError::CorruptRecord(format!("Stored vote: {}", e)))?;
            votes.entry(tx_id).or_default().insert(voter, decision);
        }
        // Empty tallies have no rows.
        for record in &pending_transactions {
            votes.entry(record.tx_id.clone()).or_default();
        }

        let mut stmt = conn_guard
            .prepare("SELECT role, identity FROM voters")
            .map_err(db_err("Failed to prepare query"))?;
        let voter_rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(db_err("Failed to query voters"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Failed to read voter"))?;
        let mut admins = BTreeSet::new();
        let mut garages = BTreeSet::new();
        for (role, identity) in voter_rows {
            match role.as_str() {
                "admin" => admins.insert(identity),
                "garage" => garages.insert(identity),
                other => {
                    return Err(LedgerError::CorruptRecord(format!("Unknown voter role {:?}", other)))
                }
            };
        }

        // Tallies for transactions that already left the pending set are kept:
        // the ledger treats them as orphans rather than dropping them here.
        Ok(Some(LedgerSnapshot {
            chain,
            pending_transactions,
            votes,
            admins,
            garages,
        }))
    }

    pub fn save_vehicle_chain(&self, vin: &str, blocks: &[Block]) -> Result<()> {
        let conn_guard = self.conn.lock().map_err(poisoned)?;
        let tx = conn_guard
            .unchecked_transaction()
            .map_err(db_err("Failed to start transaction"))?;

        tx.execute("DELETE FROM vehicle_blocks WHERE vin = ?1", params![vin])
            .map_err(db_err("Failed to clear vehicle chain"))?;
        for block in blocks {
            let row = BlockRow::from_block(block)?;
            tx.execute(
                "INSERT INTO vehicle_blocks (vin, height, hash, previous_hash, timestamp, nonce, transactions)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![vin, row.height, row.hash, row.previous_hash, row.timestamp, row.nonce, row.transactions],
            )
            .map_err(db_err("Failed to save vehicle block"))?;
        }

        tx.commit().map_err(db_err("Failed to commit transaction"))?;
        Ok(())
    }

    pub fn load_vehicle_chain(&self, vin: &str) -> Result<Option<Vec<Block>>> {
        let conn_guard = self.conn.lock().map_err(poisoned)?;
        let mut stmt = conn_guard
            .prepare(
                "SELECT height, hash, previous_hash, timestamp, nonce, transactions
                 FROM vehicle_blocks WHERE vin = ?1 ORDER BY height ASC",
            )
            .map_err(db_err("Failed to prepare query"))?;
        let rows = stmt
            .query_map(params![vin], BlockRow::read)
            .map_err(db_err("Failed to query vehicle blocks"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Failed to read vehicle block"))?;

        if rows.is_empty() {
            return Ok(None);
        }
        rows.into_iter().map(BlockRow::into_block).collect::<Result<Vec<_>>>().map(Some)
    }

    pub fn vehicle_ids(&self) -> Result<Vec<String>> {
        let conn_guard = self.conn.lock().map_err(poisoned)?;
        let mut stmt = conn_guard
            .prepare("SELECT DISTINCT vin FROM vehicle_blocks ORDER BY vin ASC")
            .map_err(db_err("Failed to prepare query"))?;
        let vins = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err("Failed to query vehicles"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Failed to read vehicle id"))?;
        Ok(vins)
    }
}

impl Persistence for Database {
    fn save_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        Database::save_snapshot(self, snapshot)
    }

    fn load_snapshot(&self) -> Result<Option<LedgerSnapshot>> {
        Database::load_snapshot(self)
    }

    fn save_vehicle_chain(&self, vin: &str, blocks: &[Block]) -> Result<()> {
        Database::save_vehicle_chain(self, vin, blocks)
    }

    fn load_vehicle_chain(&self, vin: &str) -> Result<Option<Vec<Block>>> {
        Database::load_vehicle_chain(self, vin)
    }

    fn vehicle_ids(&self) -> Result<Vec<String>> {
        Database::vehicle_ids(self)
    }
}

// ============================================================================
// JSON files
// ============================================================================

/// `ledger.json` for the global state plus `vehicles/<hex(vin)>.json` per
/// vehicle. Every write goes to a temp file that is then renamed into place.
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("vehicles"))?;
        Ok(Self { root })
    }

    fn snapshot_path(&self) -> PathBuf {
        self.root.join("ledger.json")
    }

    fn vehicle_path(&self, vin: &str) -> PathBuf {
        // Hex keeps arbitrary identifiers filesystem-safe.
        self.root.join("vehicles").join(format!("{}.json", hex::encode(vin)))
    }

    fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let tmp_path = path.with_extension("json.tmp");
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn read_optional<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(path)?;
        decode(&data, what).map(Some)
    }
}

impl Persistence for JsonFileStore {
    fn save_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        let data = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| LedgerError::PersistenceFailure(format!("Failed to serialize snapshot: {}", e)))?;
        Self::write_atomic(&self.snapshot_path(), &data)
    }

    fn load_snapshot(&self) -> Result<Option<LedgerSnapshot>> {
        Self::read_optional(&self.snapshot_path(), "ledger snapshot")
    }

    fn save_vehicle_chain(&self, vin: &str, blocks: &[Block]) -> Result<()> {
        let data = serde_json::to_vec_pretty(blocks)
            .map_err(|e| LedgerError::PersistenceFailure(format!("Failed to serialize vehicle chain: {}", e)))?;
        Self::write_atomic(&self.vehicle_path(vin), &data)
    }

    fn load_vehicle_chain(&self, vin: &str) -> Result<Option<Vec<Block>>> {
        Self::read_optional(&self.vehicle_path(vin), "vehicle chain")
    }

    fn vehicle_ids(&self) -> Result<Vec<String>> {
        let mut vins = Vec::new();
        for entry in fs::read_dir(self.root.join("vehicles"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let decoded = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| hex::decode(s).ok())
                .and_then(|bytes| String::from_utf8(bytes).ok());
            if let Some(vin) = decoded {
                vins.push(vin);
            }
        }
        vins.sort();
        Ok(vins)
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
/// Clones share storage, so a clone can stand in for a restarted process.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    pub snapshot: Arc<Mutex<Option<LedgerSnapshot>>>,
    pub vehicles: Arc<Mutex<BTreeMap<String, Vec<Block>>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for InMemoryPersistence {
    fn save_snapshot(&self, snapshot: &LedgerSnapshot) -> Result<()> {
        let mut stored = self.snapshot.lock().map_err(poisoned)?;
        *stored = Some(snapshot.clone());
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<LedgerSnapshot>> {
        let stored = self.snapshot.lock().map_err(poisoned)?;
        Ok(stored.clone())
    }

    fn save_vehicle_chain(&self, vin: &str, blocks: &[Block]) -> Result<()> {
        let mut vehicles = self.vehicles.lock().map_err(poisoned)?;
        vehicles.insert(vin.to_string(), blocks.to_vec());
        Ok(())
    }

    fn load_vehicle_chain(&self, vin: &str) -> Result<Option<Vec<Block>>> {
        let vehicles = self.vehicles.lock().map_err(poisoned)?;
        Ok(vehicles.get(vin).cloned())
    }

    fn vehicle_ids(&self) -> Result<Vec<String>> {
        let vehicles = self.vehicles.lock().map_err(poisoned)?;
        Ok(vehicles.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{Chain, ProofOfWork};
    use crate::transaction::{TransactionRequest, TxStatus};
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_snapshot() -> LedgerSnapshot {
        let pow = ProofOfWork::new("0", 1_000_000).unwrap();
        let mut chain = Chain::new(pow).unwrap();
        let accepted = PendingRecord {
            tx_id: "accepted-1".to_string(),
            tx: TransactionRequest::from_parts(
                "register_vehicle",
                json!({"vin": "VIN1", "owner": "dana"}),
                "dana",
                10,
            )
            .unwrap(),
            time_submitted: 11,
            status: TxStatus::Accepted,
        };
        chain.seal_next(vec![accepted]).unwrap();

        let pending = PendingRecord {
            tx_id: "pending-1".to_string(),
            tx: TransactionRequest::from_parts("propose_garage", json!({"garage": "g1"}), "alice", 12).unwrap(),
            time_submitted: 13,
            status: TxStatus::Pending,
        };

        let mut tally = VoteTally::new();
        tally.insert("alice".to_string(), Decision::Approve);
        tally.insert("bob".to_string(), Decision::Reject);

        LedgerSnapshot {
            chain: chain.into_blocks(),
            pending_transactions: vec![pending],
            votes: BTreeMap::from([("pending-1".to_string(), tally)]),
            admins: ["alice", "bob", "carol"].iter().map(|s| s.to_string()).collect(),
            garages: ["g9"].iter().map(|s| s.to_string()).collect(),
        }
    }

    fn round_trip(store: &dyn Persistence) {
        assert!(store.load_snapshot().unwrap().is_none());

        let snapshot = sample_snapshot();
        store.save_snapshot(&snapshot).unwrap();
        assert_eq!(store.load_snapshot().unwrap(), Some(snapshot.clone()));

        let vehicle_blocks = snapshot.chain.clone();
        store.save_vehicle_chain("VIN/1", &vehicle_blocks).unwrap();
        assert_eq!(store.load_vehicle_chain("VIN/1").unwrap(), Some(vehicle_blocks));
        assert_eq!(store.load_vehicle_chain("VIN2").unwrap(), None);
        assert_eq!(store.vehicle_ids().unwrap(), vec!["VIN/1".to_string()]);
    }

    #[test]
    fn test_database_round_trip() {
        let db = Database::open(":memory:").unwrap();
        round_trip(&db);
    }

    #[test]
    fn test_database_snapshot_shrinks() {
        let db = Database::open(":memory:").unwrap();
        let mut snapshot = sample_snapshot();
        db.save_snapshot(&snapshot).unwrap();

        snapshot.chain.truncate(1);
        snapshot.pending_transactions.clear();
        snapshot.votes.clear();
        db.save_snapshot(&snapshot).unwrap();

        assert_eq!(db.load_snapshot().unwrap(), Some(snapshot));
    }

    #[test]
    fn test_json_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        round_trip(&store);
        assert!(!dir.path().join("ledger.json.tmp").exists());
    }

    #[test]
    fn test_json_store_reports_corrupt_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("ledger.json"), b"{ not json").unwrap();
        assert!(matches!(store.load_snapshot(), Err(LedgerError::CorruptRecord(_))));
    }

    #[test]
    fn test_in_memory_clones_share_storage() {
        let store = InMemoryPersistence::new();
        round_trip(&store);
        let restarted = store.clone();
        assert!(restarted.load_snapshot().unwrap().is_some());
    }
}
