//! Shared helpers for the command-line front end

use crate::config::{load_config, Config};
use crate::error::Result;
use crate::node::LedgerNode;
use chrono::{TimeZone, Utc};
use std::path::Path;

/// Load configuration from `path` (defaults if absent), install logging and open the ledger.
pub fn load_node_from_config<P: AsRef<Path>>(path: P) -> Result<(Config, LedgerNode)> {
    let config = load_config(path)?;
    LedgerNode::init_tracing(&config.logging.level);
    let node = LedgerNode::init(config.clone())?;
    Ok((config, node))
}

/// First and last characters of a long hash, for tables.
pub fn short_hash(hash: &str) -> String {
    if hash.len() > 20 {
        format!("{}…{}", &hash[..10], &hash[hash.len() - 8..])
    } else {
        hash.to_string()
    }
}

/// Render epoch milliseconds as RFC 3339 UTC.
pub fn format_timestamp(millis: u64) -> String {
    match Utc.timestamp_millis_opt(millis as i64).single() {
        Some(ts) => ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        None => millis.to_string(),
    }
}
