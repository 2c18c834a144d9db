//! Vehicle Ledger - quorum-ratified vehicle lifecycle records
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Ledger
//! - [`blockchain`] - Blocks, proof-of-work sealing and chain validation
//! - [`subchain`] - Per-vehicle service-record sub-chains
//! - [`transaction`] - Transaction types and validation
//! - [`voting`] - Decisions, tallies and quorum rules
//! - [`ledger`] - The pending/vote/finalize state machine
//!
//! ## Hashing
//! - [`hasher`] - Canonical encoding and SHA-256 digests
//!
//! ## State Management
//! - [`persistence`] - Snapshot storage (SQLite, JSON files, in-memory)
//! - [`views`] - Ownership and history projections
//! - [`node`] - Shared, lock-guarded ledger handle
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types
//! - [`cli`] - CLI utilities

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod blockchain;
pub mod ledger;
pub mod subchain;
pub mod transaction;
pub mod voting;

// ============================================================================
// Hashing
// ============================================================================
pub mod hasher;

// ============================================================================
// State Management
// ============================================================================
pub mod node;
pub mod persistence;
pub mod views;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod cli;
pub mod config;
pub mod error;

pub use error::{LedgerError, Result};
pub use ledger::Ledger;
pub use node::LedgerNode;
