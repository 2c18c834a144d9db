#![forbid(unsafe_code)]
//! Operator front end for the vehicle ledger

use clap::{Parser, Subcommand};
use colored::*;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Attribute, Cell, Color as TableColor, ContentArrangement, Table};
use std::path::PathBuf;
use vehicle_ledger::blockchain::Block;
use vehicle_ledger::cli::{format_timestamp, load_node_from_config, short_hash};
use vehicle_ledger::config::DEFAULT_CONFIG_PATH;
use vehicle_ledger::transaction::TransactionRequest;
use vehicle_ledger::voting::Finalization;

#[derive(Parser)]
#[command(name = "vehicle-ledger", version, about = "Quorum-ratified vehicle lifecycle ledger")]
struct Cli {
    /// Configuration file (defaults are used if it does not exist)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a transaction for voting
    Submit {
        /// register_vehicle, add_service, propose_garage, transfer_ownership, ...
        #[arg(long = "type")]
        kind: String,
        /// JSON object, e.g. '{"vin":"WVW123","owner":"dana"}'
        #[arg(long)]
        payload: String,
        #[arg(long)]
        by: String,
    },
    /// Cast or change a vote on a pending transaction
    Vote {
        tx_id: String,
        voter: String,
        /// approve or reject
        decision: String,
    },
    /// Print the global chain
    Chain,
    /// Print one global block as JSON
    Block { index: u64 },
    /// List pending transactions and their tallies
    Pending,
    /// Global events and service sub-chain for a vehicle
    History { vin: String },
    /// Current owner of a vehicle
    Owner { vin: String },
    /// Vehicles currently owned by an identity
    OwnedBy { identity: String },
    AddAdmin { identity: String },
    AddGarage { identity: String },
    /// Verify every chain
    Verify,
}

fn blocks_table(blocks: &[Block]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").add_attribute(Attribute::Bold),
            Cell::new("Timestamp").add_attribute(Attribute::Bold),
            Cell::new("Transactions").add_attribute(Attribute::Bold),
            Cell::new("Nonce").add_attribute(Attribute::Bold),
            Cell::new("Hash").add_attribute(Attribute::Bold),
        ]);

    for block in blocks {
        let txs = if block.transactions.is_empty() {
            "genesis".to_string()
        } else {
            block
                .transactions
                .iter()
                .map(|r| format!("{} {}", r.tx.type_name(), short_hash(&r.tx_id)))
                .collect::<Vec<_>>()
                .join("\n")
        };
        table.add_row(vec![
            Cell::new(block.index),
            Cell::new(format_timestamp(block.timestamp)),
            Cell::new(txs),
            Cell::new(block.nonce),
            Cell::new(short_hash(&block.hash)).fg(TableColor::Cyan),
        ]);
    }
    table
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let (_config, node) = load_node_from_config(&cli.config)?;

    match cli.command {
        Command::Submit { kind, payload, by } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).map_err(|e| format!("Payload is not valid JSON: {}", e))?;
            let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
            let request = TransactionRequest::from_parts(&kind, payload, by, now)?;
            let tx_id = node.submit(request)?;
            println!("{} {}", "✅ Transaction submitted:".green().bold(), tx_id);
        }
        Command::Vote { tx_id, voter, decision } => {
            let outcome = node.cast_vote(&tx_id, &voter, &decision)?;
            let status = match outcome.finalized {
                Finalization::Accepted => "ACCEPTED".green().bold(),
                Finalization::Rejected => "REJECTED".red().bold(),
                Finalization::Open => "open".yellow(),
            };
            println!(
                "approve {} / reject {} (majority {}) → {}",
                outcome.approve_count, outcome.reject_count, outcome.majority, status
            );
            if let Some(block) = &outcome.block {
                println!("Sealed in block #{} {}", block.index, short_hash(&block.hash).cyan());
            }
            if let Some(err) = &outcome.error {
                println!("{} {}", "⚠️ ".yellow(), err);
            }
        }
        Command::Chain => {
            let chain = node.chain();
            println!("{}", format!("⛓️  Global chain ({} blocks)", chain.len()).bright_cyan().bold());
            println!("{}", blocks_table(&chain));
        }
        Command::Block { index } => match node.block(index) {
            Some(block) => println!("{}", serde_json::to_string_pretty(&block)?),
            None => {
                eprintln!("{}", format!("No block at index {}", index).red());
                std::process::exit(1);
            }
        },
        Command::Pending => {
            let pending = node.pending();
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["Tx", "Type", "Requested by", "Submitted", "Votes"]);
            for record in &pending {
                let votes = node
                    .votes_for(&record.tx_id)
                    .map(|tally| {
                        tally
                            .iter()
                            .map(|(voter, d)| format!("{}: {:?}", voter, d))
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                table.add_row(vec![
                    Cell::new(&record.tx_id),
                    Cell::new(record.tx.type_name()),
                    Cell::new(&record.tx.requested_by),
                    Cell::new(format_timestamp(record.time_submitted)),
                    Cell::new(votes),
                ]);
            }
            let voters = node.voters();
            println!(
                "{}",
                format!(
                    "🗳️  {} pending, admins: {} | garages: {}",
                    pending.len(),
                    voters.admins.iter().cloned().collect::<Vec<_>>().join(", "),
                    voters.garages.iter().cloned().collect::<Vec<_>>().join(", ")
                )
                .bright_cyan()
            );
            println!("{}", table);
        }
        Command::History { vin } => {
            let history = node.vehicle_history(&vin);
            if history.is_empty() {
                println!("{}", format!("No history for {}", vin).yellow());
                return Ok(());
            }
            println!("{}", format!("🚗 Vehicle {}", vin).bright_cyan().bold());
            for event in &history.global_events {
                println!(
                    "  #{:<4} {} {:<20} {}",
                    event.block_index,
                    format_timestamp(event.timestamp),
                    event.kind,
                    event.payload
                );
            }
            println!("{}", format!("🔧 Service sub-chain ({} blocks)", history.vehicle_chain.len()).bright_cyan());
            println!("{}", blocks_table(&history.vehicle_chain));
            for service in history.service_records() {
                println!("  {}: {}", service.garage.bold(), service.description);
            }
        }
        Command::Owner { vin } => match node.current_owner(&vin) {
            Some(owner) => println!("{} is owned by {}", vin, owner.green().bold()),
            None => println!("{}", format!("{} has never been registered", vin).yellow()),
        },
        Command::OwnedBy { identity } => {
            let vehicles = node.vehicles_owned_by(&identity);
            println!("{} owns {} vehicle(s)", identity.bold(), vehicles.len());
            for vin in vehicles {
                println!("  • {}", vin);
            }
        }
        Command::AddAdmin { identity } => {
            let added = node.add_admin(&identity)?;
            println!("{}", if added { "Admin added".green() } else { "Already an admin".yellow() });
        }
        Command::AddGarage { identity } => {
            let added = node.add_garage(&identity)?;
            println!("{}", if added { "Garage added".green() } else { "Already a garage".yellow() });
        }
        Command::Verify => {
            if node.verify() {
                println!("{}", "✅ All chains verify".green().bold());
            } else {
                eprintln!("{}", "❌ Chain verification failed".red().bold());
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
