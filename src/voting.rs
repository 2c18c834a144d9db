//! Role-gated majority voting
//!
//! Voter identities are opaque strings supplied by the caller; the ledger
//! only counts them.

use crate::blockchain::Block;
use crate::error::LedgerError;
use crate::transaction::PendingRecord;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

impl FromStr for Decision {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Decision::Approve),
            "reject" => Ok(Decision::Reject),
            other => Err(LedgerError::InvalidDecision(other.to_string())),
        }
    }
}

/// voter identity -> latest decision. Re-voting overwrites.
pub type VoteTally = BTreeMap<String, Decision>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoterRole {
    Admins,
    Garages,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterSets {
    pub admins: BTreeSet<String>,
    pub garages: BTreeSet<String>,
}

impl VoterSets {
    pub fn new<A, G>(admins: A, garages: G) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        G: IntoIterator,
        G::Item: Into<String>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
            garages: garages.into_iter().map(Into::into).collect(),
        }
    }

    /// Size of the set a quorum is computed against. An empty garage set
    /// counts as one so a lone garage can still ratify service records.
    pub fn quorum_base(&self, role: VoterRole) -> usize {
        match role {
            VoterRole::Admins => self.admins.len(),
            VoterRole::Garages => self.garages.len().max(1),
        }
    }

    pub fn majority(&self, role: VoterRole) -> usize {
        majority(self.quorum_base(role))
    }
}

/// `floor(n / 2) + 1`
pub fn majority(voter_set_size: usize) -> usize {
    voter_set_size / 2 + 1
}

/// (approve, reject) counts for a tally.
pub fn count(tally: &VoteTally) -> (usize, usize) {
    tally.values().fold((0, 0), |(approve, reject), decision| match decision {
        Decision::Approve => (approve + 1, reject),
        Decision::Reject => (approve, reject + 1),
    })
}

/// Whether a vote finalized its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalization {
    Accepted,
    Rejected,
    Open,
}

// Wire form: "accepted", "rejected", or `false` while still open.
impl Serialize for Finalization {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Finalization::Accepted => serializer.serialize_str("accepted"),
            Finalization::Rejected => serializer.serialize_str("rejected"),
            Finalization::Open => serializer.serialize_bool(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoteOutcome {
    pub approve_count: usize,
    pub reject_count: usize,
    pub majority: usize,
    pub finalized: Finalization,
    /// The finalized record, present once `finalized` is not `Open`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<PendingRecord>,
    /// The block that absorbed an accepted transaction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<Block>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VoteOutcome {
    pub fn open(approve_count: usize, reject_count: usize, majority: usize) -> Self {
        Self {
            approve_count,
            reject_count,
            majority,
            finalized: Finalization::Open,
            tx: None,
            block: None,
            error: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized != Finalization::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority() {
        assert_eq!(majority(0), 1);
        assert_eq!(majority(1), 1);
        assert_eq!(majority(2), 2);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 3);
    }

    #[test]
    fn test_empty_garage_set_counts_as_one() {
        let voters = VoterSets::new(["alice", "bob", "carol"], Vec::<String>::new());
        assert_eq!(voters.majority(VoterRole::Garages), 1);
        assert_eq!(voters.majority(VoterRole::Admins), 2);
    }

    #[test]
    fn test_revote_overwrites() {
        let mut tally = VoteTally::new();
        tally.insert("alice".to_string(), Decision::Approve);
        tally.insert("alice".to_string(), Decision::Reject);
        assert_eq!(count(&tally), (0, 1));
    }

    #[test]
    fn test_decision_parsing() {
        assert_eq!("approve".parse::<Decision>().unwrap(), Decision::Approve);
        assert_eq!("reject".parse::<Decision>().unwrap(), Decision::Reject);
        assert_eq!(
            "maybe".parse::<Decision>(),
            Err(LedgerError::InvalidDecision("maybe".to_string()))
        );
    }

    #[test]
    fn test_outcome_wire_form() {
        let open = serde_json::to_value(VoteOutcome::open(1, 1, 2)).unwrap();
        assert_eq!(
            open,
            serde_json::json!({"approve_count": 1, "reject_count": 1, "majority": 2, "finalized": false})
        );

        let mut rejected = VoteOutcome::open(0, 2, 2);
        rejected.finalized = Finalization::Rejected;
        assert_eq!(serde_json::to_value(rejected).unwrap()["finalized"], "rejected");
    }
}
