/// Transaction types for the vehicle ledger
use crate::blockchain::now_millis;
use crate::error::LedgerError;
use crate::voting::VoterRole;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const REGISTER_VEHICLE: &str = "register_vehicle";
pub const ADD_SERVICE: &str = "add_service";
pub const PROPOSE_GARAGE: &str = "propose_garage";
pub const TRANSFER_OWNERSHIP: &str = "transfer_ownership";

/// Keys a payload carries beyond its typed fields. They are stored, hashed
/// and returned exactly as submitted.
pub type ExtraFields = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterVehicle {
    pub vin: String,
    pub owner: String,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl RegisterVehicle {
    /// Free-form registration details, if supplied.
    pub fn meta(&self) -> Option<&Value> {
        self.extra.get("meta")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub vin: String,
    pub garage: String,
    pub description: String,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposeGarage {
    pub garage: String,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferOwnership {
    pub vin: String,
    pub to: String,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl TransferOwnership {
    /// The owner the caller claims to be transferring from. Informational only.
    pub fn from(&self) -> Option<&str> {
        self.extra.get("from").and_then(Value::as_str)
    }
}

/// The closed set of transaction types, plus a fallback for anything else.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionKind {
    RegisterVehicle(RegisterVehicle),
    AddService(ServiceRecord),
    ProposeGarage(ProposeGarage),
    TransferOwnership(TransferOwnership),
    /// Unrecognized type name. Carried verbatim and voted on by the admins.
    Other { kind: String, payload: Value },
}

impl TransactionKind {
    /// Build a kind from its wire form: a type name and a JSON payload.
    pub fn from_parts(kind: &str, payload: Value) -> Result<Self, LedgerError> {
        fn typed<T: serde::de::DeserializeOwned>(kind: &str, payload: Value) -> Result<T, LedgerError> {
            serde_json::from_value(payload).map_err(|e| {
                LedgerError::InvalidTransaction(format!("Malformed {} payload: {}", kind, e))
            })
        }

        Ok(match kind {
            REGISTER_VEHICLE => TransactionKind::RegisterVehicle(typed(kind, payload)?),
            ADD_SERVICE => TransactionKind::AddService(typed(kind, payload)?),
            PROPOSE_GARAGE => TransactionKind::ProposeGarage(typed(kind, payload)?),
            TRANSFER_OWNERSHIP => TransactionKind::TransferOwnership(typed(kind, payload)?),
            other => TransactionKind::Other {
                kind: other.to_string(),
                payload,
            },
        })
    }

    pub fn type_name(&self) -> &str {
        match self {
            TransactionKind::RegisterVehicle(_) => REGISTER_VEHICLE,
            TransactionKind::AddService(_) => ADD_SERVICE,
            TransactionKind::ProposeGarage(_) => PROPOSE_GARAGE,
            TransactionKind::TransferOwnership(_) => TRANSFER_OWNERSHIP,
            TransactionKind::Other { kind, .. } => kind,
        }
    }

    pub fn payload(&self) -> Value {
        let encoded = match self {
            TransactionKind::RegisterVehicle(p) => serde_json::to_value(p),
            TransactionKind::AddService(p) => serde_json::to_value(p),
            TransactionKind::ProposeGarage(p) => serde_json::to_value(p),
            TransactionKind::TransferOwnership(p) => serde_json::to_value(p),
            TransactionKind::Other { payload, .. } => return payload.clone(),
        };
        // Plain structs with string keys always encode.
        encoded.unwrap_or_default()
    }

    /// The vehicle this transaction refers to, if any. Unrecognized types are
    /// matched on a `vin` string in their payload.
    pub fn vin(&self) -> Option<&str> {
        match self {
            TransactionKind::RegisterVehicle(p) => Some(&p.vin),
            TransactionKind::AddService(p) => Some(&p.vin),
            TransactionKind::TransferOwnership(p) => Some(&p.vin),
            TransactionKind::ProposeGarage(_) => None,
            TransactionKind::Other { payload, .. } => payload.get("vin").and_then(Value::as_str),
        }
    }

    /// Which voter set ratifies this transaction.
    pub fn voter_role(&self) -> VoterRole {
        match self {
            TransactionKind::AddService(_) => VoterRole::Garages,
            _ => VoterRole::Admins,
        }
    }
}

/// A transaction as submitted by a collaborator. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRequest", into = "RawRequest")]
pub struct TransactionRequest {
    pub kind: TransactionKind,
    pub requested_by: String,
    /// Milliseconds since the Unix epoch, as supplied by the caller.
    pub submitted_at: u64,
}

impl TransactionRequest {
    pub fn new(kind: TransactionKind, requested_by: impl Into<String>) -> Self {
        Self {
            kind,
            requested_by: requested_by.into(),
            submitted_at: now_millis(),
        }
    }

    pub fn from_parts(
        kind: &str,
        payload: Value,
        requested_by: impl Into<String>,
        submitted_at: u64,
    ) -> Result<Self, LedgerError> {
        Ok(Self {
            kind: TransactionKind::from_parts(kind, payload)?,
            requested_by: requested_by.into(),
            submitted_at,
        })
    }

    pub fn type_name(&self) -> &str {
        self.kind.type_name()
    }
}

#[derive(Serialize, Deserialize)]
struct RawRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    requested_by: String,
    #[serde(rename = "time", default)]
    submitted_at: u64,
}

impl TryFrom<RawRequest> for TransactionRequest {
    type Error = LedgerError;

    fn try_from(raw: RawRequest) -> Result<Self, Self::Error> {
        TransactionRequest::from_parts(&raw.kind, raw.payload, raw.requested_by, raw.submitted_at)
    }
}

impl From<TransactionRequest> for RawRequest {
    fn from(request: TransactionRequest) -> Self {
        RawRequest {
            kind: request.kind.type_name().to_string(),
            payload: request.kind.payload(),
            requested_by: request.requested_by,
            submitted_at: request.submitted_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Accepted,
    Rejected,
}

/// A submitted transaction awaiting (or having reached) a quorum decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub tx_id: String,
    pub tx: TransactionRequest,
    pub time_submitted: u64,
    pub status: TxStatus,
}

impl PendingRecord {
    pub fn kind(&self) -> &TransactionKind {
        &self.tx.kind
    }
}
