use crate::error::LedgerError;
use crate::transaction::types::{TransactionKind, TransactionRequest};

/// Maximum encoded request size in bytes (100KB) to keep blocks and snapshots bounded
pub const MAX_TRANSACTION_SIZE: usize = 100_000;

/// Size in bytes of the request's bincode encoding (type, payload,
/// requester and time).
pub fn encoded_size(request: &TransactionRequest) -> Result<usize, LedgerError> {
    Ok(bincode::serialized_size(request)? as usize)
}

/// Reject requests whose encoding exceeds [`MAX_TRANSACTION_SIZE`].
pub fn validate_size(request: &TransactionRequest) -> Result<(), LedgerError> {
    let size = encoded_size(request)?;

    if size > MAX_TRANSACTION_SIZE {
        return Err(LedgerError::InvalidTransaction(format!(
            "Transaction too large: {} bytes (max: {})",
            size, MAX_TRANSACTION_SIZE
        )));
    }
    Ok(())
}

fn require(field: &str, value: &str) -> Result<(), LedgerError> {
    if value.trim().is_empty() {
        return Err(LedgerError::InvalidTransaction(format!("{} must not be empty", field)));
    }
    Ok(())
}

/// Structural checks applied at submission.
pub fn validate_request(request: &TransactionRequest) -> Result<(), LedgerError> {
    require("requested_by", &request.requested_by)?;

    match &request.kind {
        TransactionKind::RegisterVehicle(p) => {
            require("vin", &p.vin)?;
            require("owner", &p.owner)?;
        }
        TransactionKind::AddService(p) => {
            require("vin", &p.vin)?;
            require("garage", &p.garage)?;
        }
        TransactionKind::ProposeGarage(p) => require("garage", &p.garage)?,
        TransactionKind::TransferOwnership(p) => {
            require("vin", &p.vin)?;
            require("to", &p.to)?;
        }
        TransactionKind::Other { kind, .. } => require("type", kind)?,
    }

    validate_size(request)
}
