//! Transaction types and request validation

pub mod types;
pub mod validation;

pub use types::*;
pub use validation::{encoded_size, validate_request, MAX_TRANSACTION_SIZE};
