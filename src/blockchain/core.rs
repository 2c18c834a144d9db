// Block sealing and chain management, plus integrity checks.
pub mod chain;
pub mod validation;

pub use chain::*;
pub use validation::*;
