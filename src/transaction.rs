//! Transaction module split into types and validation

pub mod types;
pub mod validation;

pub use types::*;
pub use validation::{SYSTEM_OPERATION_KINDS, ZERO_AMOUNT_KINDS};
