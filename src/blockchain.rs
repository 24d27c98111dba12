//! The chain orchestrator. The implementation lives in `blockchain/core`,
//! split into chain management, derived state and validation.

pub mod core;
pub use self::core::*;
