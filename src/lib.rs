//! ContribChain - a permissioned ledger for a contribution-based token economy
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Ledger
//! - [`transaction`] - Signed value transfers and their validity rules
//! - [`block`] - Hash-linked transaction batches with merkle roots
//! - [`blockchain`] - The chain orchestrator (mempool, balances, fork resolution)
//! - [`mempool`] - Pending transaction pool
//!
//! ## Consensus
//! - [`consensus`] - Proof-of-Contribution validator selection
//!
//! ## Cryptography & Identity
//! - [`crypto`] - Signatures and verification (secp256k1)
//! - [`identity`] - Identity classes and key binding
//!
//! ## State Management
//! - [`persistence`] - Chain snapshot storage interface
//! - [`cache`] - Balance cache
//!
//! ## Networking
//! - [`network`] - Authenticated P2P overlay
//! - [`sync`] - Chain synchronization bookkeeping
//! - [`node`] - Runtime wiring of chain and network
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration structs
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod block;
pub mod blockchain;
pub mod mempool;
pub mod transaction;

// ============================================================================
// Consensus
// ============================================================================
pub mod consensus;

// ============================================================================
// Cryptography & Identity
// ============================================================================
pub mod crypto;
pub mod identity;

// ============================================================================
// State Management
// ============================================================================
pub mod cache;
pub mod persistence;

// ============================================================================
// Networking
// ============================================================================
pub mod network;
pub mod node;
pub mod sync;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;

/// Milliseconds since the Unix epoch, the clock every timestamp in the crate uses.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
