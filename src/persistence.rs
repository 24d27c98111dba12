//! Chain snapshot storage interface
//!
//! The ledger core does not own a database. It consumes a [`SnapshotStore`]
//! that persists the full block list and per-identity opening balances;
//! an absent snapshot means "bootstrap from genesis".

use crate::block::Block;
use crate::error::ChainError;
use crate::transaction::{Amount, TokenKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Storage backends must save snapshots atomically: a reader never observes
/// a partially written block list.
pub trait SnapshotStore: Send + Sync {
    fn load_chain(&self) -> Result<Option<Vec<Block>>, ChainError>;
    fn save_chain(&self, blocks: &[Block]) -> Result<(), ChainError>;
    fn get_balance_checkpoint(
        &self,
        identity: &str,
        token: TokenKind,
    ) -> Result<Option<Amount>, ChainError>;
    fn set_balance_checkpoint(
        &self,
        identity: &str,
        token: TokenKind,
        amount: Amount,
    ) -> Result<(), ChainError>;
}

/// Simple in-memory store useful for tests and ephemeral nodes. Clones share
/// the same underlying state.
#[derive(Clone, Default)]
pub struct InMemorySnapshotStore {
    blocks: Arc<Mutex<Option<Vec<Block>>>>,
    checkpoints: Arc<Mutex<HashMap<(String, TokenKind), Amount>>>,
    saves: Arc<Mutex<u64>>,
}

fn poisoned<T>(_: T) -> ChainError {
    ChainError::StorageError("Mutex poisoned".to_string())
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-loaded with `blocks`, as if a previous run had saved them.
    pub fn with_chain(blocks: Vec<Block>) -> Self {
        let store = Self::default();
        if let Ok(mut slot) = store.blocks.lock() {
            *slot = Some(blocks);
        }
        store
    }

    /// Number of successful `save_chain` calls.
    pub fn save_count(&self) -> Result<u64, ChainError> {
        Ok(*self.saves.lock().map_err(poisoned)?)
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn load_chain(&self) -> Result<Option<Vec<Block>>, ChainError> {
        let blocks = self.blocks.lock().map_err(poisoned)?;
        Ok(blocks.clone())
    }

    fn save_chain(&self, blocks: &[Block]) -> Result<(), ChainError> {
        let mut slot = self.blocks.lock().map_err(poisoned)?;
        *slot = Some(blocks.to_vec());
        *self.saves.lock().map_err(poisoned)? += 1;
        Ok(())
    }

    fn get_balance_checkpoint(
        &self,
        identity: &str,
        token: TokenKind,
    ) -> Result<Option<Amount>, ChainError> {
        let checkpoints = self.checkpoints.lock().map_err(poisoned)?;
        Ok(checkpoints.get(&(identity.to_string(), token)).copied())
    }

    fn set_balance_checkpoint(
        &self,
        identity: &str,
        token: TokenKind,
        amount: Amount,
    ) -> Result<(), ChainError> {
        let mut checkpoints = self.checkpoints.lock().map_err(poisoned)?;
        checkpoints.insert((identity.to_string(), token), amount);
        Ok(())
    }
}
