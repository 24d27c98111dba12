//! Pending transaction pool
//!
//! Transactions are keyed by [`Transaction::unique_id`]. Access is serialized
//! by the owning [`crate::blockchain::Blockchain`], so the pool itself is a
//! plain single-threaded structure.

use crate::crypto::Sha256Hash;
use crate::error::ChainError;
use crate::transaction::{Amount, TokenKind, Transaction};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct Mempool {
    transactions: HashMap<Sha256Hash, Transaction>,
    content_hashes: HashSet<Sha256Hash>,
    max_size: usize,
    duplicate_window_ms: u64,
}

impl Mempool {
    pub fn new(max_size: usize, duplicate_window_ms: u64) -> Self {
        Self {
            transactions: HashMap::new(),
            content_hashes: HashSet::new(),
            max_size,
            duplicate_window_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn contains(&self, tx: &Transaction) -> bool {
        self.transactions.contains_key(&tx.unique_id()) || self.content_hashes.contains(&tx.content_hash)
    }

    /// Same parties, token, amount and operation within the near-duplicate window.
    pub fn find_near_duplicate(&self, tx: &Transaction) -> Option<&Transaction> {
        self.transactions.values().find(|pending| {
            pending.from_id == tx.from_id
                && pending.to_id == tx.to_id
                && pending.token == tx.token
                && pending.amount == tx.amount
                && pending.payload.kind == tx.payload.kind
                && pending.created_at.abs_diff(tx.created_at) < self.duplicate_window_ms
        })
    }

    pub fn add(&mut self, tx: Transaction) -> Result<(), ChainError> {
        if self.contains(&tx) {
            return Err(ChainError::DuplicateTransaction(format!(
                "transaction {} is already pending",
                tx.hash_str()
            )));
        }
        if let Some(existing) = self.find_near_duplicate(&tx) {
            return Err(ChainError::DuplicateTransaction(format!(
                "near-duplicate of pending transaction {}",
                existing.hash_str()
            )));
        }
        if self.transactions.len() >= self.max_size {
            return Err(ChainError::MempoolFull);
        }

        self.content_hashes.insert(tx.content_hash);
        self.transactions.insert(tx.unique_id(), tx);
        Ok(())
    }

    /// Sum of pending outgoing amounts for `sender` in `token`.
    pub fn pending_spend(&self, sender: &str, token: TokenKind) -> Amount {
        self.transactions
            .values()
            .filter(|tx| tx.from_id == sender && tx.token == token)
            .fold(Amount::ZERO, |acc, tx| acc.saturating_add(tx.amount))
    }

    /// Up to `limit` pending transactions, oldest first.
    pub fn select(&self, limit: usize) -> Vec<Transaction> {
        let mut pending: Vec<&Transaction> = self.transactions.values().collect();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.content_hash.cmp(&b.content_hash))
        });
        pending.into_iter().take(limit).cloned().collect()
    }

    /// Drops transactions older than `max_age_ms` at `now`.
    pub fn evict_stale(&mut self, now: u64, max_age_ms: u64) -> usize {
        self.retain(|tx| tx.created_at.saturating_add(max_age_ms) >= now)
    }

    /// Keeps transactions matching `keep`; returns how many were removed.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&Transaction) -> bool,
    {
        let before = self.transactions.len();
        let content_hashes = &mut self.content_hashes;
        self.transactions.retain(|_, tx| {
            let kept = keep(tx);
            if !kept {
                content_hashes.remove(&tx.content_hash);
            }
            kept
        });
        before - self.transactions.len()
    }

    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.values()
    }

    pub fn clear(&mut self) {
        self.transactions.clear();
        self.content_hashes.clear();
    }
}
