//! Caching layer for derived balances
//!
//! Balances are a pure function of the chain, so the cache is only ever a
//! shortcut around a replay. Any chain mutation clears it.
use crate::transaction::{Amount, TokenKind};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

const DEFAULT_CAPACITY: usize = 1_024;

pub struct BalanceCache {
    inner: Mutex<LruCache<(String, TokenKind), Amount>>,
}

impl BalanceCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or_else(|| NonZeroUsize::new(DEFAULT_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, identity: &str, token: TokenKind) -> Option<Amount> {
        self.inner
            .lock()
            .get(&(identity.to_string(), token))
            .copied()
    }

    pub fn put(&self, identity: &str, token: TokenKind, amount: Amount) {
        self.inner.lock().put((identity.to_string(), token), amount);
    }

    pub fn invalidate(&self, identity: &str) {
        let mut inner = self.inner.lock();
        for token in TokenKind::ALL {
            inner.pop(&(identity.to_string(), token));
        }
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BalanceCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
