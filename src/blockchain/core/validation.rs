use crate::block::{Block, GENESIS_PREVIOUS_HASH};
use crate::config::TransactionRules;
use crate::crypto::Sha256Hash;
use crate::error::ChainError;
use crate::identity::GENESIS_IDENTITY;
use crate::transaction::{Amount, TokenKind, Transaction};
use std::collections::{HashMap, HashSet};

use super::state::ChainIndex;

/// Fingerprint of a user spend. Two committed transactions sharing one are
/// treated as the same spend replayed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpendKey {
    pub sender: String,
    pub token: TokenKind,
    pub amount: Amount,
    pub created_at: u64,
}

impl SpendKey {
    /// `None` for system senders, which are exempt from double-spend accounting.
    pub fn of(tx: &Transaction) -> Option<Self> {
        if tx.is_system_sender() {
            return None;
        }
        Some(SpendKey {
            sender: tx.from_id.clone(),
            token: tx.token,
            amount: tx.amount,
            created_at: tx.created_at,
        })
    }
}

/// Rejects a block that replays a committed transaction or spend, or that
/// contains the same spend twice.
pub fn validate_no_double_spend(block: &Block, index: &ChainIndex) -> Result<(), ChainError> {
    let mut seen_hashes: HashSet<Sha256Hash> = HashSet::new();
    let mut seen_spends: HashMap<SpendKey, Sha256Hash> = HashMap::new();

    for tx in &block.transactions {
        if index.is_committed(&tx.content_hash) || !seen_hashes.insert(tx.content_hash) {
            return Err(ChainError::DoubleSpendDetected(format!(
                "transaction {} is already committed",
                tx.hash_str()
            )));
        }

        let Some(key) = SpendKey::of(tx) else {
            continue;
        };
        if index.has_spend(&key) {
            return Err(ChainError::DoubleSpendDetected(format!(
                "spend of {} {} by {} at {} collides with a committed transaction",
                key.amount, key.token, key.sender, key.created_at
            )));
        }
        if let Some(conflicting) = seen_spends.get(&key) {
            return Err(ChainError::DoubleSpendDetected(format!(
                "Double spend detected in block. {} and {} spend the same funds",
                hex::encode(conflicting),
                tx.hash_str()
            )));
        }
        seen_spends.insert(key, tx.content_hash);
    }
    Ok(())
}

/// Rejects a block whose user spends exceed the senders' balances before it.
pub fn validate_block_spends<F>(block: &Block, balance_of: F) -> Result<(), ChainError>
where
    F: Fn(&str, TokenKind) -> Amount,
{
    let mut outgoing: HashMap<(&str, TokenKind), Amount> = HashMap::new();
    for tx in block.transactions.iter().filter(|tx| !tx.is_system_sender()) {
        let total = outgoing.entry((tx.from_id.as_str(), tx.token)).or_default();
        *total = total.saturating_add(tx.amount);
    }

    for ((sender, token), spent) in outgoing {
        let available = balance_of(sender, token);
        if spent > available {
            return Err(ChainError::InsufficientBalance {
                available: format!("{} {}", available, token),
                required: format!("{} {}", spent, token),
            });
        }
    }
    Ok(())
}

/// Structural checks on block 0.
pub fn validate_genesis(genesis: &Block, rules: &TransactionRules) -> Result<(), ChainError> {
    if genesis.header.height != 0
        || genesis.header.previous_hash != GENESIS_PREVIOUS_HASH
        || genesis.header.difficulty != 0
        || genesis.header.validator_id != GENESIS_IDENTITY
    {
        return Err(ChainError::Integrity(
            "genesis block header is malformed".to_string(),
        ));
    }
    if genesis.transactions.iter().any(|tx| !tx.is_system_sender()) {
        return Err(ChainError::Integrity(
            "genesis block may only carry system allocations".to_string(),
        ));
    }
    genesis.validate(None, rules)
}

/// Whole-chain validation from genesis. When `expected_genesis` is given the
/// chain must start from that exact block.
pub fn validate_chain(
    blocks: &[Block],
    rules: &TransactionRules,
    expected_genesis: Option<&Sha256Hash>,
) -> Result<(), ChainError> {
    let genesis = blocks
        .first()
        .ok_or_else(|| ChainError::Integrity("chain has no genesis block".to_string()))?;
    validate_genesis(genesis, rules)?;
    if let Some(expected) = expected_genesis {
        if genesis.hash != *expected {
            return Err(ChainError::Conflict(format!(
                "chain starts from foreign genesis {}",
                genesis.hash_str()
            )));
        }
    }

    let mut index = ChainIndex::build(std::slice::from_ref(genesis));
    for pair in blocks.windows(2) {
        let (prev, block) = (&pair[0], &pair[1]);
        block.validate(Some(prev), rules)?;
        validate_no_double_spend(block, &index)?;
        index.record_block(block);
    }
    Ok(())
}
