//! Derived ledger state: committed-transaction index, balance replay and history
use crate::block::Block;
use crate::crypto::Sha256Hash;
use crate::transaction::{Amount, TokenKind, Transaction};
use std::collections::HashSet;

use super::validation::SpendKey;

/// Lookup structure over every committed transaction, rebuilt from the
/// chain whenever the chain is replaced.
#[derive(Debug, Clone, Default)]
pub struct ChainIndex {
    committed: HashSet<Sha256Hash>,
    spends: HashSet<SpendKey>,
}

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(blocks: &[Block]) -> Self {
        let mut index = Self::new();
        for block in blocks {
            index.record_block(block);
        }
        index
    }

    pub fn record_block(&mut self, block: &Block) {
        for tx in &block.transactions {
            self.committed.insert(tx.content_hash);
            if let Some(key) = SpendKey::of(tx) {
                self.spends.insert(key);
            }
        }
    }

    pub fn is_committed(&self, content_hash: &Sha256Hash) -> bool {
        self.committed.contains(content_hash)
    }

    pub fn has_spend(&self, key: &SpendKey) -> bool {
        self.spends.contains(key)
    }

    pub fn transaction_count(&self) -> usize {
        self.committed.len()
    }
}

/// Replays every transaction touching `identity` in `token`, starting from
/// `opening`. Intermediate deficits are carried exactly and the result is
/// clamped at zero.
pub fn replay_balance(blocks: &[Block], identity: &str, token: TokenKind, opening: Amount) -> Amount {
    let mut balance: i128 = opening.units() as i128;
    for tx in blocks.iter().flat_map(|b| b.transactions.iter()) {
        if tx.token != token {
            continue;
        }
        if tx.to_id == identity {
            balance += tx.amount.units() as i128;
        }
        if tx.from_id == identity {
            balance -= tx.amount.units() as i128;
        }
    }
    Amount::from_units(balance.clamp(0, u64::MAX as i128) as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
    /// Sender and recipient are the same identity.
    SelfTransfer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub transaction: Transaction,
    pub block_height: u64,
    pub block_hash: Sha256Hash,
    pub direction: Direction,
}

/// Committed transactions touching `identity`, newest first.
pub fn transaction_history(
    blocks: &[Block],
    identity: &str,
    token: Option<TokenKind>,
) -> Vec<HistoryEntry> {
    let mut entries: Vec<HistoryEntry> = blocks
        .iter()
        .flat_map(|block| {
            block.transactions.iter().filter_map(move |tx| {
                if token.map_or(false, |t| t != tx.token) {
                    return None;
                }
                let direction = match (tx.from_id == identity, tx.to_id == identity) {
                    (true, true) => Direction::SelfTransfer,
                    (true, false) => Direction::Outgoing,
                    (false, true) => Direction::Incoming,
                    (false, false) => return None,
                };
                Some(HistoryEntry {
                    transaction: tx.clone(),
                    block_height: block.header.height,
                    block_hash: block.hash,
                    direction,
                })
            })
        })
        .collect();

    entries.sort_by(|a, b| {
        b.transaction
            .created_at
            .cmp(&a.transaction.created_at)
            .then_with(|| b.block_height.cmp(&a.block_height))
    });
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Payload;

    const A: &str = "did:contrib:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const B: &str = "did:contrib:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn transfer(from: &str, to: &str, tokens: u64, token: TokenKind, at: u64) -> Transaction {
        Transaction::create_at(
            from,
            to,
            Amount::from_tokens(tokens),
            token,
            Payload::default(),
            at,
            [at as u8; 16],
        )
    }

    fn blocks() -> Vec<Block> {
        let genesis = Block::genesis(
            0,
            vec![Transaction::genesis_allocation(A, Amount::from_tokens(1000), TokenKind::B, 0, 0)],
        );
        let one = Block::new_at(
            1,
            genesis.hash,
            vec![
                transfer(A, B, 100, TokenKind::B, 10),
                transfer(B, A, 5, TokenKind::P, 11),
            ],
            A,
            0,
            20,
        );
        vec![genesis, one]
    }

    #[test]
    fn test_replay_balances_per_token() {
        let chain = blocks();
        assert_eq!(replay_balance(&chain, A, TokenKind::B, Amount::ZERO), Amount::from_tokens(900));
        assert_eq!(replay_balance(&chain, B, TokenKind::B, Amount::ZERO), Amount::from_tokens(100));
        // B spent P it never had: clamped
        assert_eq!(replay_balance(&chain, B, TokenKind::P, Amount::ZERO), Amount::ZERO);
        assert_eq!(replay_balance(&chain, A, TokenKind::P, Amount::ZERO), Amount::from_tokens(5));
        assert_eq!(
            replay_balance(&chain, B, TokenKind::P, Amount::from_tokens(10)),
            Amount::from_tokens(5)
        );
    }

    #[test]
    fn test_history_newest_first() {
        let chain = blocks();
        let history = transaction_history(&chain, A, None);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].direction, Direction::Incoming);
        assert_eq!(history[0].transaction.token, TokenKind::P);
        assert_eq!(history[2].block_height, 0);

        let only_b = transaction_history(&chain, A, Some(TokenKind::B));
        assert_eq!(only_b.len(), 2);
        assert_eq!(only_b[0].direction, Direction::Outgoing);
    }

    #[test]
    fn test_index_tracks_commits() {
        let chain = blocks();
        let index = ChainIndex::build(&chain);
        assert_eq!(index.transaction_count(), 3);
        assert!(index.is_committed(&chain[1].transactions[0].content_hash));
        assert!(index.has_spend(&SpendKey::of(&chain[1].transactions[0]).unwrap()));
    }
}
