use crate::block::Block;
use crate::cache::BalanceCache;
use crate::config::ChainConfig;
use crate::consensus::ConsensusEngine;
use crate::crypto::Sha256Hash;
use crate::error::{ChainError, ErrorKind};
use crate::identity::{self, IdentityRegistry, SYSTEM_IDENTITY};
use crate::mempool::Mempool;
use crate::persistence::{InMemorySnapshotStore, SnapshotStore};
use crate::transaction::{Amount, TokenKind, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::state::{replay_balance, transaction_history, ChainIndex, HistoryEntry};
use super::validation::{validate_block_spends, validate_chain, validate_no_double_spend, SpendKey};

/// Number of trailing blocks inspected when retargeting difficulty.
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: usize = 10;

const SNAPSHOT_VERSION: u32 = 1;

/// Outbound announcement sink. The network handle implements this so the
/// chain can publish without holding a reference back into the network.
pub trait Gossip: Send + Sync {
    fn announce_transaction(&self, tx: &Transaction);
    fn announce_block(&self, block: &Block);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub unique_id: Sha256Hash,
    pub content_hash: Sha256Hash,
    pub pending_transactions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainStatus {
    pub height: u64,
    pub pending_transactions: usize,
    pub validator_count: usize,
    pub last_block_hash: String,
    pub difficulty: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainStats {
    pub total_blocks: usize,
    pub total_transactions: usize,
    pub volume: BTreeMap<TokenKind, Amount>,
    pub average_transactions_per_block: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorInfo {
    pub registered_at: u64,
    pub blocks_validated: u64,
}

#[derive(Serialize, Deserialize)]
struct ChainSnapshot {
    version: u32,
    blocks: Vec<Block>,
}

/// The canonical chain and everything derived from it.
///
/// All mutation goes through `&mut self`; callers that share a `Blockchain`
/// across tasks wrap it in a single lock so submission, block admission and
/// conflict resolution never interleave.
pub struct Blockchain {
    blocks: Vec<Block>,
    difficulty: u32,
    mempool: Mempool,
    consensus: ConsensusEngine,
    index: ChainIndex,
    balances: BalanceCache,
    validators: BTreeMap<String, ValidatorInfo>,
    storage: Box<dyn SnapshotStore>,
    registry: Option<Arc<dyn IdentityRegistry>>,
    gossip: Option<Arc<dyn Gossip>>,
    config: ChainConfig,
}

impl Blockchain {
    /// Create a new `Blockchain` using an in-memory snapshot store.
    pub fn in_memory(config: ChainConfig) -> Result<Self, ChainError> {
        Self::new(config, Box::new(InMemorySnapshotStore::new()))
    }

    /// Bootstraps from the stored snapshot, or from genesis when there is none.
    /// A snapshot that fails whole-chain validation is fatal.
    pub fn new(config: ChainConfig, storage: Box<dyn SnapshotStore>) -> Result<Self, ChainError> {
        config.validate()?;

        let expected_genesis = Self::build_genesis(&config);
        let blocks = match storage.load_chain()? {
            Some(blocks) if !blocks.is_empty() => {
                if let Err(e) = validate_chain(&blocks, &config.transactions, None) {
                    error!(error = %e, "stored chain snapshot failed validation");
                    return Err(ChainError::Integrity(format!(
                        "local snapshot is invalid and must be repaired or resynced: {}",
                        e
                    )));
                }
                if blocks[0].hash != expected_genesis.hash {
                    warn!(
                        stored = %blocks[0].hash_str(),
                        configured = %expected_genesis.hash_str(),
                        "stored genesis differs from configured genesis"
                    );
                }
                info!(height = blocks.len() - 1, "loaded chain snapshot");
                blocks
            }
            _ => {
                info!(genesis = %expected_genesis.hash_str(), "bootstrapping chain from genesis");
                let blocks = vec![expected_genesis];
                storage.save_chain(&blocks)?;
                blocks
            }
        };

        Ok(Blockchain {
            index: ChainIndex::build(&blocks),
            blocks,
            difficulty: config.difficulty,
            mempool: Mempool::new(config.max_mempool_size, config.duplicate_window_ms),
            consensus: ConsensusEngine::new(config.consensus.clone()),
            balances: BalanceCache::new(config.balance_cache_size),
            validators: BTreeMap::new(),
            storage,
            registry: None,
            gossip: None,
            config,
        })
    }

    /// The genesis block implied by `config`. Deterministic, so every node
    /// with the same configuration agrees on it.
    pub fn build_genesis(config: &ChainConfig) -> Block {
        let seed = config
            .genesis_allocations
            .iter()
            .enumerate()
            .map(|(i, alloc)| {
                Transaction::genesis_allocation(
                    &alloc.identity,
                    alloc.amount,
                    alloc.token,
                    config.genesis_timestamp,
                    i,
                )
            })
            .collect();
        Block::genesis(config.genesis_timestamp, seed)
    }

    pub fn set_identity_registry(&mut self, registry: Arc<dyn IdentityRegistry>) {
        self.registry = Some(registry);
    }

    pub fn set_gossip(&mut self, gossip: Arc<dyn Gossip>) {
        self.gossip = Some(gossip);
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn latest_block(&self) -> &Block {
        // the chain always holds at least the genesis block
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn height(&self) -> u64 {
        self.latest_block().header.height
    }

    pub fn genesis_hash(&self) -> Sha256Hash {
        self.blocks[0].hash
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn consensus(&self) -> &ConsensusEngine {
        &self.consensus
    }

    pub fn consensus_mut(&mut self) -> &mut ConsensusEngine {
        &mut self.consensus
    }

    pub fn validators(&self) -> &BTreeMap<String, ValidatorInfo> {
        &self.validators
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn submit_transaction(&mut self, tx: Transaction) -> Result<TxReceipt, ChainError> {
        let now = crate::now_millis();
        tx.validate(&self.config.transactions, now, self.registry.as_deref())?;

        if self.index.is_committed(&tx.content_hash) {
            return Err(ChainError::DuplicateTransaction(format!(
                "transaction {} is already committed",
                tx.hash_str()
            )));
        }
        if let Some(key) = SpendKey::of(&tx) {
            if self.index.has_spend(&key) {
                return Err(ChainError::DoubleSpendDetected(format!(
                    "spend by {} at {} is already committed",
                    key.sender, key.created_at
                )));
            }
        }

        if !tx.is_system_sender() {
            let balance = self.get_balance(&tx.from_id, tx.token);
            let pending = self.mempool.pending_spend(&tx.from_id, tx.token);
            let available = balance.saturating_sub(pending);
            if tx.amount > available {
                return Err(ChainError::InsufficientBalance {
                    available: format!("{} {}", available, tx.token),
                    required: format!("{} {}", tx.amount, tx.token),
                });
            }
        }

        let receipt = TxReceipt {
            unique_id: tx.unique_id(),
            content_hash: tx.content_hash,
            pending_transactions: self.mempool.len() + 1,
        };
        self.mempool.add(tx.clone())?;
        debug!(tx = %tx.hash_str(), from = %tx.from_id, amount = %tx.amount, "transaction accepted");

        if let Some(gossip) = &self.gossip {
            gossip.announce_transaction(&tx);
        }
        Ok(receipt)
    }

    // ------------------------------------------------------------------
    // Block production
    // ------------------------------------------------------------------

    pub fn register_validator(&mut self, id: &str, score: u64) -> Result<(), ChainError> {
        if !identity::is_acceptable(id, self.config.transactions.allow_test_identities)
            || identity::is_system(id)
        {
            return Err(ChainError::Consensus(format!(
                "cannot register validator with identity {}",
                id
            )));
        }
        self.consensus.set_score(id, score);
        self.validators
            .entry(id.to_string())
            .or_insert_with(|| ValidatorInfo {
                registered_at: crate::now_millis(),
                blocks_validated: 0,
            });
        Ok(())
    }

    /// Weighted selection over `candidates`, or over registered validators
    /// when no candidates are given.
    pub fn select_validator(&self, candidates: &[String]) -> Result<String, ChainError> {
        if candidates.is_empty() {
            let registered: Vec<String> = self.validators.keys().cloned().collect();
            return self.consensus.select_validator(&registered);
        }
        self.consensus.select_validator(candidates)
    }

    /// Unmined successor of the tip carrying `txs` plus the validator reward.
    pub fn assemble_block(
        &self,
        mut txs: Vec<Transaction>,
        validator: &str,
    ) -> Result<Block, ChainError> {
        let prev = self.latest_block();
        let created_at = crate::now_millis().max(prev.header.created_at + 1);
        let height = prev.header.height + 1;

        if !self.config.validator_reward.is_zero() {
            txs.push(Transaction::validator_reward(
                validator,
                self.config.validator_reward,
                height,
                created_at,
            ));
        }
        Ok(Block::new_at(
            height,
            prev.hash,
            txs,
            validator,
            self.difficulty,
            created_at,
        ))
    }

    pub fn create_block(&self, txs: Vec<Transaction>, validator: &str) -> Result<Block, ChainError> {
        let mut block = self.assemble_block(txs, validator)?;
        block.mine();
        Ok(block)
    }

    /// Selects a validator and assembles an unmined block from `txs`, or from
    /// the oldest pending transactions.
    pub fn prepare_block(
        &mut self,
        candidates: &[String],
        txs: Option<Vec<Transaction>>,
    ) -> Result<Block, ChainError> {
        let evicted = self
            .mempool
            .evict_stale(crate::now_millis(), self.config.transactions.max_age_ms);
        if evicted > 0 {
            debug!(evicted, "evicted stale pending transactions");
        }

        let txs = match txs {
            Some(txs) => txs,
            None => self.mempool.select(self.config.max_block_transactions),
        };
        if txs.is_empty() {
            return Err(ChainError::InvalidBlock(
                "no pending transactions to include".to_string(),
            ));
        }

        let validator = self.select_validator(candidates)?;
        self.assemble_block(txs, &validator)
    }

    pub fn mine_and_commit(
        &mut self,
        candidates: &[String],
        txs: Option<Vec<Transaction>>,
    ) -> Result<Block, ChainError> {
        let mut block = self.prepare_block(candidates, txs)?;
        block.mine();
        self.add_block(block.clone(), BlockOrigin::Local)?;
        Ok(block)
    }

    // ------------------------------------------------------------------
    // Block admission
    // ------------------------------------------------------------------

    fn validate_reward(&self, block: &Block) -> Result<(), ChainError> {
        let rewards: Vec<&Transaction> = block
            .transactions
            .iter()
            .filter(|tx| tx.payload.kind_is("validator_reward"))
            .collect();

        if self.config.validator_reward.is_zero() {
            if rewards.is_empty() {
                return Ok(());
            }
            return Err(ChainError::InvalidBlock(
                "block carries an unexpected validator reward".to_string(),
            ));
        }

        let [reward] = rewards.as_slice() else {
            return Err(ChainError::InvalidBlock(format!(
                "expected exactly one validator reward, found {}",
                rewards.len()
            )));
        };
        let height = block.header.height.to_string();
        if reward.from_id != SYSTEM_IDENTITY
            || reward.to_id != block.header.validator_id
            || reward.amount != self.config.validator_reward
            || reward.token != TokenKind::B
            || reward.payload.fields.get("block_height") != Some(&height)
        {
            return Err(ChainError::InvalidBlock(format!(
                "malformed validator reward {}",
                reward.hash_str()
            )));
        }
        Ok(())
    }

    pub fn add_block(&mut self, block: Block, origin: BlockOrigin) -> Result<(), ChainError> {
        let now = crate::now_millis();
        if block.header.created_at > now.saturating_add(self.config.block_max_future_ms) {
            return Err(ChainError::InvalidBlock(format!(
                "block timestamp {} is too far in the future",
                block.header.created_at
            )));
        }
        if block.header.created_at.saturating_add(self.config.block_max_age_ms) < now {
            return Err(ChainError::InvalidBlock(format!(
                "block timestamp {} is too old",
                block.header.created_at
            )));
        }

        if let Err(e) = block.validate(Some(self.latest_block()), &self.config.transactions) {
            if e.kind() == ErrorKind::Integrity {
                error!(height = block.header.height, hash = %block.hash_str(), error = %e, "tampered block rejected");
            }
            return Err(e);
        }
        validate_no_double_spend(&block, &self.index)?;
        self.validate_reward(&block)?;
        validate_block_spends(&block, |id, token| self.get_balance(id, token))?;
        self.consensus.validate_block(&block)?;

        self.commit(block, origin);
        Ok(())
    }

    fn commit(&mut self, block: Block, origin: BlockOrigin) {
        let validator = block.header.validator_id.clone();

        self.index.record_block(&block);
        self.consensus.observe_block(&block);
        self.blocks.push(block);
        self.balances.clear();

        let pruned = self.prune_mempool();

        if let Err(e) = self.storage.save_chain(&self.blocks) {
            warn!(error = %e, "failed to persist chain snapshot");
        }

        let score = self.consensus.reward_validator(&validator);
        if let Some(info) = self.validators.get_mut(&validator) {
            info.blocks_validated += 1;
        }
        self.maybe_adjust_difficulty();

        let block = self.latest_block();
        info!(
            height = block.header.height,
            hash = %block.hash_str(),
            txs = block.transactions.len(),
            validator = %validator,
            score,
            pruned,
            ?origin,
            "block committed"
        );

        if let Some(gossip) = &self.gossip {
            gossip.announce_block(block);
        }
    }

    /// Drops pending transactions that the current chain has committed or
    /// can no longer fund. Spends are charged oldest first, so the earliest
    /// of several competing transfers keeps its place.
    fn prune_mempool(&mut self) -> usize {
        let mut spent: BTreeMap<(String, TokenKind), Amount> = BTreeMap::new();
        let mut dropped: HashSet<Sha256Hash> = HashSet::new();
        for tx in self.mempool.select(usize::MAX) {
            let committed = self.index.is_committed(&tx.content_hash)
                || SpendKey::of(&tx).map_or(false, |key| self.index.has_spend(&key));
            if committed {
                dropped.insert(tx.content_hash);
                continue;
            }
            if tx.is_system_sender() {
                continue;
            }
            let balance = self.get_balance(&tx.from_id, tx.token);
            let pending = spent.entry((tx.from_id.clone(), tx.token)).or_default();
            let required = pending.saturating_add(tx.amount);
            if required > balance {
                debug!(tx = %tx.hash_str(), from = %tx.from_id, "dropping unfunded pending transaction");
                dropped.insert(tx.content_hash);
            } else {
                *pending = required;
            }
        }

        if dropped.is_empty() {
            return 0;
        }
        self.mempool.retain(|tx| !dropped.contains(&tx.content_hash))
    }

    fn maybe_adjust_difficulty(&mut self) {
        if !self.config.adjust_difficulty || self.blocks.len() <= DIFFICULTY_ADJUSTMENT_INTERVAL {
            return;
        }
        let recent = &self.blocks[self.blocks.len() - DIFFICULTY_ADJUSTMENT_INTERVAL - 1..];
        let span = recent[recent.len() - 1].header.created_at - recent[0].header.created_at;
        let average = span / DIFFICULTY_ADJUSTMENT_INTERVAL as u64;
        let target = self.config.target_block_time_ms;

        let adjusted = if average < target {
            self.difficulty + 1
        } else if average > target * 2 {
            self.difficulty.saturating_sub(1)
        } else {
            self.difficulty
        };
        let adjusted = adjusted.clamp(1, self.config.max_difficulty.max(1));
        if adjusted != self.difficulty {
            info!(from = self.difficulty, to = adjusted, average, "difficulty adjusted");
            self.difficulty = adjusted;
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get_balance(&self, id: &str, token: TokenKind) -> Amount {
        if identity::is_system(id) {
            return Amount::SYSTEM_SENTINEL;
        }
        if let Some(cached) = self.balances.get(id, token) {
            return cached;
        }

        let opening = match self.storage.get_balance_checkpoint(id, token) {
            Ok(opening) => opening.unwrap_or(Amount::ZERO),
            Err(e) => {
                warn!(identity = id, error = %e, "balance checkpoint unavailable");
                Amount::ZERO
            }
        };
        let balance = replay_balance(&self.blocks, id, token, opening);
        self.balances.put(id, token, balance);
        balance
    }

    /// Records an opening balance that replay starts from.
    pub fn set_balance_checkpoint(
        &mut self,
        id: &str,
        token: TokenKind,
        amount: Amount,
    ) -> Result<(), ChainError> {
        self.storage.set_balance_checkpoint(id, token, amount)?;
        self.balances.invalidate(id);
        Ok(())
    }

    pub fn get_transaction_history(&self, id: &str, token: Option<TokenKind>) -> Vec<HistoryEntry> {
        transaction_history(&self.blocks, id, token)
    }

    pub fn status(&self) -> ChainStatus {
        ChainStatus {
            height: self.height(),
            pending_transactions: self.mempool.len(),
            validator_count: self.consensus.eligible_count(),
            last_block_hash: self.latest_block().hash_str(),
            difficulty: self.difficulty,
        }
    }

    pub fn stats(&self) -> ChainStats {
        let mut volume = BTreeMap::new();
        for tx in self.blocks.iter().flat_map(|b| b.transactions.iter()) {
            let total: &mut Amount = volume.entry(tx.token).or_default();
            *total = total.saturating_add(tx.amount);
        }
        let total_transactions = self.index.transaction_count();
        ChainStats {
            total_blocks: self.blocks.len(),
            total_transactions,
            volume,
            average_transactions_per_block: total_transactions as f64 / self.blocks.len() as f64,
        }
    }

    // ------------------------------------------------------------------
    // Chain replacement
    // ------------------------------------------------------------------

    pub fn validate_local_chain(&self) -> Result<(), ChainError> {
        validate_chain(&self.blocks, &self.config.transactions, None)
    }

    pub fn is_chain_valid(&self) -> bool {
        match self.validate_local_chain() {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "local chain failed self-audit");
                false
            }
        }
    }

    /// Adopts the longest candidate that is strictly longer than the local
    /// chain, shares its genesis and validates end to end. Returns the new height.
    pub fn resolve_conflicts(&mut self, candidates: Vec<Vec<Block>>) -> Result<u64, ChainError> {
        let genesis = self.genesis_hash();
        let mut best: Option<Vec<Block>> = None;

        for candidate in candidates {
            let best_len = best.as_ref().map_or(self.blocks.len(), Vec::len);
            if candidate.len() <= best_len {
                continue;
            }
            match validate_chain(&candidate, &self.config.transactions, Some(&genesis)) {
                Ok(()) => best = Some(candidate),
                Err(e) => warn!(length = candidate.len(), error = %e, "discarding invalid candidate chain"),
            }
        }

        let Some(chain) = best else {
            return Err(ChainError::Conflict(format!(
                "no valid candidate longer than local height {}",
                self.height()
            )));
        };
        let previous_len = self.blocks.len();
        self.replace_chain(chain);
        for block in &self.blocks[previous_len..] {
            self.consensus.observe_block(block);
        }
        info!(height = self.height(), "adopted longer chain");
        Ok(self.height())
    }

    fn replace_chain(&mut self, blocks: Vec<Block>) {
        self.index = ChainIndex::build(&blocks);
        self.blocks = blocks;
        self.balances.clear();

        let pruned = self.prune_mempool();
        if pruned > 0 {
            debug!(pruned, "pruned pending transactions after chain replacement");
        }
        if let Err(e) = self.storage.save_chain(&self.blocks) {
            warn!(error = %e, "failed to persist chain snapshot");
        }
    }

    pub fn export_chain(&self) -> Result<Vec<u8>, ChainError> {
        let snapshot = ChainSnapshot {
            version: SNAPSHOT_VERSION,
            blocks: self.blocks.clone(),
        };
        Ok(bincode::serialize(&snapshot)?)
    }

    /// Replaces the local chain with an exported snapshot after validating it.
    pub fn import_chain(&mut self, bytes: &[u8]) -> Result<u64, ChainError> {
        let snapshot: ChainSnapshot = bincode::deserialize(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(ChainError::Serialization(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        validate_chain(&snapshot.blocks, &self.config.transactions, None)?;
        self.replace_chain(snapshot.blocks);
        info!(height = self.height(), "imported chain snapshot");
        Ok(self.height())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenesisAllocation;
    use crate::crypto::KeyPair;
    use crate::transaction::Payload;
    use parking_lot::Mutex;

    struct Fixture {
        chain: Blockchain,
        alice: KeyPair,
        bob: KeyPair,
        validator: String,
    }

    fn config_for(alice: &KeyPair) -> ChainConfig {
        ChainConfig {
            difficulty: 1,
            genesis_timestamp: crate::now_millis() - 60_000,
            genesis_allocations: vec![GenesisAllocation {
                identity: alice.identity(),
                token: TokenKind::B,
                amount: Amount::from_tokens(1000),
            }],
            ..ChainConfig::default()
        }
    }

    fn fixture() -> Fixture {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap();
        let validator = KeyPair::generate().unwrap().identity();
        let mut chain = Blockchain::in_memory(config_for(&alice)).unwrap();
        chain.register_validator(&validator, 500).unwrap();
        Fixture {
            chain,
            alice,
            bob,
            validator,
        }
    }

    fn transfer(from: &KeyPair, to: &str, tokens: u64) -> Transaction {
        let mut tx = Transaction::create(
            &from.identity(),
            to,
            Amount::from_tokens(tokens),
            TokenKind::B,
            Payload::default(),
        );
        tx.sign(Some(from)).unwrap();
        tx
    }

    #[derive(Default)]
    struct RecordingGossip {
        txs: Mutex<Vec<Sha256Hash>>,
        blocks: Mutex<Vec<u64>>,
    }

    impl Gossip for RecordingGossip {
        fn announce_transaction(&self, tx: &Transaction) {
            self.txs.lock().push(tx.content_hash);
        }
        fn announce_block(&self, block: &Block) {
            self.blocks.lock().push(block.header.height);
        }
    }

    #[test]
    fn test_bootstrap_from_genesis() {
        let f = fixture();
        assert_eq!(f.chain.height(), 0);
        assert_eq!(
            f.chain.get_balance(&f.alice.identity(), TokenKind::B),
            Amount::from_tokens(1000)
        );
        assert!(f.chain.is_chain_valid());
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let alice = KeyPair::generate().unwrap();
        let config = config_for(&alice);
        assert_eq!(
            Blockchain::build_genesis(&config).hash,
            Blockchain::build_genesis(&config).hash
        );
    }

    #[test]
    fn test_submit_and_mine() {
        let mut f = fixture();
        let gossip = Arc::new(RecordingGossip::default());
        f.chain.set_gossip(gossip.clone());

        let tx = transfer(&f.alice, &f.bob.identity(), 100);
        let receipt = f.chain.submit_transaction(tx.clone()).unwrap();
        assert_eq!(receipt.pending_transactions, 1);
        assert_eq!(gossip.txs.lock().as_slice(), &[tx.content_hash]);

        let block = f.chain.mine_and_commit(&[f.validator.clone()], None).unwrap();
        assert_eq!(block.header.height, 1);
        assert_eq!(block.transactions.len(), 2);
        assert!(block.transactions[1].payload.kind_is("validator_reward"));
        assert_eq!(gossip.blocks.lock().as_slice(), &[1]);

        assert!(f.chain.mempool().is_empty());
        assert_eq!(
            f.chain.get_balance(&f.alice.identity(), TokenKind::B),
            Amount::from_tokens(900)
        );
        assert_eq!(
            f.chain.get_balance(&f.bob.identity(), TokenKind::B),
            Amount::from_tokens(100)
        );
        assert_eq!(
            f.chain.get_balance(&f.validator, TokenKind::B),
            Amount::from_tokens(5)
        );
        assert_eq!(f.chain.consensus().get_score(&f.validator), 550);
        assert_eq!(f.chain.validators()[&f.validator].blocks_validated, 1);
    }

    #[test]
    fn test_pending_spends_count_against_balance() {
        let mut f = fixture();
        f.chain
            .submit_transaction(transfer(&f.alice, &f.bob.identity(), 600))
            .unwrap();
        let second = f
            .chain
            .submit_transaction(transfer(&f.alice, &KeyPair::generate().unwrap().identity(), 600));
        assert!(matches!(second, Err(ChainError::InsufficientBalance { .. })));
    }

    #[test]
    fn test_resubmitting_committed_transaction_fails() {
        let mut f = fixture();
        let tx = transfer(&f.alice, &f.bob.identity(), 10);
        f.chain.submit_transaction(tx.clone()).unwrap();
        f.chain.mine_and_commit(&[f.validator.clone()], None).unwrap();

        assert!(matches!(
            f.chain.submit_transaction(tx),
            Err(ChainError::DuplicateTransaction(_))
        ));
    }

    #[test]
    fn test_mine_with_nothing_pending() {
        let mut f = fixture();
        assert!(f.chain.mine_and_commit(&[f.validator.clone()], None).is_err());
    }

    #[test]
    fn test_empty_candidates_use_registered_validators() {
        let mut f = fixture();
        f.chain
            .submit_transaction(transfer(&f.alice, &f.bob.identity(), 1))
            .unwrap();
        let block = f.chain.mine_and_commit(&[], None).unwrap();
        assert_eq!(block.header.validator_id, f.validator);
    }

    #[test]
    fn test_add_block_rejects_wrong_reward() {
        let mut f = fixture();
        let tx = transfer(&f.alice, &f.bob.identity(), 10);
        let prev = f.chain.latest_block().clone();
        let created_at = crate::now_millis().max(prev.header.created_at + 1);
        let mut block = Block::new_at(
            1,
            prev.hash,
            vec![
                tx,
                Transaction::validator_reward(&f.validator, Amount::from_tokens(500), 1, created_at),
            ],
            &f.validator,
            1,
            created_at,
        );
        block.mine();
        assert!(matches!(
            f.chain.add_block(block, BlockOrigin::Remote),
            Err(ChainError::InvalidBlock(_))
        ));
        assert_eq!(f.chain.height(), 0);
    }

    #[test]
    fn test_add_block_rejects_overspend() {
        let mut f = fixture();
        let tx = transfer(&f.alice, &f.bob.identity(), 5_000);
        let mut block = f.chain.assemble_block(vec![tx], &f.validator).unwrap();
        block.mine();
        assert!(matches!(
            f.chain.add_block(block, BlockOrigin::Remote),
            Err(ChainError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn test_add_block_rejects_ineligible_validator() {
        let mut f = fixture();
        let outsider = KeyPair::generate().unwrap().identity();
        let tx = transfer(&f.alice, &f.bob.identity(), 5);
        let block = f.chain.create_block(vec![tx], &outsider).unwrap();
        assert!(matches!(
            f.chain.add_block(block, BlockOrigin::Remote),
            Err(ChainError::Consensus(_))
        ));
    }

    #[test]
    fn test_add_block_rejects_tampered_block() {
        let mut f = fixture();
        let tx = transfer(&f.alice, &f.bob.identity(), 5);
        let mut block = f.chain.create_block(vec![tx], &f.validator).unwrap();
        block.transactions[0].amount = Amount::from_tokens(1);
        assert!(matches!(
            f.chain.add_block(block, BlockOrigin::Remote),
            Err(ChainError::Integrity(_))
        ));
    }

    #[test]
    fn test_checkpoint_is_opening_balance() {
        let mut f = fixture();
        let carol = KeyPair::generate().unwrap().identity();
        f.chain
            .set_balance_checkpoint(&carol, TokenKind::P, Amount::from_tokens(40))
            .unwrap();
        assert_eq!(f.chain.get_balance(&carol, TokenKind::P), Amount::from_tokens(40));
        assert_eq!(f.chain.get_balance(SYSTEM_IDENTITY, TokenKind::P), Amount::SYSTEM_SENTINEL);
    }

    #[test]
    fn test_history_and_status() {
        let mut f = fixture();
        f.chain
            .submit_transaction(transfer(&f.alice, &f.bob.identity(), 100))
            .unwrap();
        let status = f.chain.status();
        assert_eq!(status.pending_transactions, 1);
        assert_eq!(status.validator_count, 1);

        f.chain.mine_and_commit(&[f.validator.clone()], None).unwrap();
        let history = f.chain.get_transaction_history(&f.alice.identity(), None);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].block_height, 1);

        let stats = f.chain.stats();
        assert_eq!(stats.total_blocks, 2);
        assert_eq!(stats.total_transactions, 3);
        assert_eq!(stats.volume[&TokenKind::B], Amount::from_tokens(1105));
    }

    #[test]
    fn test_export_import_round_trip() {
        let mut f = fixture();
        f.chain
            .submit_transaction(transfer(&f.alice, &f.bob.identity(), 100))
            .unwrap();
        f.chain.mine_and_commit(&[f.validator.clone()], None).unwrap();
        let exported = f.chain.export_chain().unwrap();

        let mut other = Blockchain::in_memory(f.chain.config().clone()).unwrap();
        assert_eq!(other.import_chain(&exported).unwrap(), 1);
        assert_eq!(
            other.get_balance(&f.bob.identity(), TokenKind::B),
            Amount::from_tokens(100)
        );
        assert!(other.import_chain(b"garbage").is_err());
    }

    #[test]
    fn test_invalid_snapshot_is_fatal() {
        let alice = KeyPair::generate().unwrap();
        let config = config_for(&alice);
        let mut genesis = Blockchain::build_genesis(&config);
        genesis.transactions[0].amount = Amount::from_tokens(1_000_000);

        let store = InMemorySnapshotStore::with_chain(vec![genesis]);
        let result = Blockchain::new(config, Box::new(store));
        assert!(matches!(result, Err(ChainError::Integrity(_))));
    }

    #[test]
    fn test_snapshot_saved_on_commit() {
        let alice = KeyPair::generate().unwrap();
        let store = InMemorySnapshotStore::new();
        let mut chain = Blockchain::new(config_for(&alice), Box::new(store.clone())).unwrap();
        let validator = KeyPair::generate().unwrap().identity();
        chain.register_validator(&validator, 100).unwrap();

        let tx = transfer(&alice, &KeyPair::generate().unwrap().identity(), 1);
        chain.submit_transaction(tx).unwrap();
        chain.mine_and_commit(&[validator], None).unwrap();

        assert_eq!(store.load_chain().unwrap().unwrap().len(), 2);
        let reloaded = Blockchain::new(chain.config().clone(), Box::new(store)).unwrap();
        assert_eq!(reloaded.height(), 1);
    }

    #[test]
    fn test_rejected_blocks_leave_repeat_cap_alone() {
        let mut f = fixture();
        let bob = f.bob.identity();
        for tokens in 1..=3 {
            f.chain.submit_transaction(transfer(&f.alice, &bob, tokens)).unwrap();
            f.chain.mine_and_commit(&[], None).unwrap();
        }
        assert_eq!(f.chain.consensus().recent_selections(&f.validator), 3);

        f.chain.submit_transaction(transfer(&f.alice, &bob, 4)).unwrap();
        for _ in 0..3 {
            assert!(matches!(
                f.chain.mine_and_commit(&[], None),
                Err(ChainError::Consensus(_))
            ));
        }
        assert_eq!(f.chain.consensus().recent_selections(&f.validator), 3);
        assert_eq!(f.chain.height(), 3);

        // a second validator takes over and the pending transfer goes through
        let relief = KeyPair::generate().unwrap().identity();
        f.chain.register_validator(&relief, 500).unwrap();
        let block = f.chain.mine_and_commit(&[], None).unwrap();
        assert_eq!(block.header.validator_id, relief);
        assert!(f.chain.mempool().is_empty());
    }

    #[test]
    fn test_remote_block_drops_unfunded_pending() {
        let mut a = fixture();
        let mut b = Blockchain::in_memory(a.chain.config().clone()).unwrap();
        b.register_validator(&a.validator, 500).unwrap();
        let carol = KeyPair::generate().unwrap().identity();

        // A still holds an older 600 transfer when B commits a competing one
        a.chain
            .submit_transaction(transfer(&a.alice, &a.bob.identity(), 600))
            .unwrap();
        b.submit_transaction(transfer(&a.alice, &carol, 600)).unwrap();
        let remote = b.mine_and_commit(&[a.validator.clone()], None).unwrap();

        a.chain.add_block(remote, BlockOrigin::Remote).unwrap();
        assert!(a.chain.mempool().is_empty());

        a.chain
            .submit_transaction(transfer(&a.alice, &a.bob.identity(), 300))
            .unwrap();
        let block = a.chain.mine_and_commit(&[], None).unwrap();
        assert_eq!(block.header.height, 2);
        assert_eq!(
            a.chain.get_balance(&a.alice.identity(), TokenKind::B),
            Amount::from_tokens(100)
        );
    }

    #[test]
    fn test_prune_keeps_oldest_funded_spends() {
        let mut a = fixture();
        let mut b = Blockchain::in_memory(a.chain.config().clone()).unwrap();
        b.register_validator(&a.validator, 500).unwrap();
        let bob = a.bob.identity();
        let carol = KeyPair::generate().unwrap().identity();

        let older = transfer(&a.alice, &bob, 300);
        a.chain.submit_transaction(older.clone()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let newer = transfer(&a.alice, &carol, 400);
        a.chain.submit_transaction(newer.clone()).unwrap();

        // the remote block leaves alice 500: room for the older transfer only
        b.submit_transaction(transfer(&a.alice, &carol, 500)).unwrap();
        let remote = b.mine_and_commit(&[a.validator.clone()], None).unwrap();
        a.chain.add_block(remote, BlockOrigin::Remote).unwrap();

        assert_eq!(a.chain.mempool().len(), 1);
        assert!(a.chain.mempool().contains(&older));
        assert!(!a.chain.mempool().contains(&newer));
    }

    #[test]
    fn test_difficulty_increases_for_fast_blocks() {
        let alice = KeyPair::generate().unwrap();
        let mut config = config_for(&alice);
        config.adjust_difficulty = true;
        config.target_block_time_ms = 60_000;
        config.consensus.max_selections_in_window = 100;
        let mut chain = Blockchain::in_memory(config).unwrap();
        let validator = KeyPair::generate().unwrap().identity();
        chain.register_validator(&validator, 100).unwrap();
        let bob = KeyPair::generate().unwrap().identity();

        for i in 0..DIFFICULTY_ADJUSTMENT_INTERVAL as u64 {
            chain.submit_transaction(transfer(&alice, &bob, i + 1)).unwrap();
            chain.mine_and_commit(&[validator.clone()], None).unwrap();
        }
        assert_eq!(chain.difficulty(), 2);
    }
}
