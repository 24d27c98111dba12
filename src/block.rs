//! Blocks: ordered transaction batches linked by hash

use crate::config::TransactionRules;
use crate::crypto::{sha256, Sha256Hash};
use crate::error::ChainError;
use crate::identity::{self, GENESIS_IDENTITY};
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `previous_hash` of the genesis block.
pub const GENESIS_PREVIOUS_HASH: Sha256Hash = [0u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub previous_hash: Sha256Hash,
    pub created_at: u64,
    pub merkle_root: Sha256Hash,
    pub validator_id: String,
    pub difficulty: u32,
    pub nonce: u64,
}

impl BlockHeader {
    pub fn hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(b"contrib-block-v1");
        hasher.update(self.height.to_le_bytes());
        hasher.update(self.previous_hash);
        hasher.update(self.created_at.to_le_bytes());
        hasher.update(self.merkle_root);
        hasher.update((self.validator_id.len() as u64).to_le_bytes());
        hasher.update(self.validator_id.as_bytes());
        hasher.update(self.difficulty.to_le_bytes());
        hasher.update(self.nonce.to_le_bytes());
        hasher.finalize().into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BlockRepr")]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub hash: Sha256Hash,
}

#[derive(Deserialize)]
struct BlockRepr {
    header: BlockHeader,
    transactions: Vec<Transaction>,
    hash: Sha256Hash,
}

impl TryFrom<BlockRepr> for Block {
    type Error = ChainError;

    fn try_from(repr: BlockRepr) -> Result<Self, Self::Error> {
        let block = Block {
            header: repr.header,
            transactions: repr.transactions,
            hash: repr.hash,
        };
        block.verify_integrity()?;
        Ok(block)
    }
}

/// Number of leading zero hex digits in `hash`.
pub fn leading_zero_nibbles(hash: &Sha256Hash) -> u32 {
    let mut count = 0;
    for byte in hash {
        if *byte == 0 {
            count += 2;
            continue;
        }
        if byte >> 4 == 0 {
            count += 1;
        }
        break;
    }
    count
}

impl Block {
    /// Builds an unmined block stamped with the current time.
    pub fn new(
        height: u64,
        previous_hash: Sha256Hash,
        transactions: Vec<Transaction>,
        validator_id: &str,
        difficulty: u32,
    ) -> Self {
        Self::new_at(
            height,
            previous_hash,
            transactions,
            validator_id,
            difficulty,
            crate::now_millis(),
        )
    }

    pub fn new_at(
        height: u64,
        previous_hash: Sha256Hash,
        transactions: Vec<Transaction>,
        validator_id: &str,
        difficulty: u32,
        created_at: u64,
    ) -> Self {
        let merkle_root = Self::calculate_merkle_root(&transactions);
        let header = BlockHeader {
            height,
            previous_hash,
            created_at,
            merkle_root,
            validator_id: validator_id.to_string(),
            difficulty,
            nonce: 0,
        };
        let hash = header.hash();
        Block {
            header,
            transactions,
            hash,
        }
    }

    /// Height-0 block attributed to the genesis identity, exempt from mining.
    pub fn genesis(created_at: u64, seed_transactions: Vec<Transaction>) -> Self {
        Self::new_at(
            0,
            GENESIS_PREVIOUS_HASH,
            seed_transactions,
            GENESIS_IDENTITY,
            0,
            created_at,
        )
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn hash_str(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn calculate_hash(&self) -> Sha256Hash {
        self.header.hash()
    }

    /// Pairwise SHA-256 over transaction content hashes. An odd level
    /// duplicates its last node; an empty block hashes the empty string.
    pub fn calculate_merkle_root(transactions: &[Transaction]) -> Sha256Hash {
        if transactions.is_empty() {
            return sha256(b"");
        }

        let mut level: Vec<Sha256Hash> = transactions
            .iter()
            .map(|tx| tx.compute_content_hash())
            .collect();

        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| {
                    let left = pair[0];
                    let right = pair.get(1).copied().unwrap_or(left);
                    let mut hasher = Sha256::new();
                    hasher.update(left);
                    hasher.update(right);
                    hasher.finalize().into()
                })
                .collect();
        }
        level[0]
    }

    pub fn meets_difficulty(&self) -> bool {
        leading_zero_nibbles(&self.hash) >= self.header.difficulty
    }

    /// Searches nonces until the hash carries `difficulty` leading zero digits.
    /// CPU-bound; run it on a blocking worker.
    pub fn mine(&mut self) -> Sha256Hash {
        self.hash = self.header.hash();
        while leading_zero_nibbles(&self.hash) < self.header.difficulty {
            self.header.nonce = self.header.nonce.wrapping_add(1);
            self.hash = self.header.hash();
        }
        self.hash
    }

    /// Validates and appends `tx`, refreshing the merkle root and hash.
    /// The block must be mined again afterwards.
    pub fn add_transaction(
        &mut self,
        tx: Transaction,
        rules: &TransactionRules,
    ) -> Result<(), ChainError> {
        tx.validate(rules, self.header.created_at, None)?;
        self.transactions.push(tx);
        self.header.merkle_root = Self::calculate_merkle_root(&self.transactions);
        self.hash = self.header.hash();
        Ok(())
    }

    /// Merkle root and hash both match a fresh recomputation.
    pub fn verify_integrity(&self) -> Result<(), ChainError> {
        if Self::calculate_merkle_root(&self.transactions) != self.header.merkle_root {
            return Err(ChainError::Integrity(format!(
                "block {} merkle root does not match its transactions",
                self.header.height
            )));
        }
        if self.calculate_hash() != self.hash {
            return Err(ChainError::Integrity(format!(
                "block {} hash does not match its header",
                self.header.height
            )));
        }
        Ok(())
    }

    /// Full validation against the predecessor. Transactions are checked for
    /// freshness relative to this block's timestamp.
    pub fn validate(
        &self,
        previous: Option<&Block>,
        rules: &TransactionRules,
    ) -> Result<(), ChainError> {
        self.verify_integrity()?;

        if let Some(prev) = previous {
            if self.header.previous_hash != prev.hash {
                return Err(ChainError::InvalidBlock(format!(
                    "Previous hash mismatch. Expected {}, but got {}.",
                    hex::encode(prev.hash),
                    hex::encode(self.header.previous_hash)
                )));
            }
            if self.header.height != prev.header.height + 1 {
                return Err(ChainError::InvalidBlock(format!(
                    "Invalid block height. Expected {}, but got {}.",
                    prev.header.height + 1,
                    self.header.height
                )));
            }
            if self.header.created_at <= prev.header.created_at {
                return Err(ChainError::InvalidBlock(format!(
                    "Block timestamp {} does not advance past {}",
                    self.header.created_at, prev.header.created_at
                )));
            }
        }

        for tx in &self.transactions {
            tx.validate(rules, self.header.created_at, None)
                .map_err(|e| match e {
                    ChainError::Integrity(_) => e,
                    other => ChainError::InvalidBlock(format!(
                        "transaction {} rejected: {}",
                        tx.hash_str(),
                        other
                    )),
                })?;
        }

        if !identity::is_acceptable(&self.header.validator_id, rules.allow_test_identities) {
            return Err(ChainError::InvalidBlock(format!(
                "malformed validator identity {}",
                self.header.validator_id
            )));
        }

        if self.header.height > 0 && !self.meets_difficulty() {
            return Err(ChainError::InvalidBlock(format!(
                "block {} does not satisfy difficulty {}",
                self.header.height, self.header.difficulty
            )));
        }
        Ok(())
    }

    pub fn is_valid(&self, previous: Option<&Block>) -> bool {
        self.validate(previous, &TransactionRules::default()).is_ok()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ChainError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
