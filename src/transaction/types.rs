/// Transaction types for ContribChain
use crate::crypto::{random_bytes, sha256, KeyPair, Sha256Hash};
use crate::error::ChainError;
use crate::identity::{self, GENESIS_IDENTITY, SYSTEM_IDENTITY};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Maximum transaction size in bytes (100KB) to prevent DoS
pub const MAX_TRANSACTION_SIZE: usize = 100_000;

/// Fixed-point token amount with four decimal places.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    pub const DECIMALS: u32 = 4;
    pub const SCALE: u64 = 10_000;
    pub const ZERO: Amount = Amount(0);
    /// Hard ceiling on a single transfer: one billion whole tokens.
    pub const MAX: Amount = Amount(1_000_000_000 * Self::SCALE);
    /// Balance reported for system identities.
    pub const SYSTEM_SENTINEL: Amount = Amount(999_999_999 * Self::SCALE);

    pub const fn from_units(units: u64) -> Self {
        Amount(units)
    }

    pub const fn from_tokens(tokens: u64) -> Self {
        Amount(tokens.saturating_mul(Self::SCALE))
    }

    pub const fn units(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn saturating_add(self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:04}", self.0 / Self::SCALE, self.0 % Self::SCALE)
    }
}

impl FromStr for Amount {
    type Err = ChainError;

    /// Parses `"12"`, `"12.5"` or `"0.0001"`. More than four decimals is an error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ChainError::InvalidTransaction(format!("Invalid amount: {:?}", s));
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() || frac.len() > Self::DECIMALS as usize {
            return Err(invalid());
        }
        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        let whole: u64 = whole.parse().map_err(|_| invalid())?;
        let mut frac_units: u64 = if frac.is_empty() {
            0
        } else {
            frac.parse().map_err(|_| invalid())?
        };
        for _ in frac.len()..Self::DECIMALS as usize {
            frac_units *= 10;
        }
        whole
            .checked_mul(Self::SCALE)
            .and_then(|w| w.checked_add(frac_units))
            .map(Amount)
            .ok_or_else(invalid)
    }
}

/// The closed set of token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    #[serde(rename = "B-Token")]
    B,
    #[serde(rename = "P-Token")]
    P,
}

impl TokenKind {
    pub const ALL: [TokenKind; 2] = [TokenKind::B, TokenKind::P];

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::B => "B-Token",
            TokenKind::P => "P-Token",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured metadata carried by a transaction. `kind` names the operation
/// for system grants and metadata-only transfers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Payload {
    pub fn of_kind(kind: &str) -> Self {
        Payload {
            kind: Some(kind.to_string()),
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    pub fn kind_is(&self, kind: &str) -> bool {
        self.kind.as_deref() == Some(kind)
    }
}

/// Proof that the sender authorised a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxSignature {
    /// Fixed marker used by system identities, which are exempt from signing.
    System,
    Ecdsa {
        public_key: Vec<u8>,
        signature: Vec<u8>,
    },
}

/// A signed value transfer between two identities.
///
/// `content_hash` covers every field except `signature`; it is computed at
/// construction and checked again on deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TransactionRepr")]
pub struct Transaction {
    pub from_id: String,
    pub to_id: String,
    pub amount: Amount,
    pub token: TokenKind,
    pub payload: Payload,
    pub created_at: u64,
    pub nonce: [u8; 16],
    pub signature: Option<TxSignature>,
    pub content_hash: Sha256Hash,
}

#[derive(Deserialize)]
struct TransactionRepr {
    from_id: String,
    to_id: String,
    amount: Amount,
    token: TokenKind,
    #[serde(default)]
    payload: Payload,
    created_at: u64,
    nonce: [u8; 16],
    signature: Option<TxSignature>,
    content_hash: Sha256Hash,
}

impl TryFrom<TransactionRepr> for Transaction {
    type Error = ChainError;

    fn try_from(repr: TransactionRepr) -> Result<Self, Self::Error> {
        let tx = Transaction {
            from_id: repr.from_id,
            to_id: repr.to_id,
            amount: repr.amount,
            token: repr.token,
            payload: repr.payload,
            created_at: repr.created_at,
            nonce: repr.nonce,
            signature: repr.signature,
            content_hash: repr.content_hash,
        };
        if !tx.verify_integrity() {
            return Err(ChainError::Integrity(format!(
                "transaction {} content hash does not match its contents",
                hex::encode(tx.content_hash)
            )));
        }
        Ok(tx)
    }
}

fn update_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

impl Transaction {
    /// Creates an unsigned transfer stamped with the current time and a fresh nonce.
    pub fn create(from: &str, to: &str, amount: Amount, token: TokenKind, payload: Payload) -> Self {
        Self::create_at(
            from,
            to,
            amount,
            token,
            payload,
            crate::now_millis(),
            random_bytes(),
        )
    }

    pub fn create_at(
        from: &str,
        to: &str,
        amount: Amount,
        token: TokenKind,
        payload: Payload,
        created_at: u64,
        nonce: [u8; 16],
    ) -> Self {
        let mut tx = Transaction {
            from_id: from.to_string(),
            to_id: to.to_string(),
            amount,
            token,
            payload,
            created_at,
            nonce,
            signature: None,
            content_hash: [0u8; 32],
        };
        tx.content_hash = tx.compute_content_hash();
        tx
    }

    fn system_grant(to: &str, amount: Amount, token: TokenKind, payload: Payload) -> Self {
        let mut tx = Self::create(SYSTEM_IDENTITY, to, amount, token, payload);
        tx.signature = Some(TxSignature::System);
        tx
    }

    /// B-Token reward for an accepted contribution.
    pub fn contribution_reward(to: &str, amount: Amount, contribution_id: &str) -> Self {
        Self::system_grant(
            to,
            amount,
            TokenKind::B,
            Payload::of_kind("contribution_reward").with("contribution_id", contribution_id),
        )
    }

    /// P-Token distribution from the system treasury.
    pub fn p_token_distribution(to: &str, amount: Amount, reason: &str) -> Self {
        Self::system_grant(
            to,
            amount,
            TokenKind::P,
            Payload::of_kind("p_token_distribution").with("reason", reason),
        )
    }

    /// Reward paid to the validator of block `height`, timestamped with the block.
    pub fn validator_reward(validator: &str, amount: Amount, height: u64, created_at: u64) -> Self {
        let mut tx = Self::create_at(
            SYSTEM_IDENTITY,
            validator,
            amount,
            TokenKind::B,
            Payload::of_kind("validator_reward").with("block_height", &height.to_string()),
            created_at,
            random_bytes(),
        );
        tx.signature = Some(TxSignature::System);
        tx
    }

    /// Opening balance written into the genesis block. The nonce is derived from
    /// `index` so every node synthesizes the same genesis.
    pub fn genesis_allocation(
        to: &str,
        amount: Amount,
        token: TokenKind,
        created_at: u64,
        index: usize,
    ) -> Self {
        let kind = match token {
            TokenKind::B => "genesis-initial-btokens",
            TokenKind::P => "genesis-initial-ptokens",
        };
        let seed = sha256(format!("genesis-allocation:{}:{}", index, to).as_bytes());
        let mut nonce = [0u8; 16];
        nonce.copy_from_slice(&seed[..16]);

        let mut tx = Self::create_at(
            GENESIS_IDENTITY,
            to,
            amount,
            token,
            Payload::of_kind(kind),
            created_at,
            nonce,
        );
        tx.signature = Some(TxSignature::System);
        tx
    }

    pub fn compute_content_hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(b"contrib-tx-v1");
        update_str(&mut hasher, &self.from_id);
        update_str(&mut hasher, &self.to_id);
        hasher.update(self.amount.units().to_le_bytes());
        update_str(&mut hasher, self.token.as_str());
        match &self.payload.kind {
            Some(kind) => {
                hasher.update([1u8]);
                update_str(&mut hasher, kind);
            }
            None => hasher.update([0u8]),
        }
        hasher.update((self.payload.fields.len() as u64).to_le_bytes());
        for (key, value) in &self.payload.fields {
            update_str(&mut hasher, key);
            update_str(&mut hasher, value);
        }
        hasher.update(self.created_at.to_le_bytes());
        hasher.update(self.nonce);
        hasher.finalize().into()
    }

    pub fn verify_integrity(&self) -> bool {
        self.content_hash == self.compute_content_hash()
    }

    /// Identifier used for mempool deduplication.
    pub fn unique_id(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.content_hash);
        hasher.update(self.nonce);
        hasher.update(self.created_at.to_le_bytes());
        hasher.finalize().into()
    }

    pub fn hash_str(&self) -> String {
        hex::encode(self.content_hash)
    }

    pub fn is_system_sender(&self) -> bool {
        identity::is_system(&self.from_id)
    }

    /// Signs the content hash with `key`. System senders get the fixed marker
    /// instead and need no key.
    pub fn sign(&mut self, key: Option<&KeyPair>) -> Result<(), ChainError> {
        if self.signature.is_some() {
            return Err(ChainError::InvalidTransaction(format!(
                "transaction {} is already signed",
                self.hash_str()
            )));
        }
        if self.is_system_sender() {
            self.signature = Some(TxSignature::System);
            return Ok(());
        }

        let key = key.ok_or_else(|| {
            ChainError::InvalidTransaction("a signing key is required".to_string())
        })?;
        let public_key = key.public_key_bytes();
        if !identity::is_bound_to_key(&self.from_id, &public_key) {
            return Err(ChainError::CryptoError(format!(
                "signing key does not belong to sender {}",
                self.from_id
            )));
        }

        let signature = key.sign(&self.content_hash)?;
        self.signature = Some(TxSignature::Ecdsa {
            public_key: public_key.to_vec(),
            signature: signature.to_vec(),
        });
        Ok(())
    }

    /// Validate transaction size to prevent DoS attacks
    pub fn validate_size(&self) -> Result<(), ChainError> {
        let serialized = bincode::serialize(self)
            .map_err(|e| ChainError::InvalidTransaction(format!("Serialization failed: {}", e)))?;

        if serialized.len() > MAX_TRANSACTION_SIZE {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction too large: {} bytes (max: {})",
                serialized.len(),
                MAX_TRANSACTION_SIZE
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ChainError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_display_and_parse() {
        assert_eq!(Amount::from_tokens(900).to_string(), "900.0000");
        assert_eq!(Amount::from_units(12_345).to_string(), "1.2345");
        assert_eq!("12.5".parse::<Amount>().unwrap(), Amount::from_units(125_000));
        assert_eq!("0.0001".parse::<Amount>().unwrap(), Amount::from_units(1));
        assert_eq!("7".parse::<Amount>().unwrap(), Amount::from_tokens(7));
        assert!("1.23456".parse::<Amount>().is_err());
        assert!("-1".parse::<Amount>().is_err());
        assert!(".5".parse::<Amount>().is_err());
    }

    #[test]
    fn test_token_kind_wire_names() {
        assert_eq!(serde_json::to_string(&TokenKind::B).unwrap(), "\"B-Token\"");
        assert_eq!(
            serde_json::from_str::<TokenKind>("\"P-Token\"").unwrap(),
            TokenKind::P
        );
        assert!(serde_json::from_str::<TokenKind>("\"C-Token\"").is_err());
    }

    #[test]
    fn test_genesis_allocation_is_deterministic() {
        let to = "did:contrib:0123456789abcdef0123456789abcdef01234567";
        let a = Transaction::genesis_allocation(to, Amount::from_tokens(10), TokenKind::B, 1, 0);
        let b = Transaction::genesis_allocation(to, Amount::from_tokens(10), TokenKind::B, 1, 0);
        assert_eq!(a.content_hash, b.content_hash);
        assert!(a.payload.kind_is("genesis-initial-btokens"));
        assert_eq!(a.signature, Some(TxSignature::System));
    }

    #[test]
    fn test_content_hash_covers_payload() {
        let to = "did:contrib:0123456789abcdef0123456789abcdef01234567";
        let base = Transaction::create_at(
            SYSTEM_IDENTITY,
            to,
            Amount::from_tokens(1),
            TokenKind::B,
            Payload::of_kind("invite_reward"),
            1,
            [0; 16],
        );
        let mut changed = base.clone();
        changed.payload = changed.payload.with("invite", "abc");
        assert_ne!(base.content_hash, changed.compute_content_hash());
    }

    #[test]
    fn test_bincode_round_trip() {
        let tx = Transaction::contribution_reward(
            "did:contrib:0123456789abcdef0123456789abcdef01234567",
            Amount::from_tokens(3),
            "issue-7",
        );
        let bytes = bincode::serialize(&tx).unwrap();
        let decoded: Transaction = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, tx);
        assert!(tx.validate_size().is_ok());
    }
}
