/// Validation logic for transactions separated from type definitions
use crate::config::TransactionRules;
use crate::error::ChainError;
use crate::identity::{self, IdentityRegistry};
use crate::transaction::types::{Amount, Transaction, TxSignature};

/// Operations a system identity may perform.
pub const SYSTEM_OPERATION_KINDS: &[&str] = &[
    "genesis-initial-btokens",
    "genesis-initial-ptokens",
    "mining_reward",
    "contribution_reward",
    "p_token_distribution",
    "invite_reward",
    "github_integration",
    "dca_reward",
    "validator_reward",
    "pr_merged_reward",
    "pr_review_reward",
    "issue_resolved_reward",
    "github_integration_bonus",
    "governance_proposal_creation",
    "governance_vote",
    "relay_reward",
];

/// Metadata-only operations that may carry a zero amount.
pub const ZERO_AMOUNT_KINDS: &[&str] = &[
    "invite_code_registration",
    "dca_verification",
    "system_notification",
    "metadata_update",
    "governance_proposal_creation",
];

fn payload_kind_in(tx: &Transaction, allowed: &[&str]) -> bool {
    tx.payload
        .kind
        .as_deref()
        .map(|kind| allowed.contains(&kind))
        .unwrap_or(false)
}

impl Transaction {
    /// Full stateless validation at time `now`.
    ///
    /// Checks run in a fixed order: integrity, identities, amount, identity
    /// format, registry membership, freshness, then the signature.
    pub fn validate(
        &self,
        rules: &TransactionRules,
        now: u64,
        registry: Option<&dyn IdentityRegistry>,
    ) -> Result<(), ChainError> {
        if !self.verify_integrity() {
            return Err(ChainError::Integrity(format!(
                "transaction {} content hash mismatch",
                self.hash_str()
            )));
        }
        self.validate_size()?;

        if self.from_id.is_empty() || self.to_id.is_empty() {
            return Err(ChainError::InvalidTransaction(
                "sender and recipient must be set".to_string(),
            ));
        }

        if self.amount > Amount::MAX {
            return Err(ChainError::InvalidTransaction(format!(
                "amount {} exceeds ceiling {}",
                self.amount,
                Amount::MAX
            )));
        }
        if self.amount.is_zero() && !payload_kind_in(self, ZERO_AMOUNT_KINDS) {
            return Err(ChainError::InvalidTransaction(
                "zero amount is only allowed for metadata operations".to_string(),
            ));
        }

        // token kind is a closed enum; unknown kinds never deserialize

        for id in [&self.from_id, &self.to_id] {
            if !identity::is_acceptable(id, rules.allow_test_identities) {
                return Err(ChainError::InvalidTransaction(format!(
                    "malformed identity {}",
                    id
                )));
            }
        }

        let system_sender = self.is_system_sender();
        if let Some(registry) = registry {
            if !system_sender && !registry.contains(&self.from_id) {
                return Err(ChainError::InvalidTransaction(format!(
                    "sender {} is not registered",
                    self.from_id
                )));
            }
            if !identity::is_system(&self.to_id) && !registry.contains(&self.to_id) {
                return Err(ChainError::InvalidTransaction(format!(
                    "recipient {} is not registered",
                    self.to_id
                )));
            }
        }

        if self.created_at.saturating_add(rules.max_age_ms) < now {
            return Err(ChainError::InvalidTransaction(format!(
                "transaction is stale: created {}ms before {}",
                now - self.created_at,
                now
            )));
        }
        if self.created_at > now.saturating_add(rules.max_future_ms) {
            return Err(ChainError::InvalidTransaction(format!(
                "transaction timestamp {} is too far in the future",
                self.created_at
            )));
        }

        if system_sender {
            if !payload_kind_in(self, SYSTEM_OPERATION_KINDS) {
                return Err(ChainError::InvalidTransaction(format!(
                    "system operation {:?} is not allowed",
                    self.payload.kind
                )));
            }
            return match self.signature {
                Some(TxSignature::System) => Ok(()),
                _ => Err(ChainError::InvalidTransaction(
                    "system transaction must carry the system marker".to_string(),
                )),
            };
        }

        self.verify_signature()
    }

    /// Verifies the sender's ECDSA signature and that the attached key is the
    /// one the sender identity was derived from.
    pub fn verify_signature(&self) -> Result<(), ChainError> {
        let (public_key, signature) = match &self.signature {
            Some(TxSignature::Ecdsa {
                public_key,
                signature,
            }) => (public_key, signature),
            Some(TxSignature::System) => {
                return Err(ChainError::InvalidTransaction(
                    "system marker on a non-system sender".to_string(),
                ))
            }
            None => {
                return Err(ChainError::InvalidTransaction(
                    "Transaction not signed".to_string(),
                ))
            }
        };

        if !identity::is_bound_to_key(&self.from_id, public_key) {
            return Err(ChainError::CryptoError(format!(
                "public key does not belong to sender {}",
                self.from_id
            )));
        }
        crate::crypto::verify_signature(public_key, &self.content_hash, signature)
    }

    /// Validity against the current clock and default rules.
    pub fn is_valid(&self, registry: Option<&dyn IdentityRegistry>) -> bool {
        self.validate(&TransactionRules::default(), crate::now_millis(), registry)
            .is_ok()
    }
}
