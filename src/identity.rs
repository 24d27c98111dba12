//! Ledger identities
//!
//! Every identity lives under the `did:contrib:` prefix and falls into one of
//! three structural classes:
//!
//! - standard: 40 to 64 lowercase hex characters
//! - system: `system` or `genesis` followed by 32 to 64 hex characters
//! - test: `test` followed by 40 to 48 hex characters
//!
//! Standard and test identities are bound to a secp256k1 key: the hex part is
//! the first 20 bytes of the SHA-256 of the compressed public key.

use crate::crypto::sha256;
use std::collections::{BTreeSet, HashSet};

pub const DID_PREFIX: &str = "did:contrib:";

/// Issuance source for rewards and grants.
pub const SYSTEM_IDENTITY: &str = "did:contrib:system00000000000000000000000000000000";

/// Sender of the genesis allocations and attributed validator of block 0.
pub const GENESIS_IDENTITY: &str = "did:contrib:genesis00000000000000000000000000000000";

const IDENTITY_HASH_BYTES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityClass {
    Standard,
    System,
    Test,
}

/// Membership oracle for registered identities.
pub trait IdentityRegistry: Send + Sync {
    fn contains(&self, identity: &str) -> bool;
}

impl IdentityRegistry for HashSet<String> {
    fn contains(&self, identity: &str) -> bool {
        HashSet::contains(self, identity)
    }
}

impl IdentityRegistry for BTreeSet<String> {
    fn contains(&self, identity: &str) -> bool {
        BTreeSet::contains(self, identity)
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn hex_len_in(s: &str, min: usize, max: usize) -> bool {
    (min..=max).contains(&s.len()) && is_lower_hex(s)
}

/// Structural classification. Returns `None` for anything that is not a
/// well-formed identity of a known class.
pub fn classify(identity: &str) -> Option<IdentityClass> {
    let body = identity.strip_prefix(DID_PREFIX)?;

    if let Some(rest) = body
        .strip_prefix("system")
        .or_else(|| body.strip_prefix("genesis"))
    {
        return hex_len_in(rest, 32, 64).then_some(IdentityClass::System);
    }
    if let Some(rest) = body.strip_prefix("test") {
        return hex_len_in(rest, 40, 48).then_some(IdentityClass::Test);
    }
    hex_len_in(body, 40, 64).then_some(IdentityClass::Standard)
}

pub fn is_system(identity: &str) -> bool {
    classify(identity) == Some(IdentityClass::System)
}

/// Accepts standard and system identities, and test identities only when allowed.
pub fn is_acceptable(identity: &str, allow_test: bool) -> bool {
    match classify(identity) {
        Some(IdentityClass::Test) => allow_test,
        Some(_) => true,
        None => false,
    }
}

fn key_fingerprint(public_key: &[u8]) -> String {
    hex::encode(&sha256(public_key)[..IDENTITY_HASH_BYTES])
}

pub fn identity_for_public_key(public_key: &[u8]) -> String {
    format!("{}{}", DID_PREFIX, key_fingerprint(public_key))
}

pub fn test_identity_for_public_key(public_key: &[u8]) -> String {
    format!("{}test{}", DID_PREFIX, key_fingerprint(public_key))
}

/// True when `identity` is the standard or test identity derived from `public_key`.
pub fn is_bound_to_key(identity: &str, public_key: &[u8]) -> bool {
    match classify(identity) {
        Some(IdentityClass::Standard) => identity == identity_for_public_key(public_key),
        Some(IdentityClass::Test) => identity == test_identity_for_public_key(public_key),
        _ => false,
    }
}
