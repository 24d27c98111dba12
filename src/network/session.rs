//! Per-peer AES-256-GCM session
//!
//! Both ends derive the same key from their ECDH shared secret and the two
//! handshake challenges, so no key material crosses the wire.

use super::message::SealedPayload;
use crate::crypto::{random_bytes, sha256};
use crate::error::ChainError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};

const SESSION_DOMAIN: &[u8] = b"contrib-p2p-session-v1";
const NONCE_SIZE: usize = 12;

pub struct SessionCipher {
    cipher: Aes256Gcm,
}

impl SessionCipher {
    /// Challenges are ordered before hashing so both sides agree on the key
    /// regardless of which one is local.
    pub fn derive(shared_secret: &[u8; 32], local_challenge: &[u8; 32], remote_challenge: &[u8; 32]) -> Self {
        let (low, high) = if local_challenge <= remote_challenge {
            (local_challenge, remote_challenge)
        } else {
            (remote_challenge, local_challenge)
        };

        let mut material = Vec::with_capacity(SESSION_DOMAIN.len() + 96);
        material.extend_from_slice(SESSION_DOMAIN);
        material.extend_from_slice(shared_secret);
        material.extend_from_slice(low);
        material.extend_from_slice(high);
        let key = sha256(&material);

        SessionCipher {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedPayload, ChainError> {
        let nonce = random_bytes::<NONCE_SIZE>();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| ChainError::CryptoError("session encryption failed".to_string()))?;
        Ok(SealedPayload {
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        })
    }

    pub fn open(&self, sealed: &SealedPayload) -> Result<Vec<u8>, ChainError> {
        let nonce = hex::decode(&sealed.nonce)
            .map_err(|e| ChainError::CryptoError(format!("bad session nonce: {}", e)))?;
        if nonce.len() != NONCE_SIZE {
            return Err(ChainError::CryptoError(format!(
                "session nonce must be {} bytes, got {}",
                NONCE_SIZE,
                nonce.len()
            )));
        }
        let ciphertext = hex::decode(&sealed.ciphertext)
            .map_err(|e| ChainError::CryptoError(format!("bad ciphertext encoding: {}", e)))?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| ChainError::CryptoError("session authentication failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn pair() -> (SessionCipher, SessionCipher) {
        let a = KeyPair::generate().unwrap();
        let b = KeyPair::generate().unwrap();
        let (ca, cb) = (random_bytes::<32>(), random_bytes::<32>());
        let sa = a.shared_secret(&b.public_key_bytes()).unwrap();
        let sb = b.shared_secret(&a.public_key_bytes()).unwrap();
        (SessionCipher::derive(&sa, &ca, &cb), SessionCipher::derive(&sb, &cb, &ca))
    }

    #[test]
    fn test_both_sides_share_a_key() {
        let (a, b) = pair();
        let sealed = a.seal(b"block 42").unwrap();
        assert_eq!(b.open(&sealed).unwrap(), b"block 42");
        assert_ne!(sealed.ciphertext, hex::encode(b"block 42"));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (a, b) = pair();
        let mut sealed = a.seal(b"payload").unwrap();
        let mut bytes = hex::decode(&sealed.ciphertext).unwrap();
        bytes[0] ^= 0x01;
        sealed.ciphertext = hex::encode(bytes);
        assert!(b.open(&sealed).is_err());
    }

    #[test]
    fn test_foreign_session_cannot_open() {
        let (a, _) = pair();
        let (_, other) = pair();
        let sealed = a.seal(b"payload").unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn test_short_nonce_rejected() {
        let (a, _) = pair();
        let mut sealed = a.seal(b"x").unwrap();
        sealed.nonce = "00".into();
        assert!(a.open(&sealed).is_err());
    }
}
