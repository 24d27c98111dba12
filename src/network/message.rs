//! Wire envelope and the closed set of P2P messages
//!
//! Every frame is a JSON text envelope `{id, type, data, timestamp, sender}`.
//! Decoding is two-stage: the envelope is parsed first so freshness and rate
//! limits can be applied on the `type` string alone, and only then is `data`
//! decoded into a typed [`Message`]. Unknown types decode to `None`.

use crate::block::Block;
use crate::crypto::random_bytes;
use crate::error::ChainError;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "contrib-p2p/1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Auth,
    AuthResponse,
    PeerDiscovery,
    Heartbeat,
    SyncRequest,
    SyncResponse,
    Transaction,
    Block,
    Sealed,
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Auth => "auth",
            MessageKind::AuthResponse => "authResponse",
            MessageKind::PeerDiscovery => "peerDiscovery",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::SyncRequest => "syncRequest",
            MessageKind::SyncResponse => "syncResponse",
            MessageKind::Transaction => "transaction",
            MessageKind::Block => "block",
            MessageKind::Sealed => "sealed",
            MessageKind::Unknown => "unknown",
        }
    }

    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "auth" => MessageKind::Auth,
            "authResponse" => MessageKind::AuthResponse,
            "peerDiscovery" => MessageKind::PeerDiscovery,
            "heartbeat" => MessageKind::Heartbeat,
            "syncRequest" => MessageKind::SyncRequest,
            "syncResponse" => MessageKind::SyncResponse,
            "transaction" => MessageKind::Transaction,
            "block" => MessageKind::Block,
            "sealed" => MessageKind::Sealed,
            _ => MessageKind::Unknown,
        }
    }

    /// Consensus-relevant kinds. These only travel sealed inside an
    /// authenticated session.
    pub fn is_consensus(&self) -> bool {
        matches!(
            self,
            MessageKind::Transaction
                | MessageKind::Block
                | MessageKind::SyncRequest
                | MessageKind::SyncResponse
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub node_id: String,
    /// Hex-encoded compressed secp256k1 public key.
    pub public_key: String,
    pub version: String,
    /// Hex-encoded 32-byte challenge the remote side must sign.
    pub challenge: String,
    #[serde(default)]
    pub listen_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponsePayload {
    pub node_id: String,
    /// Signature over `challenge || node_id`.
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryPayload {
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub uptime_ms: u64,
    pub peer_count: usize,
    pub height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestPayload {
    pub request_id: String,
    /// First block height wanted.
    #[serde(default)]
    pub from_height: u64,
}

/// One page of the responder's chain: consecutive blocks starting at
/// `from_height`. `height` is the responder's tip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponsePayload {
    pub request_id: String,
    pub height: u64,
    #[serde(default)]
    pub from_height: u64,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPayload {
    pub nonce: String,
    pub ciphertext: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Auth(AuthPayload),
    AuthResponse(AuthResponsePayload),
    PeerDiscovery(DiscoveryPayload),
    Heartbeat(HeartbeatPayload),
    SyncRequest(SyncRequestPayload),
    SyncResponse(SyncResponsePayload),
    Transaction(Box<Transaction>),
    Block(Box<Block>),
    Sealed(SealedPayload),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Auth(_) => MessageKind::Auth,
            Message::AuthResponse(_) => MessageKind::AuthResponse,
            Message::PeerDiscovery(_) => MessageKind::PeerDiscovery,
            Message::Heartbeat(_) => MessageKind::Heartbeat,
            Message::SyncRequest(_) => MessageKind::SyncRequest,
            Message::SyncResponse(_) => MessageKind::SyncResponse,
            Message::Transaction(_) => MessageKind::Transaction,
            Message::Block(_) => MessageKind::Block,
            Message::Sealed(_) => MessageKind::Sealed,
        }
    }

    fn data(&self) -> Result<Value, ChainError> {
        let value = match self {
            Message::Auth(p) => serde_json::to_value(p),
            Message::AuthResponse(p) => serde_json::to_value(p),
            Message::PeerDiscovery(p) => serde_json::to_value(p),
            Message::Heartbeat(p) => serde_json::to_value(p),
            Message::SyncRequest(p) => serde_json::to_value(p),
            Message::SyncResponse(p) => serde_json::to_value(p),
            Message::Transaction(tx) => serde_json::to_value(tx),
            Message::Block(block) => serde_json::to_value(block),
            Message::Sealed(p) => serde_json::to_value(p),
        };
        Ok(value?)
    }

    /// Typed decode of an envelope body. `Ok(None)` for kinds outside the
    /// protocol. Transactions and blocks are integrity-checked on the way in.
    pub fn decode(kind: MessageKind, data: Value) -> Result<Option<Message>, ChainError> {
        let message = match kind {
            MessageKind::Auth => Message::Auth(serde_json::from_value(data)?),
            MessageKind::AuthResponse => Message::AuthResponse(serde_json::from_value(data)?),
            MessageKind::PeerDiscovery => Message::PeerDiscovery(serde_json::from_value(data)?),
            MessageKind::Heartbeat => Message::Heartbeat(serde_json::from_value(data)?),
            MessageKind::SyncRequest => Message::SyncRequest(serde_json::from_value(data)?),
            MessageKind::SyncResponse => Message::SyncResponse(serde_json::from_value(data)?),
            MessageKind::Transaction => Message::Transaction(Box::new(serde_json::from_value(data)?)),
            MessageKind::Block => Message::Block(Box::new(serde_json::from_value(data)?)),
            MessageKind::Sealed => Message::Sealed(serde_json::from_value(data)?),
            MessageKind::Unknown => return Ok(None),
        };
        Ok(Some(message))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: u64,
    #[serde(default)]
    pub sender: String,
}

impl Envelope {
    pub fn wrap(message: &Message, sender: &str, timestamp: u64) -> Result<Self, ChainError> {
        Ok(Envelope {
            id: hex::encode(random_bytes::<16>()),
            kind: message.kind().as_str().to_string(),
            data: message.data()?,
            timestamp,
            sender: sender.to_string(),
        })
    }

    pub fn parse(text: &str) -> Result<Self, ChainError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_text(&self) -> Result<String, ChainError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> MessageKind {
        MessageKind::from_wire(&self.kind)
    }

    /// Rejects envelopes older than `max_age_ms` or more than `max_future_ms`
    /// ahead of `now`.
    pub fn check_freshness(&self, now: u64, max_age_ms: u64, max_future_ms: u64) -> Result<(), ChainError> {
        if self.timestamp > now.saturating_add(max_future_ms) {
            return Err(ChainError::NetworkError(format!(
                "envelope {} is {}ms in the future",
                self.id,
                self.timestamp - now
            )));
        }
        if now.saturating_sub(self.timestamp) > max_age_ms {
            return Err(ChainError::NetworkError(format!(
                "envelope {} is {}ms old",
                self.id,
                now - self.timestamp
            )));
        }
        Ok(())
    }

    pub fn into_message(self) -> Result<Option<Message>, ChainError> {
        Message::decode(self.kind(), self.data)
    }
}
