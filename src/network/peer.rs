//! Peer records owned by the network actor

use super::session::SessionCipher;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;

pub type ConnId = u64;

/// Upper bound on remembered discovery addresses.
const MAX_KNOWN_ADDRESSES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum HandshakeState {
    Connected,
    AuthPending,
    Authenticated,
    Active,
}

/// Instruction for a connection's writer half.
#[derive(Debug)]
pub enum Outbound {
    Frame(String),
    Close,
}

pub struct PeerRecord {
    pub conn_id: ConnId,
    pub address: SocketAddr,
    pub outbound: bool,
    pub state: HandshakeState,
    pub node_id: Option<String>,
    pub public_key: Option<Vec<u8>>,
    pub declared_version: Option<String>,
    pub listen_port: Option<u16>,
    pub local_challenge: [u8; 32],
    pub remote_challenge: Option<[u8; 32]>,
    pub session: Option<SessionCipher>,
    pub connected_at: Instant,
    pub last_seen: Instant,
    pub reported_height: u64,
    pub outbox: mpsc::UnboundedSender<Outbound>,
}

impl PeerRecord {
    pub fn new(
        conn_id: ConnId,
        address: SocketAddr,
        outbound: bool,
        local_challenge: [u8; 32],
        outbox: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        let now = Instant::now();
        PeerRecord {
            conn_id,
            address,
            outbound,
            state: HandshakeState::Connected,
            node_id: None,
            public_key: None,
            declared_version: None,
            listen_port: None,
            local_challenge,
            remote_challenge: None,
            session: None,
            connected_at: now,
            last_seen: now,
            reported_height: 0,
            outbox,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state >= HandshakeState::Authenticated
    }

    pub fn is_active(&self) -> bool {
        self.state == HandshakeState::Active
    }

    /// Address other nodes can dial, when the peer announced a listen port.
    pub fn listen_address(&self) -> Option<String> {
        self.listen_port
            .map(|port| format!("ws://{}:{}", self.address.ip(), port))
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            node_id: self.node_id.clone(),
            address: self.address,
            outbound: self.outbound,
            state: self.state,
            connected_ms: self.connected_at.elapsed().as_millis() as u64,
            idle_ms: self.last_seen.elapsed().as_millis() as u64,
            reported_height: self.reported_height,
            declared_version: self.declared_version.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub node_id: Option<String>,
    pub address: SocketAddr,
    pub outbound: bool,
    pub state: HandshakeState,
    pub connected_ms: u64,
    pub idle_ms: u64,
    pub reported_height: u64,
    pub declared_version: Option<String>,
}

#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<ConnId, PeerRecord>,
    known_addresses: BTreeSet<String>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: PeerRecord) {
        self.peers.insert(record.conn_id, record);
    }

    pub fn get(&self, conn: ConnId) -> Option<&PeerRecord> {
        self.peers.get(&conn)
    }

    pub fn get_mut(&mut self, conn: ConnId) -> Option<&mut PeerRecord> {
        self.peers.get_mut(&conn)
    }

    pub fn remove(&mut self, conn: ConnId) -> Option<PeerRecord> {
        self.peers.remove(&conn)
    }

    /// Connection currently bound to `node_id`, if any.
    pub fn by_node_id(&self, node_id: &str) -> Option<ConnId> {
        self.peers
            .values()
            .find(|p| p.node_id.as_deref() == Some(node_id))
            .map(|p| p.conn_id)
    }

    pub fn active_ids(&self) -> Vec<ConnId> {
        self.peers
            .values()
            .filter(|p| p.is_active())
            .map(|p| p.conn_id)
            .collect()
    }

    pub fn authenticated_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_authenticated()).count()
    }

    pub fn active_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_active()).count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.peers.keys().copied().collect()
    }

    pub fn record_known(&mut self, address: String) -> bool {
        if self.known_addresses.len() >= MAX_KNOWN_ADDRESSES {
            return false;
        }
        self.known_addresses.insert(address)
    }

    pub fn known_addresses(&self) -> Vec<String> {
        self.known_addresses.iter().cloned().collect()
    }

    /// Listen addresses of active peers other than `exclude`, for discovery.
    pub fn shareable_addresses(&self, exclude: ConnId, limit: usize) -> Vec<String> {
        self.peers
            .values()
            .filter(|p| p.is_active() && p.conn_id != exclude)
            .filter_map(PeerRecord::listen_address)
            .take(limit)
            .collect()
    }
}
