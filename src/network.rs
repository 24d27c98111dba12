//! Authenticated P2P overlay
//!
//! The network runs as a single actor task that exclusively owns peer
//! records, rate limiters, the connection throttle and sync bookkeeping.
//! Callers talk to it through a cloneable [`NetworkHandle`] and consume
//! [`NetworkEvent`]s from the channel returned by [`NetworkHandle::spawn`].
//!
//! Peers speak JSON envelopes over WebSocket. A connection moves through
//! `Connected -> AuthPending -> Authenticated -> Active`: each side sends its
//! node key and a random challenge, signs the other's challenge, and both
//! derive an AES-256-GCM session from ECDH. Transactions, blocks and sync
//! traffic only travel sealed inside that session.

mod actor;
mod connection;
pub mod limiter;
pub mod message;
pub mod peer;
pub mod session;

pub use actor::node_id_for;
pub use message::{Message, MessageKind, PROTOCOL_VERSION};
pub use peer::{HandshakeState, PeerInfo};

use crate::block::Block;
use crate::blockchain::Gossip;
use crate::config::NetworkConfig;
use crate::crypto::KeyPair;
use crate::error::ChainError;
use crate::sync::{SyncOffer, SyncState};
use crate::transaction::Transaction;
use serde::Serialize;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Reply<T> = oneshot::Sender<T>;

pub(crate) enum NetworkCommand {
    Start {
        port: u16,
        reply: Reply<Result<SocketAddr, ChainError>>,
    },
    Connect {
        address: String,
        reply: Reply<Result<(), ChainError>>,
    },
    Broadcast {
        message: Message,
        reply: Option<Reply<BroadcastReport>>,
    },
    SendDirect {
        node_id: String,
        message: Message,
        reply: Reply<Result<(), ChainError>>,
    },
    RequestSync {
        from_height: u64,
        reply: Reply<Result<String, ChainError>>,
    },
    FetchChain {
        node_id: String,
        from_height: u64,
        reply: Reply<Result<SyncOffer, ChainError>>,
    },
    RespondSync {
        node_id: String,
        request_id: String,
        height: u64,
        from_height: u64,
        blocks: Vec<Block>,
        reply: Reply<Result<(), ChainError>>,
    },
    Disconnect {
        node_id: String,
        reply: Reply<bool>,
    },
    SetLocalHeight(u64),
    HeartbeatNow {
        reply: Reply<usize>,
    },
    SweepPeers {
        reply: Reply<usize>,
    },
    Status {
        reply: Reply<NetworkStatus>,
    },
    Stats {
        reply: Reply<NetworkStats>,
    },
    Peers {
        reply: Reply<Vec<PeerInfo>>,
    },
    Shutdown,
}

/// Notifications published by the network actor.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    PeerConnected {
        node_id: String,
        address: SocketAddr,
    },
    PeerDisconnected {
        node_id: String,
        reason: String,
    },
    TransactionReceived {
        from: String,
        transaction: Box<Transaction>,
    },
    BlockReceived {
        from: String,
        block: Box<Block>,
    },
    SyncRequested {
        from: String,
        request_id: String,
        from_height: u64,
    },
    /// A response to a broadcast sync request.
    SyncOffer(SyncOffer),
    SyncTimedOut {
        request_id: String,
    },
    /// An active peer's heartbeat reported a chain taller than ours.
    PeerAhead {
        node_id: String,
        height: u64,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionStatus {
    Stopped,
    Listening,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkStatus {
    pub node_id: String,
    pub connection_status: ConnectionStatus,
    pub peer_count: usize,
    pub active_peers: usize,
    pub max_peers: usize,
    pub sync_status: SyncState,
    pub listen_address: Option<SocketAddr>,
    pub uptime_ms: u64,
    pub local_height: u64,
    pub known_addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    pub total_connections: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub security_events: u64,
    pub rate_limited: u64,
    pub blocked_connections: u64,
    pub auth_failures: u64,
}

/// Cloneable front end to the network actor.
#[derive(Clone)]
pub struct NetworkHandle {
    commands: mpsc::UnboundedSender<NetworkCommand>,
    node_id: String,
}

fn stopped() -> ChainError {
    ChainError::NetworkError("network actor has stopped".to_string())
}

impl NetworkHandle {
    /// Spawns the actor on the current tokio runtime. The node key comes from
    /// `config.node_secret_key` when set.
    pub fn spawn(config: NetworkConfig) -> Result<(Self, mpsc::UnboundedReceiver<NetworkEvent>), ChainError> {
        config.validate()?;
        let keypair = match &config.node_secret_key {
            Some(secret) => {
                let bytes = hex::decode(secret)
                    .map_err(|e| ChainError::CryptoError(format!("node secret key is not hex: {}", e)))?;
                KeyPair::from_secret_bytes(&bytes)?
            }
            None => KeyPair::generate()?,
        };
        let node_id = node_id_for(&keypair.public_key_bytes());

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let actor = actor::NetworkActor::new(config, keypair, event_tx, internal_tx);
        tokio::spawn(actor.run(command_rx, internal_rx));

        Ok((
            NetworkHandle {
                commands: command_tx,
                node_id,
            },
            event_rx,
        ))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> NetworkCommand) -> Result<T, ChainError> {
        let (reply, response) = oneshot::channel();
        self.commands.send(build(reply)).map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())
    }

    /// Binds the listener; port 0 picks a free port.
    pub async fn start(&self, port: u16) -> Result<SocketAddr, ChainError> {
        self.request(|reply| NetworkCommand::Start { port, reply }).await?
    }

    /// Resolves once the WebSocket is open and our auth has been sent.
    pub async fn connect_to(&self, address: &str) -> Result<(), ChainError> {
        let address = address.to_string();
        self.request(|reply| NetworkCommand::Connect { address, reply })
            .await?
    }

    pub async fn broadcast(&self, message: Message) -> Result<BroadcastReport, ChainError> {
        self.request(|reply| NetworkCommand::Broadcast {
            message,
            reply: Some(reply),
        })
        .await
    }

    pub async fn send_direct(&self, node_id: &str, message: Message) -> Result<(), ChainError> {
        let node_id = node_id.to_string();
        self.request(|reply| NetworkCommand::SendDirect {
            node_id,
            message,
            reply,
        })
        .await?
    }

    /// Asks every active peer for its chain from `from_height` on. Offers
    /// arrive as [`NetworkEvent::SyncOffer`]. Returns the request id.
    pub async fn request_sync(&self, from_height: u64) -> Result<String, ChainError> {
        self.request(|reply| NetworkCommand::RequestSync { from_height, reply })
            .await?
    }

    /// Requests one page of a peer's chain starting at `from_height` and
    /// waits for it. Fails on the sync timeout or when that peer disconnects
    /// first.
    pub async fn fetch_chain(&self, node_id: &str, from_height: u64) -> Result<SyncOffer, ChainError> {
        let node_id = node_id.to_string();
        self.request(|reply| NetworkCommand::FetchChain {
            node_id,
            from_height,
            reply,
        })
        .await?
    }

    /// Answers a sync request with blocks starting at `from_height`. The
    /// page shrinks until its sealed frame fits the frame limit.
    pub async fn respond_sync(
        &self,
        node_id: &str,
        request_id: &str,
        height: u64,
        from_height: u64,
        blocks: Vec<Block>,
    ) -> Result<(), ChainError> {
        let (node_id, request_id) = (node_id.to_string(), request_id.to_string());
        self.request(|reply| NetworkCommand::RespondSync {
            node_id,
            request_id,
            height,
            from_height,
            blocks,
            reply,
        })
        .await?
    }

    pub async fn disconnect(&self, node_id: &str) -> Result<bool, ChainError> {
        let node_id = node_id.to_string();
        self.request(|reply| NetworkCommand::Disconnect { node_id, reply })
            .await
    }

    /// Height advertised in our heartbeats.
    pub fn set_local_height(&self, height: u64) {
        let _ = self.commands.send(NetworkCommand::SetLocalHeight(height));
    }

    /// Sends a heartbeat to every active peer now; returns how many were reached.
    pub async fn heartbeat_now(&self) -> Result<usize, ChainError> {
        self.request(|reply| NetworkCommand::HeartbeatNow { reply })
            .await
    }

    /// Runs the liveness sweep now; returns how many peers were dropped.
    pub async fn sweep_peers(&self) -> Result<usize, ChainError> {
        self.request(|reply| NetworkCommand::SweepPeers { reply })
            .await
    }

    pub async fn status(&self) -> Result<NetworkStatus, ChainError> {
        self.request(|reply| NetworkCommand::Status { reply }).await
    }

    pub async fn stats(&self) -> Result<NetworkStats, ChainError> {
        self.request(|reply| NetworkCommand::Stats { reply }).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>, ChainError> {
        self.request(|reply| NetworkCommand::Peers { reply }).await
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(NetworkCommand::Shutdown);
    }
}

impl Gossip for NetworkHandle {
    fn announce_transaction(&self, tx: &Transaction) {
        let command = NetworkCommand::Broadcast {
            message: Message::Transaction(Box::new(tx.clone())),
            reply: None,
        };
        if self.commands.send(command).is_err() {
            debug!(target: "p2p", "transaction announcement dropped: network stopped");
        }
    }

    fn announce_block(&self, block: &Block) {
        let command = NetworkCommand::Broadcast {
            message: Message::Block(Box::new(block.clone())),
            reply: None,
        };
        if self.commands.send(command).is_err() {
            debug!(target: "p2p", "block announcement dropped: network stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn local_config() -> NetworkConfig {
        NetworkConfig {
            listen_host: "127.0.0.1".into(),
            maintenance_interval_ms: 50,
            ..NetworkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_reports_status() {
        let (handle, _events) = NetworkHandle::spawn(local_config()).unwrap();
        let before = handle.status().await.unwrap();
        assert_eq!(before.connection_status, ConnectionStatus::Stopped);
        assert_eq!(before.node_id, handle.node_id());

        let addr = handle.start(0).await.unwrap();
        assert_ne!(addr.port(), 0);
        let after = handle.status().await.unwrap();
        assert_eq!(after.connection_status, ConnectionStatus::Listening);
        assert_eq!(after.listen_address, Some(addr));
        assert_eq!(after.sync_status, SyncState::Idle);

        assert!(handle.start(0).await.is_err());
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_configured_node_key_sets_id() {
        let key = KeyPair::generate().unwrap();
        let config = NetworkConfig {
            node_secret_key: Some(hex::encode(key.secret_key.secret_bytes())),
            ..local_config()
        };
        let (handle, _events) = NetworkHandle::spawn(config).unwrap();
        assert_eq!(handle.node_id(), node_id_for(&key.public_key_bytes()));
        handle.shutdown();

        let bad = NetworkConfig {
            node_secret_key: Some("zz".into()),
            ..local_config()
        };
        assert!(NetworkHandle::spawn(bad).is_err());
    }

    #[tokio::test]
    async fn test_no_peers_to_sync_from() {
        let (handle, _events) = NetworkHandle::spawn(local_config()).unwrap();
        assert!(handle.request_sync(1).await.is_err());
        assert!(handle.fetch_chain("unknown", 0).await.is_err());
        assert_eq!(handle.heartbeat_now().await.unwrap(), 0);
        assert!(!handle.disconnect("unknown").await.unwrap());
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_dial_failure_is_reported() {
        let (handle, _events) = NetworkHandle::spawn(NetworkConfig {
            dial_timeout_ms: 500,
            ..local_config()
        })
        .unwrap();
        // nothing listens on port 1
        let result = tokio::time::timeout(Duration::from_secs(5), handle.connect_to("127.0.0.1:1"))
            .await
            .unwrap();
        assert!(result.is_err());
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_handle_after_shutdown() {
        let (handle, _events) = NetworkHandle::spawn(local_config()).unwrap();
        handle.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(handle.status().await, Err(ChainError::NetworkError(_))));
    }
}
