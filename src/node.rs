//! Node runtime: wires the chain orchestrator to the P2P network
//!
//! The chain lives behind one `tokio::sync::RwLock`, the single-writer
//! boundary for submission, block admission and conflict resolution. The
//! network never calls into the chain; its events are drained by a task
//! spawned here, which takes the lock only for the duration of each chain
//! operation and never across a network round trip.

use crate::block::Block;
use crate::blockchain::{BlockOrigin, Blockchain, ChainStatus, HistoryEntry, TxReceipt};
use crate::config::NodeConfig;
use crate::error::{ChainError, ErrorKind};
use crate::network::{NetworkEvent, NetworkHandle, NetworkStats, NetworkStatus};
use crate::persistence::SnapshotStore;
use crate::sync::SyncOffer;
use crate::transaction::{Amount, TokenKind, Transaction};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    Booting,
    Syncing,
    Ready,
    Degraded,
}

/// Installs the global fmt subscriber, filtered by `RUST_LOG` (default
/// `info`). Later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub struct Node {
    chain: Arc<RwLock<Blockchain>>,
    network: NetworkHandle,
    state: Arc<RwLock<NodeState>>,
    listen_addr: SocketAddr,
    event_task: JoinHandle<()>,
}

impl Node {
    /// Bootstraps the chain from `storage`, starts listening, dials the
    /// configured seeds and begins processing network events. An invalid
    /// stored chain aborts the launch.
    pub async fn launch(config: NodeConfig, storage: Box<dyn SnapshotStore>) -> Result<Self, ChainError> {
        config.validate()?;
        let state = Arc::new(RwLock::new(NodeState::Booting));

        let mut chain = Blockchain::new(config.chain.clone(), storage)?;
        let (network, events) = NetworkHandle::spawn(config.network.clone())?;
        let listen_addr = match network.start(config.network.listen_port).await {
            Ok(addr) => addr,
            Err(e) => {
                network.shutdown();
                return Err(e);
            }
        };

        chain.set_gossip(Arc::new(network.clone()));
        network.set_local_height(chain.height());
        info!(
            node_id = %network.node_id(),
            %listen_addr,
            height = chain.height(),
            genesis = %hex::encode(chain.genesis_hash()),
            "node started"
        );
        let chain = Arc::new(RwLock::new(chain));

        let mut connected = 0;
        for seed in &config.network.seed_peers {
            match network.connect_to(seed).await {
                Ok(()) => connected += 1,
                Err(e) => warn!(%seed, error = %e, "failed to dial seed peer"),
            }
        }
        *state.write().await = if connected > 0 {
            NodeState::Syncing
        } else {
            NodeState::Ready
        };

        let event_task = tokio::spawn(run_events(
            chain.clone(),
            network.clone(),
            state.clone(),
            config.network.sync_page_blocks,
            events,
        ));

        Ok(Node {
            chain,
            network,
            state,
            listen_addr,
            event_task,
        })
    }

    pub fn chain(&self) -> Arc<RwLock<Blockchain>> {
        self.chain.clone()
    }

    pub fn network(&self) -> &NetworkHandle {
        &self.network
    }

    pub fn node_id(&self) -> &str {
        self.network.node_id()
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub async fn state(&self) -> NodeState {
        *self.state.read().await
    }

    pub async fn connect_to(&self, address: &str) -> Result<(), ChainError> {
        self.network.connect_to(address).await
    }

    pub async fn submit_transaction(&self, tx: Transaction) -> Result<TxReceipt, ChainError> {
        self.chain.write().await.submit_transaction(tx)
    }

    pub async fn register_validator(&self, id: &str, score: u64) -> Result<(), ChainError> {
        self.chain.write().await.register_validator(id, score)
    }

    /// Selects a validator and assembles a block under the lock, mines it on
    /// the blocking pool, then commits under the lock again. A block that
    /// lost a race with a remote block at the same height is rejected by
    /// admission.
    pub async fn mine_block(&self, candidates: &[String]) -> Result<Block, ChainError> {
        let mut block = self.chain.write().await.prepare_block(candidates, None)?;

        let block = tokio::task::spawn_blocking(move || {
            block.mine();
            block
        })
        .await
        .map_err(|e| ChainError::InvalidBlock(format!("mining task failed: {}", e)))?;

        let mut chain = self.chain.write().await;
        chain.add_block(block.clone(), BlockOrigin::Local)?;
        self.network.set_local_height(chain.height());
        Ok(block)
    }

    /// Submits an externally produced block.
    pub async fn submit_block(&self, block: Block) -> Result<(), ChainError> {
        let mut chain = self.chain.write().await;
        chain.add_block(block, BlockOrigin::Local)?;
        self.network.set_local_height(chain.height());
        Ok(())
    }

    pub async fn get_balance(&self, id: &str, token: TokenKind) -> Amount {
        self.chain.read().await.get_balance(id, token)
    }

    pub async fn get_transaction_history(&self, id: &str, token: Option<TokenKind>) -> Vec<HistoryEntry> {
        self.chain.read().await.get_transaction_history(id, token)
    }

    pub async fn status(&self) -> ChainStatus {
        self.chain.read().await.status()
    }

    pub async fn network_status(&self) -> Result<NetworkStatus, ChainError> {
        self.network.status().await
    }

    pub async fn network_stats(&self) -> Result<NetworkStats, ChainError> {
        self.network.stats().await
    }

    /// Pulls `peer`'s chain page by page and adopts it if it is longer and
    /// valid.
    pub async fn sync_from(&self, peer: &str) -> Result<u64, ChainError> {
        let from_height = self.chain.read().await.height() + 1;
        let offer = self.network.fetch_chain(peer, from_height).await?;
        pull_chain(&self.chain, &self.network, offer).await
    }

    pub fn shutdown(self) {
        self.network.shutdown();
        self.event_task.abort();
    }
}

async fn run_events(
    chain: Arc<RwLock<Blockchain>>,
    network: NetworkHandle,
    state: Arc<RwLock<NodeState>>,
    page_blocks: usize,
    mut events: mpsc::UnboundedReceiver<NetworkEvent>,
) {
    let pulling: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    while let Some(event) = events.recv().await {
        match event {
            NetworkEvent::PeerConnected { node_id, address } => {
                info!(%node_id, %address, "peer joined");
                let from_height = chain.read().await.height() + 1;
                if let Err(e) = network.request_sync(from_height).await {
                    debug!(error = %e, "sync request not sent");
                }
            }
            NetworkEvent::PeerDisconnected { node_id, reason } => {
                info!(%node_id, %reason, "peer left");
            }
            NetworkEvent::TransactionReceived { from, transaction } => {
                match chain.write().await.submit_transaction(*transaction) {
                    Ok(receipt) => debug!(
                        %from,
                        tx = %hex::encode(receipt.content_hash),
                        "relayed transaction accepted"
                    ),
                    Err(ChainError::DuplicateTransaction(_)) => {}
                    Err(e) => debug!(%from, error = %e, "relayed transaction rejected"),
                }
            }
            NetworkEvent::BlockReceived { from, block } => {
                handle_block(&chain, &network, &from, *block).await;
            }
            NetworkEvent::SyncRequested {
                from,
                request_id,
                from_height,
            } => {
                let (height, start, blocks) = {
                    let chain = chain.read().await;
                    let all = chain.blocks();
                    let start = all.len().min(from_height as usize);
                    let end = all.len().min(start.saturating_add(page_blocks));
                    (chain.height(), start as u64, all[start..end].to_vec())
                };
                if let Err(e) = network
                    .respond_sync(&from, &request_id, height, start, blocks)
                    .await
                {
                    debug!(%from, error = %e, "sync response not sent");
                }
            }
            NetworkEvent::SyncOffer(offer) => {
                if offer.height <= chain.read().await.height() {
                    *state.write().await = NodeState::Ready;
                    continue;
                }
                if !pulling.lock().insert(offer.peer.clone()) {
                    debug!(peer = %offer.peer, "already pulling from peer");
                    continue;
                }
                let (chain, network, state, pulling) =
                    (chain.clone(), network.clone(), state.clone(), pulling.clone());
                tokio::spawn(async move {
                    let peer = offer.peer.clone();
                    match pull_chain(&chain, &network, offer).await {
                        Ok(height) => {
                            info!(%peer, height, "adopted longer chain");
                            *state.write().await = NodeState::Ready;
                        }
                        Err(e) => warn!(%peer, error = %e, "discarded chain offer"),
                    }
                    pulling.lock().remove(&peer);
                });
            }
            NetworkEvent::SyncTimedOut { request_id } => {
                let mut state = state.write().await;
                if *state == NodeState::Syncing {
                    warn!(%request_id, "initial sync timed out");
                    *state = NodeState::Degraded;
                }
            }
            NetworkEvent::PeerAhead { node_id, height } => {
                debug!(%node_id, height, "peer is ahead, syncing");
                *state.write().await = NodeState::Syncing;
                let from_height = chain.read().await.height() + 1;
                if let Err(e) = network.request_sync(from_height).await {
                    debug!(error = %e, "sync request not sent");
                }
            }
        }
    }
    debug!("network event stream closed");
}

/// Builds a candidate chain from our prefix below `offer.from_height` and the
/// peer's pages, fetching the rest until the last page. Returns `None` when
/// the first page does not extend our prefix.
async fn assemble_candidate(
    chain: &RwLock<Blockchain>,
    network: &NetworkHandle,
    offer: SyncOffer,
) -> Result<Option<Vec<Block>>, ChainError> {
    let mut candidate = {
        let chain = chain.read().await;
        let local = chain.blocks();
        let from = offer.from_height as usize;
        if from > local.len() {
            return Ok(None);
        }
        local[..from].to_vec()
    };
    if let (Some(tip), Some(first)) = (candidate.last(), offer.blocks.first()) {
        if first.header.previous_hash != tip.hash {
            return Ok(None);
        }
    }

    let peer = offer.peer.clone();
    let mut page = offer;
    loop {
        let last = page.is_last_page();
        candidate.extend(page.blocks);
        if last {
            break;
        }
        let next = candidate.len() as u64;
        page = network.fetch_chain(&peer, next).await?;
        if page.from_height != next {
            return Err(ChainError::NetworkError(format!(
                "peer {} answered from height {} instead of {}",
                peer, page.from_height, next
            )));
        }
    }
    Ok(Some(candidate))
}

/// Completes `offer` into a full candidate and adopts it if it is longer and
/// valid. A fork below the offered page is refetched from genesis.
async fn pull_chain(
    chain: &RwLock<Blockchain>,
    network: &NetworkHandle,
    offer: SyncOffer,
) -> Result<u64, ChainError> {
    let peer = offer.peer.clone();
    let candidate = match assemble_candidate(chain, network, offer).await? {
        Some(candidate) => candidate,
        None => {
            debug!(%peer, "offer forks below our tip, fetching from genesis");
            let offer = network.fetch_chain(&peer, 0).await?;
            assemble_candidate(chain, network, offer).await?.ok_or_else(|| {
                ChainError::NetworkError(format!("peer {} did not answer from genesis", peer))
            })?
        }
    };

    let mut chain = chain.write().await;
    let height = chain.resolve_conflicts(vec![candidate])?;
    network.set_local_height(height);
    Ok(height)
}

async fn handle_block(chain: &RwLock<Blockchain>, network: &NetworkHandle, from: &str, block: Block) {
    let mut chain = chain.write().await;
    let tip = chain.height();
    let height = block.header.height;

    if height <= tip {
        debug!(%from, height, tip, "ignoring block at or below tip");
        return;
    }
    if height > tip + 1 {
        drop(chain);
        debug!(%from, height, tip, "block is ahead of tip, requesting sync");
        if let Err(e) = network.request_sync(tip + 1).await {
            debug!(error = %e, "sync request not sent");
        }
        return;
    }

    match chain.add_block(block, BlockOrigin::Remote) {
        Ok(()) => network.set_local_height(chain.height()),
        Err(e) if e.kind() == ErrorKind::Integrity => {
            warn!(%from, height, error = %e, "peer sent a tampered block")
        }
        Err(e) => debug!(%from, height, error = %e, "remote block rejected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenesisAllocation;
    use crate::crypto::KeyPair;
    use crate::persistence::InMemorySnapshotStore;
    use crate::transaction::Payload;

    fn config(alice: &str) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.chain.difficulty = 1;
        config.chain.genesis_allocations = vec![GenesisAllocation {
            identity: alice.to_string(),
            token: TokenKind::B,
            amount: Amount::from_tokens(1000),
        }];
        config.network.listen_host = "127.0.0.1".into();
        config.network.listen_port = 0;
        config
    }

    #[test]
    fn test_init_tracing_twice() {
        init_tracing();
        init_tracing();
    }

    #[tokio::test]
    async fn test_launch_mine_and_query() {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap().identity();
        let validator = KeyPair::generate().unwrap().identity();

        let node = Node::launch(config(&alice.identity()), Box::new(InMemorySnapshotStore::new()))
            .await
            .unwrap();
        assert_eq!(node.state().await, NodeState::Ready);
        assert_eq!(node.status().await.height, 0);

        node.register_validator(&validator, 100).await.unwrap();
        let mut tx = Transaction::create(
            &alice.identity(),
            &bob,
            Amount::from_tokens(100),
            TokenKind::B,
            Payload::default(),
        );
        tx.sign(Some(&alice)).unwrap();
        node.submit_transaction(tx).await.unwrap();

        let block = node.mine_block(&[]).await.unwrap();
        assert_eq!(block.header.height, 1);
        assert_eq!(block.header.validator_id, validator);
        assert_eq!(node.get_balance(&alice.identity(), TokenKind::B).await, Amount::from_tokens(900));
        assert_eq!(node.get_balance(&bob, TokenKind::B).await, Amount::from_tokens(100));
        assert_eq!(node.get_transaction_history(&bob, None).await.len(), 1);
        assert_eq!(node.network_status().await.unwrap().local_height, 1);

        node.shutdown();
    }

    #[tokio::test]
    async fn test_launch_refuses_corrupt_snapshot() {
        let alice = KeyPair::generate().unwrap();
        let mut genesis = Blockchain::build_genesis(&config(&alice.identity()).chain);
        genesis.header.validator_id = alice.identity();
        let store = InMemorySnapshotStore::with_chain(vec![genesis]);

        let result = Node::launch(config(&alice.identity()), Box::new(store)).await;
        assert!(matches!(result, Err(ChainError::Integrity(_))));
    }

    #[tokio::test]
    async fn test_mining_with_empty_mempool_fails() {
        let alice = KeyPair::generate().unwrap();
        let node = Node::launch(config(&alice.identity()), Box::new(InMemorySnapshotStore::new()))
            .await
            .unwrap();
        assert!(node.mine_block(&[]).await.is_err());
        node.shutdown();
    }
}
