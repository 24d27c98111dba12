//! The network actor: sole owner of peer state, limiters and sync bookkeeping

use super::connection::{self, Internal};
use super::limiter::{ConnectionThrottle, RateLimiter};
use super::message::{
    AuthPayload, AuthResponsePayload, DiscoveryPayload, Envelope, HeartbeatPayload, Message,
    MessageKind, SyncRequestPayload, SyncResponsePayload, PROTOCOL_VERSION,
};
use super::peer::{ConnId, HandshakeState, Outbound, PeerRecord, PeerTable};
use super::session::SessionCipher;
use super::{
    BroadcastReport, ConnectionStatus, NetworkCommand, NetworkEvent, NetworkStats, NetworkStatus,
};
use crate::config::NetworkConfig;
use crate::crypto::{random_bytes, sha256, verify_signature, KeyPair};
use crate::error::ChainError;
use crate::sync::{Completion, SyncOffer, SyncTracker};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

/// Node ids are the hex SHA-256 of the node's compressed public key.
pub fn node_id_for(public_key: &[u8]) -> String {
    hex::encode(sha256(public_key))
}

fn auth_message(challenge: &[u8; 32], node_id: &str) -> Vec<u8> {
    let mut message = Vec::with_capacity(32 + node_id.len());
    message.extend_from_slice(challenge);
    message.extend_from_slice(node_id.as_bytes());
    message
}

/// When two nodes dial each other at once, both keep the link dialed by the
/// lower node id. Returns true when that is our outbound link.
fn keep_outbound_link(local: &str, remote: &str) -> bool {
    local < remote
}

fn decode_challenge(hex_challenge: &str) -> Result<[u8; 32], ChainError> {
    let bytes = hex::decode(hex_challenge)
        .map_err(|e| ChainError::NetworkError(format!("bad challenge encoding: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| ChainError::NetworkError("challenge must be 32 bytes".to_string()))
}

pub(super) struct NetworkActor {
    config: NetworkConfig,
    keypair: KeyPair,
    node_id: String,
    peers: PeerTable,
    limiter: RateLimiter<(ConnId, MessageKind)>,
    throttle: ConnectionThrottle,
    sync: SyncTracker,
    stats: NetworkStats,
    local_height: u64,
    listen_addr: Option<SocketAddr>,
    started_at: Instant,
    next_conn: ConnId,
    ws_config: WebSocketConfig,
    events: mpsc::UnboundedSender<NetworkEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    shutdown_tx: watch::Sender<bool>,
}

impl NetworkActor {
    pub(super) fn new(
        config: NetworkConfig,
        keypair: KeyPair,
        events: mpsc::UnboundedSender<NetworkEvent>,
        internal_tx: mpsc::UnboundedSender<Internal>,
    ) -> Self {
        let node_id = node_id_for(&keypair.public_key_bytes());
        let (shutdown_tx, _) = watch::channel(false);
        NetworkActor {
            limiter: RateLimiter::new(config.rate_limit_messages, config.rate_limit_window()),
            throttle: ConnectionThrottle::new(
                config.connection_attempt_limit,
                config.connection_attempt_window(),
            ),
            ws_config: connection::ws_config(config.max_frame_bytes),
            config,
            keypair,
            node_id,
            peers: PeerTable::new(),
            sync: SyncTracker::new(),
            stats: NetworkStats::default(),
            local_height: 0,
            listen_addr: None,
            started_at: Instant::now(),
            next_conn: 1,
            events,
            internal_tx,
            shutdown_tx,
        }
    }

    pub(super) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<NetworkCommand>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut maintenance = tokio::time::interval(self.config.maintenance_interval());
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // both intervals fire immediately; skip that first tick
        maintenance.tick().await;
        heartbeat.tick().await;

        info!(target: "p2p", node_id = %self.node_id, "network actor started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(NetworkCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = internal.recv() => self.handle_internal(event),
                _ = maintenance.tick() => self.maintain(Instant::now()),
                _ = heartbeat.tick() => {
                    self.send_heartbeats();
                }
            }
        }
        self.shutdown();
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: NetworkCommand) {
        match command {
            NetworkCommand::Start { port, reply } => {
                let _ = reply.send(self.start(port).await);
            }
            NetworkCommand::Connect { address, reply } => {
                tokio::spawn(connection::dial(
                    address,
                    self.ws_config,
                    self.config.dial_timeout(),
                    self.internal_tx.clone(),
                    reply,
                ));
            }
            NetworkCommand::Broadcast { message, reply } => {
                let report = self.broadcast(&message);
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
            }
            NetworkCommand::SendDirect { node_id, message, reply } => {
                let _ = reply.send(self.send_direct(&node_id, &message));
            }
            NetworkCommand::RequestSync { from_height, reply } => {
                let _ = reply.send(self.request_sync(from_height));
            }
            NetworkCommand::FetchChain {
                node_id,
                from_height,
                reply,
            } => {
                let request_id = hex::encode(random_bytes::<16>());
                let message = Message::SyncRequest(SyncRequestPayload {
                    request_id: request_id.clone(),
                    from_height,
                });
                match self.send_direct(&node_id, &message) {
                    Ok(()) => self.sync.begin(
                        request_id,
                        Some(node_id),
                        Instant::now() + self.config.sync_timeout(),
                        Some(reply),
                    ),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            NetworkCommand::RespondSync {
                node_id,
                request_id,
                height,
                from_height,
                blocks,
                reply,
            } => {
                let payload = SyncResponsePayload {
                    request_id,
                    height,
                    from_height,
                    blocks,
                };
                let _ = reply.send(self.respond_sync(&node_id, payload));
            }
            NetworkCommand::Disconnect { node_id, reply } => {
                let closed = match self.peers.by_node_id(&node_id) {
                    Some(conn) => {
                        self.close_peer(conn, "disconnected locally");
                        true
                    }
                    None => false,
                };
                let _ = reply.send(closed);
            }
            NetworkCommand::SetLocalHeight(height) => self.local_height = height,
            NetworkCommand::HeartbeatNow { reply } => {
                let _ = reply.send(self.send_heartbeats());
            }
            NetworkCommand::SweepPeers { reply } => {
                let _ = reply.send(self.sweep_peers(Instant::now()));
            }
            NetworkCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            NetworkCommand::Stats { reply } => {
                let _ = reply.send(self.stats.clone());
            }
            NetworkCommand::Peers { reply } => {
                let _ = reply.send(self.peers.iter().map(PeerRecord::info).collect());
            }
            NetworkCommand::Shutdown => {}
        }
    }

    async fn start(&mut self, port: u16) -> Result<SocketAddr, ChainError> {
        if let Some(addr) = self.listen_addr {
            return Err(ChainError::NetworkError(format!(
                "already listening on {}",
                addr
            )));
        }
        let listener = TcpListener::bind((self.config.listen_host.as_str(), port))
            .await
            .map_err(|e| ChainError::NetworkError(format!("P2P port {} unavailable: {}", port, e)))?;
        let addr = listener.local_addr()?;
        self.listen_addr = Some(addr);

        tokio::spawn(connection::accept_loop(
            listener,
            self.internal_tx.clone(),
            self.shutdown_tx.subscribe(),
        ));
        info!(target: "p2p", %addr, node_id = %self.node_id, "listening for peers");
        Ok(addr)
    }

    fn broadcast(&mut self, message: &Message) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for conn in self.peers.active_ids() {
            match self.send_to(conn, message) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!(target: "p2p", conn, "broadcast delivery failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    fn send_direct(&mut self, node_id: &str, message: &Message) -> Result<(), ChainError> {
        let conn = self
            .peers
            .by_node_id(node_id)
            .filter(|conn| self.peers.get(*conn).map_or(false, PeerRecord::is_active))
            .ok_or_else(|| ChainError::NetworkError(format!("peer {} is not connected", node_id)))?;
        self.send_to(conn, message)
    }

    fn request_sync(&mut self, from_height: u64) -> Result<String, ChainError> {
        if let Some(existing) = self.sync.pending_broadcast() {
            return Ok(existing.to_string());
        }
        let request_id = hex::encode(random_bytes::<16>());
        let report = self.broadcast(&Message::SyncRequest(SyncRequestPayload {
            request_id: request_id.clone(),
            from_height,
        }));
        if report.delivered == 0 {
            return Err(ChainError::NetworkError(
                "no active peers to sync from".to_string(),
            ));
        }
        self.sync.begin(
            request_id.clone(),
            None,
            Instant::now() + self.config.sync_timeout(),
            None,
        );
        debug!(target: "p2p", %request_id, peers = report.delivered, "sync requested");
        Ok(request_id)
    }

    /// Sends a sync page, halving it until the sealed frame fits. The
    /// requester asks again from wherever the page ended.
    fn respond_sync(&mut self, node_id: &str, mut payload: SyncResponsePayload) -> Result<(), ChainError> {
        loop {
            match self.send_direct(node_id, &Message::SyncResponse(payload.clone())) {
                Err(ChainError::FrameTooLarge { size, .. }) if payload.blocks.len() > 1 => {
                    let keep = payload.blocks.len() / 2;
                    debug!(target: "p2p", %node_id, size, keep, "sync page too large, halving");
                    payload.blocks.truncate(keep);
                }
                other => return other,
            }
        }
    }

    /// Frames and queues `message` for one connection. Consensus kinds are
    /// sealed with the peer's session and fail when there is none.
    fn send_to(&mut self, conn: ConnId, message: &Message) -> Result<(), ChainError> {
        let peer = self
            .peers
            .get(conn)
            .ok_or_else(|| ChainError::NetworkError(format!("connection {} is gone", conn)))?;

        let now = crate::now_millis();
        let envelope = Envelope::wrap(message, &self.node_id, now)?;
        let text = if message.kind().is_consensus() {
            let session = peer.session.as_ref().ok_or_else(|| {
                ChainError::NetworkError(format!("no session with connection {}", conn))
            })?;
            let sealed = session.seal(envelope.to_text()?.as_bytes())?;
            Envelope::wrap(&Message::Sealed(sealed), &self.node_id, now)?.to_text()?
        } else {
            envelope.to_text()?
        };
        if text.len() > self.config.max_frame_bytes {
            return Err(ChainError::FrameTooLarge {
                size: text.len(),
                limit: self.config.max_frame_bytes,
            });
        }

        let len = text.len() as u64;
        peer.outbox
            .send(Outbound::Frame(text))
            .map_err(|_| ChainError::NetworkError(format!("connection {} is closing", conn)))?;
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += len;
        Ok(())
    }

    fn send_heartbeats(&mut self) -> usize {
        let message = Message::Heartbeat(HeartbeatPayload {
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            peer_count: self.peers.active_count(),
            height: self.local_height,
        });
        self.broadcast(&message).delivered
    }

    fn status(&self) -> NetworkStatus {
        let active_peers = self.peers.active_count();
        let connection_status = match (self.listen_addr, active_peers) {
            (_, n) if n > 0 => ConnectionStatus::Connected,
            (Some(_), _) => ConnectionStatus::Listening,
            (None, _) => ConnectionStatus::Stopped,
        };
        NetworkStatus {
            node_id: self.node_id.clone(),
            connection_status,
            peer_count: self.peers.len(),
            active_peers,
            max_peers: self.config.max_peers,
            sync_status: self.sync.state(),
            listen_address: self.listen_addr,
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            local_height: self.local_height,
            known_addresses: self.peers.known_addresses(),
        }
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Incoming { stream, address } => {
                if !self.throttle.register_attempt(address.ip(), Instant::now()) {
                    self.stats.blocked_connections += 1;
                    warn!(target: "p2p", event = "connection_blocked", %address, "connection attempt refused");
                    return;
                }
                tokio::spawn(connection::upgrade_inbound(
                    stream,
                    address,
                    self.ws_config,
                    self.config.auth_timeout(),
                    self.internal_tx.clone(),
                ));
            }
            Internal::Opened {
                stream,
                address,
                outbound,
                reply,
            } => self.open_connection(stream, address, outbound, reply),
            Internal::Frame { conn, text } => self.handle_frame(conn, text),
            Internal::Closed { conn, reason } => self.close_peer(conn, &reason),
        }
    }

    fn open_connection(
        &mut self,
        stream: connection::WsStream,
        address: SocketAddr,
        outbound: bool,
        reply: Option<tokio::sync::oneshot::Sender<Result<(), ChainError>>>,
    ) {
        let conn = self.next_conn;
        self.next_conn += 1;
        let outbox = connection::spawn_connection(conn, stream, self.internal_tx.clone());
        let challenge = random_bytes::<32>();
        self.peers
            .insert(PeerRecord::new(conn, address, outbound, challenge, outbox));
        self.stats.total_connections += 1;
        debug!(target: "p2p", conn, %address, outbound, "connection opened");

        let auth = Message::Auth(AuthPayload {
            node_id: self.node_id.clone(),
            public_key: hex::encode(self.keypair.public_key_bytes()),
            version: PROTOCOL_VERSION.to_string(),
            challenge: hex::encode(challenge),
            listen_port: self.listen_addr.map(|addr| addr.port()),
        });
        let result = self.send_to(conn, &auth);
        if result.is_ok() {
            if let Some(peer) = self.peers.get_mut(conn) {
                peer.state = HandshakeState::AuthPending;
            }
        }
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    fn handle_frame(&mut self, conn: ConnId, text: String) {
        let now = Instant::now();
        let Some(peer) = self.peers.get_mut(conn) else {
            return;
        };
        peer.last_seen = now;
        self.stats.bytes_received += text.len() as u64;

        if text.len() > self.config.max_frame_bytes {
            self.security_event(conn, "oversized_frame", "frame exceeds size limit");
            return;
        }
        let envelope = match Envelope::parse(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.security_event(conn, "malformed_envelope", &e.to_string());
                return;
            }
        };
        if let Err(e) = self.check_freshness(&envelope) {
            self.security_event(conn, "stale_envelope", &e.to_string());
            return;
        }

        let (envelope, sealed) = if envelope.kind() == MessageKind::Sealed {
            match self.unseal(conn, envelope) {
                Ok(inner) => (inner, true),
                Err(e) => {
                    self.security_event(conn, "unseal_failed", &e.to_string());
                    return;
                }
            }
        } else {
            (envelope, false)
        };

        let kind = envelope.kind();
        if !self.limiter.check(&(conn, kind), now) {
            self.stats.rate_limited += 1;
            self.security_event(conn, "rate_limited", kind.as_str());
            return;
        }
        if kind.is_consensus() && !sealed {
            let authenticated = self
                .peers
                .get(conn)
                .map_or(false, PeerRecord::is_authenticated);
            let event = if authenticated {
                "unsealed_consensus"
            } else {
                "unauthenticated_consensus"
            };
            self.security_event(conn, event, kind.as_str());
            return;
        }

        let message = match envelope.into_message() {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(target: "p2p", conn, kind = %kind.as_str(), "unhandled message type");
                return;
            }
            Err(e) => {
                self.security_event(conn, "malformed_payload", &e.to_string());
                return;
            }
        };
        self.stats.messages_received += 1;
        self.dispatch(conn, message);
    }

    fn check_freshness(&self, envelope: &Envelope) -> Result<(), ChainError> {
        envelope.check_freshness(
            crate::now_millis(),
            self.config.message_max_age_ms,
            self.config.message_max_future_ms,
        )
    }

    fn unseal(&self, conn: ConnId, envelope: Envelope) -> Result<Envelope, ChainError> {
        let session = self
            .peers
            .get(conn)
            .and_then(|peer| peer.session.as_ref())
            .ok_or_else(|| ChainError::NetworkError("sealed message without a session".to_string()))?;
        let sealed = match envelope.into_message()? {
            Some(Message::Sealed(sealed)) => sealed,
            _ => return Err(ChainError::NetworkError("malformed sealed body".to_string())),
        };
        let plaintext = session.open(&sealed)?;
        let text = String::from_utf8(plaintext)
            .map_err(|_| ChainError::NetworkError("sealed body is not UTF-8".to_string()))?;
        let inner = Envelope::parse(&text)?;
        if inner.kind() == MessageKind::Sealed {
            return Err(ChainError::NetworkError("nested sealed envelope".to_string()));
        }
        self.check_freshness(&inner)?;
        Ok(inner)
    }

    fn dispatch(&mut self, conn: ConnId, message: Message) {
        match message {
            Message::Auth(payload) => self.handle_auth(conn, payload),
            Message::AuthResponse(payload) => self.handle_auth_response(conn, payload),
            Message::PeerDiscovery(payload) => self.handle_discovery(conn, payload),
            Message::Heartbeat(payload) => self.handle_heartbeat(conn, payload),
            Message::SyncRequest(payload) => {
                if let Some(from) = self.active_node_id(conn) {
                    self.emit(NetworkEvent::SyncRequested {
                        from,
                        request_id: payload.request_id,
                        from_height: payload.from_height,
                    });
                }
            }
            Message::SyncResponse(payload) => self.handle_sync_response(conn, payload),
            Message::Transaction(transaction) => {
                if let Some(from) = self.active_node_id(conn) {
                    self.emit(NetworkEvent::TransactionReceived { from, transaction });
                }
            }
            Message::Block(block) => {
                if let Some(from) = self.active_node_id(conn) {
                    self.emit(NetworkEvent::BlockReceived { from, block });
                }
            }
            Message::Sealed(_) => self.security_event(conn, "nested_sealed", "sealed"),
        }
    }

    fn active_node_id(&self, conn: ConnId) -> Option<String> {
        self.peers
            .get(conn)
            .filter(|peer| peer.is_active())
            .and_then(|peer| peer.node_id.clone())
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    fn handle_auth(&mut self, conn: ConnId, payload: AuthPayload) {
        let Some(peer) = self.peers.get(conn) else {
            return;
        };
        if peer.remote_challenge.is_some() {
            self.security_event(conn, "duplicate_auth", "auth already received");
            return;
        }
        if payload.version != PROTOCOL_VERSION {
            self.reject_auth(conn, &format!("unsupported protocol version {}", payload.version));
            return;
        }
        let public_key = match hex::decode(&payload.public_key) {
            Ok(key) => key,
            Err(_) => {
                self.reject_auth(conn, "public key is not hex");
                return;
            }
        };
        let challenge = match decode_challenge(&payload.challenge) {
            Ok(challenge) => challenge,
            Err(e) => {
                self.reject_auth(conn, &e.to_string());
                return;
            }
        };
        if node_id_for(&public_key) != payload.node_id {
            self.reject_auth(conn, "node id does not match public key");
            return;
        }
        if payload.node_id == self.node_id {
            debug!(target: "p2p", conn, "dropping connection to self");
            self.close_peer(conn, "self connection");
            return;
        }
        if let Some(existing) = self
            .peers
            .by_node_id(&payload.node_id)
            .filter(|existing| *existing != conn)
        {
            if !self.supersedes(conn, existing, &payload.node_id) {
                self.reject_auth(conn, "node is already connected");
                return;
            }
            debug!(target: "p2p", conn, existing, node_id = %payload.node_id, "simultaneous dial, keeping the new link");
            self.close_peer(existing, "superseded by simultaneous dial");
        }
        if self.peers.authenticated_count() >= self.config.max_peers {
            self.reject_auth(conn, "peer capacity reached");
            return;
        }

        let signature = match self.keypair.sign(&auth_message(&challenge, &self.node_id)) {
            Ok(signature) => signature,
            Err(e) => {
                self.close_peer(conn, &format!("could not sign challenge: {}", e));
                return;
            }
        };
        if let Some(peer) = self.peers.get_mut(conn) {
            peer.node_id = Some(payload.node_id);
            peer.public_key = Some(public_key);
            peer.declared_version = Some(payload.version);
            peer.listen_port = payload.listen_port;
            peer.remote_challenge = Some(challenge);
        }

        let response = Message::AuthResponse(AuthResponsePayload {
            node_id: self.node_id.clone(),
            signature: hex::encode(signature),
        });
        if let Err(e) = self.send_to(conn, &response) {
            self.close_peer(conn, &e.to_string());
        }
    }

    fn handle_auth_response(&mut self, conn: ConnId, payload: AuthResponsePayload) {
        let Some(peer) = self.peers.get(conn) else {
            return;
        };
        if peer.is_authenticated() {
            self.security_event(conn, "duplicate_auth", "already authenticated");
            return;
        }
        let (Some(public_key), Some(remote_challenge)) =
            (peer.public_key.clone(), peer.remote_challenge)
        else {
            self.reject_auth(conn, "auth response before auth");
            return;
        };
        if peer.node_id.as_deref() != Some(payload.node_id.as_str()) {
            self.reject_auth(conn, "auth response from a different node");
            return;
        }
        let local_challenge = peer.local_challenge;

        let verified = hex::decode(&payload.signature)
            .map_err(|e| ChainError::CryptoError(e.to_string()))
            .and_then(|signature| {
                verify_signature(
                    &public_key,
                    &auth_message(&local_challenge, &payload.node_id),
                    &signature,
                )
            });
        if let Err(e) = verified {
            self.reject_auth(conn, &format!("challenge signature invalid: {}", e));
            return;
        }

        let shared_secret = match self.keypair.shared_secret(&public_key) {
            Ok(secret) => secret,
            Err(e) => {
                self.reject_auth(conn, &format!("key agreement failed: {}", e));
                return;
            }
        };
        let session = SessionCipher::derive(&shared_secret, &local_challenge, &remote_challenge);

        let Some(peer) = self.peers.get_mut(conn) else {
            return;
        };
        peer.state = HandshakeState::Authenticated;
        info!(target: "p2p", conn, node_id = %payload.node_id, address = %peer.address, "peer authenticated");
        peer.session = Some(session);
        peer.state = HandshakeState::Active;
        let address = peer.address;
        let listen_address = peer.listen_address();

        if let Some(listen_address) = listen_address {
            self.peers.record_known(listen_address);
        }
        let discovery = Message::PeerDiscovery(DiscoveryPayload {
            peers: self
                .peers
                .shareable_addresses(conn, self.config.discovery_share_limit),
        });
        if let Err(e) = self.send_to(conn, &discovery) {
            debug!(target: "p2p", conn, "discovery send failed: {}", e);
        }
        self.emit(NetworkEvent::PeerConnected {
            node_id: payload.node_id,
            address,
        });
    }

    /// Whether `conn` should replace `existing` as the link to `node_id`.
    /// Only a link in the preferred direction replaces one in the other.
    fn supersedes(&self, conn: ConnId, existing: ConnId, node_id: &str) -> bool {
        let (Some(new), Some(old)) = (self.peers.get(conn), self.peers.get(existing)) else {
            return false;
        };
        let preferred = keep_outbound_link(&self.node_id, node_id);
        new.outbound == preferred && old.outbound != preferred
    }

    fn reject_auth(&mut self, conn: ConnId, reason: &str) {
        self.stats.auth_failures += 1;
        self.security_event(conn, "auth_failed", reason);
        self.close_peer(conn, reason);
    }

    // ------------------------------------------------------------------
    // Control messages
    // ------------------------------------------------------------------

    fn handle_discovery(&mut self, conn: ConnId, payload: DiscoveryPayload) {
        let own = self
            .listen_addr
            .map(|addr| format!("ws://{}:{}", addr.ip(), addr.port()));
        let mut learned = 0;
        for address in payload
            .peers
            .into_iter()
            .take(self.config.discovery_share_limit)
        {
            if Some(&address) == own.as_ref() || !address.starts_with("ws://") {
                continue;
            }
            if self.peers.record_known(address) {
                learned += 1;
            }
        }
        if learned > 0 {
            debug!(target: "p2p", conn, learned, "learned peer addresses");
        }
    }

    fn handle_heartbeat(&mut self, conn: ConnId, payload: HeartbeatPayload) {
        let Some(peer) = self.peers.get_mut(conn) else {
            return;
        };
        peer.reported_height = payload.height;
        if !peer.is_active() {
            return;
        }
        let node_id = peer.node_id.clone();
        if payload.height > self.local_height {
            if let Some(node_id) = node_id {
                self.emit(NetworkEvent::PeerAhead {
                    node_id,
                    height: payload.height,
                });
            }
        }
    }

    fn handle_sync_response(&mut self, conn: ConnId, payload: SyncResponsePayload) {
        let Some(peer) = self.active_node_id(conn) else {
            return;
        };
        let offer = SyncOffer {
            peer,
            request_id: payload.request_id,
            height: payload.height,
            from_height: payload.from_height,
            blocks: payload.blocks,
        };
        match self.sync.complete(offer) {
            Completion::Delivered => {}
            Completion::Publish(offer) => self.emit(NetworkEvent::SyncOffer(offer)),
            Completion::Superseded => {
                debug!(target: "p2p", conn, "dropping repeated sync offer")
            }
            Completion::Unsolicited => {
                self.security_event(conn, "unsolicited_sync_response", "no matching request")
            }
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    fn maintain(&mut self, now: Instant) {
        let auth_timeout = self.config.auth_timeout();
        let unauthenticated: Vec<ConnId> = self
            .peers
            .iter()
            .filter(|peer| !peer.is_authenticated() && now.duration_since(peer.connected_at) >= auth_timeout)
            .map(|peer| peer.conn_id)
            .collect();
        for conn in unauthenticated {
            self.stats.auth_failures += 1;
            warn!(target: "p2p", event = "auth_timeout", conn, "peer failed to authenticate in time");
            self.close_peer(conn, "authentication timed out");
        }

        self.sweep_peers(now);

        for request_id in self.sync.expire(now) {
            warn!(target: "p2p", %request_id, "sync request timed out");
            self.emit(NetworkEvent::SyncTimedOut { request_id });
        }

        self.limiter.cleanup(now);
        self.throttle.cleanup(now);
    }

    /// Disconnects peers silent for longer than the liveness timeout.
    fn sweep_peers(&mut self, now: Instant) -> usize {
        let peer_timeout = self.config.peer_timeout();
        let silent: Vec<ConnId> = self
            .peers
            .iter()
            .filter(|peer| now.duration_since(peer.last_seen) >= peer_timeout)
            .map(|peer| peer.conn_id)
            .collect();
        for conn in &silent {
            info!(target: "p2p", conn, "peer timed out");
            self.close_peer(*conn, "liveness timeout");
        }
        silent.len()
    }

    fn close_peer(&mut self, conn: ConnId, reason: &str) {
        let Some(peer) = self.peers.remove(conn) else {
            return;
        };
        let _ = peer.outbox.send(Outbound::Close);
        self.limiter.forget(|(id, _)| *id == conn);

        if let Some(node_id) = peer.node_id.filter(|_| peer.state == HandshakeState::Active) {
            let orphaned = self.sync.drop_peer(&node_id);
            info!(target: "p2p", conn, %node_id, reason, orphaned, "peer disconnected");
            self.emit(NetworkEvent::PeerDisconnected {
                node_id,
                reason: reason.to_string(),
            });
        } else {
            debug!(target: "p2p", conn, reason, "connection closed");
        }
    }

    fn security_event(&mut self, conn: ConnId, event: &str, detail: &str) {
        self.stats.security_events += 1;
        let address = self.peers.get(conn).map(|peer| peer.address);
        warn!(target: "p2p", event, conn, ?address, detail, "security event");
    }

    fn emit(&self, event: NetworkEvent) {
        if self.events.send(event).is_err() {
            debug!(target: "p2p", "event receiver dropped");
        }
    }

    fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for conn in self.peers.ids() {
            self.close_peer(conn, "shutting down");
        }
        self.sync.abort_all();
        info!(target: "p2p", node_id = %self.node_id, "network actor stopped");
    }
}
