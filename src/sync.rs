//! Chain synchronization bookkeeping for ContribChain
//!
//! The network actor owns a [`SyncTracker`]: every outstanding sync request
//! is recorded with a deadline, responses are correlated by request id, and
//! requests are rejected rather than left hanging when they time out or the
//! target peer disconnects.

use crate::block::Block;
use crate::error::ChainError;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::oneshot;

/// Sync state tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    Idle,
    Syncing,
    Synced,
    Failed,
}

/// A peer's answer to a sync request: one page of its chain starting at
/// `from_height`, plus the height of its tip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOffer {
    pub peer: String,
    pub request_id: String,
    pub height: u64,
    pub from_height: u64,
    pub blocks: Vec<Block>,
}

impl SyncOffer {
    /// True when this page ends at the offered tip.
    pub fn is_last_page(&self) -> bool {
        self.blocks.is_empty() || self.from_height + self.blocks.len() as u64 > self.height
    }
}

/// Sync statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub requests_sent: u64,
    pub offers_received: u64,
    pub timeouts: u64,
    pub failures: u64,
}

pub type SyncWaiter = oneshot::Sender<Result<SyncOffer, ChainError>>;

struct PendingRequest {
    /// `None` for a request broadcast to every active peer.
    target: Option<String>,
    deadline: Instant,
    responses: u32,
    /// Tallest tip offered so far by each peer answering a broadcast.
    offered: HashMap<String, u64>,
    waiter: Option<SyncWaiter>,
}

/// What to do with a sync response once it has been correlated.
#[derive(Debug)]
pub enum Completion {
    /// Handed to the caller awaiting a direct request.
    Delivered,
    /// Belongs to a broadcast request and should be published as an event.
    Publish(SyncOffer),
    /// Repeats a broadcast answer from the same peer without a taller tip.
    Superseded,
    /// Matches no outstanding request from this peer.
    Unsolicited,
}

pub struct SyncTracker {
    pending: HashMap<String, PendingRequest>,
    state: SyncState,
    stats: SyncStats,
}

impl SyncTracker {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            state: SyncState::Idle,
            stats: SyncStats::default(),
        }
    }

    pub fn begin(&mut self, request_id: String, target: Option<String>, deadline: Instant, waiter: Option<SyncWaiter>) {
        self.pending.insert(
            request_id,
            PendingRequest {
                target,
                deadline,
                responses: 0,
                offered: HashMap::new(),
                waiter,
            },
        );
        self.stats.requests_sent += 1;
        self.state = SyncState::Syncing;
    }

    /// Id of the outstanding broadcast request, if one is already in flight.
    pub fn pending_broadcast(&self) -> Option<&str> {
        self.pending
            .iter()
            .find(|(_, request)| request.target.is_none())
            .map(|(id, _)| id.as_str())
    }

    pub fn complete(&mut self, offer: SyncOffer) -> Completion {
        let Some(request) = self.pending.get_mut(&offer.request_id) else {
            return Completion::Unsolicited;
        };
        if request.target.as_deref().map_or(false, |t| t != offer.peer) {
            return Completion::Unsolicited;
        }

        if request.target.is_none() {
            if request
                .offered
                .get(&offer.peer)
                .map_or(false, |best| *best >= offer.height)
            {
                return Completion::Superseded;
            }
            request.offered.insert(offer.peer.clone(), offer.height);
            request.responses += 1;
            self.stats.offers_received += 1;
            self.state = SyncState::Synced;
            self.refresh_state();
            return Completion::Publish(offer);
        }

        self.stats.offers_received += 1;
        self.state = SyncState::Synced;

        let waiter = self
            .pending
            .remove(&offer.request_id)
            .and_then(|request| request.waiter);
        self.refresh_state();
        match waiter {
            Some(waiter) => match waiter.send(Ok(offer)) {
                Ok(()) => Completion::Delivered,
                Err(returned) => match returned {
                    Ok(offer) => Completion::Publish(offer),
                    Err(_) => Completion::Delivered,
                },
            },
            None => Completion::Publish(offer),
        }
    }

    /// Closes requests past their deadline. Returns the ids of those that
    /// timed out without a single response.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, request)| now >= request.deadline)
            .map(|(id, _)| id.clone())
            .collect();

        let mut timed_out = Vec::new();
        for id in expired {
            let Some(request) = self.pending.remove(&id) else {
                continue;
            };
            if request.responses > 0 {
                continue;
            }
            self.stats.timeouts += 1;
            if let Some(waiter) = request.waiter {
                let _ = waiter.send(Err(ChainError::NetworkError(format!(
                    "sync request {} timed out",
                    id
                ))));
            }
            self.state = SyncState::Failed;
            timed_out.push(id);
        }
        self.refresh_state();
        timed_out
    }

    /// Rejects direct requests aimed at a peer that has gone away.
    pub fn drop_peer(&mut self, node_id: &str) -> usize {
        let orphaned: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, request)| request.target.as_deref() == Some(node_id))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &orphaned {
            if let Some(request) = self.pending.remove(id) {
                self.stats.failures += 1;
                if let Some(waiter) = request.waiter {
                    let _ = waiter.send(Err(ChainError::NetworkError(format!(
                        "peer {} disconnected before answering sync request {}",
                        node_id, id
                    ))));
                }
            }
        }
        self.refresh_state();
        orphaned.len()
    }

    /// Rejects everything outstanding, used on shutdown.
    pub fn abort_all(&mut self) {
        for (id, request) in self.pending.drain() {
            if let Some(waiter) = request.waiter {
                let _ = waiter.send(Err(ChainError::NetworkError(format!(
                    "sync request {} aborted by shutdown",
                    id
                ))));
            }
        }
        self.state = SyncState::Idle;
    }

    fn refresh_state(&mut self) {
        if self.pending.values().any(|r| r.responses == 0) {
            self.state = SyncState::Syncing;
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }
}

impl Default for SyncTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn offer(peer: &str, request_id: &str) -> SyncOffer {
        SyncOffer {
            peer: peer.into(),
            request_id: request_id.into(),
            height: 3,
            from_height: 0,
            blocks: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_direct_request_delivered() {
        let mut tracker = SyncTracker::new();
        let (tx, rx) = oneshot::channel();
        tracker.begin("r1".into(), Some("peer-a".into()), Instant::now() + Duration::from_secs(5), Some(tx));
        assert_eq!(tracker.state(), SyncState::Syncing);

        // wrong peer cannot answer a direct request
        assert!(matches!(tracker.complete(offer("peer-b", "r1")), Completion::Unsolicited));
        assert!(matches!(tracker.complete(offer("peer-a", "r1")), Completion::Delivered));

        let received = rx.await.unwrap().unwrap();
        assert_eq!(received.height, 3);
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(tracker.state(), SyncState::Synced);
    }

    #[tokio::test]
    async fn test_timeout_rejects_waiter() {
        let mut tracker = SyncTracker::new();
        let (tx, rx) = oneshot::channel();
        let start = Instant::now();
        tracker.begin("r1".into(), Some("peer-a".into()), start + Duration::from_millis(10), Some(tx));

        assert!(tracker.expire(start).is_empty());
        assert_eq!(tracker.expire(start + Duration::from_millis(10)), vec!["r1".to_string()]);
        assert!(matches!(rx.await.unwrap(), Err(ChainError::NetworkError(_))));
        assert_eq!(tracker.state(), SyncState::Failed);
        assert_eq!(tracker.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_disconnect_rejects_waiter() {
        let mut tracker = SyncTracker::new();
        let (tx, rx) = oneshot::channel();
        tracker.begin("r1".into(), Some("peer-a".into()), Instant::now() + Duration::from_secs(5), Some(tx));

        assert_eq!(tracker.drop_peer("peer-b"), 0);
        assert_eq!(tracker.drop_peer("peer-a"), 1);
        assert!(rx.await.unwrap().is_err());
    }

    #[test]
    fn test_broadcast_keeps_tallest_offer_per_peer() {
        let mut tracker = SyncTracker::new();
        tracker.begin("b1".into(), None, Instant::now() + Duration::from_secs(5), None);

        assert!(matches!(tracker.complete(offer("peer-a", "b1")), Completion::Publish(_)));
        assert!(matches!(tracker.complete(offer("peer-a", "b1")), Completion::Superseded));

        let mut taller = offer("peer-a", "b1");
        taller.height = 4;
        assert!(matches!(tracker.complete(taller.clone()), Completion::Publish(_)));
        assert!(matches!(tracker.complete(taller), Completion::Superseded));
        assert_eq!(tracker.stats().offers_received, 2);
    }

    #[test]
    fn test_last_page() {
        let mut page = offer("peer-a", "r1");
        assert!(page.is_last_page());

        let genesis = Block::genesis(0, Vec::new());
        page.blocks = vec![genesis.clone(), genesis.clone()];
        assert!(!page.is_last_page());
        page.from_height = 2;
        assert!(page.is_last_page());
    }

    #[test]
    fn test_broadcast_collects_many_offers() {
        let mut tracker = SyncTracker::new();
        let start = Instant::now();
        tracker.begin("b1".into(), None, start + Duration::from_millis(10), None);
        assert_eq!(tracker.pending_broadcast(), Some("b1"));

        assert!(matches!(tracker.complete(offer("peer-a", "b1")), Completion::Publish(_)));
        assert!(matches!(tracker.complete(offer("peer-b", "b1")), Completion::Publish(_)));
        assert!(matches!(tracker.complete(offer("peer-a", "zz")), Completion::Unsolicited));

        // answered requests close quietly
        assert!(tracker.expire(start + Duration::from_millis(10)).is_empty());
        assert_eq!(tracker.state(), SyncState::Synced);
        assert_eq!(tracker.stats().offers_received, 2);
    }
}
