//! Message rate limiting and inbound connection throttling
//!
//! Both structures take the current `Instant` explicitly so the actor can
//! drive them from a single clock reading per event.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Fixed-window counter per key.
#[derive(Debug)]
pub struct RateLimiter<K> {
    limit: u32,
    window: Duration,
    counters: HashMap<K, (u32, Instant)>,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    pub fn new(limit: u32, window: Duration) -> Self {
        RateLimiter {
            limit,
            window,
            counters: HashMap::new(),
        }
    }

    /// Counts one message for `key`. Returns false once the window's budget is spent.
    pub fn check(&mut self, key: &K, now: Instant) -> bool {
        let entry = self.counters.entry(key.clone()).or_insert((0, now));

        if now.duration_since(entry.1) >= self.window {
            entry.0 = 0;
            entry.1 = now;
        }

        if entry.0 >= self.limit {
            return false;
        }
        entry.0 += 1;
        true
    }

    /// Drops counters whose window has closed.
    pub fn cleanup(&mut self, now: Instant) {
        let window = self.window;
        self.counters
            .retain(|_, (_, started)| now.duration_since(*started) < window);
    }

    pub fn forget<F>(&mut self, mut matches: F)
    where
        F: FnMut(&K) -> bool,
    {
        self.counters.retain(|key, _| !matches(key));
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// Rolling-window count of connection attempts per source address. A source
/// that exceeds the limit is blacklisted for one further window.
#[derive(Debug)]
pub struct ConnectionThrottle {
    limit: u32,
    window: Duration,
    attempts: HashMap<IpAddr, VecDeque<Instant>>,
    blacklist: HashMap<IpAddr, Instant>,
}

impl ConnectionThrottle {
    pub fn new(limit: u32, window: Duration) -> Self {
        ConnectionThrottle {
            limit,
            window,
            attempts: HashMap::new(),
            blacklist: HashMap::new(),
        }
    }

    /// Records an attempt from `source`; false when the attempt must be refused.
    pub fn register_attempt(&mut self, source: IpAddr, now: Instant) -> bool {
        if self.is_blacklisted(source, now) {
            return false;
        }

        let window = self.window;
        let attempts = self.attempts.entry(source).or_default();
        while attempts
            .front()
            .map_or(false, |t| now.duration_since(*t) >= window)
        {
            attempts.pop_front();
        }
        attempts.push_back(now);

        if attempts.len() as u32 > self.limit {
            self.attempts.remove(&source);
            self.blacklist.insert(source, now + window);
            return false;
        }
        true
    }

    pub fn is_blacklisted(&self, source: IpAddr, now: Instant) -> bool {
        self.blacklist.get(&source).map_or(false, |until| now < *until)
    }

    pub fn blacklisted_count(&self) -> usize {
        self.blacklist.len()
    }

    pub fn cleanup(&mut self, now: Instant) {
        let window = self.window;
        self.blacklist.retain(|_, until| now < *until);
        self.attempts.retain(|_, attempts| {
            attempts
                .back()
                .map_or(false, |t| now.duration_since(*t) < window)
        });
    }
}
