//! Connection Statistics
//!
//! Counters updated by the active role handler and its links. A fresh
//! tracker is created for every role start.

use crate::replication::registry::PeerRegistry;
use crate::replication::types::ConnectionStats;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// How long an error stays in `recent_errors`.
pub const ERROR_WINDOW: Duration = Duration::from_secs(300);

/// Upper bound on retained recent errors.
pub const MAX_RECENT_ERRORS: usize = 100;

#[derive(Debug)]
pub struct StatsTracker {
    started: Instant,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    reconnect_attempts: AtomicU64,
    /// 0 until the first sync
    last_sync_ms: AtomicU64,
    recent_errors: Mutex<VecDeque<(u64, String)>>,
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            last_sync_ms: AtomicU64::new(0),
            recent_errors: Mutex::new(VecDeque::new()),
        }
    }
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync(&self, now_ms: u64) {
        self.last_sync_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn record_error(&self, now_ms: u64, message: impl Into<String>) {
        let mut errors = self.recent_errors.lock();
        errors.push_back((now_ms, message.into()));
        while errors.len() > MAX_RECENT_ERRORS {
            errors.pop_front();
        }
    }

    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Snapshot the counters together with the registry's peer counts.
    pub fn snapshot(&self, registry: &PeerRegistry, now_ms: u64) -> ConnectionStats {
        let window_ms = ERROR_WINDOW.as_millis() as u64;
        let recent_errors = {
            let mut errors = self.recent_errors.lock();
            while errors
                .front()
                .is_some_and(|(at, _)| now_ms.saturating_sub(*at) > window_ms)
            {
                errors.pop_front();
            }
            errors.iter().map(|(_, m)| m.clone()).collect()
        };

        let (total_peers, online_peers) = registry.counts();
        let last_sync = self.last_sync_ms.load(Ordering::Relaxed);

        ConnectionStats {
            total_peers,
            online_peers,
            offline_peers: total_peers.saturating_sub(online_peers),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts(),
            uptime_secs: self.started.elapsed().as_secs(),
            last_sync_ms: (last_sync != 0).then_some(last_sync),
            recent_errors,
        }
    }
}
