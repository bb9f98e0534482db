//! Local in-process event bus backed by a tokio broadcast channel.
//!
//! Carries agent status transitions and upgrade progress so the control
//! surface and tests can observe the supervisor without polling it.

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

pub mod topics {
    //! Canonical topic constants. Keep dot.case names.

    pub const TOPIC_SERVICE_START: &str = "service.start";
    pub const TOPIC_SERVICE_STOP: &str = "service.stop";
    pub const TOPIC_SERVICE_STATUS: &str = "service.status";

    pub const TOPIC_CHECKIN_OK: &str = "fleet.checkin.ok";
    pub const TOPIC_CHECKIN_DEGRADED: &str = "fleet.checkin.degraded";
    pub const TOPIC_ACTION_DISPATCHED: &str = "fleet.action.dispatched";
    pub const TOPIC_ACTION_FAILED: &str = "fleet.action.failed";
    pub const TOPIC_ACK_RETRY: &str = "fleet.ack.retry";

    pub const TOPIC_POLICY_APPLIED: &str = "policy.applied";
    pub const TOPIC_UNENROLLED: &str = "fleet.unenrolled";

    pub const TOPIC_UPGRADE_STARTED: &str = "upgrade.started";
    pub const TOPIC_UPGRADE_DOWNLOADED: &str = "upgrade.artifact.downloaded";
    pub const TOPIC_UPGRADE_ROLLBACK: &str = "upgrade.rollback";
    pub const TOPIC_UPGRADE_COMPLETED: &str = "upgrade.completed";
}

/// Minimal event envelope (RFC3339 time).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    no_receivers: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub no_receivers: u64,
    pub receivers: usize,
}

#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
    counters: Arc<Counters>,
    replay: Arc<Mutex<VecDeque<Envelope>>>,
    replay_cap: usize,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        Self::new_with_replay(capacity, 64)
    }

    pub fn new_with_replay(capacity: usize, replay_cap: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            counters: Arc::new(Counters::default()),
            replay: Arc::new(Mutex::new(VecDeque::with_capacity(replay_cap))),
            replay_cap,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let val = serde_json::to_value(payload)
            .unwrap_or_else(|_| serde_json::json!({ "_ser": "error" }));
        let env = Envelope {
            time: chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            kind: kind.to_string(),
            payload: val,
        };
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        match self.tx.send(env.clone()) {
            Ok(n) => {
                self.counters.delivered.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(_) => {
                self.counters.no_receivers.fetch_add(1, Ordering::Relaxed);
            }
        }
        let mut rb = self.replay.lock().unwrap();
        if rb.len() == self.replay_cap {
            rb.pop_front();
        }
        rb.push_back(env);
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            no_receivers: self.counters.no_receivers.load(Ordering::Relaxed),
            receivers: self.tx.receiver_count(),
        }
    }

    /// Up to `n` recent envelopes, oldest first. Useful for late
    /// subscribers that need the tail of what they missed.
    pub fn replay(&self, n: usize) -> Vec<Envelope> {
        let rb = self.replay.lock().unwrap();
        let len = rb.len();
        let take = n.min(len);
        rb.iter().skip(len.saturating_sub(take)).cloned().collect()
    }
}
