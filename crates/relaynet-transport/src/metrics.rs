//! Transport counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
/// Snapshot of transport counters at a point in time.
pub struct MetricsSnapshot {
    /// Requests handed to the network.
    pub messages_sent: u64,
    /// Requests delivered to a service.
    pub messages_received: u64,
    /// Replies sent by services.
    pub replies_sent: u64,
    /// Replies received by clients.
    pub replies_received: u64,
    /// Exchanges that timed out.
    pub timeouts: u64,
    /// Exchanges that failed on the network.
    pub network_errors: u64,
    /// Bulk transfers issued.
    pub bulk_started: u64,
    /// Bulk transfers that completed successfully.
    pub bulk_completed: u64,
    /// Gateway pings issued.
    pub pings_sent: u64,
    /// Routes added.
    pub routes_added: u64,
    /// Routes deleted.
    pub routes_deleted: u64,
    /// Liveness changes delivered to drivers.
    pub notifications_delivered: u64,
}

/// Thread-safe transport counters.
#[derive(Default)]
pub struct TransportMetrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    replies_sent: AtomicU64,
    replies_received: AtomicU64,
    timeouts: AtomicU64,
    network_errors: AtomicU64,
    bulk_started: AtomicU64,
    bulk_completed: AtomicU64,
    pings_sent: AtomicU64,
    routes_added: AtomicU64,
    routes_deleted: AtomicU64,
    notifications_delivered: AtomicU64,
}

impl std::fmt::Debug for TransportMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl TransportMetrics {
    /// All counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the messages sent counter.
    pub fn inc_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the messages received counter.
    pub fn inc_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the replies sent counter.
    pub fn inc_replies_sent(&self) {
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the replies received counter.
    pub fn inc_replies_received(&self) {
        self.replies_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the timeouts counter.
    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the network errors counter.
    pub fn inc_network_errors(&self) {
        self.network_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the bulk started counter.
    pub fn inc_bulk_started(&self) {
        self.bulk_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the bulk completed counter.
    pub fn inc_bulk_completed(&self) {
        self.bulk_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the pings sent counter.
    pub fn inc_pings_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the routes added counter.
    pub fn inc_routes_added(&self) {
        self.routes_added.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds to the routes deleted counter.
    pub fn add_routes_deleted(&self, n: u64) {
        self.routes_deleted.fetch_add(n, Ordering::Relaxed);
    }

    /// Increments the notifications delivered counter.
    pub fn inc_notifications_delivered(&self) {
        self.notifications_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            replies_received: self.replies_received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            network_errors: self.network_errors.load(Ordering::Relaxed),
            bulk_started: self.bulk_started.load(Ordering::Relaxed),
            bulk_completed: self.bulk_completed.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            routes_added: self.routes_added.load(Ordering::Relaxed),
            routes_deleted: self.routes_deleted.load(Ordering::Relaxed),
            notifications_delivered: self.notifications_delivered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_zeroed() {
        assert_eq!(TransportMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_counters() {
        let m = TransportMetrics::new();
        m.inc_messages_sent();
        m.inc_messages_sent();
        m.inc_timeouts();
        m.add_routes_deleted(3);
        let snap = m.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.routes_deleted, 3);
        assert_eq!(snap.replies_sent, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let m = TransportMetrics::new();
        m.inc_pings_sent();
        let json = serde_json::to_string(&m.snapshot()).unwrap();
        assert!(json.contains("\"pings_sent\":1"));
    }
}
