pub mod prometheus;

use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide counters and gauges, mirrored into the prometheus registry
/// on every update so `/metrics` and `/status` always agree.
pub struct Collector {
    upstream_connected: AtomicBool,
    clients_active: AtomicI64,
    shares_ok: AtomicU64,
    shares_bad: AtomicU64,
    last_notify_unix: AtomicI64,
    last_set_difficulty_bits: AtomicU64,
}

impl Collector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            upstream_connected: AtomicBool::new(false),
            clients_active: AtomicI64::new(0),
            shares_ok: AtomicU64::new(0),
            shares_bad: AtomicU64::new(0),
            last_notify_unix: AtomicI64::new(0),
            last_set_difficulty_bits: AtomicU64::new(0),
        })
    }

    pub fn set_upstream_connected(&self, connected: bool) {
        self.upstream_connected.store(connected, Ordering::Relaxed);
        prometheus::set_upstream_connected(connected);
    }

    pub fn upstream_connected(&self) -> bool {
        self.upstream_connected.load(Ordering::Relaxed)
    }

    pub fn inc_clients(&self) {
        self.clients_active.fetch_add(1, Ordering::SeqCst);
        prometheus::inc_connections();
    }

    pub fn dec_clients(&self) {
        self.clients_active.fetch_sub(1, Ordering::SeqCst);
        prometheus::dec_connections();
    }

    pub fn clients_active(&self) -> i64 {
        self.clients_active.load(Ordering::SeqCst)
    }

    pub fn inc_shares_ok(&self) {
        self.shares_ok.fetch_add(1, Ordering::Relaxed);
        prometheus::inc_accepted();
    }

    pub fn inc_shares_bad(&self) {
        self.shares_bad.fetch_add(1, Ordering::Relaxed);
        prometheus::inc_rejected();
    }

    pub fn shares_ok(&self) -> u64 {
        self.shares_ok.load(Ordering::Relaxed)
    }

    pub fn shares_bad(&self) -> u64 {
        self.shares_bad.load(Ordering::Relaxed)
    }

    pub fn set_last_notify_unix(&self, unix: i64) {
        self.last_notify_unix.store(unix, Ordering::Relaxed);
        prometheus::set_last_notify(unix);
    }

    pub fn last_notify_unix(&self) -> i64 {
        self.last_notify_unix.load(Ordering::Relaxed)
    }

    pub fn set_last_difficulty(&self, difficulty: f64) {
        self.last_set_difficulty_bits
            .store(difficulty.to_bits(), Ordering::Relaxed);
        prometheus::set_upstream_difficulty(difficulty);
    }

    pub fn last_difficulty(&self) -> f64 {
        f64::from_bits(self.last_set_difficulty_bits.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "upstream": self.upstream_connected(),
            "clients_active": self.clients_active(),
            "shares_ok": self.shares_ok(),
            "shares_bad": self.shares_bad(),
            "last_notify_unix": self.last_notify_unix(),
            "last_diff": self.last_difficulty(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let c = Collector::new();
        c.inc_shares_ok();
        c.inc_shares_ok();
        c.inc_shares_bad();
        assert_eq!(c.shares_ok(), 2);
        assert_eq!(c.shares_bad(), 1);

        c.inc_clients();
        c.inc_clients();
        c.dec_clients();
        assert_eq!(c.clients_active(), 1);
    }

    #[test]
    fn test_difficulty_round_trips_through_bits() {
        let c = Collector::new();
        c.set_last_difficulty(8192.5);
        assert_eq!(c.last_difficulty(), 8192.5);
    }

    #[test]
    fn test_snapshot_shape() {
        let c = Collector::new();
        c.set_upstream_connected(true);
        let snap = c.snapshot();
        assert_eq!(snap["upstream"], true);
        assert_eq!(snap["clients_active"], 0);
    }
}
