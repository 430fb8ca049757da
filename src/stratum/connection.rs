/// Connection state for a downstream miner
///
/// Tracks per-miner identity, handshake progress, the assigned extranonce
/// prefix, share counters, and the outbound writer channel. The socket read
/// half lives in the connection's task; every frame destined for the miner
/// goes through the bounded `outbound` channel so a slow peer can only
/// delay itself.

use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::warn;

use super::protocol::Message;

/// Frames buffered per client before the writer falls behind and frames
/// start being shed. The next clean-jobs notify refreshes anything lost.
pub const OUTBOUND_BUFFER: usize = 128;

/// Extranonce prefix assigned to a client for the lifetime of its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoncePrefix {
    /// Uppercase hex, two characters per trimmed byte.
    pub prefix: String,
    /// Bytes removed from the upstream extranonce2_size.
    pub trim: usize,
}

pub struct Connection {
    pub id: u64,
    pub peer_addr: SocketAddr,
    worker: Mutex<String>,
    upstream_user: Mutex<String>,
    handshake_done: AtomicBool,
    last_activity_ms: AtomicI64,
    last_accept_ms: AtomicI64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    difficulty_bits: AtomicU64,
    extranonce: Mutex<Option<NoncePrefix>>,
    outbound: mpsc::Sender<String>,
    connected_at: Instant,
}

/// Row in the `/status` client listing.
#[derive(Debug, Serialize)]
pub struct ClientView {
    pub ip: String,
    pub worker: String,
    pub upstream_user: String,
    pub ok: u64,
    pub bad: u64,
}

impl Connection {
    pub fn new(
        id: u64,
        peer_addr: SocketAddr,
        upstream_user: String,
        outbound: mpsc::Sender<String>,
    ) -> Self {
        Self {
            id,
            peer_addr,
            worker: Mutex::new(String::new()),
            upstream_user: Mutex::new(upstream_user),
            handshake_done: AtomicBool::new(false),
            last_activity_ms: AtomicI64::new(now_ms()),
            last_accept_ms: AtomicI64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            difficulty_bits: AtomicU64::new(0),
            extranonce: Mutex::new(None),
            outbound,
            connected_at: Instant::now(),
        }
    }

    /// Queue a wire line for the writer task. Non-blocking: a full queue
    /// sheds the frame with a warning instead of stalling the caller.
    pub fn send_line(&self, line: String) -> bool {
        match self.outbound.try_send(line) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("client {} outbound queue full, dropping frame", self.peer_addr);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn send_message(&self, msg: &Message) -> bool {
        match msg.to_line() {
            Ok(line) => self.send_line(line),
            Err(e) => {
                warn!("client {} serialize error: {}", self.peer_addr, e);
                false
            }
        }
    }

    pub fn worker(&self) -> String {
        self.worker.lock().unwrap().clone()
    }

    pub fn set_worker(&self, worker: &str) {
        *self.worker.lock().unwrap() = worker.to_string();
    }

    /// Worker name for log lines, falling back to the peer address before
    /// the miner has authorized.
    pub fn worker_or_addr(&self) -> String {
        let w = self.worker();
        if w.is_empty() {
            self.peer_addr.to_string()
        } else {
            w
        }
    }

    pub fn upstream_user(&self) -> String {
        self.upstream_user.lock().unwrap().clone()
    }

    pub fn handshake_done(&self) -> bool {
        self.handshake_done.load(Ordering::Relaxed)
    }

    pub fn set_handshake_done(&self, done: bool) {
        self.handshake_done.store(done, Ordering::Relaxed);
    }

    pub fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_activity_unix_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    /// Record a share outcome; returns the cumulative (accepted, rejected).
    pub fn record_share(&self, accepted: bool) -> (u64, u64) {
        if accepted {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        (self.accepted(), self.rejected())
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Swap in a new accept timestamp, returning the previous one (0 when
    /// this is the first accepted share).
    pub fn swap_last_accept(&self, now_ms: i64) -> i64 {
        self.last_accept_ms.swap(now_ms, Ordering::Relaxed)
    }

    pub fn difficulty(&self) -> f64 {
        f64::from_bits(self.difficulty_bits.load(Ordering::Relaxed))
    }

    pub fn set_difficulty(&self, difficulty: f64) {
        self.difficulty_bits.store(difficulty.to_bits(), Ordering::Relaxed);
    }

    pub fn extranonce_prefix(&self) -> Option<NoncePrefix> {
        self.extranonce.lock().unwrap().clone()
    }

    /// Assign the prefix once; later calls are no-ops (the prefix is
    /// immutable for the session).
    pub fn assign_prefix(&self, prefix: String, trim: usize) -> bool {
        let mut guard = self.extranonce.lock().unwrap();
        if guard.is_some() {
            return false;
        }
        *guard = Some(NoncePrefix { prefix, trim });
        true
    }

    /// Drop the prefix when the upstream extranonce2 space no longer has
    /// room for it (upstream renegotiated a smaller size).
    pub fn clear_prefix(&self) {
        *self.extranonce.lock().unwrap() = None;
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    pub fn view(&self) -> ClientView {
        ClientView {
            ip: self.peer_addr.to_string(),
            worker: self.worker(),
            upstream_user: self.upstream_user(),
            ok: self.accepted(),
            bad: self.rejected(),
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Build a subscribe response carrying the effective extranonce pair.
/// The empty subscriptions array is deliberate: the proxy fabricates no
/// per-client subscription ids.
pub fn subscribe_response(id: Option<i64>, extranonce1: &str, extranonce2_size: usize) -> String {
    json!({
        "id": id,
        "result": [[], extranonce1, extranonce2_size],
        "error": null,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_conn() -> (Connection, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(4);
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 12345);
        (Connection::new(1, addr, "wallet.proxy".to_string(), tx), rx)
    }

    #[test]
    fn test_share_tracking() {
        let (conn, _rx) = test_conn();
        conn.record_share(true);
        conn.record_share(true);
        let (ok, bad) = conn.record_share(false);
        assert_eq!((ok, bad), (2, 1));
    }

    #[test]
    fn test_prefix_assigned_once() {
        let (conn, _rx) = test_conn();
        assert!(conn.assign_prefix("00".to_string(), 1));
        assert!(!conn.assign_prefix("01".to_string(), 1));
        assert_eq!(
            conn.extranonce_prefix(),
            Some(NoncePrefix { prefix: "00".to_string(), trim: 1 })
        );
    }

    #[test]
    fn test_send_line_sheds_on_full_queue() {
        let (conn, _rx) = test_conn();
        for _ in 0..4 {
            assert!(conn.send_line("{}".to_string()));
        }
        assert!(!conn.send_line("{}".to_string()));
    }

    #[test]
    fn test_subscribe_response_shape() {
        let line = subscribe_response(Some(10), "DEADBEEF00", 3);
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["id"], 10);
        assert_eq!(v["result"][0], json!([]));
        assert_eq!(v["result"][1], "DEADBEEF00");
        assert_eq!(v["result"][2], 3);
        assert!(v["error"].is_null());
    }

    #[test]
    fn test_worker_fallback() {
        let (conn, _rx) = test_conn();
        assert_eq!(conn.worker_or_addr(), "127.0.0.1:12345");
        conn.set_worker("rig1");
        assert_eq!(conn.worker_or_addr(), "rig1");
    }
}
