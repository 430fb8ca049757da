/// Extranonce partitioning and subscribe deferral
///
/// Every miner gets a unique one-byte prefix appended to the pool's
/// extranonce1 and trimmed off the advertised extranonce2_size, so
/// concurrent miners roll disjoint regions of the nonce space and cannot
/// duplicate each other's shares. Miners that subscribe before the pool
/// has published its extranonce are parked here and answered the moment
/// the upstream handshake completes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::stratum::connection::{subscribe_response, Connection};
use crate::stratum::protocol::parse_extranonce_result;
use crate::upstream::Upstream;

/// Bytes of extranonce2 claimed per client. One byte gives 256 concurrent
/// prefixes; the counter wraps, which only matters past 256 simultaneous
/// miners.
pub const PREFIX_BYTES: usize = 1;

struct PendingSubscribe {
    conn: Arc<Connection>,
    id: Option<i64>,
}

pub struct NonceManager {
    upstream: Arc<Upstream>,
    ready: AtomicBool,
    pending_subs: Mutex<HashMap<u64, PendingSubscribe>>,
    /// Monotonic for the process lifetime; never rewound on upstream
    /// resets, otherwise a reconnect could hand a live miner's prefix to a
    /// newcomer.
    prefix_counter: AtomicU64,
}

impl NonceManager {
    pub fn new(upstream: Arc<Upstream>) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            ready: AtomicBool::new(false),
            pending_subs: Mutex::new(HashMap::new()),
            prefix_counter: AtomicU64::new(0),
        })
    }

    /// Ready means the handshake produced a usable extranonce pair.
    pub fn upstream_ready(&self) -> bool {
        if !self.ready.load(Ordering::SeqCst) {
            return false;
        }
        let (e1, e2_size) = self.upstream.extranonce();
        !e1.is_empty() && e2_size > 0
    }

    /// Entry point for a client `mining.subscribe`: answer now if the
    /// upstream is ready, otherwise park it. Readiness is re-checked under
    /// the queue lock so a flush racing this call cannot strand the miner.
    pub fn respond_subscribe(&self, conn: &Arc<Connection>, id: Option<i64>) {
        if self.upstream_ready() {
            self.respond_now(conn, id);
            return;
        }

        let mut pending = self.pending_subs.lock().unwrap();
        if self.upstream_ready() {
            drop(pending);
            self.respond_now(conn, id);
            return;
        }
        // one parked subscribe per client; a late resubscribe replaces the id
        pending.insert(conn.id, PendingSubscribe { conn: conn.clone(), id });
    }

    pub fn remove_client(&self, client_id: u64) {
        self.pending_subs.lock().unwrap().remove(&client_id);
    }

    /// Drain the queue atomically and answer every parked subscribe with
    /// the extranonce pair valid right now.
    pub fn flush(&self) {
        let drained: Vec<PendingSubscribe> = {
            let mut pending = self.pending_subs.lock().unwrap();
            pending.drain().map(|(_, v)| v).collect()
        };
        if drained.is_empty() {
            return;
        }
        debug!("releasing {} parked subscribe(s)", drained.len());
        for entry in drained {
            self.respond_now(&entry.conn, entry.id);
        }
    }

    fn respond_now(&self, conn: &Arc<Connection>, id: Option<i64>) {
        self.assign_prefix(conn);
        let (e1, e2_size) = self.client_extranonce(conn);
        if !conn.send_line(subscribe_response(id, &e1, e2_size)) {
            warn!("subscribe response to {} not delivered", conn.peer_addr);
        }
    }

    /// Allocate the client's prefix if it does not have one yet. Skipped
    /// when the upstream extranonce2 is too small to slice.
    pub fn assign_prefix(&self, conn: &Arc<Connection>) {
        if conn.extranonce_prefix().is_some() {
            return;
        }
        let (_, e2_size) = self.upstream.extranonce();
        if e2_size <= PREFIX_BYTES {
            return;
        }
        let mask = (1u64 << (8 * PREFIX_BYTES)) - 1;
        let val = self.prefix_counter.fetch_add(1, Ordering::SeqCst) & mask;
        let prefix = format!("{:0width$X}", val, width = 2 * PREFIX_BYTES);
        conn.assign_prefix(prefix, PREFIX_BYTES);
    }

    /// The (extranonce1, extranonce2_size) pair this client should see:
    /// upstream extranonce1 with the prefix appended, size reduced by the
    /// trim. Falls back to the unsliced upstream pair when the prefix no
    /// longer fits the negotiated size.
    pub fn client_extranonce(&self, conn: &Arc<Connection>) -> (String, usize) {
        let (e1, e2_size) = self.upstream.extranonce();
        match conn.extranonce_prefix() {
            Some(p) if e2_size > p.trim => (format!("{}{}", e1, p.prefix), e2_size - p.trim),
            Some(_) => {
                // upstream renegotiated a smaller extranonce2; the slice no
                // longer fits, so this client reverts to the shared space
                conn.clear_prefix();
                (e1, e2_size)
            }
            None => (e1, e2_size),
        }
    }

    /// Consume the upstream subscribe result. A valid pair flips readiness
    /// and releases the parked subscribes; anything else leaves readiness
    /// alone.
    pub fn process_subscribe_result(&self, result: &serde_json::Value) {
        match parse_extranonce_result(result) {
            Some((e1, e2_size)) => {
                self.upstream.set_extranonce(&e1, e2_size);
                info!("upstream extranonce: ex1={} ex2_size={}", e1, e2_size);
                self.set_ready(true);
            }
            None => {
                if !self.ready.load(Ordering::SeqCst) {
                    warn!("malformed subscribe result from upstream: {}", result);
                }
            }
        }
    }

    pub fn set_ready(&self, ready: bool) {
        if ready {
            self.ready.store(true, Ordering::SeqCst);
            self.flush();
        } else {
            self.ready.store(false, Ordering::SeqCst);
        }
    }

    /// Upstream session went away: gate new subscribes again. Parked
    /// entries stay parked; they are answered after the next handshake,
    /// and the prefix counter keeps counting.
    pub fn reset(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.pending_subs.lock().unwrap().len()
    }
}
