/// Message routing between miners and the upstream pool
///
/// Client requests are rewritten (worker identity, extranonce2 prefix) and
/// forwarded with a pending-table entry; upstream notifications are
/// broadcast to every miner; upstream responses are matched back to the
/// requester with its original id restored and the body untouched.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::metrics::Collector;
use crate::nonce::NonceManager;
use crate::stratum::connection::{ClientView, Connection};
use crate::stratum::protocol::{
    diff_from_bits, fmt_duration, Message, METHOD_AUTHORIZE, METHOD_NOTIFY,
    METHOD_SET_DIFFICULTY, METHOD_SUBMIT, METHOD_SUBSCRIBE,
};
use crate::upstream::{PendingRequest, Upstream};
use crate::vardiff::VarDiff;

pub struct Router {
    upstream_user: String,
    strict_broadcast: bool,
    upstream: Arc<Upstream>,
    nonce: Arc<NonceManager>,
    vardiff: Arc<VarDiff>,
    metrics: Arc<Collector>,
    clients: RwLock<HashMap<u64, Arc<Connection>>>,
}

impl Router {
    pub fn new(
        upstream_user: String,
        strict_broadcast: bool,
        upstream: Arc<Upstream>,
        nonce: Arc<NonceManager>,
        vardiff: Arc<VarDiff>,
        metrics: Arc<Collector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            upstream_user,
            strict_broadcast,
            upstream,
            nonce,
            vardiff,
            metrics,
            clients: RwLock::new(HashMap::new()),
        })
    }

    pub async fn add_client(&self, conn: Arc<Connection>) {
        self.clients.write().await.insert(conn.id, conn);
    }

    pub async fn remove_client(&self, client_id: u64) {
        self.clients.write().await.remove(&client_id);
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn client_views(&self) -> Vec<ClientView> {
        self.clients.read().await.values().map(|c| c.view()).collect()
    }

    /// Dispatch one frame read from a miner.
    pub async fn process_client_message(&self, conn: &Arc<Connection>, msg: Message) {
        match msg.method.as_str() {
            METHOD_SUBSCRIBE => self.nonce.respond_subscribe(conn, msg.id),
            METHOD_AUTHORIZE => {
                if let Some(worker) = msg
                    .params
                    .as_ref()
                    .and_then(|p| p.get(0))
                    .and_then(|v| v.as_str())
                {
                    conn.set_worker(worker);
                }
                self.forward(conn, &msg.method, msg.params.unwrap_or(Value::Null), msg.id)
                    .await;
            }
            METHOD_SUBMIT => {
                let mut params = msg.params.unwrap_or(Value::Null);
                self.rewrite_submit(conn, &mut params);
                self.forward(conn, METHOD_SUBMIT, params, msg.id).await;
            }
            m if m.starts_with("mining.") => {
                self.forward(conn, &msg.method, msg.params.unwrap_or(Value::Null), msg.id)
                    .await;
            }
            other => {
                debug!("ignoring non-mining method '{}' from {}", other, conn.peer_addr);
            }
        }
    }

    /// Forward a client request upstream, registering the correlation
    /// entry. Failures answer the miner with a Stratum error carrying its
    /// own id.
    async fn forward(
        &self,
        conn: &Arc<Connection>,
        method: &str,
        params: Value,
        id: Option<i64>,
    ) -> bool {
        if !self.upstream.is_connected() {
            conn.send_message(&Message::err_response(id, -1, "Upstream down"));
            return false;
        }
        let pending = PendingRequest {
            client_id: conn.id,
            orig_id: id,
            method: method.to_string(),
            sent: Instant::now(),
        };
        match self.upstream.forward(method, params, pending).await {
            Ok(_) => true,
            Err(e) => {
                debug!("forward {} for {} failed: {}", method, conn.peer_addr, e);
                conn.send_message(&Message::err_response(id, -1, "Forward error"));
                false
            }
        }
    }

    /// Strip the miner's identity and re-seat its extranonce2 inside the
    /// slice this client was assigned.
    fn rewrite_submit(&self, conn: &Arc<Connection>, params: &mut Value) {
        let Some(arr) = params.as_array_mut() else {
            return;
        };
        if arr.is_empty() {
            return;
        }
        let upstream_user = {
            let u = conn.upstream_user();
            if u.is_empty() {
                self.upstream_user.clone()
            } else {
                u
            }
        };
        arr[0] = Value::String(upstream_user);

        if arr.len() > 2 {
            if let Some(prefix) = conn.extranonce_prefix() {
                if prefix.trim > 0 {
                    if let Some(s) = arr[2].as_str() {
                        let (_, e2_size) = self.upstream.extranonce();
                        arr[2] = Value::String(rewrite_extranonce2(s, &prefix.prefix, e2_size));
                    }
                }
            }
        }
    }

    /// Dispatch one raw line read from the upstream socket.
    pub async fn process_upstream_line(&self, line: &str) {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            // unparseable lines are tolerated, pools emit banners and such
            return;
        };

        let method = value.get("method").and_then(|m| m.as_str()).unwrap_or("");
        if !method.is_empty() {
            self.process_notification(method, &value, line).await;
            return;
        }

        let Some(id) = value.get("id").and_then(|i| i.as_i64()) else {
            return;
        };
        let has_body = value.get("result").map(|r| !r.is_null()).unwrap_or(false)
            || value.get("error").map(|e| !e.is_null()).unwrap_or(false);
        if !has_body {
            return;
        }

        match self.upstream.take_pending(id) {
            Some(pending) => self.relay_response(pending, value).await,
            None => {
                if id == self.upstream.subscribe_id() {
                    if let Some(result) = value.get("result") {
                        self.nonce.process_subscribe_result(result);
                    }
                } else {
                    debug!("upstream response id={} has no pending entry, dropped", id);
                }
            }
        }
    }

    async fn process_notification(&self, method: &str, value: &Value, line: &str) {
        match method {
            METHOD_NOTIFY => {
                self.metrics.set_last_notify_unix(chrono::Utc::now().timestamp());
                if let Some(params) = value.get("params").and_then(|p| p.as_array()) {
                    let job = params.first().and_then(|v| v.as_str()).unwrap_or("");
                    let nbits = params.get(6).and_then(|v| v.as_str()).unwrap_or("");
                    let clean = params.get(8).map(clean_jobs_flag).unwrap_or(false);
                    if clean {
                        info!("new job job={} diff={:.6}", job, diff_from_bits(nbits));
                    }
                }
                self.broadcast(line).await;
            }
            METHOD_SET_DIFFICULTY => {
                if let Some(d) = value
                    .get("params")
                    .and_then(|p| p.get(0))
                    .and_then(|v| v.as_f64())
                {
                    self.metrics.set_last_difficulty(d);
                }
                self.broadcast(line).await;
            }
            m if m.starts_with("mining.") => {
                if self.strict_broadcast {
                    debug!("strict_broadcast: dropping upstream notification '{}'", m);
                } else {
                    self.broadcast(line).await;
                }
            }
            other => {
                debug!("dropping non-mining upstream notification '{}'", other);
            }
        }
    }

    /// Relay a correlated response with the miner's original id restored
    /// and the rest of the body byte-for-byte as the pool produced it.
    async fn relay_response(&self, pending: PendingRequest, mut value: Value) {
        let accepted = value.get("result") == Some(&Value::Bool(true));

        if let Some(obj) = value.as_object_mut() {
            match pending.orig_id {
                Some(id) => {
                    obj.insert("id".to_string(), json!(id));
                }
                None => {
                    obj.remove("id");
                }
            }
        }

        let conn = {
            let clients = self.clients.read().await;
            clients.get(&pending.client_id).cloned()
        };
        let Some(conn) = conn else {
            debug!("response for disconnected client {}, dropped", pending.client_id);
            return;
        };

        if !conn.send_line(value.to_string()) {
            warn!("response write to {} failed", conn.peer_addr);
        }

        match pending.method.as_str() {
            METHOD_SUBMIT => self.account_share(&conn, &pending, accepted),
            METHOD_AUTHORIZE => {
                if accepted {
                    conn.set_handshake_done(true);
                }
            }
            _ => {}
        }
    }

    fn account_share(&self, conn: &Arc<Connection>, pending: &PendingRequest, accepted: bool) {
        let (ok, bad) = conn.record_share(accepted);
        if accepted {
            self.metrics.inc_shares_ok();
        } else {
            self.metrics.inc_shares_bad();
        }
        self.vardiff.record_share(conn.id, accepted);

        let latency = pending.sent.elapsed();
        let mut since_prev = Duration::ZERO;
        if accepted {
            let now_ms = chrono::Utc::now().timestamp_millis();
            let prev = conn.swap_last_accept(now_ms);
            if prev > 0 {
                since_prev = Duration::from_millis((now_ms - prev).max(0) as u64);
            }
        }

        let status = if accepted { "Accepted" } else { "Rejected" };
        info!(
            "share {} worker={} share={} ok={} bad={} since_prev={} latency={}",
            status,
            conn.worker_or_addr(),
            ok + bad,
            ok,
            bad,
            fmt_duration(since_prev),
            fmt_duration(latency),
        );
    }

    /// Deliver one raw line to every connected miner. Each client has its
    /// own writer queue, so one slow peer cannot hold the rest back.
    pub async fn broadcast(&self, line: &str) {
        let clients = self.clients.read().await;
        for conn in clients.values() {
            conn.send_line(line.to_string());
        }
    }
}

fn clean_jobs_flag(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// The three-case extranonce2 re-seating rule. `prefix` is uppercase hex
/// of the trimmed bytes; `extranonce2_size` is the pool's full width.
pub(crate) fn rewrite_extranonce2(s: &str, prefix: &str, extranonce2_size: usize) -> String {
    let s = s.to_uppercase();
    let full = 2 * extranonce2_size;
    let reduced = full.saturating_sub(prefix.len());

    if s.len() == reduced {
        // miner honoured the advertised (smaller) width: prepend
        return format!("{prefix}{s}");
    }
    if s.len() == full {
        // miner still speaks the pool's width: overwrite the head
        if !s.starts_with(prefix) {
            return format!("{}{}", prefix, &s[prefix.len()..]);
        }
        return s;
    }
    // unexpected width: make sure the prefix is there and pass it on
    if !s.starts_with(prefix) {
        return format!("{prefix}{s}");
    }
    s
}
