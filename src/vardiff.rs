/// Variable difficulty controller
///
/// Tracks accepted-share cadence per miner and retargets its difficulty so
/// shares arrive roughly every `target_share_time`. Retargets are emitted
/// as `mining.set_difficulty` frames onto the miner's writer channel by a
/// periodic task; the router feeds share outcomes in.

use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::VarDiffSection;
use crate::stratum::connection::Connection;
use crate::stratum::protocol::Message;

#[derive(Debug, Clone, Copy)]
pub struct VarDiffConfig {
    pub enabled: bool,
    /// Desired average time between accepted shares.
    pub target_share_time: Duration,
    /// How often to retarget.
    pub retarget_time: Duration,
    /// Ignore small fluctuations; only retarget if deviation exceeds this fraction.
    pub variance: f64,
    pub min_difficulty: u64,
    pub max_difficulty: u64,
}

impl From<&VarDiffSection> for VarDiffConfig {
    fn from(s: &VarDiffSection) -> Self {
        Self {
            enabled: s.enabled,
            target_share_time: Duration::from_secs(s.target_seconds),
            retarget_time: Duration::from_millis(s.adjust_every_ms),
            variance: s.variance,
            min_difficulty: s.min_diff.max(1),
            max_difficulty: s.max_diff.max(s.min_diff.max(1)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VarDiffState {
    last_retarget: Instant,
    accepted_since: u64,
}

impl VarDiffState {
    pub fn new() -> Self {
        Self {
            last_retarget: Instant::now(),
            accepted_since: 0,
        }
    }

    pub fn on_share(&mut self, accepted: bool) {
        if accepted {
            self.accepted_since = self.accepted_since.saturating_add(1);
        }
    }

    /// Returns `Some(new_difficulty)` when a retarget is due and the
    /// difficulty actually changes.
    pub fn retarget(&mut self, now: Instant, cfg: &VarDiffConfig, current_difficulty: u64) -> Option<u64> {
        let elapsed = now.saturating_duration_since(self.last_retarget);
        if elapsed < cfg.retarget_time {
            return None;
        }

        // No accepted shares in the window: reset and keep the current
        // difficulty rather than chasing a silent miner downward forever.
        if self.accepted_since == 0 {
            self.last_retarget = now;
            return None;
        }

        let elapsed_secs = elapsed.as_secs_f64().max(0.000_001);
        let avg_share_time = elapsed_secs / (self.accepted_since as f64);
        let target = cfg.target_share_time.as_secs_f64().max(0.000_001);

        let ratio = target / avg_share_time;
        self.last_retarget = now;
        self.accepted_since = 0;

        if ratio >= 1.0 - cfg.variance && ratio <= 1.0 + cfg.variance {
            return None;
        }

        let cur = current_difficulty.max(1) as f64;
        let mut next = (cur * ratio).round();
        if !next.is_finite() || next <= 0.0 {
            next = 1.0;
        }
        let next = (next as u64).clamp(cfg.min_difficulty, cfg.max_difficulty).max(1);

        if next == current_difficulty {
            None
        } else {
            Some(next)
        }
    }
}

struct ClientSlot {
    conn: Arc<Connection>,
    state: VarDiffState,
}

pub struct VarDiff {
    cfg: VarDiffConfig,
    clients: Mutex<HashMap<u64, ClientSlot>>,
}

impl VarDiff {
    pub fn new(section: &VarDiffSection) -> Arc<Self> {
        Arc::new(Self {
            cfg: VarDiffConfig::from(section),
            clients: Mutex::new(HashMap::new()),
        })
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// Start tracking a miner and push the floor difficulty at it so it
    /// begins with a known target.
    pub fn add_client(&self, conn: Arc<Connection>) {
        if !self.cfg.enabled {
            return;
        }
        let initial = self.cfg.min_difficulty as f64;
        conn.set_difficulty(initial);
        conn.send_message(&Message::set_difficulty(initial));
        self.clients.lock().unwrap().insert(
            conn.id,
            ClientSlot {
                conn,
                state: VarDiffState::new(),
            },
        );
    }

    pub fn remove_client(&self, client_id: u64) {
        self.clients.lock().unwrap().remove(&client_id);
    }

    pub fn record_share(&self, client_id: u64, accepted: bool) {
        if !self.cfg.enabled {
            return;
        }
        if let Some(slot) = self.clients.lock().unwrap().get_mut(&client_id) {
            slot.state.on_share(accepted);
        }
    }

    pub fn adjust_all(&self) {
        let now = Instant::now();
        let mut clients = self.clients.lock().unwrap();
        for slot in clients.values_mut() {
            let current = slot.conn.difficulty().max(1.0) as u64;
            if let Some(next) = slot.state.retarget(now, &self.cfg, current) {
                debug!(
                    "vardiff retarget worker={} {} -> {}",
                    slot.conn.worker_or_addr(),
                    current,
                    next
                );
                slot.conn.set_difficulty(next as f64);
                slot.conn.send_message(&Message::set_difficulty(next as f64));
            }
        }
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        if !self.cfg.enabled {
            return;
        }
        let mut tick = tokio::time::interval(self.cfg.retarget_time);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tick.tick() => self.adjust_all(),
            }
        }
    }

    pub fn stats_json(&self) -> serde_json::Value {
        let clients = self.clients.lock().unwrap();
        let mut avg_difficulty = 0.0;
        for slot in clients.values() {
            avg_difficulty += slot.conn.difficulty();
        }
        if !clients.is_empty() {
            avg_difficulty /= clients.len() as f64;
        }
        json!({
            "enabled": self.cfg.enabled,
            "clients": clients.len(),
            "avg_difficulty": avg_difficulty,
            "target_seconds": self.cfg.target_share_time.as_secs(),
            "min_difficulty": self.cfg.min_difficulty,
            "max_difficulty": self.cfg.max_difficulty,
        })
    }
}
