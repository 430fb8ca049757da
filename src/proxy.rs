/// Proxy supervisor
///
/// Wires the components together and owns the long-lived tasks: the
/// accept loop, the upstream manager (which keeps an upstream session
/// alive exactly while miners are present, modulo a grace window), the
/// vardiff and rate-limit tickers, and the periodic share report.

use anyhow::Result;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metrics::Collector;
use crate::nonce::NonceManager;
use crate::ratelimit::RateLimiter;
use crate::router::Router;
use crate::stratum::protocol::{fmt_duration, FrameError, LineReader, MAX_FRAME};
use crate::stratum::server::StratumServer;
use crate::upstream::{backoff, Upstream};
use crate::vardiff::VarDiff;
use crate::USER_AGENT;

/// Cadence of the upstream manager's client-count checks.
const MANAGER_TICK: Duration = Duration::from_millis(250);

pub struct Proxy {
    pub cfg: Arc<Config>,
    pub upstream: Arc<Upstream>,
    pub nonce: Arc<NonceManager>,
    pub router: Arc<Router>,
    pub vardiff: Arc<VarDiff>,
    pub ratelimit: Arc<RateLimiter>,
    pub metrics: Arc<Collector>,
    server: Arc<StratumServer>,
}

impl Proxy {
    pub fn new(cfg: Config) -> Arc<Self> {
        let cfg = Arc::new(cfg);
        let metrics = Collector::new();
        let upstream = Upstream::new();
        let nonce = NonceManager::new(upstream.clone());
        let vardiff = VarDiff::new(&cfg.vardiff);
        let ratelimit = RateLimiter::new(cfg.ratelimit.clone());
        let router = Router::new(
            cfg.upstream.user.clone(),
            cfg.compat.strict_broadcast,
            upstream.clone(),
            nonce.clone(),
            vardiff.clone(),
            metrics.clone(),
        );
        let server = StratumServer::new(
            cfg.clone(),
            router.clone(),
            nonce.clone(),
            vardiff.clone(),
            ratelimit.clone(),
            metrics.clone(),
        );
        Arc::new(Self {
            cfg,
            upstream,
            nonce,
            router,
            vardiff,
            ratelimit,
            metrics,
            server,
        })
    }

    /// Bind the listener and launch every long-lived task. Returns the
    /// bound address (useful when listening on an ephemeral port).
    pub async fn start(self: &Arc<Self>, token: CancellationToken) -> Result<SocketAddr> {
        let (listener, tls) = self.server.bind().await?;
        let addr = listener.local_addr()?;

        tokio::spawn(self.server.clone().run(listener, tls, token.child_token()));
        tokio::spawn(self.clone().upstream_manager(token.child_token()));
        tokio::spawn(self.vardiff.clone().run(token.child_token()));
        tokio::spawn(self.ratelimit.clone().run_cleanup(token.child_token()));
        tokio::spawn(
            self.clone()
                .report_loop(token.child_token(), Duration::from_secs(60)),
        );
        Ok(addr)
    }

    /// Keep the upstream session running exactly while miners are
    /// connected. The manager and the session communicate through
    /// cancellation only.
    async fn upstream_manager(self: Arc<Self>, token: CancellationToken) {
        let grace = Duration::from_secs(self.cfg.proxy.idle_grace_secs);
        let mut session_token: Option<CancellationToken> = None;
        let mut grace_deadline: Option<Instant> = None;
        let mut tick = tokio::time::interval(MANAGER_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    if let Some(t) = session_token.take() {
                        t.cancel();
                    }
                    return;
                }
                _ = tick.tick() => {
                    let has_clients = self.metrics.clients_active() > 0;
                    let running = session_token.is_some();

                    if has_clients && !running {
                        grace_deadline = None;
                        info!("⛏️ miners present — starting upstream session");
                        let child = token.child_token();
                        session_token = Some(child.clone());
                        tokio::spawn(self.clone().upstream_loop(child));
                    } else if !has_clients && running {
                        match grace_deadline {
                            None => grace_deadline = Some(Instant::now() + grace),
                            Some(d) if Instant::now() >= d => {
                                info!("no miners for {}s — releasing upstream", grace.as_secs());
                                if let Some(t) = session_token.take() {
                                    t.cancel();
                                }
                                grace_deadline = None;
                            }
                            Some(_) => {}
                        }
                    } else if has_clients {
                        grace_deadline = None;
                    }
                }
            }
        }
    }

    /// One upstream session after another: dial the current failover
    /// target, handshake, pump frames into the router, and on any failure
    /// advance to the next target after a backoff.
    async fn upstream_loop(self: Arc<Self>, token: CancellationToken) {
        let mut idx = 0usize;

        while !token.is_cancelled() {
            let targets = self.cfg.upstream_targets();
            if idx >= targets.len() {
                idx = 0;
            }
            let target = targets[idx].clone();
            let min = Duration::from_millis(target.backoff_min_ms);
            let max = Duration::from_millis(target.backoff_max_ms);

            let reader = match self.upstream.dial(&target).await {
                Ok(r) => r,
                Err(e) => {
                    let d = backoff(min, max);
                    warn!(
                        "upstream dial failed (idx={} {}): {}; retry in {}",
                        idx,
                        target.addr(),
                        e,
                        fmt_duration(d)
                    );
                    idx = (idx + 1) % targets.len();
                    if idx != 0 {
                        info!("switching to backup upstream index {}", idx);
                    }
                    if !sleep_or_cancelled(&token, d).await {
                        break;
                    }
                    continue;
                }
            };

            self.metrics.set_upstream_connected(true);
            info!("✅ upstream connected: {} (idx={})", target.addr(), idx);

            if let Err(e) = self
                .upstream
                .handshake(USER_AGENT, &target.user, &target.pass)
                .await
            {
                warn!("upstream handshake failed: {}", e);
                self.teardown_upstream().await;
                idx = (idx + 1) % targets.len();
                if !sleep_or_cancelled(&token, Duration::from_secs(1)).await {
                    break;
                }
                continue;
            }

            let mut lines = LineReader::new(reader, MAX_FRAME);
            let session_over = loop {
                tokio::select! {
                    _ = token.cancelled() => break true,
                    res = lines.next_line() => match res {
                        Ok(Some(line)) => self.router.process_upstream_line(&line).await,
                        Ok(None) => {
                            debug!("upstream closed the connection");
                            break false;
                        }
                        Err(FrameError::TooLarge(max)) => {
                            warn!("upstream frame exceeds {} bytes, dropped", max);
                        }
                        Err(FrameError::Io(e)) => {
                            warn!("upstream read error: {}", e);
                            break false;
                        }
                    }
                }
            };

            self.teardown_upstream().await;
            if session_over {
                break;
            }

            let d = backoff(min, max);
            warn!("upstream disconnected; retry in {}", fmt_duration(d));
            idx = (idx + 1) % targets.len();
            if !sleep_or_cancelled(&token, d).await {
                break;
            }
        }

        self.teardown_upstream().await;
        debug!("upstream session loop stopped");
    }

    /// Reset everything the dead session negotiated. Parked subscribes
    /// stay parked; they are released by the next successful handshake.
    async fn teardown_upstream(&self) {
        self.upstream.reset_session().await;
        self.nonce.reset();
        self.metrics.set_upstream_connected(false);
    }

    /// Periodic aggregate share report.
    async fn report_loop(self: Arc<Self>, token: CancellationToken, interval: Duration) {
        let start = Instant::now();
        let mut last = start;
        let mut last_ok = self.metrics.shares_ok();
        let mut last_bad = self.metrics.shares_bad();
        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + interval,
            interval,
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tick.tick() => {
                    let now = Instant::now();
                    let total_ok = self.metrics.shares_ok();
                    let total_bad = self.metrics.shares_bad();
                    let delta_ok = total_ok - last_ok;
                    let delta_bad = total_bad - last_bad;
                    let submitted_interval = delta_ok + delta_bad;
                    let submitted_total = total_ok + total_bad;

                    let interval_min = now.duration_since(last).as_secs_f64() / 60.0;
                    let total_min = now.duration_since(start).as_secs_f64() / 60.0;
                    let rate_interval = if interval_min > 0.0 { submitted_interval as f64 / interval_min } else { 0.0 };
                    let rate_total = if total_min > 0.0 { submitted_total as f64 / total_min } else { 0.0 };
                    let acc_interval = if submitted_interval > 0 { delta_ok as f64 / submitted_interval as f64 * 100.0 } else { 0.0 };
                    let acc_total = if submitted_total > 0 { total_ok as f64 / submitted_total as f64 * 100.0 } else { 0.0 };

                    info!(
                        "periodic report | submitted {}/{} (acc {:.1}% / {:.1}%) | rejects {}/{} | rate {:.2}/min (overall {:.2}/min) | miners {}",
                        delta_ok, total_ok, acc_interval, acc_total,
                        delta_bad, total_bad,
                        rate_interval, rate_total,
                        self.metrics.clients_active(),
                    );

                    last = now;
                    last_ok = total_ok;
                    last_bad = total_bad;
                }
            }
        }
    }

    /// Snapshot for the `/status` endpoint.
    pub async fn status_json(&self) -> serde_json::Value {
        let (e1, e2_size) = self.upstream.extranonce();
        json!({
            "upstream": self.metrics.upstream_connected(),
            "extranonce1": e1,
            "extranonce2_size": e2_size,
            "last_notify_unix": self.metrics.last_notify_unix(),
            "last_diff": self.metrics.last_difficulty(),
            "shares_ok": self.metrics.shares_ok(),
            "shares_bad": self.metrics.shares_bad(),
            "clients": self.router.client_views().await,
            "vardiff": self.vardiff.stats_json(),
            "ratelimit": self.ratelimit.global_stats(),
        })
    }
}

async fn sleep_or_cancelled(token: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}
