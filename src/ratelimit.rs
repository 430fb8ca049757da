/// Per-IP admission control
///
/// Caps simultaneous connections per address, throttles connection churn
/// per minute, and bans addresses that exceed the churn limit. Rejected
/// peers get a bare TCP close; no Stratum error body is owed to a peer
/// that has not been admitted.

use serde_json::json;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RateLimitSection;

#[derive(Default)]
struct IpStats {
    active_connections: usize,
    connection_times: Vec<Instant>,
    banned_until: Option<Instant>,
}

pub struct RateLimiter {
    cfg: RateLimitSection,
    stats: Mutex<HashMap<IpAddr, IpStats>>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitSection) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            stats: Mutex::new(HashMap::new()),
        })
    }

    /// Admission check for a new connection. A `true` result counts the
    /// connection; the caller must `release` it on teardown.
    pub fn allow(&self, addr: SocketAddr) -> bool {
        if !self.cfg.enabled {
            return true;
        }
        let ip = addr.ip();
        let now = Instant::now();
        let mut stats = self.stats.lock().unwrap();
        let entry = stats.entry(ip).or_default();

        if let Some(until) = entry.banned_until {
            if now < until {
                return false;
            }
            entry.banned_until = None;
        }

        if self.cfg.max_connections_per_ip > 0
            && entry.active_connections >= self.cfg.max_connections_per_ip
        {
            return false;
        }

        if self.cfg.max_connections_per_minute > 0 {
            let cutoff = now - Duration::from_secs(60);
            entry.connection_times.retain(|t| *t > cutoff);
            if entry.connection_times.len() >= self.cfg.max_connections_per_minute {
                entry.banned_until =
                    Some(now + Duration::from_secs(self.cfg.ban_duration_seconds));
                debug!("banning {} for {}s (connection churn)", ip, self.cfg.ban_duration_seconds);
                return false;
            }
            entry.connection_times.push(now);
        }

        entry.active_connections += 1;
        true
    }

    pub fn release(&self, addr: SocketAddr) {
        if !self.cfg.enabled {
            return;
        }
        let mut stats = self.stats.lock().unwrap();
        if let Some(entry) = stats.get_mut(&addr.ip()) {
            entry.active_connections = entry.active_connections.saturating_sub(1);
        }
    }

    pub fn is_banned(&self, addr: SocketAddr) -> bool {
        if !self.cfg.enabled {
            return false;
        }
        let stats = self.stats.lock().unwrap();
        stats
            .get(&addr.ip())
            .and_then(|e| e.banned_until)
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    pub fn global_stats(&self) -> serde_json::Value {
        let stats = self.stats.lock().unwrap();
        let now = Instant::now();
        let total_active: usize = stats.values().map(|e| e.active_connections).sum();
        let banned = stats
            .values()
            .filter(|e| e.banned_until.map(|u| now < u).unwrap_or(false))
            .count();
        json!({
            "enabled": self.cfg.enabled,
            "tracked_ips": stats.len(),
            "total_active": total_active,
            "banned_ips": banned,
            "max_per_ip": self.cfg.max_connections_per_ip,
            "max_per_minute": self.cfg.max_connections_per_minute,
            "ban_duration_sec": self.cfg.ban_duration_seconds,
        })
    }

    /// Drop entries with no connections, no ban, and no recent churn.
    fn cleanup(&self) {
        let now = Instant::now();
        let cutoff = now - Duration::from_secs(300);
        let mut stats = self.stats.lock().unwrap();
        stats.retain(|_, e| {
            e.active_connections > 0
                || e.banned_until.map(|u| now < u).unwrap_or(false)
                || e.connection_times.last().map(|t| *t > cutoff).unwrap_or(false)
        });
    }

    pub async fn run_cleanup(self: Arc<Self>, token: CancellationToken) {
        if !self.cfg.enabled || self.cfg.cleanup_interval_seconds == 0 {
            return;
        }
        let mut tick =
            tokio::time::interval(Duration::from_secs(self.cfg.cleanup_interval_seconds));
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tick.tick() => self.cleanup(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(last_octet: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), port)
    }

    fn limiter(per_ip: usize, per_minute: usize) -> Arc<RateLimiter> {
        RateLimiter::new(RateLimitSection {
            enabled: true,
            max_connections_per_ip: per_ip,
            max_connections_per_minute: per_minute,
            ban_duration_seconds: 300,
            cleanup_interval_seconds: 0,
        })
    }

    #[test]
    fn test_disabled_allows_everything() {
        let rl = RateLimiter::new(RateLimitSection {
            enabled: false,
            ..RateLimitSection::default()
        });
        for i in 0..1000 {
            assert!(rl.allow(addr(1, i)));
        }
    }

    #[test]
    fn test_per_ip_cap() {
        let rl = limiter(2, 0);
        assert!(rl.allow(addr(1, 1)));
        assert!(rl.allow(addr(1, 2)));
        assert!(!rl.allow(addr(1, 3)), "third connection from same IP refused");
        assert!(rl.allow(addr(2, 1)), "other IPs unaffected");

        rl.release(addr(1, 1));
        assert!(rl.allow(addr(1, 4)), "slot freed by release");
    }

    #[test]
    fn test_churn_ban() {
        let rl = limiter(0, 3);
        for i in 0..3 {
            assert!(rl.allow(addr(1, i)));
        }
        assert!(!rl.allow(addr(1, 9)), "churn limit exceeded");
        assert!(rl.is_banned(addr(1, 9)));
        assert!(!rl.allow(addr(1, 10)), "banned while ban lasts");
        assert!(!rl.is_banned(addr(2, 1)));
    }

    #[test]
    fn test_release_never_underflows() {
        let rl = limiter(5, 0);
        rl.release(addr(1, 1));
        assert!(rl.allow(addr(1, 2)));
    }

    #[test]
    fn test_cleanup_keeps_live_entries() {
        let rl = limiter(5, 0);
        assert!(rl.allow(addr(1, 1)));
        rl.cleanup();
        let stats = rl.global_stats();
        assert_eq!(stats["tracked_ips"], 1, "active entry survives cleanup");
    }
}
