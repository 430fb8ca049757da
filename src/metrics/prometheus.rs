use prometheus::core::Collector;
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, TextEncoder};
use std::sync::OnceLock;

static ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static REJECTED: OnceLock<IntCounter> = OnceLock::new();
static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();
static UPSTREAM_CONNECTED: OnceLock<IntGauge> = OnceLock::new();
static UPSTREAM_DIFFICULTY: OnceLock<Gauge> = OnceLock::new();
static LAST_NOTIFY: OnceLock<IntGauge> = OnceLock::new();

fn accepted() -> &'static IntCounter {
    ACCEPTED.get_or_init(|| IntCounter::new("shares_accepted_total", "Total accepted shares").unwrap())
}

fn rejected() -> &'static IntCounter {
    REJECTED.get_or_init(|| IntCounter::new("shares_rejected_total", "Total rejected shares").unwrap())
}

fn active_connections() -> &'static IntGauge {
    ACTIVE_CONNECTIONS
        .get_or_init(|| IntGauge::new("stratum_active_connections", "Active miner connections").unwrap())
}

fn upstream_connected() -> &'static IntGauge {
    UPSTREAM_CONNECTED.get_or_init(|| {
        IntGauge::new(
            "upstream_connected",
            "Upstream connection status (1 = connected, 0 = disconnected)",
        )
        .unwrap()
    })
}

fn upstream_difficulty() -> &'static Gauge {
    UPSTREAM_DIFFICULTY.get_or_init(|| {
        Gauge::new("upstream_difficulty", "Last difficulty set by upstream").unwrap()
    })
}

fn last_notify() -> &'static IntGauge {
    LAST_NOTIFY.get_or_init(|| {
        IntGauge::new(
            "last_notify_timestamp_seconds",
            "Unix timestamp of the last mining.notify received",
        )
        .unwrap()
    })
}

pub fn inc_accepted() {
    accepted().inc();
}

pub fn inc_rejected() {
    rejected().inc();
}

pub fn inc_connections() {
    active_connections().inc();
}

pub fn dec_connections() {
    active_connections().dec();
}

pub fn set_upstream_connected(connected: bool) {
    upstream_connected().set(if connected { 1 } else { 0 });
}

pub fn set_upstream_difficulty(difficulty: f64) {
    upstream_difficulty().set(difficulty);
}

pub fn set_last_notify(unix: i64) {
    last_notify().set(unix);
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(accepted().collect());
    mfs.extend(rejected().collect());
    mfs.extend(active_connections().collect());
    mfs.extend(upstream_connected().collect());
    mfs.extend(upstream_difficulty().collect());
    mfs.extend(last_notify().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_lists_all_metrics() {
        inc_accepted();
        set_upstream_connected(true);
        let out = render();
        assert!(out.contains("shares_accepted_total"));
        assert!(out.contains("shares_rejected_total"));
        assert!(out.contains("stratum_active_connections"));
        assert!(out.contains("upstream_connected"));
        assert!(out.contains("upstream_difficulty"));
        assert!(out.contains("last_notify_timestamp_seconds"));
    }
}
