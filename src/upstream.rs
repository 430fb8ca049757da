/// Upstream pool session
///
/// Owns the single pool socket. The write half and the request id counter
/// live under one mutex so the id assigned to a frame always matches the
/// order it hits the wire; the counter restarts at zero on every fresh
/// dial, which makes the handshake subscribe id 1 for every session.

use anyhow::{Context, Result};
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::socks;
use crate::stratum::protocol::{Message, METHOD_AUTHORIZE, METHOD_SUBSCRIBE};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A forwarded client request awaiting its upstream response, keyed in the
/// pending table by the upstream id the proxy assigned.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub client_id: u64,
    pub orig_id: Option<i64>,
    pub method: String,
    pub sent: Instant,
}

struct Writer {
    half: BoxedWriter,
    next_id: i64,
}

pub struct Upstream {
    writer: Mutex<Option<Writer>>,
    extranonce: StdMutex<(String, usize)>,
    connected: AtomicBool,
    subscribe_id: AtomicI64,
    pending: StdMutex<HashMap<i64, PendingRequest>>,
}

impl Upstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            writer: Mutex::new(None),
            extranonce: StdMutex::new((String::new(), 0)),
            connected: AtomicBool::new(false),
            subscribe_id: AtomicI64::new(0),
            pending: StdMutex::new(HashMap::new()),
        })
    }

    /// Dial the target (plain TCP, TLS, or through a SOCKS5 tunnel) and
    /// install the write half. Returns the read half for the session's
    /// read loop.
    pub async fn dial(&self, target: &UpstreamConfig) -> Result<BoxedReader> {
        let dial_addr = if target.socks_proxy.enabled {
            format!("{}:{}", target.socks_proxy.host, target.socks_proxy.port)
        } else {
            target.addr()
        };

        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&dial_addr))
            .await
            .with_context(|| format!("connect timeout to {dial_addr}"))?
            .with_context(|| format!("connect to {dial_addr}"))?;
        stream.set_nodelay(true)?;

        if target.socks_proxy.enabled {
            tokio::time::timeout(
                CONNECT_TIMEOUT,
                socks::connect(
                    &mut stream,
                    &target.host,
                    target.port,
                    &target.socks_proxy.username,
                    &target.socks_proxy.password,
                ),
            )
            .await
            .context("socks5 negotiation timeout")??;
        }

        let reader: BoxedReader;
        let writer: BoxedWriter;
        if target.tls {
            let connector = tls_connector(target.insecure_skip_verify)?;
            let name = ServerName::try_from(target.host.clone())
                .with_context(|| format!("invalid TLS server name {}", target.host))?;
            let tls = tokio::time::timeout(CONNECT_TIMEOUT, connector.connect(name, stream))
                .await
                .context("TLS handshake timeout")?
                .context("TLS handshake")?;
            let (r, w) = tokio::io::split(tls);
            reader = Box::new(r);
            writer = Box::new(w);
        } else {
            let (r, w) = tokio::io::split(stream);
            reader = Box::new(r);
            writer = Box::new(w);
        }

        self.attach(writer).await;
        Ok(reader)
    }

    /// Install a fresh write half: id counter back to zero, stale pending
    /// entries from the previous session discarded. Client forwards stay
    /// refused until the handshake has claimed the first ids.
    async fn attach(&self, half: BoxedWriter) {
        let mut guard = self.writer.lock().await;
        *guard = Some(Writer { half, next_id: 0 });
        drop(guard);
        self.clear_pending();
    }

    /// Session handshake: subscribe (recording its id) then authorize.
    /// The responses are consumed later by the session read loop. Only a
    /// completed handshake opens the session to client forwards.
    pub async fn handshake(&self, user_agent: &str, user: &str, pass: &str) -> Result<()> {
        let sid = self
            .send(METHOD_SUBSCRIBE, serde_json::json!([user_agent]))
            .await?;
        self.subscribe_id.store(sid, Ordering::SeqCst);
        self.send(METHOD_AUTHORIZE, serde_json::json!([user, pass]))
            .await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn send(&self, method: &str, params: Value) -> Result<i64> {
        self.send_inner(method, params, None).await
    }

    /// Forward a client request: the pending entry is registered before the
    /// frame is flushed, so the response can never race past it.
    pub async fn forward(&self, method: &str, params: Value, pending: PendingRequest) -> Result<i64> {
        self.send_inner(method, params, Some(pending)).await
    }

    async fn send_inner(
        &self,
        method: &str,
        params: Value,
        pending: Option<PendingRequest>,
    ) -> Result<i64> {
        let mut guard = self.writer.lock().await;
        let w = guard.as_mut().context("upstream not connected")?;
        w.next_id += 1;
        let id = w.next_id;

        let msg = Message {
            id: Some(id),
            method: method.to_string(),
            params: Some(params),
            ..Default::default()
        };
        let line = msg.to_line()?;

        let tracked = pending.is_some();
        if let Some(p) = pending {
            self.pending.lock().unwrap().insert(id, p);
        }

        let res = write_line(&mut w.half, &line).await;
        if let Err(e) = res {
            if tracked {
                self.pending.lock().unwrap().remove(&id);
            }
            return Err(e);
        }
        Ok(id)
    }

    pub async fn send_raw(&self, line: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let w = guard.as_mut().context("upstream not connected")?;
        write_line(&mut w.half, line).await
    }

    pub async fn close(&self) {
        let mut guard = self.writer.lock().await;
        if let Some(mut w) = guard.take() {
            let _ = w.half.shutdown().await;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Full teardown at session end: socket closed, negotiated extranonce
    /// scrubbed, pending correlations dropped.
    pub async fn reset_session(&self) {
        self.close().await;
        self.set_extranonce("", 0);
        self.clear_pending();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn subscribe_id(&self) -> i64 {
        self.subscribe_id.load(Ordering::SeqCst)
    }

    pub fn extranonce(&self) -> (String, usize) {
        self.extranonce.lock().unwrap().clone()
    }

    pub fn set_extranonce(&self, extranonce1: &str, extranonce2_size: usize) {
        *self.extranonce.lock().unwrap() = (extranonce1.to_string(), extranonce2_size);
    }

    pub fn take_pending(&self, upstream_id: i64) -> Option<PendingRequest> {
        self.pending.lock().unwrap().remove(&upstream_id)
    }

    pub fn clear_pending(&self) {
        let mut pending = self.pending.lock().unwrap();
        if !pending.is_empty() {
            debug!("discarding {} pending upstream requests", pending.len());
        }
        pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
impl Upstream {
    /// Install a duplex pipe as a fully established session socket; the
    /// returned half is the fake pool's side.
    pub(crate) async fn attach_for_test(&self) -> tokio::io::DuplexStream {
        let (ours, theirs) = tokio::io::duplex(8192);
        let (_r, w) = tokio::io::split(ours);
        self.attach(Box::new(w)).await;
        self.connected.store(true, Ordering::SeqCst);
        theirs
    }
}

/// Read one newline-terminated frame from the fake pool's side of the pipe.
#[cfg(test)]
pub(crate) async fn read_test_line(peer: &mut tokio::io::DuplexStream) -> String {
    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = peer.read(&mut byte).await.expect("peer read");
        assert!(n > 0, "peer closed before newline");
        if byte[0] == b'\n' {
            return String::from_utf8(buf).expect("utf8 frame");
        }
        buf.push(byte[0]);
    }
}

async fn write_line(half: &mut BoxedWriter, line: &str) -> Result<()> {
    half.write_all(line.as_bytes()).await?;
    half.write_all(b"\n").await?;
    half.flush().await?;
    Ok(())
}

/// Exponential backoff with jitter: `clamp(min * 2^r, min, max)` for a
/// random r in 0..=3, plus up to 250ms of uniform jitter so a fleet of
/// proxies does not reconnect in lockstep.
pub fn backoff(min: Duration, max: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter = Duration::from_millis(rng.gen_range(0..250));
    if max <= min {
        return min + jitter;
    }
    let mul = 1u32 << rng.gen_range(0..4u32);
    let d = min.saturating_mul(mul).clamp(min, max);
    d + jitter
}

fn tls_connector(insecure_skip_verify: bool) -> Result<TlsConnector> {
    let config = if insecure_skip_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Certificate verifier that accepts anything; only installed when the
/// operator sets `insecure_skip_verify`.
#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme::*;
        vec![
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            ECDSA_NISTP521_SHA512,
            ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ids_are_dense_and_match_send_order() {
        let up = Upstream::new();
        let mut peer = up.attach_for_test().await;

        let a = up.send("mining.subscribe", serde_json::json!(["ua"])).await.unwrap();
        let b = up.send("mining.authorize", serde_json::json!(["u", "p"])).await.unwrap();
        let c = up.send("mining.submit", serde_json::json!(["u", "j", "00"])).await.unwrap();
        assert_eq!((a, b, c), (1, 2, 3));

        for (expect_id, expect_method) in [
            (1, "mining.subscribe"),
            (2, "mining.authorize"),
            (3, "mining.submit"),
        ] {
            let msg: Message =
                serde_json::from_str(&read_test_line(&mut peer).await).unwrap();
            assert_eq!(msg.id, Some(expect_id));
            assert_eq!(msg.method, expect_method);
        }
    }

    #[tokio::test]
    async fn test_id_counter_resets_on_fresh_attach() {
        let up = Upstream::new();
        let _peer = up.attach_for_test().await;
        assert_eq!(up.send("mining.subscribe", serde_json::json!([])).await.unwrap(), 1);
        assert_eq!(up.send("mining.authorize", serde_json::json!([])).await.unwrap(), 2);

        let _peer2 = up.attach_for_test().await;
        assert_eq!(up.send("mining.subscribe", serde_json::json!([])).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_forward_registers_pending_before_write() {
        let up = Upstream::new();
        let _peer = up.attach_for_test().await;

        let id = up
            .forward(
                "mining.submit",
                serde_json::json!(["u", "j", "00"]),
                PendingRequest {
                    client_id: 7,
                    orig_id: Some(21),
                    method: "mining.submit".to_string(),
                    sent: Instant::now(),
                },
            )
            .await
            .unwrap();

        let entry = up.take_pending(id).unwrap();
        assert_eq!(entry.client_id, 7);
        assert_eq!(entry.orig_id, Some(21));
        assert!(up.take_pending(id).is_none(), "take removes the entry");
    }

    #[tokio::test]
    async fn test_fresh_attach_discards_stale_pending() {
        let up = Upstream::new();
        let _peer = up.attach_for_test().await;
        up.forward(
            "mining.authorize",
            serde_json::json!([]),
            PendingRequest {
                client_id: 1,
                orig_id: None,
                method: "mining.authorize".to_string(),
                sent: Instant::now(),
            },
        )
        .await
        .unwrap();
        assert_eq!(up.pending_len(), 1);

        let _peer2 = up.attach_for_test().await;
        assert_eq!(up.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let up = Upstream::new();
        assert!(up.send("mining.subscribe", serde_json::json!([])).await.is_err());
        assert!(!up.is_connected());
    }

    #[test]
    fn test_backoff_within_bounds() {
        let min = Duration::from_millis(1000);
        let max = Duration::from_millis(4000);
        for _ in 0..200 {
            let d = backoff(min, max);
            assert!(d >= min, "{d:?} below min");
            assert!(d <= max + Duration::from_millis(250), "{d:?} above max+jitter");
        }
        // degenerate range collapses to min (+ jitter)
        let d = backoff(Duration::from_secs(5), Duration::from_secs(5));
        assert!(d >= Duration::from_secs(5) && d < Duration::from_secs(6));
    }
}
