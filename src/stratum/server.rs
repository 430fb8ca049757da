/// Downstream Stratum server
///
/// Accepts miner connections (plain TCP or TLS), runs admission control,
/// and drives one read task plus one writer task per miner. The read loop
/// applies a short deadline until the miner finishes its handshake and a
/// long one afterwards so authorized rigs are not dropped between jobs.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{Connection, OUTBOUND_BUFFER};
use super::protocol::{FrameError, LineReader, Message, MAX_FRAME};
use crate::config::Config;
use crate::metrics::Collector;
use crate::nonce::NonceManager;
use crate::ratelimit::RateLimiter;
use crate::router::Router;
use crate::stratum::protocol::fmt_duration;
use crate::vardiff::VarDiff;

/// Authorized miners idle between jobs; do not time them out aggressively.
const POST_HANDSHAKE_IDLE: Duration = Duration::from_secs(30 * 60);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct StratumServer {
    cfg: Arc<Config>,
    router: Arc<Router>,
    nonce: Arc<NonceManager>,
    vardiff: Arc<VarDiff>,
    ratelimit: Arc<RateLimiter>,
    metrics: Arc<Collector>,
    next_client_id: AtomicU64,
}

impl StratumServer {
    pub fn new(
        cfg: Arc<Config>,
        router: Arc<Router>,
        nonce: Arc<NonceManager>,
        vardiff: Arc<VarDiff>,
        ratelimit: Arc<RateLimiter>,
        metrics: Arc<Collector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            router,
            nonce,
            vardiff,
            ratelimit,
            metrics,
            next_client_id: AtomicU64::new(1),
        })
    }

    /// Bind the listener (and load TLS material when configured) before
    /// the accept loop starts, so bad config fails fast.
    pub async fn bind(&self) -> Result<(TcpListener, Option<TlsAcceptor>)> {
        let listener = TcpListener::bind(&self.cfg.proxy.listen)
            .await
            .with_context(|| format!("binding {}", self.cfg.proxy.listen))?;
        let addr = listener.local_addr()?;

        let tls = if self.cfg.proxy.tls.enabled {
            let acceptor = build_tls_acceptor(
                &self.cfg.proxy.tls.cert_file,
                &self.cfg.proxy.tls.key_file,
            )?;
            info!("proxy: listening on {} (TLS enabled)", addr);
            Some(acceptor)
        } else {
            info!("proxy: listening on {}", addr);
            None
        };
        Ok((listener, tls))
    }

    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        token: CancellationToken,
    ) {
        loop {
            let (stream, peer) = tokio::select! {
                _ = token.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept error: {}", e);
                        continue;
                    }
                },
            };

            if !self.ratelimit.allow(peer) {
                debug!("rejecting client {}: rate limit exceeded", peer);
                continue;
            }
            if self.metrics.clients_active() >= self.cfg.proxy.max_clients as i64 {
                warn!("rejecting client {}: max_clients reached", peer);
                self.ratelimit.release(peer);
                continue;
            }
            self.metrics.inc_clients();

            let server = self.clone();
            let tls = tls.clone();
            let child = token.child_token();
            tokio::spawn(async move {
                server.serve_client(stream, peer, tls, child).await;
            });
        }
    }

    async fn serve_client(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        tls: Option<TlsAcceptor>,
        token: CancellationToken,
    ) {
        let _ = stream.set_nodelay(true);

        let (reader, writer): (BoxedReader, BoxedWriter) = match tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(s) => {
                    let (r, w) = tokio::io::split(s);
                    (Box::new(r), Box::new(w))
                }
                Err(e) => {
                    debug!("TLS accept from {} failed: {}", peer, e);
                    self.ratelimit.release(peer);
                    self.metrics.dec_clients();
                    return;
                }
            },
            None => {
                let (r, w) = tokio::io::split(stream);
                (Box::new(r), Box::new(w))
            }
        };

        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let conn = Arc::new(Connection::new(
            id,
            peer,
            self.cfg.upstream.user.clone(),
            tx,
        ));

        self.router.add_client(conn.clone()).await;
        self.vardiff.add_client(conn.clone());
        info!("client connected: {}", peer);

        tokio::spawn(write_loop(writer, rx, peer));

        self.client_loop(&conn, reader, &token).await;

        self.nonce.remove_client(conn.id);
        self.router.remove_client(conn.id).await;
        self.vardiff.remove_client(conn.id);
        self.ratelimit.release(peer);
        self.metrics.dec_clients();

        let (ok, bad) = (conn.accepted(), conn.rejected());
        let worker = {
            let w = conn.worker();
            if w.is_empty() {
                "unknown".to_string()
            } else {
                w
            }
        };
        info!(
            "client closed: {} worker={} duration={} shares={} (ok={} bad={})",
            peer,
            worker,
            fmt_duration(Duration::from_secs(conn.uptime().as_secs())),
            ok + bad,
            ok,
            bad,
        );
    }

    async fn client_loop(&self, conn: &Arc<Connection>, reader: BoxedReader, token: &CancellationToken) {
        let mut lines = LineReader::new(reader, MAX_FRAME);
        loop {
            let idle = if conn.handshake_done() || self.cfg.proxy.client_idle_ms == 0 {
                POST_HANDSHAKE_IDLE
            } else {
                Duration::from_millis(self.cfg.proxy.client_idle_ms)
            };

            let res = tokio::select! {
                _ = token.cancelled() => return,
                r = tokio::time::timeout(idle, lines.next_line()) => r,
            };

            let line = match res {
                Err(_) => {
                    debug!("client {} idle timeout", conn.peer_addr);
                    return;
                }
                Ok(Err(FrameError::TooLarge(max))) => {
                    warn!("client {} frame exceeds {} bytes, dropped", conn.peer_addr, max);
                    continue;
                }
                Ok(Err(FrameError::Io(e))) => {
                    debug!("client {} read error: {}", conn.peer_addr, e);
                    return;
                }
                Ok(Ok(None)) => return,
                Ok(Ok(Some(line))) => line,
            };

            conn.touch();
            let Ok(msg) = serde_json::from_str::<Message>(&line) else {
                // single bad frame never tears the session down
                continue;
            };
            self.router.process_client_message(conn, msg).await;
        }
    }
}

async fn write_loop(mut writer: BoxedWriter, mut rx: mpsc::Receiver<String>, peer: SocketAddr) {
    while let Some(line) = rx.recv().await {
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };
        if let Err(e) = write.await {
            debug!("client {} write error: {}", peer, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

fn build_tls_acceptor(cert_file: &str, key_file: &str) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(cert_file).with_context(|| format!("opening {cert_file}"))?,
    ))
    .collect::<std::result::Result<Vec<_>, _>>()
    .context("parsing TLS certificates")?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key_file).with_context(|| format!("opening {key_file}"))?,
    ))
    .context("parsing TLS key")?
    .context("no private key found")?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS server config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
