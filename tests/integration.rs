// End-to-end proxy flows over loopback: a scripted pool on one side, raw
// miner sockets on the other, and the real proxy in between.

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use oreflow::config::Config;
use oreflow::proxy::Proxy;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Control marker that makes the scripted pool drop its current
/// connection, simulating an upstream flap.
const CLOSE_MARKER: &str = "__close__";

struct FakePool {
    addr: SocketAddr,
    submits: mpsc::UnboundedReceiver<Value>,
    control: mpsc::UnboundedSender<String>,
}

impl FakePool {
    /// Push a raw notification line at the proxy.
    fn notify(&self, line: &str) {
        self.control.send(line.to_string()).unwrap();
    }

    /// Drop the current upstream connection.
    fn drop_connection(&self) {
        self.control.send(CLOSE_MARKER.to_string()).unwrap();
    }

    async fn recv_submit(&mut self) -> Value {
        tokio::time::timeout(RECV_TIMEOUT, self.submits.recv())
            .await
            .expect("timed out waiting for submit at pool")
            .expect("pool submit channel closed")
    }
}

async fn spawn_fake_pool() -> FakePool {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (submit_tx, submits) = mpsc::unbounded_channel();
    let (control, mut control_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            pool_session(stream, &mut control_rx, &submit_tx).await;
        }
    });

    FakePool { addr, submits, control }
}

/// Serve one upstream connection: answer the handshake, echo submit
/// outcomes, relay injected notifications. Returns when the proxy hangs
/// up or a close marker arrives.
async fn pool_session(
    stream: TcpStream,
    control_rx: &mut mpsc::UnboundedReceiver<String>,
    submit_tx: &mpsc::UnboundedSender<Value>,
) {
    let (r, mut w) = stream.into_split();
    let mut lines = BufReader::new(r).lines();

    loop {
        tokio::select! {
            ctl = control_rx.recv() => {
                let Some(line) = ctl else { return };
                if line == CLOSE_MARKER {
                    return;
                }
                if w.write_all(line.as_bytes()).await.is_err() {
                    return;
                }
                let _ = w.write_all(b"\n").await;
            }
            res = lines.next_line() => {
                let Ok(Some(line)) = res else { return };
                let v: Value = serde_json::from_str(&line).unwrap();
                let id = v["id"].clone();
                let reply = match v["method"].as_str().unwrap_or("") {
                    "mining.subscribe" => json!({"id": id, "result": [[], "DEADBEEF", 4], "error": null}),
                    "mining.authorize" => json!({"id": id, "result": true, "error": null}),
                    "mining.submit" => {
                        submit_tx.send(v["params"].clone()).unwrap();
                        if v["params"][1] == "reject" {
                            json!({"id": id, "result": false, "error": [23, "low difficulty share", null]})
                        } else {
                            json!({"id": id, "result": true, "error": null})
                        }
                    }
                    _ => continue,
                };
                if w.write_all(reply.to_string().as_bytes()).await.is_err() {
                    return;
                }
                let _ = w.write_all(b"\n").await;
            }
        }
    }
}

struct Miner {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Miner {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (r, writer) = stream.into_split();
        Self {
            lines: BufReader::new(r).lines(),
            writer,
        }
    }

    async fn send(&mut self, v: Value) {
        self.writer.write_all(v.to_string().as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv_raw(&mut self) -> String {
        tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for frame from proxy")
            .expect("read error")
            .expect("proxy closed the connection")
    }

    async fn recv(&mut self) -> Value {
        serde_json::from_str(&self.recv_raw().await).unwrap()
    }

    /// `None` when the proxy closes without sending anything.
    async fn recv_or_eof(&mut self) -> Option<String> {
        tokio::time::timeout(RECV_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for close")
            .ok()
            .flatten()
    }
}

fn test_config(pool: SocketAddr) -> Config {
    let mut cfg = Config::default();
    cfg.proxy.listen = "127.0.0.1:0".to_string();
    cfg.upstream.host = pool.ip().to_string();
    cfg.upstream.port = pool.port();
    cfg.upstream.user = "wallet.proxy".to_string();
    cfg.upstream.pass = "x".to_string();
    cfg.upstream.backoff_min_ms = 100;
    cfg.upstream.backoff_max_ms = 200;
    cfg
}

#[tokio::test]
async fn test_subscribe_authorize_submit_and_broadcast() {
    let mut pool = spawn_fake_pool().await;
    let token = CancellationToken::new();
    let proxy = Proxy::new(test_config(pool.addr));
    let addr = proxy.start(token.clone()).await.unwrap();

    // The upstream session only starts once a miner is present, so this
    // subscribe is parked and released when the pool handshake completes.
    let mut miner = Miner::connect(addr).await;
    miner
        .send(json!({"id": 10, "method": "mining.subscribe", "params": ["cpuminer"]}))
        .await;

    let sub = miner.recv().await;
    assert_eq!(sub["id"], 10);
    assert_eq!(sub["result"], json!([[], "DEADBEEF00", 3]));
    assert!(sub["error"].is_null());

    miner
        .send(json!({"id": 20, "method": "mining.authorize", "params": ["rig1", "x"]}))
        .await;
    let auth = miner.recv().await;
    assert_eq!(auth["id"], 20);
    assert_eq!(auth["result"], true);

    // accepted submit: identity and extranonce2 rewritten on the way up
    miner
        .send(json!({
            "id": 21,
            "method": "mining.submit",
            "params": ["rig1", "job1", "A1B2C3", "1a2b3c", "deadbeef", "000000"]
        }))
        .await;
    let seen = pool.recv_submit().await;
    assert_eq!(seen[0], "wallet.proxy");
    assert_eq!(seen[1], "job1");
    assert_eq!(seen[2], "00A1B2C3");

    let accepted = miner.recv().await;
    assert_eq!(accepted["id"], 21);
    assert_eq!(accepted["result"], true);

    // rejected submit: pool's error tuple relayed with the miner's id
    miner
        .send(json!({
            "id": 22,
            "method": "mining.submit",
            "params": ["rig1", "reject", "A1B2C3", "1a2b3c", "deadbeef", "000000"]
        }))
        .await;
    let _ = pool.recv_submit().await;
    let rejected = miner.recv().await;
    assert_eq!(rejected["id"], 22);
    assert_eq!(rejected["result"], false);
    assert_eq!(rejected["error"], json!([23, "low difficulty share", null]));

    // a second miner gets the next prefix and both see the same notify line
    let mut miner2 = Miner::connect(addr).await;
    miner2
        .send(json!({"id": 30, "method": "mining.subscribe", "params": ["cpuminer"]}))
        .await;
    let sub2 = miner2.recv().await;
    assert_eq!(sub2["result"], json!([[], "DEADBEEF01", 3]));

    let notify = r#"{"method":"mining.notify","params":["j1","p","cb1","cb2",[],"20000000","1d00ffff","5f000000",true]}"#;
    pool.notify(notify);
    assert_eq!(miner.recv_raw().await, notify);
    assert_eq!(miner2.recv_raw().await, notify);

    token.cancel();
}

#[tokio::test]
async fn test_upstream_flap_releases_parked_subscribe_after_redial() {
    let pool = spawn_fake_pool().await;
    let token = CancellationToken::new();
    let proxy = Proxy::new(test_config(pool.addr));
    let addr = proxy.start(token.clone()).await.unwrap();

    let mut miner = Miner::connect(addr).await;
    miner
        .send(json!({"id": 1, "method": "mining.subscribe", "params": ["m"]}))
        .await;
    let first = miner.recv().await;
    assert_eq!(first["result"][1], "DEADBEEF00");

    // flap: the pool drops the session; the proxy backs off and redials
    pool.drop_connection();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // a miner arriving during/after the outage parks until the new
    // handshake completes, and the prefix counter keeps counting
    let mut miner2 = Miner::connect(addr).await;
    miner2
        .send(json!({"id": 2, "method": "mining.subscribe", "params": ["m"]}))
        .await;
    let second = miner2.recv().await;
    assert_eq!(second["id"], 2);
    assert_eq!(second["result"][1], "DEADBEEF01", "prefix survives the flap");
    assert_eq!(second["result"][2], 3);

    token.cancel();
}

#[tokio::test]
async fn test_max_clients_admission() {
    let pool = spawn_fake_pool().await;
    let token = CancellationToken::new();
    let mut cfg = test_config(pool.addr);
    cfg.proxy.max_clients = 1;
    let proxy = Proxy::new(cfg);
    let addr = proxy.start(token.clone()).await.unwrap();

    let mut miner = Miner::connect(addr).await;
    miner
        .send(json!({"id": 1, "method": "mining.subscribe", "params": ["m"]}))
        .await;
    let _ = miner.recv().await;

    // the second connection is over the cap: closed with no Stratum body
    let mut rejected = Miner::connect(addr).await;
    assert_eq!(rejected.recv_or_eof().await, None);

    token.cancel();
}

#[tokio::test]
async fn test_submit_while_upstream_down_gets_error_reply() {
    // no pool at all: dial fails, forwards answer with an error body
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = unused.local_addr().unwrap();
    drop(unused);

    let token = CancellationToken::new();
    let proxy = Proxy::new(test_config(dead_addr));
    let addr = proxy.start(token.clone()).await.unwrap();

    let mut miner = Miner::connect(addr).await;
    miner
        .send(json!({
            "id": 7,
            "method": "mining.submit",
            "params": ["rig1", "job1", "A1B2C3", "t", "n"]
        }))
        .await;

    let reply = miner.recv().await;
    assert_eq!(reply["id"], 7);
    assert_eq!(reply["error"], json!([-1, "Upstream down", null]));

    token.cancel();
}
