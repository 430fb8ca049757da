// oreflow: Stratum V1 mining proxy
//
// One upstream pool session, many downstream miners. Identity rewriting,
// extranonce2 prefix partitioning, id correlation, subscribe deferral.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use oreflow::config::Config;
use oreflow::metrics::prometheus as metrics;
use oreflow::proxy::Proxy;

#[derive(Parser, Debug)]
#[command(name = "oreflow", version, about = "Stratum V1 mining proxy")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

#[derive(Clone)]
struct ApiState {
    proxy: Arc<Proxy>,
}

async fn api_healthz() -> &'static str {
    "ok"
}

async fn api_status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(state.proxy.status_json().await)
}

async fn api_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::render(),
    )
}

async fn serve_http(listen: String, proxy: Arc<Proxy>, token: CancellationToken) {
    let app = Router::new()
        .route("/healthz", get(api_healthz))
        .route("/status", get(api_status))
        .route("/metrics", get(api_metrics))
        .with_state(ApiState { proxy });

    let listener = match tokio::net::TcpListener::bind(&listen).await {
        Ok(l) => l,
        Err(e) => {
            error!("http: binding {} failed: {}", listen, e);
            return;
        }
    };
    info!("http: listening on {}", listen);

    let shutdown = async move { token.cancelled().await };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("http server error: {}", e);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let args = Args::parse();
    let cfg = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("failed to load config: {:#}", e);
            std::process::exit(1);
        }
    };

    info!("🚀 oreflow starting — upstream {}", cfg.upstream.addr());

    let http_listen = cfg.http.listen.clone();
    let proxy = Proxy::new(cfg);
    let token = CancellationToken::new();

    if let Err(e) = proxy.start(token.clone()).await {
        error!("startup failed: {:#}", e);
        std::process::exit(1);
    }

    if !http_listen.is_empty() {
        tokio::spawn(serve_http(http_listen, proxy.clone(), token.child_token()));
    }

    wait_for_signal().await;
    info!("shutting down...");
    token.cancel();

    // bounded drain window for in-flight tasks
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("shutdown complete");
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
