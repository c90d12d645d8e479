// `server.rs` composes the gateway: it loads configuration, opens the
// database, connects to the broker, mounts the HTTP handlers and hands every
// long-running task to the orchestrator.
use std::time::Duration;

use axum::{Extension, Router, routing::get};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::context::{GatewayContext, wait_for_shutdown};
use crate::db::start_db_worker;
use crate::dispatch::Dispatcher;
use crate::handlers::{self, StatusInfo};
use crate::logging;
use crate::mqtt::MqttSession;
use crate::orchestrator::{Orchestrator, spawn_signal_listener};

/// Upper bound on the graceful HTTP shutdown.
pub const HTTP_SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

pub async fn run() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env()?;
    logging::init(&config.log)?;
    info!(version = env!("CARGO_PKG_VERSION"), "starting device gateway");

    let (db, db_worker) = start_db_worker(config.db_path.clone(), config.db_seed.clone()).await?;
    info!(
        path = config.db_path.as_deref().unwrap_or(":memory:"),
        "database ready"
    );

    let (ctx, receivers) = GatewayContext::new(config.mqtt.client_id.clone())?;

    // Startup failures from here on are fatal; nothing has been spawned yet.
    let session = MqttSession::connect(&config.mqtt, &ctx).await?;
    let listener = TcpListener::bind(config.http_addr.as_str()).await?;
    info!(addr = %config.http_addr, "http listening");

    let mqtt_task = task::spawn(session.run(receivers.outbound));
    let http_task = task::spawn(serve(listener, router(&ctx), ctx.shutdown_listener()));

    let (signal_tx, signal_rx) = mpsc::channel(1);
    let _signals = spawn_signal_listener(signal_tx)?;

    let dispatcher = Dispatcher::new(db.clone(), config.cache_root.clone());
    let mut orchestrator = Orchestrator::new(&ctx, dispatcher, receivers.inbound, signal_rx);
    orchestrator.supervise("mqtt", mqtt_task);
    orchestrator.supervise("http", http_task);

    let outcome = orchestrator.run().await;

    if let Err(e) = db.shutdown().await {
        warn!(error = %e, "database shutdown failed");
    }
    if let Err(e) = db_worker.await {
        error!(error = %e, "database worker ended abnormally");
    }

    match &outcome {
        Ok(()) => info!("device gateway stopped"),
        Err(e) => error!(error = %e, "device gateway stopped with error"),
    }
    outcome
}

pub fn router(ctx: &GatewayContext) -> Router {
    Router::new()
        .route("/", get(handlers::status_page))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/health", get(handlers::health))
        .layer(Extension(StatusInfo::from_context(ctx)))
        .layer(Extension(ctx.registry.clone()))
        .layer(TraceLayer::new_for_http())
}

/// Serve until the shutdown broadcast, then allow in-flight requests up to
/// `HTTP_SHUTDOWN_WAIT` before dropping them.
pub async fn serve(listener: TcpListener, app: Router, shutdown: watch::Receiver<bool>) {
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown.clone()))
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        res = &mut server => {
            if let Err(e) = res {
                error!(error = %e, "http server failed");
            }
            return;
        }
        _ = wait_for_shutdown(shutdown) => {}
    }

    match tokio::time::timeout(HTTP_SHUTDOWN_WAIT, &mut server).await {
        Ok(Ok(())) => info!("http server stopped"),
        Ok(Err(e)) => error!(error = %e, "http server failed during shutdown"),
        Err(_) => warn!(
            wait_secs = HTTP_SHUTDOWN_WAIT.as_secs(),
            "http shutdown timed out; dropping open connections"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get_raw(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_routes_and_graceful_shutdown() {
        let (ctx, _rx) = GatewayContext::new("gw-http").unwrap();
        ctx.metrics.messages_total.inc();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, router(&ctx), ctx.shutdown_listener()));

        let health = get_raw(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.ends_with("ok"));

        let status = get_raw(addr, "/").await;
        assert!(status.contains("<title>AFM</title>"));
        assert!(status.contains("Gateway: gw-http"));

        let metrics = get_raw(addr, "/metrics").await;
        assert!(metrics.contains("gateway_messages_total 1"));

        let missing = get_raw(addr, "/nope").await;
        assert!(missing.starts_with("HTTP/1.1 404"));

        ctx.signal_shutdown();
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
    }
}
