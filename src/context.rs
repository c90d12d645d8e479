// Process-wide plumbing built once at startup: the channels between the MQTT
// session and the orchestrator, the shutdown broadcast, and the metrics.
// Components take what they need from a `&GatewayContext` when constructed.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use prometheus::Registry;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::metrics::GatewayMetrics;

/// A publish received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Outbound publish request. `qos` is the numeric string form ("0", "1",
/// "2"); anything unparseable is sent at QoS 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: String,
}

/// Receiving halves handed to their single owners.
pub struct GatewayReceivers {
    pub inbound: mpsc::Receiver<InboundMessage>,
    pub outbound: mpsc::Receiver<PublishRequest>,
}

#[derive(Clone)]
pub struct GatewayContext {
    pub inbound_tx: mpsc::Sender<InboundMessage>,
    pub outbound_tx: mpsc::Sender<PublishRequest>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    pub metrics: GatewayMetrics,
    pub registry: Arc<Registry>,
    pub started_at: DateTime<Utc>,
    pub client_id: String,
}

// One slot: the MQTT session waits on every delivery while the orchestrator
// is busy, which is the pipeline's only backpressure.
const INBOUND_CAPACITY: usize = 1;
const OUTBOUND_CAPACITY: usize = 64;

impl GatewayContext {
    pub fn new(client_id: impl Into<String>) -> anyhow::Result<(Self, GatewayReceivers)> {
        let registry = Arc::new(Registry::new());
        let metrics = GatewayMetrics::register(&registry)?;

        let (inbound_tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        let (outbound_tx, outbound) = mpsc::channel(OUTBOUND_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        let ctx = GatewayContext {
            inbound_tx,
            outbound_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            metrics,
            registry,
            started_at: Utc::now(),
            client_id: client_id.into(),
        };
        Ok((ctx, GatewayReceivers { inbound, outbound }))
    }

    /// A fresh listener for the shutdown broadcast. Every listener observes
    /// the broadcast, including ones subscribed after it was sent.
    pub fn shutdown_listener(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown_sender(&self) -> Arc<watch::Sender<bool>> {
        Arc::clone(&self.shutdown_tx)
    }

    pub fn signal_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Queue a publish for the MQTT session. Fails only when the session has
    /// stopped or its queue is full; nothing is retried.
    pub fn publish(&self, topic: &str, payload: Vec<u8>, qos: &str) -> anyhow::Result<()> {
        let request = PublishRequest {
            topic: topic.to_string(),
            payload,
            qos: qos.to_string(),
        };
        self.outbound_tx.try_send(request).map_err(|e| {
            warn!(topic, error = %e, "unable to queue outbound publish");
            anyhow::anyhow!("outbound publish queue: {}", e)
        })
    }
}

/// Resolve once shutdown has been broadcast (or the broadcaster is gone).
pub async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
