// The processing loop. A single task takes inbound messages one at a time and
// runs them through classification, decoding and dispatch, until a
// termination signal moves it into draining: broadcast shutdown, stop
// accepting messages, wait for the supervised tasks, then report how the
// process should exit.
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::{GatewayContext, InboundMessage};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::metrics::GatewayMetrics;
use crate::topics::{Category, decode_message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationSignal::Interrupt => f.write_str("SIGINT"),
            TerminationSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopCause {
    Signal(TerminationSignal),
    SignalSourceClosed,
    InboundClosed,
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCause::Signal(sig) => write!(f, "signal {}", sig),
            StopCause::SignalSourceClosed => f.write_str("signal source closed"),
            StopCause::InboundClosed => f.write_str("inbound message channel closed"),
        }
    }
}

struct Supervised {
    name: &'static str,
    handle: JoinHandle<()>,
}

pub struct Orchestrator {
    dispatcher: Dispatcher,
    inbound: mpsc::Receiver<InboundMessage>,
    signals: mpsc::Receiver<TerminationSignal>,
    shutdown: Arc<watch::Sender<bool>>,
    metrics: GatewayMetrics,
    tasks: Vec<Supervised>,
    state: State,
}

impl Orchestrator {
    pub fn new(
        ctx: &GatewayContext,
        dispatcher: Dispatcher,
        inbound: mpsc::Receiver<InboundMessage>,
        signals: mpsc::Receiver<TerminationSignal>,
    ) -> Self {
        Orchestrator {
            dispatcher,
            inbound,
            signals,
            shutdown: ctx.shutdown_sender(),
            metrics: ctx.metrics.clone(),
            tasks: Vec::new(),
            state: State::Running,
        }
    }

    /// Register a task that must finish before the orchestrator stops.
    pub fn supervise(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.push(Supervised { name, handle });
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Run to completion. An interrupt is a clean stop; every other cause is
    /// returned as an error.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("orchestrator running");
        let cause = self.process().await;

        self.state = State::Draining;
        info!(state = ?self.state, cause = %cause, "shutdown requested");
        self.drain().await;

        self.state = State::Stopped;
        info!(state = ?self.state, cause = %cause, "all tasks finished");
        match cause {
            StopCause::Signal(TerminationSignal::Interrupt) => Ok(()),
            other => Err(anyhow::anyhow!("shutting down due to {}", other)),
        }
    }

    async fn process(&mut self) -> StopCause {
        loop {
            tokio::select! {
                biased;

                signal = self.signals.recv() => {
                    return match signal {
                        Some(sig) => StopCause::Signal(sig),
                        None => StopCause::SignalSourceClosed,
                    };
                }

                message = self.inbound.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => return StopCause::InboundClosed,
                },
            }
        }
    }

    async fn handle_message(&self, message: InboundMessage) {
        let topic = message.topic;
        debug!(topic = %topic, bytes = message.payload.len(), "processing message");

        match self.process_message(&topic, message.payload).await {
            Ok(category) => {
                self.metrics
                    .messages_processed
                    .with_label_values(&[category.keyword()])
                    .inc();
            }
            Err(e) => {
                self.metrics.messages_dropped.inc();
                warn!(topic = %topic, error = %e, "dropping message");
            }
        }
    }

    async fn process_message(&self, topic: &str, payload: Vec<u8>) -> Result<Category> {
        let data = decode_message(topic, payload)?;
        let category = data.category();
        let device = data.device_id().to_string();
        let outcome = self.dispatcher.dispatch(data).await?;
        debug!(topic, device = %device, ?outcome, "dispatched");
        Ok(category)
    }

    async fn drain(&mut self) {
        self.shutdown.send_replace(true);
        // Fails any delivery the MQTT session is still waiting on.
        self.inbound.close();

        for task in self.tasks.drain(..) {
            match task.handle.await {
                Ok(()) => info!(task = task.name, "task finished"),
                Err(e) => error!(task = task.name, error = %e, "task ended abnormally"),
            }
        }
    }
}

/// Forward the first SIGINT or SIGTERM to the orchestrator.
#[cfg(unix)]
pub fn spawn_signal_listener(
    tx: mpsc::Sender<TerminationSignal>,
) -> anyhow::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(tokio::spawn(async move {
        let received = tokio::select! {
            _ = sigint.recv() => TerminationSignal::Interrupt,
            _ = sigterm.recv() => TerminationSignal::Terminate,
        };
        info!(signal = %received, "termination signal received");
        let _ = tx.send(received).await;
    }))
}

#[cfg(not(unix))]
pub fn spawn_signal_listener(
    tx: mpsc::Sender<TerminationSignal>,
) -> anyhow::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "unable to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received");
        let _ = tx.send(TerminationSignal::Interrupt).await;
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{GatewayReceivers, wait_for_shutdown};
    use crate::db::{DbHandle, start_db_worker};
    use crate::models::Device;
    use duckdb::types::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    struct Harness {
        ctx: GatewayContext,
        db: DbHandle,
        signals: mpsc::Sender<TerminationSignal>,
        orchestrator: Orchestrator,
        _cache: TempDir,
    }

    async fn harness() -> Harness {
        let (ctx, GatewayReceivers { inbound, .. }) = GatewayContext::new("test").unwrap();
        let (db, _worker) = start_db_worker(None, None).await.unwrap();
        let cache = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(db.clone(), cache.path());
        let (signals, signal_rx) = mpsc::channel(1);
        let orchestrator = Orchestrator::new(&ctx, dispatcher, inbound, signal_rx);
        Harness {
            ctx,
            db,
            signals,
            orchestrator,
            _cache: cache,
        }
    }

    // Stands in for the MQTT session and the HTTP server: finishes only after
    // the shutdown broadcast.
    fn fake_worker(ctx: &GatewayContext, done: Arc<AtomicBool>) -> JoinHandle<()> {
        let rx = ctx.shutdown_listener();
        tokio::spawn(async move {
            wait_for_shutdown(rx).await;
            done.store(true, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_interrupt_stops_cleanly_after_workers() {
        let mut h = harness().await;
        assert_eq!(h.orchestrator.state(), State::Running);

        let mqtt_done = Arc::new(AtomicBool::new(false));
        let http_done = Arc::new(AtomicBool::new(false));
        h.orchestrator.supervise("mqtt", fake_worker(&h.ctx, mqtt_done.clone()));
        h.orchestrator.supervise("http", fake_worker(&h.ctx, http_done.clone()));

        h.signals.send(TerminationSignal::Interrupt).await.unwrap();
        let res = timeout(Duration::from_secs(2), h.orchestrator.run()).await.unwrap();

        assert!(res.is_ok());
        assert!(mqtt_done.load(Ordering::SeqCst));
        assert!(http_done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_terminate_is_an_error() {
        let h = harness().await;
        h.signals.send(TerminationSignal::Terminate).await.unwrap();
        let err = h.orchestrator.run().await.unwrap_err();
        assert!(err.to_string().contains("SIGTERM"));
    }

    #[tokio::test]
    async fn test_closed_signal_source_is_an_error() {
        let h = harness().await;
        drop(h.signals);
        let err = h.orchestrator.run().await.unwrap_err();
        assert!(err.to_string().contains("signal source closed"));
    }

    #[tokio::test]
    async fn test_bad_messages_do_not_stop_processing() {
        let h = harness().await;
        let inbound = h.ctx.inbound_tx.clone();
        let signals = h.signals.clone();
        let metrics = h.ctx.metrics.clone();

        let run = tokio::spawn(h.orchestrator.run());

        let messages = [
            ("too/short", b"{}".to_vec()),
            ("afm/v1/unknown/dev1", b"{}".to_vec()),
            ("afm/v1/image/dev1", vec![1, 2, 3]),
            ("afm/v1/settings/dev-42", br#"{"model":"m1"}"#.to_vec()),
        ];
        for (topic, payload) in messages {
            inbound
                .send(InboundMessage {
                    topic: topic.to_string(),
                    payload,
                })
                .await
                .unwrap();
        }

        // Signals take priority over queued messages, so let the last one land.
        timeout(Duration::from_secs(2), async {
            while metrics.messages_dropped.get() + metrics.processed_total() < 4 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        signals.send(TerminationSignal::Interrupt).await.unwrap();
        let res = timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
        assert!(res.is_ok());

        assert_eq!(metrics.messages_dropped.get(), 3);
        assert_eq!(
            metrics.messages_processed.with_label_values(&["settings"]).get(),
            1
        );
        let device: Option<Device> = h
            .db
            .load_by_field(Value::Text("dev-42".into()))
            .await
            .unwrap();
        assert_eq!(device.unwrap().model, "m1");
    }

    #[tokio::test]
    async fn test_draining_releases_pending_delivery() {
        let h = harness().await;
        let inbound = h.ctx.inbound_tx.clone();

        // Fill the single slot, then park a second delivery behind it.
        inbound
            .send(InboundMessage {
                topic: "afm/v1/video/dev1".into(),
                payload: vec![],
            })
            .await
            .unwrap();
        let pending = tokio::spawn(async move {
            inbound
                .send(InboundMessage {
                    topic: "afm/v1/audio/dev1".into(),
                    payload: vec![],
                })
                .await
        });

        h.signals.send(TerminationSignal::Interrupt).await.unwrap();
        h.orchestrator.run().await.unwrap();

        let delivery = timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
        assert!(delivery.is_err());
    }
}
