// MQTT session. Connects to the broker with `rumqttc`, subscribes to the
// gateway topic namespace and then runs one loop that forwards incoming
// publishes to the orchestrator, sends queued outbound publishes and watches
// for the shutdown broadcast.
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::config::MqttSettings;
use crate::context::{GatewayContext, InboundMessage, PublishRequest, wait_for_shutdown};
use crate::metrics::GatewayMetrics;

/// Upper bound on the clean disconnect during shutdown.
pub const DISCONNECT_WAIT: Duration = Duration::from_millis(250);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 10;

pub fn mqtt_options(settings: &MqttSettings) -> MqttOptions {
    let mut opts = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    opts.set_keep_alive(Duration::from_secs(5));
    opts.set_clean_session(true);
    if let Some((user, pass)) = &settings.credentials {
        opts.set_credentials(user, pass);
    }
    opts
}

/// "0", "1" and "2" map to their QoS levels; anything else falls back to
/// at-most-once.
pub fn parse_qos(raw: &str) -> QoS {
    match raw.trim().parse::<u8>() {
        Ok(0) => QoS::AtMostOnce,
        Ok(1) => QoS::AtLeastOnce,
        Ok(2) => QoS::ExactlyOnce,
        _ => {
            warn!(qos = raw, "unsupported qos value, publishing at qos 0");
            QoS::AtMostOnce
        }
    }
}

pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    inbound: mpsc::Sender<InboundMessage>,
    shutdown: watch::Receiver<bool>,
    metrics: GatewayMetrics,
}

impl MqttSession {
    /// Connect and subscribe. Any failure before the broker acknowledges the
    /// connection is returned to the caller, which treats it as fatal.
    pub async fn connect(settings: &MqttSettings, ctx: &GatewayContext) -> anyhow::Result<Self> {
        info!(
            host = %settings.host,
            port = settings.port,
            client_id = %settings.client_id,
            authenticated = settings.credentials.is_some(),
            "connecting to MQTT broker"
        );
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(settings), REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    debug!(?ack, "broker acknowledged connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(anyhow::anyhow!(
                        "unable to connect to MQTT broker at {}:{}: {}",
                        settings.host,
                        settings.port,
                        e
                    ));
                }
            }
        }

        client.subscribe(&settings.topic, QoS::AtLeastOnce).await?;
        info!(topic = %settings.topic, "subscribed to MQTT topic");

        Ok(MqttSession {
            client,
            eventloop,
            inbound: ctx.inbound_tx.clone(),
            shutdown: ctx.shutdown_listener(),
            metrics: ctx.metrics.clone(),
        })
    }

    /// Run until the shutdown broadcast, then disconnect.
    pub async fn run(mut self, mut outbound: mpsc::Receiver<PublishRequest>) {
        let shutdown = wait_for_shutdown(self.shutdown.clone());
        tokio::pin!(shutdown);
        let mut outbound_open = true;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                request = outbound.recv(), if outbound_open => match request {
                    Some(request) => self.publish(request),
                    None => {
                        debug!("outbound publish queue closed");
                        outbound_open = false;
                    }
                },

                ev = self.eventloop.poll() => match ev {
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        self.metrics.messages_total.inc();
                        debug!(topic = %p.topic, bytes = p.payload.len(), "mqtt publish received");
                        let message = InboundMessage {
                            topic: p.topic.clone(),
                            payload: p.payload.to_vec(),
                        };
                        // Waits for the orchestrator to take the message.
                        if self.inbound.send(message).await.is_err() {
                            debug!(topic = %p.topic, "orchestrator no longer receiving; message discarded");
                        }
                    }
                    Ok(Event::Incoming(i)) => debug!(incoming = ?i, "mqtt incoming"),
                    Ok(Event::Outgoing(o)) => debug!(outgoing = ?o, "mqtt outgoing"),
                    Err(e) => {
                        warn!(error = %e, "mqtt connection error; retrying");
                        tokio::select! {
                            _ = time::sleep(ERROR_BACKOFF) => {}
                            _ = &mut shutdown => break,
                        }
                    }
                },
            }
        }

        self.disconnect().await;
    }

    fn publish(&self, request: PublishRequest) {
        let qos = parse_qos(&request.qos);
        // The request queue is drained by this same task, so never wait on it.
        if let Err(e) = self
            .client
            .try_publish(request.topic.as_str(), qos, false, request.payload)
        {
            self.metrics.publish_failures.inc();
            error!(topic = %request.topic, error = %e, "mqtt publish failed");
        }
    }

    async fn disconnect(self) {
        let MqttSession {
            client,
            mut eventloop,
            ..
        } = self;

        let attempt = time::timeout(DISCONNECT_WAIT, async move {
            if let Err(e) = client.try_disconnect() {
                return Err(anyhow::anyhow!(e));
            }
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(anyhow::anyhow!(e)),
                }
            }
        })
        .await;

        match attempt {
            Ok(Ok(())) => info!("disconnected from MQTT broker"),
            Ok(Err(e)) => warn!(error = %e, "mqtt disconnect failed"),
            Err(_) => warn!(
                wait_ms = DISCONNECT_WAIT.as_millis() as u64,
                "mqtt disconnect timed out"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TOPIC;

    fn settings(port: u16) -> MqttSettings {
        MqttSettings {
            host: "127.0.0.1".into(),
            port,
            credentials: Some(("gw".into(), "secret".into())),
            topic: DEFAULT_TOPIC.into(),
            client_id: "gateway-test".into(),
        }
    }

    #[test]
    fn test_parse_qos() {
        assert_eq!(parse_qos("0"), QoS::AtMostOnce);
        assert_eq!(parse_qos("1"), QoS::AtLeastOnce);
        assert_eq!(parse_qos(" 2 "), QoS::ExactlyOnce);
        assert_eq!(parse_qos("3"), QoS::AtMostOnce);
        assert_eq!(parse_qos("high"), QoS::AtMostOnce);
        assert_eq!(parse_qos(""), QoS::AtMostOnce);
    }

    #[test]
    fn test_options_from_settings() {
        let opts = mqtt_options(&settings(1884));
        assert_eq!(opts.client_id(), "gateway-test");
        assert_eq!(opts.broker_address(), ("127.0.0.1".to_string(), 1884));
        assert_eq!(opts.keep_alive(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let (ctx, _rx) = GatewayContext::new("gateway-test").unwrap();
        // Nothing listens on port 1.
        let res = MqttSession::connect(&settings(1), &ctx).await;
        let err = res.err().expect("connect should fail");
        assert!(err.to_string().contains("127.0.0.1:1"));
    }
}
