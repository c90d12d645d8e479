// HTTP handlers for the gateway's status surface. These only read the shared
// metrics; nothing here touches the ingestion pipeline.
use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, header::CONTENT_TYPE},
    response::Html,
};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;

use crate::context::GatewayContext;
use crate::metrics::GatewayMetrics;
use crate::page::Page;

/// What the status page reports.
#[derive(Clone)]
pub struct StatusInfo {
    pub started_at: DateTime<Utc>,
    pub client_id: String,
    pub metrics: GatewayMetrics,
}

impl StatusInfo {
    pub fn from_context(ctx: &GatewayContext) -> Self {
        StatusInfo {
            started_at: ctx.started_at,
            client_id: ctx.client_id.clone(),
            metrics: ctx.metrics.clone(),
        }
    }
}

pub async fn status_page(Extension(status): Extension<StatusInfo>) -> Html<String> {
    Html(render_status(&status, Utc::now()))
}

fn render_status(status: &StatusInfo, now: DateTime<Utc>) -> String {
    let mut page = Page::new("AFM");
    page.add_style_sheet("polaroid.css");
    page.add_meta("viewport", "width=device-width, initial-scale=1");
    page.add_meta("generator", concat!("device-gateway ", env!("CARGO_PKG_VERSION")));

    let uptime = (now - status.started_at).num_seconds().max(0);
    let metrics = &status.metrics;
    page.add_paragraph(&format!("Gateway: {}", status.client_id));
    page.add_paragraph(&format!(
        "Up since {} ({}s)",
        status.started_at.to_rfc3339(),
        uptime
    ));
    page.add_paragraph(&format!(
        "Messages received: {}, processed: {}, dropped: {}",
        metrics.messages_total.get(),
        metrics.processed_total(),
        metrics.messages_dropped.get()
    ));
    page.render()
}

/// Prometheus text-format metrics gathered from the shared `Registry`.
pub async fn metrics_handler(Extension(registry): Extension<Arc<Registry>>) -> (HeaderMap, String) {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    let body = String::from_utf8_lossy(&buffer).to_string();

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
        headers.insert(CONTENT_TYPE, value);
    }
    (headers, body)
}

pub async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn status() -> StatusInfo {
        let (ctx, _rx) = GatewayContext::new("gw-7").unwrap();
        StatusInfo::from_context(&ctx)
    }

    #[test]
    fn test_status_page_reports_counters() {
        let status = status();
        status.metrics.messages_total.inc_by(4);
        status.metrics.messages_dropped.inc();
        status
            .metrics
            .messages_processed
            .with_label_values(&["settings"])
            .inc_by(3);

        let html = render_status(&status, status.started_at + Duration::seconds(90));
        assert!(html.contains("<title>AFM</title>"));
        assert!(html.contains("href=\"polaroid.css\""));
        assert!(html.contains("Gateway: gw-7"));
        assert!(html.contains("(90s)"));
        assert!(html.contains("received: 4, processed: 3, dropped: 1"));
    }

    #[tokio::test]
    async fn test_metrics_handler_encodes_registry() {
        let (ctx, _rx) = GatewayContext::new("gw").unwrap();
        ctx.metrics.messages_total.inc();
        let (headers, body) = metrics_handler(Extension(ctx.registry.clone())).await;
        assert!(body.contains("gateway_messages_total 1"));
        assert!(headers.get(CONTENT_TYPE).is_some());
    }
}
