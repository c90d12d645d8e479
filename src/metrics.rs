// Prometheus counters shared by the pipeline and exposed on `/metrics`.
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

use crate::topics::Category;

#[derive(Clone)]
pub struct GatewayMetrics {
    pub messages_total: IntCounter,
    pub messages_dropped: IntCounter,
    pub messages_processed: IntCounterVec,
    pub publish_failures: IntCounter,
}

impl GatewayMetrics {
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let messages_total =
            IntCounter::new("gateway_messages_total", "Total MQTT messages received")?;
        let messages_dropped = IntCounter::new(
            "gateway_messages_dropped_total",
            "Messages dropped after a processing error",
        )?;
        let messages_processed = IntCounterVec::new(
            Opts::new(
                "gateway_messages_processed_total",
                "Messages dispatched successfully, by category",
            ),
            &["category"],
        )?;
        let publish_failures = IntCounter::new(
            "gateway_publish_failures_total",
            "Outbound MQTT publishes that failed",
        )?;

        registry.register(Box::new(messages_total.clone()))?;
        registry.register(Box::new(messages_dropped.clone()))?;
        registry.register(Box::new(messages_processed.clone()))?;
        registry.register(Box::new(publish_failures.clone()))?;

        Ok(GatewayMetrics {
            messages_total,
            messages_dropped,
            messages_processed,
            publish_failures,
        })
    }

    pub fn processed_total(&self) -> u64 {
        Category::PRECEDENCE
            .iter()
            .map(|c| self.messages_processed.with_label_values(&[c.keyword()]).get())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_gather() {
        let registry = Registry::new();
        let metrics = GatewayMetrics::register(&registry).unwrap();
        metrics.messages_total.inc();
        metrics.messages_processed.with_label_values(&["image"]).inc();
        metrics.messages_processed.with_label_values(&["settings"]).inc_by(2);

        assert_eq!(metrics.processed_total(), 3);
        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|mf| mf.name().to_string())
            .collect();
        assert!(names.contains(&"gateway_messages_total".to_string()));
        assert!(names.contains(&"gateway_messages_processed_total".to_string()));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        GatewayMetrics::register(&registry).unwrap();
        assert!(GatewayMetrics::register(&registry).is_err());
    }
}
