use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

/// Delivery metrics of one outbox worker.
#[derive(Clone)]
pub struct OutboxMetrics {
    pub pending: IntGauge,
    pub oldest_pending_age_seconds: IntGauge,
    pub delivered: IntCounter,
    pub failed: IntCounter,
    pub retried: IntCounter,
}

fn gauge(name: &str, help: &str, service: &str) -> IntGauge {
    IntGauge::with_opts(Opts::new(name, help).const_label("service", service.to_string()))
        .expect("valid metric opts for outbox gauge")
}

fn counter(name: &str, help: &str, service: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help).const_label("service", service.to_string()))
        .expect("valid metric opts for outbox counter")
}

impl OutboxMetrics {
    /// Create the metrics and register them on the default registry.
    ///
    /// A second registration with the same service label only logs a warning;
    /// the returned handles still work but are not exported twice.
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let pending = gauge(
            "outbox_pending_count",
            "Number of outbox events waiting to be enqueued",
            service,
        );
        let oldest_pending_age_seconds = gauge(
            "outbox_oldest_pending_age_seconds",
            "Age in seconds of the oldest pending outbox event",
            service,
        );
        let delivered = counter(
            "outbox_delivered_total",
            "Total number of outbox events handed to the task queue",
            service,
        );
        let failed = counter(
            "outbox_failed_total",
            "Total number of outbox events given up on",
            service,
        );
        let retried = counter(
            "outbox_retried_total",
            "Total number of enqueue attempts that failed and will be retried",
            service,
        );

        for metric in [
            Box::new(pending.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(oldest_pending_age_seconds.clone()),
            Box::new(delivered.clone()),
            Box::new(failed.clone()),
            Box::new(retried.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register outbox metric: {}", e);
            }
        }

        Self {
            pending,
            oldest_pending_age_seconds,
            delivered,
            failed,
            retried,
        }
    }
}
