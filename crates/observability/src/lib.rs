use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

#[derive(Debug, Default)]
pub struct AppMetrics {
    messages_total: AtomicU64,
    classified_total: AtomicU64,
    unknown_total: AtomicU64,
    missing_reply_total: AtomicU64,
    webhook_events_total: AtomicU64,
    outbound_failures_total: AtomicU64,
    total_latency_micros: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub messages_total: u64,
    pub classified_total: u64,
    pub unknown_total: u64,
    pub missing_reply_total: u64,
    pub webhook_events_total: u64,
    pub outbound_failures_total: u64,
    pub avg_latency_millis: f64,
}

impl AppMetrics {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_message(&self) {
        self.messages_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_classification(&self, unknown: bool) {
        self.classified_total.fetch_add(1, Ordering::Relaxed);
        if unknown {
            self.unknown_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_missing_reply(&self) {
        self.missing_reply_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_webhook_event(&self) {
        self.webhook_events_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_outbound_failure(&self) {
        self.outbound_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_latency(&self, duration: Duration) {
        self.total_latency_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let messages = self.messages_total.load(Ordering::Relaxed);
        let latency = self.total_latency_micros.load(Ordering::Relaxed);

        MetricsSnapshot {
            messages_total: messages,
            classified_total: self.classified_total.load(Ordering::Relaxed),
            unknown_total: self.unknown_total.load(Ordering::Relaxed),
            missing_reply_total: self.missing_reply_total.load(Ordering::Relaxed),
            webhook_events_total: self.webhook_events_total.load(Ordering::Relaxed),
            outbound_failures_total: self.outbound_failures_total.load(Ordering::Relaxed),
            avg_latency_millis: if messages == 0 {
                0.0
            } else {
                latency as f64 / messages as f64 / 1000.0
            },
        }
    }
}

pub fn init_tracing(service_name: &str) {
    TRACING_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}=info,teleassist_api=info,teleassist_agents=info",
                service_name
            ))
        });

        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .with_span_list(true)
            .init();
    });
}
