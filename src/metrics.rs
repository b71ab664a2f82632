use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// The relay's Prometheus registry and counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    relayed_entries: IntCounterVec,
    rejected_entries: IntCounterVec,
    injected_contexts: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, String> {
        Self::build().map_err(|e| format!("could not register metrics: {}", e))
    }

    fn build() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("logrelay".to_string()), None)?;

        let relayed_entries = IntCounterVec::new(
            Opts::new(
                "relayed_entries_total",
                "Log entries relayed, by severity and writer",
            ),
            &["severity", "writer"],
        )?;
        let rejected_entries = IntCounterVec::new(
            Opts::new("rejected_entries_total", "Log entries rejected, by reason"),
            &["reason"],
        )?;
        let injected_contexts = IntCounter::with_opts(Opts::new(
            "injected_trace_contexts_total",
            "Requests without trace context that got one injected",
        ))?;

        registry.register(Box::new(relayed_entries.clone()))?;
        registry.register(Box::new(rejected_entries.clone()))?;
        registry.register(Box::new(injected_contexts.clone()))?;
        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Metrics {
            inner: Arc::new(MetricsInner {
                registry,
                relayed_entries,
                rejected_entries,
                injected_contexts,
            }),
        })
    }

    pub fn inc_relayed(&self, severity: &str, writer: &str) {
        self.inner
            .relayed_entries
            .with_label_values(&[severity, writer])
            .inc();
    }

    pub fn inc_rejected(&self, reason: &str) {
        self.inner.rejected_entries.with_label_values(&[reason]).inc();
    }

    pub fn inc_injected_context(&self) {
        self.inner.injected_contexts.inc();
    }

    /// The text exposition format of all metrics.
    pub fn gather(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = vec![];
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# could not encode metrics: {}\n", e).into_bytes();
        }
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.inc_relayed("INFO", "stdout");
        metrics.inc_rejected("invalid_json");
        metrics.inc_injected_context();

        let text = String::from_utf8(metrics.gather()).unwrap();
        assert!(text
            .contains("logrelay_relayed_entries_total{severity=\"INFO\",writer=\"stdout\"} 1"));
        assert!(text.contains("logrelay_rejected_entries_total{reason=\"invalid_json\"} 1"));
        assert!(text.contains("logrelay_injected_trace_contexts_total 1"));
    }
}
