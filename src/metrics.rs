use crate::push::ConnectionState;
use crate::store::AppendOutcome;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub samples_total: CounterVec,
    pub fetch_errors_total: CounterVec,
    pub malformed_events_total: Counter,
    pub push_reconnects_total: Counter,
    pub scrape_count_total: Counter,
    pub tracked_entities: Gauge,
    pub online_entities: Gauge,
    pub push_connection_state: Gauge,
    pub push_degraded: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let samples_total = CounterVec::new(
            opts!(
                "fleetsync_samples_total",
                "Samples offered to the store by source and outcome"
            ),
            &["source", "outcome"],
        )?;
        let fetch_errors_total = CounterVec::new(
            opts!(
                "fleetsync_fetch_errors_total",
                "Failed pull requests by error kind"
            ),
            &["kind"],
        )?;
        let malformed_events_total = Counter::with_opts(opts!(
            "fleetsync_malformed_events_total",
            "Push frames dropped because they could not be decoded"
        ))?;
        let push_reconnects_total = Counter::with_opts(opts!(
            "fleetsync_push_reconnects_total",
            "Reconnect attempts made by the push channel"
        ))?;
        let scrape_count_total = Counter::with_opts(opts!(
            "fleetsync_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let tracked_entities = Gauge::with_opts(opts!(
            "fleetsync_tracked_entities",
            "Hosts currently tracked"
        ))?;
        let online_entities = Gauge::with_opts(opts!(
            "fleetsync_online_entities",
            "Tracked hosts whose latest sample is within the staleness threshold"
        ))?;
        let push_connection_state = Gauge::with_opts(opts!(
            "fleetsync_push_connection_state",
            "Push channel state (0 closed, 1 connecting, 2 open, 3 reconnecting)"
        ))?;
        let push_degraded = Gauge::with_opts(opts!(
            "fleetsync_push_degraded",
            "1 when the push channel gave up reconnecting"
        ))?;

        register(&registry, &samples_total)?;
        register(&registry, &fetch_errors_total)?;
        register(&registry, &malformed_events_total)?;
        register(&registry, &push_reconnects_total)?;
        register(&registry, &scrape_count_total)?;
        register(&registry, &tracked_entities)?;
        register(&registry, &online_entities)?;
        register(&registry, &push_connection_state)?;
        register(&registry, &push_degraded)?;

        Ok(Arc::new(Self {
            registry,
            samples_total,
            fetch_errors_total,
            malformed_events_total,
            push_reconnects_total,
            scrape_count_total,
            tracked_entities,
            online_entities,
            push_connection_state,
            push_degraded,
        }))
    }

    pub fn record_append(&self, source: &str, outcome: AppendOutcome) {
        self.samples_total
            .with_label_values(&[source, outcome.as_label()])
            .inc();
    }

    pub fn inc_fetch_error(&self, kind: &str) {
        self.fetch_errors_total.with_label_values(&[kind]).inc();
    }

    pub fn inc_malformed_event(&self) {
        self.malformed_events_total.inc();
    }

    pub fn inc_scrape_count(&self) {
        self.scrape_count_total.inc();
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        let code = match state {
            ConnectionState::Closed { .. } => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Open => 2.0,
            ConnectionState::Reconnecting { .. } => 3.0,
        };
        self.push_connection_state.set(code);
        self.push_degraded
            .set(if state.is_degraded() { 1.0 } else { 0.0 });
        if matches!(state, ConnectionState::Reconnecting { .. }) {
            self.push_reconnects_total.inc();
        }
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RejectReason;

    #[test]
    fn encodes_registered_series() {
        let metrics = Metrics::new().expect("metrics init");
        metrics.record_append("push", AppendOutcome::Inserted);
        metrics.record_append("poll", AppendOutcome::Rejected(RejectReason::TooOld));
        metrics.set_connection_state(ConnectionState::Reconnecting { attempt: 1 });

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(text.contains("fleetsync_samples_total{outcome=\"inserted\",source=\"push\"} 1"));
        assert!(text.contains("outcome=\"too_old\""));
        assert!(text.contains("fleetsync_push_connection_state 3"));
        assert!(text.contains("fleetsync_push_reconnects_total 1"));
    }

    #[test]
    fn degraded_gauge_follows_terminal_close() {
        let metrics = Metrics::new().expect("metrics init");
        metrics.set_connection_state(ConnectionState::Closed { degraded: true });
        assert_eq!(metrics.push_degraded.get(), 1.0);
        metrics.set_connection_state(ConnectionState::Connecting);
        assert_eq!(metrics.push_degraded.get(), 0.0);
    }
}
