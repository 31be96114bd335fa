use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::processor::ProcessorError;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Counters
    pub webhook_events_total: IntCounterVec,
    pub webhook_signature_failures_total: IntCounterVec,
    pub processor_calls_total: IntCounterVec,
    pub sweeper_redispatch_total: IntCounterVec,
    pub subscription_transitions_rejected_total: IntCounterVec,
    pub ledger_transactions_total: IntCounterVec,

    // Histograms
    pub http_request_duration_seconds: HistogramVec,

    // Dependency gauges
    pub dep_up: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let webhook_events_total = IntCounterVec::new(
            Opts::new("reconciliation_webhook_events_total", "Webhook events by outcome"),
            &["event_type", "outcome"], // processed|failed|dead_lettered|duplicate|in_flight|unhandled
        )?;

        let webhook_signature_failures_total = IntCounterVec::new(
            Opts::new(
                "reconciliation_webhook_signature_failures_total",
                "Webhook deliveries rejected before processing",
            ),
            &["reason"], // missing|malformed|expired|mismatch
        )?;

        let processor_calls_total = IntCounterVec::new(
            Opts::new("reconciliation_processor_calls_total", "Payment processor API calls"),
            &["operation", "result"], // ok|client_error|server_error|transport_error
        )?;

        let sweeper_redispatch_total = IntCounterVec::new(
            Opts::new(
                "reconciliation_sweeper_redispatch_total",
                "Events re-dispatched by the retry sweeper",
            ),
            &["result"], // processed|failed|dead_lettered|skipped
        )?;

        let subscription_transitions_rejected_total = IntCounterVec::new(
            Opts::new(
                "reconciliation_subscription_transitions_rejected_total",
                "Subscription status changes outside the lifecycle graph",
            ),
            &["from", "to"],
        )?;

        let ledger_transactions_total = IntCounterVec::new(
            Opts::new("reconciliation_ledger_transactions_total", "Ledger append attempts"),
            &["kind", "result"], // recorded|duplicate
        )?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "HTTP request duration seconds"),
            &["path", "method", "status"],
        )?;

        let dep_up = IntGaugeVec::new(
            Opts::new("reconciliation_dependency_up", "Dependency up gauge"),
            &["dep"], // db
        )?;

        registry.register(Box::new(webhook_events_total.clone()))?;
        registry.register(Box::new(webhook_signature_failures_total.clone()))?;
        registry.register(Box::new(processor_calls_total.clone()))?;
        registry.register(Box::new(sweeper_redispatch_total.clone()))?;
        registry.register(Box::new(subscription_transitions_rejected_total.clone()))?;
        registry.register(Box::new(ledger_transactions_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(dep_up.clone()))?;

        Ok(Self {
            registry,
            webhook_events_total,
            webhook_signature_failures_total,
            processor_calls_total,
            sweeper_redispatch_total,
            subscription_transitions_rejected_total,
            ledger_transactions_total,
            http_request_duration_seconds,
            dep_up,
        })
    }

    /// Count a processor call by outcome class
    pub fn record_processor_call<T>(&self, operation: &str, result: &Result<T, ProcessorError>) {
        let label = match result {
            Ok(_) => "ok",
            Err(e) if e.is_client_error() => "client_error",
            Err(e) if e.is_server_error() => "server_error",
            Err(_) => "transport_error",
        };
        self.processor_calls_total
            .with_label_values(&[operation, label])
            .inc();
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}
