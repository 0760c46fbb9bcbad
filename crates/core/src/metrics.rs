use anyhow::Result;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Metric set for the gateway core.
///
/// Constructed once at startup and shared by handle; nothing in the core
/// registers metrics globally.
pub struct Metrics {
    registry: Registry,

    /// Pipelines started successfully
    pub pipeline_starts: IntCounter,
    /// Pipeline start rejections by reason
    pub pipeline_rejects: IntCounterVec,
    /// Currently running encoder processes
    pub live_processes: IntGauge,
    /// Bus messages dropped on full subscriber buffers, by topic
    pub bus_dropped: IntCounterVec,
    /// Admission requests refused
    pub admission_rejected: IntCounter,
    /// Circuit breaker transitions, by target state
    pub breaker_transitions: IntCounterVec,
    /// Watchdog timeouts and stalls
    pub watchdog_failures: IntCounterVec,
    /// Preflight failures by reason
    pub preflight_failures: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let pipeline_starts = IntCounter::with_opts(Opts::new(
            "tunergate_pipeline_starts_total",
            "Pipelines started successfully",
        ))?;
        let pipeline_rejects = IntCounterVec::new(
            Opts::new(
                "tunergate_pipeline_rejects_total",
                "Pipeline start rejections",
            ),
            &["reason"],
        )?;
        let live_processes = IntGauge::with_opts(Opts::new(
            "tunergate_live_processes",
            "Currently running encoder processes",
        ))?;
        let bus_dropped = IntCounterVec::new(
            Opts::new(
                "tunergate_bus_dropped_total",
                "Messages dropped on full subscriber buffers",
            ),
            &["topic"],
        )?;
        let admission_rejected = IntCounter::with_opts(Opts::new(
            "tunergate_admission_rejected_total",
            "Admission requests refused",
        ))?;
        let breaker_transitions = IntCounterVec::new(
            Opts::new(
                "tunergate_breaker_transitions_total",
                "Circuit breaker state transitions",
            ),
            &["state"],
        )?;
        let watchdog_failures = IntCounterVec::new(
            Opts::new(
                "tunergate_watchdog_failures_total",
                "Watchdog timeouts and stalls",
            ),
            &["kind"],
        )?;
        let preflight_failures = IntCounterVec::new(
            Opts::new(
                "tunergate_preflight_failures_total",
                "Upstream preflight failures",
            ),
            &["reason"],
        )?;

        registry.register(Box::new(pipeline_starts.clone()))?;
        registry.register(Box::new(pipeline_rejects.clone()))?;
        registry.register(Box::new(live_processes.clone()))?;
        registry.register(Box::new(bus_dropped.clone()))?;
        registry.register(Box::new(admission_rejected.clone()))?;
        registry.register(Box::new(breaker_transitions.clone()))?;
        registry.register(Box::new(watchdog_failures.clone()))?;
        registry.register(Box::new(preflight_failures.clone()))?;

        Ok(Arc::new(Self {
            registry,
            pipeline_starts,
            pipeline_rejects,
            live_processes,
            bus_dropped,
            admission_rejected,
            breaker_transitions,
            watchdog_failures,
            preflight_failures,
        }))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_once() {
        let m = Metrics::new().unwrap();
        m.pipeline_starts.inc();
        m.bus_dropped.with_label_values(&["session.stop"]).inc();
        assert_eq!(m.pipeline_starts.get(), 1);
        assert_eq!(m.bus_dropped.with_label_values(&["session.stop"]).get(), 1);
        assert!(m.registry().gather().len() >= 2);
    }
}
