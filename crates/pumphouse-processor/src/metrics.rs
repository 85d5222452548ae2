//! Processor Metrics
//!
//! Prometheus metrics for one `EventProcessor`. Each processor owns its own
//! `Registry`, so several processors in one process (or one test binary) never
//! collide on metric names.
//!
//! ## Metrics
//!
//! - `pumphouse_events_processed_total{partition}`
//! - `pumphouse_process_errors_total{partition, kind}`
//! - `pumphouse_checkpoint_writes_total{result}` (written, failed, rejected)
//! - `pumphouse_claims_total{result}` (won, lost, relinquished)
//! - `pumphouse_coordination_cycles_total{result}` (ok, skipped)
//! - `pumphouse_active_pumps`

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct ProcessorMetrics {
    registry: Registry,
    pub events_processed: IntCounterVec,
    pub process_errors: IntCounterVec,
    pub checkpoint_writes: IntCounterVec,
    pub claims: IntCounterVec,
    pub coordination_cycles: IntCounterVec,
    pub active_pumps: IntGauge,
}

impl ProcessorMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let events_processed = IntCounterVec::new(
            Opts::new("pumphouse_events_processed_total", "Total events processed"),
            &["partition"],
        )
        .expect("metric can be created");

        let process_errors = IntCounterVec::new(
            Opts::new(
                "pumphouse_process_errors_total",
                "Total errors reported to partition processors",
            ),
            &["partition", "kind"],
        )
        .expect("metric can be created");

        let checkpoint_writes = IntCounterVec::new(
            Opts::new(
                "pumphouse_checkpoint_writes_total",
                "Total checkpoint writes by result",
            ),
            &["result"],
        )
        .expect("metric can be created");

        let claims = IntCounterVec::new(
            Opts::new("pumphouse_claims_total", "Total ownership claims by result"),
            &["result"],
        )
        .expect("metric can be created");

        let coordination_cycles = IntCounterVec::new(
            Opts::new(
                "pumphouse_coordination_cycles_total",
                "Total coordination cycles by result",
            ),
            &["result"],
        )
        .expect("metric can be created");

        let active_pumps = IntGauge::new("pumphouse_active_pumps", "Partition pumps running")
            .expect("metric can be created");

        registry
            .register(Box::new(events_processed.clone()))
            .expect("events_processed_total can be registered");
        registry
            .register(Box::new(process_errors.clone()))
            .expect("process_errors_total can be registered");
        registry
            .register(Box::new(checkpoint_writes.clone()))
            .expect("checkpoint_writes_total can be registered");
        registry
            .register(Box::new(claims.clone()))
            .expect("claims_total can be registered");
        registry
            .register(Box::new(coordination_cycles.clone()))
            .expect("coordination_cycles_total can be registered");
        registry
            .register(Box::new(active_pumps.clone()))
            .expect("active_pumps can be registered");

        Self {
            registry,
            events_processed,
            process_errors,
            checkpoint_writes,
            claims,
            coordination_cycles,
            active_pumps,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for ProcessorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registries_are_independent() {
        let a = ProcessorMetrics::new();
        let b = ProcessorMetrics::new();

        a.events_processed.with_label_values(&["0"]).inc_by(3);
        a.active_pumps.set(2);

        assert_eq!(a.events_processed.with_label_values(&["0"]).get(), 3);
        assert_eq!(b.events_processed.with_label_values(&["0"]).get(), 0);

        let text = a.gather_text();
        assert!(text.contains("pumphouse_events_processed_total{partition=\"0\"} 3"));
        assert!(text.contains("pumphouse_active_pumps 2"));
    }
}
