//! Prometheus metrics.
//!
//! One [`Metrics`] value is created at startup and handed to each
//! component as an explicit `Arc<Metrics>` dependency. The registry is
//! owned by that value rather than a process-global, so tests can create
//! as many independent instances as they like and nothing registers
//! metrics behind the caller's back.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

/// Process-wide observability sink.
pub struct Metrics {
    registry: Registry,
    /// Update runs by result and repository.
    pub update_runs: CounterVec,
    /// Wall-clock duration of one update run in seconds.
    pub run_duration: Histogram,
    /// Entries currently waiting in the shared queue.
    pub queue_depth: Gauge,
    /// Update runs currently executing in this process.
    pub jobs_in_progress: Gauge,
}

impl Metrics {
    /// Creates and registers all metrics on a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let update_runs = CounterVec::new(
            Opts::new("renofleet_update_runs", "Number of update runs"),
            &["result", "repo"],
        )?;

        let run_duration = Histogram::with_opts(
            HistogramOpts::new(
                "renofleet_update_run_duration_seconds",
                "Duration of one update run in seconds",
            )
            .buckets(vec![30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]),
        )?;

        let queue_depth = Gauge::new(
            "renofleet_queue_depth",
            "Entries waiting in the shared job queue",
        )?;

        let jobs_in_progress = Gauge::new(
            "renofleet_jobs_in_progress",
            "Update runs currently executing in this process",
        )?;

        registry.register(Box::new(update_runs.clone()))?;
        registry.register(Box::new(run_duration.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(jobs_in_progress.clone()))?;

        Ok(Self {
            registry,
            update_runs,
            run_duration,
            queue_depth,
            jobs_in_progress,
        })
    }

    /// Renders all registered metrics in the Prometheus text format.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# error encoding metrics: {}\n", e);
        }

        String::from_utf8(buffer).unwrap_or_else(|e| format!("# metrics not valid UTF-8: {}\n", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_instances() {
        // Two instances must not clash; nothing global is registered.
        let a = Metrics::new().expect("first instance");
        let b = Metrics::new().expect("second instance");

        a.update_runs.with_label_values(&["ok", "p1/r1"]).inc();
        assert!((b.queue_depth.get() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_export_contains_recorded_runs() {
        let metrics = Metrics::new().expect("metrics");
        metrics.update_runs.with_label_values(&["ok", "p1/r1"]).inc();
        metrics
            .update_runs
            .with_label_values(&["error", "p1/r2"])
            .inc();
        metrics.jobs_in_progress.set(3.0);

        let out = metrics.export();
        assert!(out.contains("renofleet_update_runs"));
        assert!(out.contains("p1/r1"));
        assert!(out.contains("renofleet_jobs_in_progress 3"));
    }
}
