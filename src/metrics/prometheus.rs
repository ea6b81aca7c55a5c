//! Prometheus metrics registration and export.
//!
//! Each [`PipelineMetrics`] owns its registry, so independent orchestrators
//! (and tests) never share counters.

use std::sync::Arc;

use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Metric set for one orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    registry: Registry,
    runs_total: CounterVec,
    run_duration: HistogramVec,
    generation_attempts_total: CounterVec,
    generation_latency: HistogramVec,
    refinement_iterations: Histogram,
    safety_decisions_total: CounterVec,
}

impl PipelineMetrics {
    /// Creates and registers all metrics in a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns a `prometheus::Error` if a metric definition is invalid.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let runs_total = CounterVec::new(
            Opts::new("story_forge_runs_total", "Total pipeline runs"),
            &["mode", "outcome"],
        )?;

        let run_duration = HistogramVec::new(
            HistogramOpts::new(
                "story_forge_run_duration_seconds",
                "Pipeline run duration in seconds",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
            &["mode"],
        )?;

        let generation_attempts_total = CounterVec::new(
            Opts::new(
                "story_forge_generation_attempts_total",
                "Generation attempts by task and outcome",
            ),
            &["task", "outcome"],
        )?;

        let generation_latency = HistogramVec::new(
            HistogramOpts::new(
                "story_forge_generation_latency_seconds",
                "Latency of a single generation attempt in seconds",
            )
            .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
            &["task"],
        )?;

        let refinement_iterations = Histogram::with_opts(
            HistogramOpts::new(
                "story_forge_refinement_iterations",
                "Revisions performed per refinement loop",
            )
            .buckets(vec![0.0, 1.0, 2.0, 3.0, 5.0, 8.0]),
        )?;

        let safety_decisions_total = CounterVec::new(
            Opts::new(
                "story_forge_safety_decisions_total",
                "Safety gate decisions",
            ),
            &["decision"],
        )?;

        registry.register(Box::new(runs_total.clone()))?;
        registry.register(Box::new(run_duration.clone()))?;
        registry.register(Box::new(generation_attempts_total.clone()))?;
        registry.register(Box::new(generation_latency.clone()))?;
        registry.register(Box::new(refinement_iterations.clone()))?;
        registry.register(Box::new(safety_decisions_total.clone()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                runs_total,
                run_duration,
                generation_attempts_total,
                generation_latency,
                refinement_iterations,
                safety_decisions_total,
            }),
        })
    }

    /// Record a finished run.
    pub fn record_run(&self, mode: &str, outcome: &str, duration_secs: f64) {
        self.inner
            .runs_total
            .with_label_values(&[mode, outcome])
            .inc();
        self.inner
            .run_duration
            .with_label_values(&[mode])
            .observe(duration_secs);
    }

    /// Record one generation attempt.
    ///
    /// `outcome` is one of "success", "transient", "timeout", "terminal", "invalid".
    pub fn record_generation_attempt(&self, task: &str, outcome: &str, latency_secs: f64) {
        self.inner
            .generation_attempts_total
            .with_label_values(&[task, outcome])
            .inc();
        self.inner
            .generation_latency
            .with_label_values(&[task])
            .observe(latency_secs);
    }

    pub fn record_refinement_iterations(&self, iterations: u32) {
        self.inner
            .refinement_iterations
            .observe(f64::from(iterations));
    }

    pub fn record_safety_decision(&self, decision: &str) {
        self.inner
            .safety_decisions_total
            .with_label_values(&[decision])
            .inc();
    }

    /// Count of generation attempts recorded for `task` with `outcome`.
    pub fn generation_attempts(&self, task: &str, outcome: &str) -> u64 {
        self.inner
            .generation_attempts_total
            .with_label_values(&[task, outcome])
            .get() as u64
    }

    /// Count of runs recorded for `mode` with `outcome`.
    pub fn runs(&self, mode: &str, outcome: &str) -> u64 {
        self.inner
            .runs_total
            .with_label_values(&[mode, outcome])
            .get() as u64
    }

    /// Export all metrics in Prometheus text format.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# Error encoding metrics: {}\n", e);
        }

        String::from_utf8(buffer)
            .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
    }
}
