//! Metrics module for Prometheus-based monitoring.
//!
//! Records pipeline runs, generation attempts, refinement depth and safety
//! decisions for one orchestrator.
//!
//! ```
//! use story_forge::metrics::PipelineMetrics;
//!
//! let metrics = PipelineMetrics::new().expect("valid metric definitions");
//! metrics.record_run("question", "success", 0.8);
//! assert!(metrics.export().contains("story_forge_runs_total"));
//! ```

pub mod prometheus;

pub use self::prometheus::PipelineMetrics;
