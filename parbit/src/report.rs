//! JSON measurement reports with schema versioning.
//!
//! The driver prints human-readable timing summaries to stdout; this
//! module is the machine-readable companion, so sweeps across
//! strategies and thread counts can be collected and plotted without
//! scraping text.

use serde::Serialize;

/// Current schema version for the JSON output format.
///
/// Increment on breaking changes to the structure below.
pub const SCHEMA_VERSION: u32 = 1;

/// One timed measurement within a run.
#[derive(Debug, Clone, Serialize)]
pub struct Measurement {
    /// What was measured, e.g. `"sequential"` or `"engine"`, possibly
    /// qualified by a sweep point like `"query_permille=50"`.
    pub label: String,
    /// Wall time in seconds.
    pub seconds: f64,
    /// Speedup versus the run's sequential measurement, when the
    /// comparison makes sense.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speedup: Option<f64>,
}

/// A complete run: configuration plus its measurements.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Schema version for format compatibility checking.
    pub schema_version: u32,
    /// Name of the tool producing the report.
    pub tool: &'static str,
    /// Version of the tool.
    pub tool_version: &'static str,
    /// Strategy that was exercised.
    pub strategy: String,
    /// Worker thread count.
    pub workers: usize,
    /// Tree size N.
    pub tree_size: usize,
    /// Operations per batch.
    pub batch_size: usize,
    /// Number of batches processed.
    pub num_batches: usize,
    /// All measurements, in the order they were taken.
    pub measurements: Vec<Measurement>,
}

impl RunReport {
    /// Creates an empty report for the given configuration.
    #[must_use]
    pub fn new(
        strategy: impl Into<String>,
        workers: usize,
        tree_size: usize,
        batch_size: usize,
        num_batches: usize,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            tool: "parbit",
            tool_version: env!("CARGO_PKG_VERSION"),
            strategy: strategy.into(),
            workers,
            tree_size,
            batch_size,
            num_batches,
            measurements: Vec::new(),
        }
    }

    /// Records a measurement.
    pub fn push(&mut self, label: impl Into<String>, seconds: f64, speedup: Option<f64>) {
        self.measurements.push(Measurement {
            label: label.into(),
            seconds,
            speedup,
        });
    }

    /// Serializes the report to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails (should not happen in
    /// practice).
    pub fn to_json_string(&self, pretty: bool) -> Result<String, serde_json::Error> {
        if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        }
    }
}
