pub mod analysis;
pub mod benchmark;
pub mod capture;
pub mod config;
pub mod record;
pub mod report;
pub mod trace;
pub mod writer;

pub use analysis::{DistributionMetrics, ExpertShare, LoadBalance};
pub use capture::{CaptureError, CaptureStatus, HeaderInfo, RoutingCapture, RoutingWeight};
pub use config::{CaptureConfig, ModelConfig, RoutingShape};
pub use record::{MetaRecord, RouteRecord, TraceRecord};
pub use report::{MetricsReport, render_text};
pub use trace::{ExpertHistogram, RouteTrace, TraceError};

use anyhow::{Context, Result};
use std::path::Path;

/// Reads a routing trace and computes its metrics report.
pub fn analyze_trace(path: &Path, strict: bool) -> Result<(RouteTrace, MetricsReport)> {
    let trace = RouteTrace::load(path)
        .with_context(|| format!("Failed to load routing trace at {:?}", path))?;
    if strict {
        trace.verify().context("Routing trace failed verification")?;
    }
    let report = MetricsReport::new(&trace);
    report.check_consistency()?;
    Ok((trace, report))
}
