// file: src/report.rs
// description: Persists expert usage metrics as JSON and renders the textual analysis summary.
// author: cipher-rc5

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::analysis::{DistributionMetrics, LoadBalance};
use crate::record::MetaRecord;
use crate::trace::RouteTrace;

/// Metrics artifact consumed by the plotting step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    #[serde(flatten)]
    pub metrics: DistributionMetrics,
    pub load_balance: LoadBalance,
    pub tokens_processed: usize,
    pub requests: usize,
    pub expert_counts: Vec<u64>,
}

impl MetricsReport {
    pub fn new(trace: &RouteTrace) -> Self {
        let histogram = trace.histogram();
        let metrics = DistributionMetrics::compute(&histogram);
        Self {
            load_balance: metrics.load_balance(),
            metrics,
            tokens_processed: trace.tokens(),
            requests: trace.request_count(),
            expert_counts: histogram.counts().to_vec(),
        }
    }

    pub fn check_consistency(&self) -> Result<()> {
        let m = &self.metrics;
        let top_sum: u64 = m.top_3_experts.iter().map(|e| e.count).sum();
        anyhow::ensure!(
            top_sum <= m.total_selections,
            "top-3 selections {} exceed total {}",
            top_sum,
            m.total_selections
        );
        let hist_sum: u64 = self.expert_counts.iter().sum();
        anyhow::ensure!(
            hist_sum == m.total_selections,
            "histogram sums to {} but total_selections is {}",
            hist_sum,
            m.total_selections
        );
        anyhow::ensure!(
            self.expert_counts.len() == m.num_experts,
            "histogram has {} experts but num_experts is {}",
            self.expert_counts.len(),
            m.num_experts
        );
        anyhow::ensure!(
            (0.0..=1.0 + 1e-9).contains(&m.normalized_entropy),
            "normalized entropy {} outside [0, 1]",
            m.normalized_entropy
        );
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file at {:?}", path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .with_context(|| format!("Failed to write metrics to {:?}", path))?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open metrics file at {:?}", path))?;
        serde_json::from_reader(file)
            .with_context(|| format!("Failed to parse metrics file at {:?}", path))
    }
}

pub fn render_text(meta: &MetaRecord, report: &MetricsReport) -> String {
    let m = &report.metrics;
    let rule = "=".repeat(60);
    let mut out = String::new();

    let _ = writeln!(out, "Model: {}", meta.model_id);
    let _ = writeln!(out, "Layers logged: {:?}", meta.layers_logged);
    let _ = writeln!(out, "Top-k: {}", meta.top_k);
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "EXPERT USAGE ANALYSIS");
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "Total expert selections: {}", m.total_selections);
    let _ = writeln!(out, "Number of experts: {}", m.num_experts);
    let _ = writeln!(out, "Tokens processed: {}", report.tokens_processed);
    let _ = writeln!(out, "Requests: {}", report.requests);

    if !m.has_data() {
        let _ = writeln!(out, "\nNo expert selections recorded.");
        let _ = writeln!(out, "{rule}");
        return out;
    }

    let _ = writeln!(out, "\nTop-3 Experts:");
    for (rank, e) in m.top_3_experts.iter().enumerate() {
        let _ = writeln!(
            out,
            "  #{}: Expert {:2} - {:5} selections ({:6.2}%)",
            rank + 1,
            e.expert_id,
            e.count,
            e.probability * 100.0
        );
    }

    let _ = writeln!(out, "\nDistribution Metrics:");
    let _ = writeln!(out, "  Shannon Entropy: {:.4} bits", m.shannon_entropy_bits);
    let _ = writeln!(out, "  Max Entropy:     {:.4} bits", m.max_entropy_bits);
    let _ = writeln!(out, "  Normalized:      {:.4} (load balance)", m.normalized_entropy);
    let _ = writeln!(out, "\n  Interpretation: {}", report.load_balance);
    let _ = writeln!(out, "{rule}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RouteRecord;

    fn trace(ids: &[[u32; 2]]) -> RouteTrace {
        RouteTrace {
            meta: MetaRecord {
                model_id: "Qwen/Qwen1.5-MoE-A2.7B-Chat".into(),
                engine_version: "e".into(),
                runtime_version: "r".into(),
                device: "cuda".into(),
                seed: Some(1234),
                layers_logged: vec![0],
                top_k: 2,
                num_experts: 4,
            },
            routes: ids
                .iter()
                .enumerate()
                .map(|(i, ids)| RouteRecord {
                    req_id: format!("r{}", i / 2),
                    token_idx: (i % 2) as u64,
                    layer: 0,
                    topk_ids: ids.to_vec(),
                    topk_weights: vec![0.6, 0.4],
                })
                .collect(),
        }
    }

    #[test]
    fn report_is_self_consistent() {
        let report = MetricsReport::new(&trace(&[[0, 1], [1, 2], [0, 0]]));
        report.check_consistency().unwrap();
        assert_eq!(report.expert_counts, vec![3, 2, 1]);
        assert_eq!(report.tokens_processed, 3);
        assert_eq!(report.requests, 2);
    }

    #[test]
    fn inconsistent_report_is_rejected() {
        let mut report = MetricsReport::new(&trace(&[[0, 1]]));
        report.expert_counts.push(5);
        assert!(report.check_consistency().is_err());
    }

    #[test]
    fn json_keeps_flat_metric_keys() {
        let report = MetricsReport::new(&trace(&[[3, 1]]));
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["total_selections"], 2);
        assert_eq!(value["num_experts"], 4);
        assert_eq!(value["top_3_experts"][0]["expert_id"], 1);
        assert_eq!(value["load_balance"], "high_specialization");
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("expert_metrics.json");
        let report = MetricsReport::new(&trace(&[[0, 1], [2, 3]]));
        report.save(&path).unwrap();
        assert_eq!(MetricsReport::load(&path).unwrap(), report);
    }

    #[test]
    fn text_mentions_top_experts_and_interpretation() {
        let t = trace(&[[0, 1], [1, 2], [0, 0]]);
        let text = render_text(&t.meta, &MetricsReport::new(&t));
        assert!(text.contains("#1: Expert  0 -     3 selections ( 50.00%)"));
        assert!(text.contains("Interpretation:"));
        assert!(text.contains("Model: Qwen/Qwen1.5-MoE-A2.7B-Chat"));
    }

    #[test]
    fn empty_trace_renders_without_metrics() {
        let t = trace(&[]);
        let report = MetricsReport::new(&t);
        report.check_consistency().unwrap();
        let text = render_text(&t.meta, &report);
        assert!(text.contains("No expert selections recorded."));
        assert!(!text.contains("Top-3"));
    }
}
