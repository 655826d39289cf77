// file: src/analysis.rs
// description: Expert usage metrics over a routing histogram: top-3 experts, Shannon entropy and load balance.
// author: cipher-rc5

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::trace::ExpertHistogram;

pub const TOP_EXPERTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpertShare {
    pub expert_id: usize,
    pub count: u64,
    pub probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionMetrics {
    pub top_3_experts: Vec<ExpertShare>,
    pub shannon_entropy_bits: f64,
    pub max_entropy_bits: f64,
    pub normalized_entropy: f64,
    pub total_selections: u64,
    pub num_experts: usize,
}

impl DistributionMetrics {
    /// Pure function of the histogram. No selections yields all-zero metrics.
    pub fn compute(histogram: &ExpertHistogram) -> Self {
        let counts = histogram.counts();
        let total = histogram.total();
        let num_experts = counts.len();
        if total == 0 {
            return Self {
                top_3_experts: Vec::new(),
                shannon_entropy_bits: 0.0,
                max_entropy_bits: 0.0,
                normalized_entropy: 0.0,
                total_selections: 0,
                num_experts,
            };
        }

        let probability = |count: u64| count as f64 / total as f64;

        // stable sort over ascending ids keeps the lower id first on ties
        let mut ranked: Vec<usize> = (0..num_experts).collect();
        ranked.sort_by(|&a, &b| counts[b].cmp(&counts[a]));
        let top_3_experts = ranked
            .into_iter()
            .take(TOP_EXPERTS)
            .map(|expert_id| ExpertShare {
                expert_id,
                count: counts[expert_id],
                probability: probability(counts[expert_id]),
            })
            .collect();

        let shannon_entropy_bits = shannon_entropy(counts.iter().map(|&c| probability(c)));
        let max_entropy_bits = if num_experts > 1 {
            (num_experts as f64).log2()
        } else {
            0.0
        };
        let normalized_entropy = if max_entropy_bits > 0.0 {
            shannon_entropy_bits / max_entropy_bits
        } else {
            0.0
        };

        Self {
            top_3_experts,
            shannon_entropy_bits,
            max_entropy_bits,
            normalized_entropy,
            total_selections: total,
            num_experts,
        }
    }

    pub fn has_data(&self) -> bool {
        self.total_selections > 0
    }

    pub fn load_balance(&self) -> LoadBalance {
        LoadBalance::from_normalized_entropy(self.normalized_entropy)
    }
}

/// Entropy in bits; zero-probability terms contribute nothing.
pub fn shannon_entropy(probabilities: impl IntoIterator<Item = f64>) -> f64 {
    let h: f64 = probabilities
        .into_iter()
        .filter(|&p| p > 0.0)
        .map(|p| -p * p.log2())
        .sum();
    // a single-expert distribution sums to -0.0
    h.max(0.0)
}

/// Reading of normalized entropy for reports. Not an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalance {
    NearPerfect,
    FairlyBalanced,
    ModerateImbalance,
    HighSpecialization,
}

impl LoadBalance {
    pub fn from_normalized_entropy(normalized: f64) -> Self {
        if normalized > 0.9 {
            Self::NearPerfect
        } else if normalized > 0.7 {
            Self::FairlyBalanced
        } else if normalized > 0.5 {
            Self::ModerateImbalance
        } else {
            Self::HighSpecialization
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::NearPerfect => "near-perfect load balance across experts",
            Self::FairlyBalanced => "fairly balanced, with moderate specialization",
            Self::ModerateImbalance => "moderate imbalance, some experts are preferred",
            Self::HighSpecialization => {
                "high specialization, routing heavily favors specific experts"
            }
        }
    }
}

impl fmt::Display for LoadBalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(counts: &[u64]) -> DistributionMetrics {
        DistributionMetrics::compute(&ExpertHistogram::from_counts(counts.to_vec()))
    }

    #[test]
    fn concentrated_usage_has_zero_entropy() {
        let m = metrics(&[40, 0, 0, 0]);
        assert_eq!(m.shannon_entropy_bits, 0.0);
        assert_eq!(m.normalized_entropy, 0.0);
        assert_eq!(m.max_entropy_bits, 2.0);
        assert_eq!(m.load_balance(), LoadBalance::HighSpecialization);
    }

    #[test]
    fn uniform_usage_has_full_entropy() {
        for k in [2usize, 3, 8, 60] {
            let m = metrics(&vec![11; k]);
            assert!((m.shannon_entropy_bits - (k as f64).log2()).abs() < 1e-12);
            assert!((m.normalized_entropy - 1.0).abs() < 1e-12);
            assert_eq!(m.load_balance(), LoadBalance::NearPerfect);
        }
    }

    #[test]
    fn top_three_ties_prefer_lower_id() {
        let m = metrics(&[5, 5, 3]);
        let ids: Vec<usize> = m.top_3_experts.iter().map(|e| e.expert_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);

        let m = metrics(&[1, 4, 0, 4, 2]);
        let ids: Vec<usize> = m.top_3_experts.iter().map(|e| e.expert_id).collect();
        assert_eq!(ids, vec![1, 3, 4]);
        assert!((m.top_3_experts[0].probability - 4.0 / 11.0).abs() < 1e-12);
    }

    #[test]
    fn small_histograms_list_every_expert() {
        let m = metrics(&[0, 7]);
        assert_eq!(m.top_3_experts.len(), 2);
        assert_eq!(m.top_3_experts[1].count, 0);
        assert_eq!(m.max_entropy_bits, 1.0);
    }

    #[test]
    fn single_expert_is_not_nan() {
        let m = metrics(&[9]);
        assert_eq!(m.max_entropy_bits, 0.0);
        assert_eq!(m.normalized_entropy, 0.0);
        assert!(m.has_data());
    }

    #[test]
    fn empty_histogram_reports_zeros() {
        let m = DistributionMetrics::compute(&ExpertHistogram::default());
        assert!(!m.has_data());
        assert_eq!(m.total_selections, 0);
        assert_eq!(m.num_experts, 0);
        assert_eq!(m.normalized_entropy, 0.0);
        assert!(m.top_3_experts.is_empty());

        let zeros = metrics(&[0, 0, 0]);
        assert_eq!(zeros.num_experts, 3);
        assert!(!zeros.normalized_entropy.is_nan());
    }

    #[test]
    fn bands_use_strict_thresholds() {
        assert_eq!(LoadBalance::from_normalized_entropy(0.95), LoadBalance::NearPerfect);
        assert_eq!(LoadBalance::from_normalized_entropy(0.9), LoadBalance::FairlyBalanced);
        assert_eq!(LoadBalance::from_normalized_entropy(0.7), LoadBalance::ModerateImbalance);
        assert_eq!(LoadBalance::from_normalized_entropy(0.5), LoadBalance::HighSpecialization);
    }
}
