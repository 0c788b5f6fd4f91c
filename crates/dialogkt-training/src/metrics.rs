//! Per-KC and macro-averaged classification metrics.

use crate::config::SelectionMetric;
use crate::folds::SplitKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Probabilities are clamped to this distance from 0 and 1 when computing BCE.
const PROB_EPS: f64 = 1e-7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KcMetrics {
    pub count: usize,
    pub positives: usize,
    pub accuracy: f64,
    /// Undefined when the KC has only one class.
    pub auc: Option<f64>,
    pub f1: f64,
}

/// Macro averages over KCs where each metric is defined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub accuracy: Option<f64>,
    pub auc: Option<f64>,
    pub f1: Option<f64>,
}

/// How predictions were produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub split: SplitKind,
    pub teacher_forced: bool,
    pub inc_first_label: bool,
    pub pack_kcs: bool,
}

/// One epoch of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    pub epoch: usize,
    pub train_loss: f64,
    pub optimizer_steps: u64,
    pub validation_loss: f64,
    pub validation_metric: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub per_kc: BTreeMap<String, KcMetrics>,
    pub aggregate: AggregateMetrics,
    /// Number of scored (turn, KC) pairs.
    pub num_samples: usize,
    pub loss: f64,
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loss_curve: Vec<EpochStats>,
}

impl MetricsRecord {
    /// Value of `metric`, higher is better. AUC falls back to accuracy when
    /// undefined for every KC.
    #[must_use]
    pub fn selection_value(&self, metric: SelectionMetric) -> Option<f64> {
        match metric {
            SelectionMetric::Auc => self.aggregate.auc.or(self.aggregate.accuracy),
            SelectionMetric::Accuracy => self.aggregate.accuracy,
            SelectionMetric::F1 => self.aggregate.f1,
        }
    }
}

/// Rank-based ROC AUC with ties sharing their average rank.
///
/// Returns `None` unless both classes are present.
#[must_use]
pub fn roc_auc(samples: &[(f64, bool)]) -> Option<f64> {
    let positives = samples.iter().filter(|(_, y)| *y).count();
    let negatives = samples.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut sorted: Vec<(f64, bool)> = samples.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut positive_rank_sum = 0.0;
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i;
        while j + 1 < sorted.len() && sorted[j + 1].0 == sorted[i].0 {
            j += 1;
        }
        // ranks are 1-based; tied block i..=j shares the mean rank
        let rank = (i + j) as f64 / 2.0 + 1.0;
        positive_rank_sum += rank * sorted[i..=j].iter().filter(|(_, y)| *y).count() as f64;
        i = j + 1;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

/// F1 of the positive (correct) class at threshold 0.5; zero when there are no
/// true positives.
#[must_use]
pub fn f1_score(samples: &[(f64, bool)]) -> f64 {
    let mut tp = 0_usize;
    let mut fp = 0_usize;
    let mut fn_ = 0_usize;
    for &(p, y) in samples {
        match (p >= 0.5, y) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, true) => fn_ += 1,
            (false, false) => {}
        }
    }
    if tp == 0 {
        return 0.0;
    }
    2.0 * tp as f64 / (2 * tp + fp + fn_) as f64
}

#[must_use]
pub fn binary_cross_entropy(p: f64, label: bool) -> f64 {
    let p = p.clamp(PROB_EPS, 1.0 - PROB_EPS);
    if label { -p.ln() } else { -(1.0 - p).ln() }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0_usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Collects (prediction, label) pairs per KC.
#[derive(Debug, Default)]
pub struct MetricsAccumulator {
    samples: BTreeMap<String, Vec<(f64, bool)>>,
    loss_sum: f64,
    count: usize,
}

impl MetricsAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kc: &str, probability: f64, label: bool) {
        self.loss_sum += binary_cross_entropy(probability, label);
        self.count += 1;
        self.samples.entry(kc.to_string()).or_default().push((probability, label));
    }

    #[must_use]
    pub fn finish(self, provenance: Provenance) -> MetricsRecord {
        let per_kc: BTreeMap<String, KcMetrics> = self
            .samples
            .into_iter()
            .map(|(kc, samples)| {
                let correct = samples.iter().filter(|(p, y)| (*p >= 0.5) == *y).count();
                let metrics = KcMetrics {
                    count: samples.len(),
                    positives: samples.iter().filter(|(_, y)| *y).count(),
                    accuracy: correct as f64 / samples.len() as f64,
                    auc: roc_auc(&samples),
                    f1: f1_score(&samples),
                };
                (kc, metrics)
            })
            .collect();

        let aggregate = AggregateMetrics {
            accuracy: mean(per_kc.values().map(|m| m.accuracy)),
            auc: mean(per_kc.values().filter_map(|m| m.auc)),
            f1: mean(per_kc.values().map(|m| m.f1)),
        };
        let loss = if self.count == 0 { 0.0 } else { self.loss_sum / self.count as f64 };

        MetricsRecord { per_kc, aggregate, num_samples: self.count, loss, provenance, loss_curve: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn provenance() -> Provenance {
        Provenance { split: SplitKind::Test, teacher_forced: true, inc_first_label: false, pack_kcs: true }
    }

    #[test]
    fn test_auc_perfect_and_inverted() {
        assert_eq!(roc_auc(&[(0.1, false), (0.9, true)]), Some(1.0));
        assert_eq!(roc_auc(&[(0.9, false), (0.1, true)]), Some(0.0));
    }

    #[test]
    fn test_auc_ties_are_averaged() {
        assert_eq!(roc_auc(&[(0.5, false), (0.5, true)]), Some(0.5));
        // one of two negatives ties with the positive
        let auc = roc_auc(&[(0.2, false), (0.6, false), (0.6, true)]).unwrap();
        assert_relative_eq!(auc, 0.75);
    }

    #[test]
    fn test_auc_undefined_for_single_class() {
        assert_eq!(roc_auc(&[(0.3, true), (0.8, true)]), None);
        assert_eq!(roc_auc(&[]), None);
    }

    #[test]
    fn test_f1() {
        let samples = [(0.9, true), (0.8, false), (0.1, true), (0.2, false)];
        assert_relative_eq!(f1_score(&samples), 0.5);
        assert_relative_eq!(f1_score(&[(0.1, false)]), 0.0);
    }

    #[test]
    fn test_macro_aggregate_skips_undefined_auc() {
        let mut acc = MetricsAccumulator::new();
        acc.add("a", 0.9, true);
        acc.add("a", 0.2, false);
        acc.add("b", 0.7, true);
        acc.add("b", 0.4, true);
        let record = acc.finish(provenance());

        assert_eq!(record.num_samples, 4);
        assert_eq!(record.per_kc["a"].auc, Some(1.0));
        assert_eq!(record.per_kc["b"].auc, None);
        assert_eq!(record.aggregate.auc, Some(1.0));
        assert_relative_eq!(record.aggregate.accuracy.unwrap(), 0.75);
        assert_eq!(record.selection_value(SelectionMetric::Auc), Some(1.0));
    }

    #[test]
    fn test_selection_falls_back_to_accuracy() {
        let mut acc = MetricsAccumulator::new();
        acc.add("a", 0.9, true);
        let record = acc.finish(provenance());
        assert_eq!(record.selection_value(SelectionMetric::Auc), Some(1.0));
        assert!(record.aggregate.auc.is_none());
    }

    #[test]
    fn test_bce_is_clamped() {
        assert!(binary_cross_entropy(0.0, true).is_finite());
        assert_relative_eq!(binary_cross_entropy(0.5, false), std::f64::consts::LN_2);
    }
}
