//! Cross-validation orchestration.
//!
//! Folds run on blocking tasks, at most `max_parallel` at a time. Results are
//! reduced in fold-index order, so the summary does not depend on which fold
//! finishes first.

use crate::config::SelectionMetric;
use crate::error::{TrainingError, TrainingResult};
use crate::folds::{FoldData, FoldProvider, SplitKind};
use crate::metrics::MetricsRecord;
use crate::progress::{NullProgressSink, ProgressEvent, ProgressSink};
use dialogkt_abstraction::seed::derive_seed;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Trains (or loads) and scores the model of one fold.
pub trait FoldRunner: Send + Sync {
    /// # Errors
    /// Fold-local errors (see [`TrainingError::is_fold_local`]) exclude the
    /// fold; any other error fails the run.
    fn run_fold(&self, fold: &FoldData, seed: u64, cancel: &CancellationToken) -> TrainingResult<MetricsRecord>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoldStatus {
    Completed,
    Diverged,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldReport {
    pub fold: usize,
    pub seed: u64,
    pub status: FoldStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Mean and sample standard deviation over folds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeanStd {
    pub mean: f64,
    /// `None` with fewer than two values.
    pub std: Option<f64>,
    pub n: usize,
}

impl MeanStd {
    #[must_use]
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len();
        let mean = values.iter().sum::<f64>() / n as f64;
        let std = (n >= 2).then(|| {
            let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
            (ss / (n - 1) as f64).sqrt()
        });
        Some(Self { mean, std, n })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub accuracy: Option<MeanStd>,
    pub auc: Option<MeanStd>,
    pub f1: Option<MeanStd>,
    pub loss: Option<MeanStd>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KcSummary {
    pub accuracy: Option<MeanStd>,
    pub auc: Option<MeanStd>,
    pub f1: Option<MeanStd>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvSummary {
    pub split: SplitKind,
    pub folds: Vec<FoldReport>,
    pub completed: usize,
    /// Some fold was cancelled before it finished; the aggregate covers the rest.
    #[serde(default)]
    pub cancelled: bool,
    pub aggregate: AggregateSummary,
    pub per_kc: BTreeMap<String, KcSummary>,
}

impl CvSummary {
    /// Mean of `metric` over completed folds.
    #[must_use]
    pub fn selection_value(&self, metric: SelectionMetric) -> Option<f64> {
        let values: Vec<f64> = self.completed_metrics().filter_map(|m| m.selection_value(metric)).collect();
        MeanStd::from_values(&values).map(|m| m.mean)
    }

    pub fn completed_metrics(&self) -> impl Iterator<Item = &MetricsRecord> {
        self.folds.iter().filter(|r| r.status == FoldStatus::Completed).filter_map(|r| r.metrics.as_ref())
    }
}

/// Averages completed folds in fold-index order.
#[must_use]
pub fn aggregate(split: SplitKind, mut reports: Vec<FoldReport>) -> CvSummary {
    reports.sort_by_key(|r| r.fold);
    let records: Vec<&MetricsRecord> = reports
        .iter()
        .filter(|r| r.status == FoldStatus::Completed)
        .filter_map(|r| r.metrics.as_ref())
        .collect();

    let collect = |f: &dyn Fn(&MetricsRecord) -> Option<f64>| {
        let values: Vec<f64> = records.iter().filter_map(|r| f(r)).collect();
        MeanStd::from_values(&values)
    };
    let aggregate = AggregateSummary {
        accuracy: collect(&|r| r.aggregate.accuracy),
        auc: collect(&|r| r.aggregate.auc),
        f1: collect(&|r| r.aggregate.f1),
        loss: collect(&|r| Some(r.loss)),
    };

    let mut by_kc: BTreeMap<&str, [Vec<f64>; 3]> = BTreeMap::new();
    for record in &records {
        for (kc, m) in &record.per_kc {
            let entry = by_kc.entry(kc.as_str()).or_default();
            entry[0].push(m.accuracy);
            if let Some(auc) = m.auc {
                entry[1].push(auc);
            }
            entry[2].push(m.f1);
        }
    }
    let per_kc = by_kc
        .into_iter()
        .map(|(kc, [accuracy, auc, f1])| {
            let summary = KcSummary {
                accuracy: MeanStd::from_values(&accuracy),
                auc: MeanStd::from_values(&auc),
                f1: MeanStd::from_values(&f1),
            };
            (kc.to_string(), summary)
        })
        .collect();

    let cancelled = reports.iter().any(|r| r.status == FoldStatus::Cancelled);
    CvSummary { split, completed: records.len(), cancelled, folds: reports, aggregate, per_kc }
}

pub struct CrossValidator {
    seed: u64,
    max_parallel: usize,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressSink>,
}

impl CrossValidator {
    #[must_use]
    pub fn new(seed: u64, max_parallel: usize) -> Self {
        Self {
            seed,
            max_parallel: max_parallel.max(1),
            cancel: CancellationToken::new(),
            progress: Arc::new(NullProgressSink),
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Sub-seed of fold `index`.
    #[must_use]
    pub fn fold_seed(&self, index: usize) -> u64 {
        derive_seed(self.seed, "fold", index as u64)
    }

    /// Runs `runner` on each of `fold_indices` and aggregates the scores on `split`.
    ///
    /// A run cancelled after some folds completed returns their summary with
    /// `cancelled` set.
    ///
    /// # Errors
    /// The first non-fold-local error by fold index; the first fold-local
    /// error when no fold completes; `Cancelled` when every fold was cancelled.
    pub async fn run(
        &self,
        provider: Arc<dyn FoldProvider>,
        fold_indices: &[usize],
        split: SplitKind,
        runner: Arc<dyn FoldRunner>,
    ) -> TrainingResult<CvSummary> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let cancel = self.cancel.child_token();
        let mut handles: Vec<(usize, Option<JoinHandle<TrainingResult<MetricsRecord>>>)> = Vec::new();

        info!(folds = fold_indices.len(), max_parallel = self.max_parallel, %split, "Running cross-validation");
        for &index in fold_indices {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|e| TrainingError::Other(anyhow::anyhow!("fold scheduler closed: {e}")))?;
            if cancel.is_cancelled() {
                handles.push((index, None));
                continue;
            }
            let provider = Arc::clone(&provider);
            let runner = Arc::clone(&runner);
            let token = cancel.clone();
            let seed = self.fold_seed(index);
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                if token.is_cancelled() {
                    return Err(TrainingError::Cancelled);
                }
                let data = provider.fold(index)?;
                runner.run_fold(&data, seed, &token)
            });
            handles.push((index, Some(handle)));
        }

        let mut reports = Vec::with_capacity(handles.len());
        let mut first_local: Option<TrainingError> = None;
        for (index, handle) in handles {
            let seed = self.fold_seed(index);
            let result = match handle {
                Some(handle) => handle
                    .await
                    .map_err(|e| TrainingError::Other(anyhow::anyhow!("fold {index} task failed: {e}")))?,
                None => Err(TrainingError::Cancelled),
            };
            let report = match result {
                Ok(metrics) => {
                    FoldReport { fold: index, seed, status: FoldStatus::Completed, metrics: Some(metrics), error: None }
                }
                Err(TrainingError::Cancelled) => {
                    warn!(fold = index, "Fold cancelled, excluded");
                    FoldReport { fold: index, seed, status: FoldStatus::Cancelled, metrics: None, error: None }
                }
                Err(e) if e.is_fold_local() => {
                    warn!(fold = index, error = %e, "Fold diverged, excluded");
                    let report = FoldReport {
                        fold: index,
                        seed,
                        status: FoldStatus::Diverged,
                        metrics: None,
                        error: Some(e.to_string()),
                    };
                    if first_local.is_none() {
                        first_local = Some(e);
                    }
                    report
                }
                Err(e) => {
                    cancel.cancel();
                    return Err(e);
                }
            };
            self.progress.on_event(ProgressEvent::FoldFinished {
                fold: index,
                diverged: report.status == FoldStatus::Diverged,
            });
            reports.push(report);
        }

        let summary = aggregate(split, reports);
        if summary.completed == 0 {
            return Err(first_local.unwrap_or(TrainingError::Cancelled));
        }
        if summary.cancelled {
            warn!(
                completed = summary.completed,
                folds = summary.folds.len(),
                "Cross-validation cancelled, summary is partial"
            );
        }
        info!(
            completed = summary.completed,
            accuracy = ?summary.aggregate.accuracy.map(|m| m.mean),
            auc = ?summary.aggregate.auc.map(|m| m.mean),
            "Cross-validation complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{EvalOptions, evaluate};
    use crate::folds::DialogueFolds;
    use crate::metrics::{AggregateMetrics, KcMetrics, Provenance};
    use dialogkt_abstraction::{Dialogue, DialogueId, KtModel, Turn};
    use dialogkt_models::MajorityModel;
    use proptest::prelude::*;

    fn record(accuracy: f64) -> MetricsRecord {
        let kc = KcMetrics { count: 4, positives: 2, accuracy, auc: None, f1: accuracy };
        MetricsRecord {
            per_kc: BTreeMap::from([("kc".to_string(), kc)]),
            aggregate: AggregateMetrics { accuracy: Some(accuracy), auc: None, f1: Some(accuracy) },
            num_samples: 4,
            loss: 0.5,
            provenance: Provenance { split: SplitKind::Test, teacher_forced: true, inc_first_label: false, pack_kcs: true },
            loss_curve: Vec::new(),
        }
    }

    fn completed(fold: usize, accuracy: f64) -> FoldReport {
        FoldReport { fold, seed: 0, status: FoldStatus::Completed, metrics: Some(record(accuracy)), error: None }
    }

    #[test]
    fn test_mean_and_sample_std() {
        let m = MeanStd::from_values(&[0.6, 0.8, 1.0]).unwrap();
        assert!((m.mean - 0.8).abs() < 1e-12);
        assert!((m.std.unwrap() - 0.2).abs() < 1e-12);
        assert_eq!(MeanStd::from_values(&[0.3]).unwrap().std, None);
        assert!(MeanStd::from_values(&[]).is_none());
    }

    #[test]
    fn test_failed_folds_are_excluded() {
        let diverged = FoldReport { fold: 1, seed: 0, status: FoldStatus::Diverged, metrics: None, error: None };
        let summary = aggregate(SplitKind::Test, vec![completed(0, 0.5), diverged, completed(2, 0.7)]);
        assert_eq!(summary.completed, 2);
        assert!((summary.aggregate.accuracy.unwrap().mean - 0.6).abs() < 1e-12);
        assert_eq!(summary.folds.len(), 3);
    }

    proptest! {
        #[test]
        fn prop_aggregate_is_order_independent(
            accuracies in prop::collection::vec(0.0f64..1.0, 2..8),
            seed in any::<u64>(),
        ) {
            let reports: Vec<FoldReport> =
                accuracies.iter().enumerate().map(|(i, a)| completed(i, *a)).collect();
            let mut shuffled = reports.clone();
            let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(seed);
            rand::seq::SliceRandom::shuffle(shuffled.as_mut_slice(), &mut rng);
            prop_assert_eq!(aggregate(SplitKind::Test, reports), aggregate(SplitKind::Test, shuffled));
        }
    }

    fn dialogues(n: usize) -> Vec<Dialogue> {
        (0..n)
            .map(|i| Dialogue {
                id: DialogueId(format!("d{i}")),
                subject: None,
                turns: vec![Turn {
                    speaker: "student".to_string(),
                    text: String::new(),
                    correct: Some(i % 3 != 0),
                    kcs: vec!["kc".to_string()],
                }],
            })
            .collect()
    }

    /// Fits a majority model and scores the test split; diverges on `fail_fold`.
    struct MajorityRunner {
        fail_fold: Option<usize>,
    }

    impl FoldRunner for MajorityRunner {
        fn run_fold(&self, fold: &FoldData, _seed: u64, _cancel: &CancellationToken) -> TrainingResult<MetricsRecord> {
            if self.fail_fold == Some(fold.index) {
                return Err(TrainingError::Divergence { step: 1, loss: f64::NAN });
            }
            let mut model = MajorityModel::new();
            model.fit(&fold.train)?;
            let options = EvalOptions { pack_kcs: true, teacher_forced: true, inc_first_label: false };
            evaluate(&model, &fold.test, SplitKind::Test, &options)
        }
    }

    fn provider() -> Arc<dyn FoldProvider> {
        Arc::new(DialogueFolds::new(dialogues(12), 3, false, 221).unwrap())
    }

    #[tokio::test]
    async fn test_parallel_matches_sequential() {
        let runner: Arc<dyn FoldRunner> = Arc::new(MajorityRunner { fail_fold: None });
        let sequential =
            CrossValidator::new(5, 1).run(provider(), &[0, 1, 2], SplitKind::Test, Arc::clone(&runner)).await.unwrap();
        let parallel = CrossValidator::new(5, 3).run(provider(), &[0, 1, 2], SplitKind::Test, runner).await.unwrap();
        assert_eq!(sequential, parallel);
        assert_eq!(sequential.completed, 3);
    }

    #[tokio::test]
    async fn test_divergent_fold_is_excluded() {
        let runner: Arc<dyn FoldRunner> = Arc::new(MajorityRunner { fail_fold: Some(1) });
        let summary = CrossValidator::new(5, 2).run(provider(), &[0, 1, 2], SplitKind::Test, runner).await.unwrap();
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.folds[1].status, FoldStatus::Diverged);
    }

    #[tokio::test]
    async fn test_all_folds_failing_fails_the_run() {
        struct AlwaysDiverges;
        impl FoldRunner for AlwaysDiverges {
            fn run_fold(&self, _: &FoldData, _: u64, _: &CancellationToken) -> TrainingResult<MetricsRecord> {
                Err(TrainingError::Divergence { step: 0, loss: f64::INFINITY })
            }
        }
        let err = CrossValidator::new(5, 1).run(provider(), &[0, 1, 2], SplitKind::Test, Arc::new(AlwaysDiverges)).await;
        assert!(matches!(err, Err(TrainingError::Divergence { .. })));
    }

    #[test]
    fn test_cancelled_fold_marks_summary() {
        let cancelled = FoldReport { fold: 1, seed: 0, status: FoldStatus::Cancelled, metrics: None, error: None };
        let summary = aggregate(SplitKind::Test, vec![completed(0, 0.5), cancelled]);
        assert!(summary.cancelled);
        assert_eq!(summary.completed, 1);
        assert!(!aggregate(SplitKind::Test, vec![completed(0, 0.5)]).cancelled);
    }

    /// Completes fold 0, then cancels the run from inside fold 1.
    struct CancelsAfterFirst {
        cancel: CancellationToken,
    }

    impl FoldRunner for CancelsAfterFirst {
        fn run_fold(&self, fold: &FoldData, seed: u64, cancel: &CancellationToken) -> TrainingResult<MetricsRecord> {
            if fold.index == 0 {
                return MajorityRunner { fail_fold: None }.run_fold(fold, seed, cancel);
            }
            self.cancel.cancel();
            Err(TrainingError::Cancelled)
        }
    }

    #[tokio::test]
    async fn test_cancellation_after_a_completed_fold_is_reported() {
        let cancel = CancellationToken::new();
        let runner: Arc<dyn FoldRunner> = Arc::new(CancelsAfterFirst { cancel: cancel.clone() });
        let summary = CrossValidator::new(5, 1)
            .with_cancellation(cancel)
            .run(provider(), &[0, 1, 2], SplitKind::Test, runner)
            .await
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.completed, 1);
        let statuses: Vec<FoldStatus> = summary.folds.iter().map(|f| f.status).collect();
        assert_eq!(statuses, [FoldStatus::Completed, FoldStatus::Cancelled, FoldStatus::Cancelled]);
    }

    #[tokio::test]
    async fn test_cancelled_run() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner: Arc<dyn FoldRunner> = Arc::new(MajorityRunner { fail_fold: None });
        let err = CrossValidator::new(5, 1)
            .with_cancellation(cancel)
            .run(provider(), &[0, 1, 2], SplitKind::Test, runner)
            .await;
        assert!(matches!(err, Err(TrainingError::Cancelled)));
    }
}
