//! dialogkt experiment harness
//!
//! Turns a resolved run configuration into reproducible knowledge-tracing
//! experiments:
//! - Resolving command-line and file configuration (`config`)
//! - Loading dialogue datasets and partitioning them into folds (`dataset`, `folds`)
//! - Training with gradient accumulation and clipping (`trainer`, `optim`)
//! - Turn-by-turn evaluation and metrics (`scan`, `eval`, `metrics`)
//! - Cross-validation and hyperparameter sweeps (`crossval`, `sweep`)
//! - Persisting model states and results (`artifacts`, `layout`, `registry`)

pub mod artifacts;
pub mod config;
pub mod crossval;
pub mod dataset;
pub mod error;
pub mod eval;
pub mod experiment;
pub mod folds;
pub mod layout;
pub mod metrics;
pub mod optim;
pub mod progress;
pub mod registry;
pub mod scan;
pub mod sweep;
pub mod trainer;

pub use artifacts::{Artifact, ArtifactKind, ModelManifest};
pub use config::{ConfigFile, Overrides, RawArgs, RunConfig, RunMode, resolve};
pub use crossval::{CrossValidator, CvSummary, FoldReport, FoldRunner, FoldStatus, MeanStd, aggregate};
pub use dataset::{DatasetId, DialogueRecord, KcTags, TurnRecord, load_dataset, read_jsonl_dataset, write_jsonl_dataset};
pub use error::{TrainingError, TrainingResult};
pub use eval::{EvalOptions, TurnPrediction, evaluate, predict_dialogue};
pub use experiment::{Experiment, ExperimentRunner, PredictionReport, RunReport, SweepReport};
pub use folds::{DialogueFolds, Fold, FoldData, FoldProvider, SplitKind};
pub use layout::ArtifactLayout;
pub use metrics::{AggregateMetrics, KcMetrics, MetricsRecord, Provenance};
pub use optim::{AdamW, Adafactor, Optimizer, build_optimizer, clip_grad_norm};
pub use progress::{NullProgressSink, ProgressEvent, ProgressSink, RecordingProgressSink, StdoutProgressSink};
pub use registry::{ModelStore, SaveInfo};
pub use scan::{DialogueScan, ScanProtocol, ScoredTurn, training_examples};
pub use sweep::{SearchSpace, SweepCandidate, SweepOrchestrator, SweepParam, SweepResult, SweepValue};
pub use trainer::{Checkpoint, TrainOutcome, Trainer, TrainerConfig, TrainingPhase, TrainingState};
