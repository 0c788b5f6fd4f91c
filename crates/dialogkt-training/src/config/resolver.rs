use super::{
    ConfigFile, DEFAULT_ARTIFACTS_DIR, DEFAULT_NUM_FOLDS, DEFAULT_SEED, DatasetConfig, DatasetName, EvalConfig,
    OptimConfig, OptimizerKind, Overrides, RawArgs, RunConfig, RunMode,
};
use crate::error::{TrainingError, TrainingResult};
use dialogkt_abstraction::{ModelError, ModelVariant};
use dialogkt_models::{ModelConfig, ModelOptions};
use std::path::PathBuf;

/// Built-in option defaults for a model type, the lowest precedence layer.
#[must_use]
pub fn builtin_overrides(variant: ModelVariant) -> Overrides {
    match variant {
        ModelVariant::Lmkt => Overrides {
            epochs: Some(3),
            lr: Some(2e-4),
            wd: Some(1e-2),
            gc: Some(1.0),
            grad_accum_steps: Some(8),
            batch_size: Some(4),
            optim: Some(OptimizerKind::Adamw),
            ..Overrides::default()
        },
        ModelVariant::Dkt => Overrides {
            epochs: Some(20),
            lr: Some(5e-3),
            wd: Some(1e-5),
            gc: Some(1.0),
            grad_accum_steps: Some(1),
            batch_size: Some(32),
            optim: Some(OptimizerKind::Adamw),
            ..Overrides::default()
        },
        ModelVariant::Bkt | ModelVariant::Majority | ModelVariant::Random => {
            Overrides { batch_size: Some(64), ..Overrides::default() }
        }
    }
}

fn model_error(err: ModelError) -> TrainingError {
    match err {
        ModelError::InvalidOption { field, message } => TrainingError::Config { field, message },
        ModelError::UnknownVariant(name) => {
            TrainingError::config("model_type", format!("unknown model type `{name}`"))
        }
        other => TrainingError::config("model_type", other.to_string()),
    }
}

fn require_positive(field: &str, value: f64) -> TrainingResult<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(TrainingError::config(field, format!("must be a finite value > 0, got {value}")))
    }
}

fn require_at_least_one(field: &str, value: usize) -> TrainingResult<usize> {
    if value >= 1 { Ok(value) } else { Err(TrainingError::config(field, "must be at least 1")) }
}

fn missing(field: &str) -> TrainingError {
    TrainingError::config(field, "no value and no default")
}

fn validate_model_name(field: &str, name: &str) -> TrainingResult<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(TrainingError::config(field, format!("`{name}` must use only letters, digits, '-', '_' and '.'")))
    }
}

fn resolve_optim(variant: ModelVariant, merged: &Overrides) -> TrainingResult<OptimConfig> {
    let batch_size = require_at_least_one("batch_size", merged.batch_size.ok_or_else(|| missing("batch_size"))?)?;
    if !variant.is_trainable() {
        // Never used by closed-form variants beyond evaluation batching.
        return Ok(OptimConfig {
            optimizer: OptimizerKind::default(),
            lr: 0.0,
            wd: 0.0,
            gc: f64::INFINITY,
            grad_accum_steps: 1,
            batch_size,
            epochs: 1,
            patience: None,
        });
    }

    let wd = merged.wd.ok_or_else(|| missing("wd"))?;
    if !wd.is_finite() || wd < 0.0 {
        return Err(TrainingError::config("wd", format!("must be a finite value >= 0, got {wd}")));
    }
    if let Some(patience) = merged.patience {
        require_at_least_one("patience", patience)?;
    }

    Ok(OptimConfig {
        optimizer: merged.optim.unwrap_or_default(),
        lr: require_positive("lr", merged.lr.ok_or_else(|| missing("lr"))?)?,
        wd,
        gc: require_positive("gc", merged.gc.ok_or_else(|| missing("gc"))?)?,
        grad_accum_steps: require_at_least_one(
            "grad_accum_steps",
            merged.grad_accum_steps.ok_or_else(|| missing("grad_accum_steps"))?,
        )?,
        batch_size,
        epochs: require_at_least_one("epochs", merged.epochs.ok_or_else(|| missing("epochs"))?)?,
        patience: merged.patience,
    })
}

/// Merges command-line values, the optional config file and built-in defaults.
///
/// Precedence is command line, then `[run]` / `[defaults.<model_type>]` from the
/// file, then built-in model-type defaults. Options that do not apply to the
/// selected model type are rejected whether they come from the command line or
/// the file.
///
/// # Errors
/// Returns `TrainingError::Config` naming the offending field.
pub fn resolve(raw: &RawArgs, file: Option<&ConfigFile>) -> TrainingResult<RunConfig> {
    let empty = ConfigFile::default();
    let file = file.unwrap_or(&empty);
    let run = &file.run;

    let variant: ModelVariant =
        raw.model_type.as_deref().unwrap_or(ModelVariant::Lmkt.as_str()).parse().map_err(model_error)?;

    let user = raw.overrides.clone().or(&file.defaults_for(variant));

    if !variant.is_trainable()
        && let Some(field) = user.optimization_fields().first()
    {
        return Err(TrainingError::config(
            *field,
            format!("only applies to gradient-trained models (lmkt, dkt), not {variant}"),
        ));
    }
    if user.pt_model_name.is_some() {
        if variant != ModelVariant::Lmkt {
            return Err(TrainingError::config("pt_model_name", format!("only applies to lmkt, not {variant}")));
        }
        if raw.mode == RunMode::Test {
            return Err(TrainingError::config("pt_model_name", "only applies when training"));
        }
    }

    let options = ModelOptions {
        base_model: user.base_model.clone(),
        r: user.r,
        lora_alpha: user.lora_alpha,
        lora_dropout: user.lora_dropout,
        quantize: user.quantize,
        emb_size: user.emb_size,
    };
    let model = ModelConfig::from_options(variant, &options).map_err(model_error)?;

    let merged = user.or(&builtin_overrides(variant));
    let optim = resolve_optim(variant, &merged)?;

    if raw.hyperparam_sweep && raw.mode == RunMode::Test {
        return Err(TrainingError::config("hyperparam_sweep", "only applies when training"));
    }
    if raw.sweep_space.is_some() && !raw.hyperparam_sweep {
        return Err(TrainingError::config("sweep_space", "requires --hyperparam_sweep"));
    }

    let model_name = if raw.hyperparam_sweep { None } else { raw.model_name.clone() };
    if let Some(name) = &model_name {
        validate_model_name("model_name", name)?;
    } else if variant.is_trainable() && !raw.hyperparam_sweep {
        let purpose = if raw.mode == RunMode::Train { "save the trained model" } else { "load the trained model" };
        return Err(TrainingError::config("model_name", format!("required for {variant} to {purpose}")));
    }
    if let Some(name) = &merged.pt_model_name {
        validate_model_name("pt_model_name", name)?;
    }

    let dataset = raw.dataset.or(run.dataset).unwrap_or(DatasetName::Comta);
    if raw.split_by_subject && dataset != DatasetName::Comta {
        return Err(TrainingError::config("split_by_subject", format!("only applies to comta, not {dataset}")));
    }
    let num_folds = raw.num_folds.or(run.num_folds).unwrap_or(DEFAULT_NUM_FOLDS);
    if num_folds < 3 {
        return Err(TrainingError::config(
            "num_folds",
            format!("must be at least 3 (train, validation and test groups), got {num_folds}"),
        ));
    }

    let max_parallel = require_at_least_one("max_parallel", raw.max_parallel.or(run.max_parallel).unwrap_or(1))?;
    let memory_budget_mb = raw.memory_budget_mb.or(run.memory_budget_mb);
    if memory_budget_mb == Some(0) {
        return Err(TrainingError::config("memory_budget_mb", "must be at least 1"));
    }

    Ok(RunConfig {
        mode: raw.mode,
        dataset: DatasetConfig {
            dataset,
            split_by_subject: raw.split_by_subject,
            typical_cutoff: raw.typical_cutoff.or(run.typical_cutoff).unwrap_or(1),
            tag_src: raw.tag_src.or(run.tag_src).unwrap_or_default(),
            debug: raw.debug,
            num_folds,
            data_dir: raw.data_dir.clone().or_else(|| run.data_dir.clone()).unwrap_or_else(|| PathBuf::from("data")),
        },
        model,
        pt_model_name: merged.pt_model_name,
        optim,
        eval: EvalConfig {
            pack_kcs: raw.pack_kcs.or(run.pack_kcs).unwrap_or(true),
            prompt_inc_labels: raw.prompt_inc_labels.or(run.prompt_inc_labels).unwrap_or(false),
            inc_first_label: raw.inc_first_label,
            testonval: raw.testonval || raw.hyperparam_sweep,
            crossval: raw.crossval || raw.hyperparam_sweep,
            selection_metric: raw.selection_metric.or(run.selection_metric).unwrap_or_default(),
        },
        seed: raw.seed.or(run.seed).unwrap_or(DEFAULT_SEED),
        model_name,
        hyperparam_sweep: raw.hyperparam_sweep,
        sweep_space: raw.sweep_space.clone(),
        artifacts_dir: raw
            .artifacts_dir
            .clone()
            .or_else(|| run.artifacts_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACTS_DIR)),
        max_parallel,
        memory_budget_mb,
    })
}
