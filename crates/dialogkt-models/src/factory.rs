//! Model factory for creating knowledge-tracing models from configuration.
//!
//! This module validates variant-specific options and constructs a model at its
//! initial state. Frozen base models are loaded once per `(id, quantize)` pair
//! and shared between every model the factory creates.

use crate::bkt::BktModel;
use crate::baselines::{MajorityModel, RandomModel};
use crate::dkt::DktModel;
use crate::encoder::{BaseModel, DEFAULT_HIDDEN_SIZE, HashedEncoder};
use crate::lmkt::{LmktModel, LoraConfig};
use crate::quant::QuantizedBase;
use dialogkt_abstraction::{KcVocab, KtModel, ModelError, ModelVariant};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Default base model identifier for LLM-KT.
pub const DEFAULT_BASE_MODEL: &str = "meta-llama/Meta-Llama-3.1-8B-Instruct";

/// Default latent state size for DKT.
pub const DEFAULT_EMB_SIZE: usize = 64;

/// Variant-specific options as supplied by the user, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    pub base_model: Option<String>,
    pub r: Option<usize>,
    pub lora_alpha: Option<f64>,
    pub lora_dropout: Option<f64>,
    pub quantize: Option<bool>,
    pub emb_size: Option<usize>,
}

impl ModelOptions {
    /// Names of the options that are set and only apply to LLM-KT.
    fn lmkt_only(&self) -> Vec<&'static str> {
        let mut set = Vec::new();
        if self.base_model.is_some() {
            set.push("base_model");
        }
        if self.r.is_some() {
            set.push("r");
        }
        if self.lora_alpha.is_some() {
            set.push("lora_alpha");
        }
        if self.lora_dropout.is_some() {
            set.push("lora_dropout");
        }
        if self.quantize.is_some() {
            set.push("quantize");
        }
        set
    }
}

/// LLM-KT configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LmktConfig {
    pub base_model: String,
    pub lora: LoraConfig,
    pub quantize: bool,
}

/// DKT configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DktConfig {
    pub emb_size: usize,
}

/// Validated model configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model_type", rename_all = "snake_case")]
pub enum ModelConfig {
    Lmkt(LmktConfig),
    Dkt(DktConfig),
    Bkt,
    Majority,
    Random,
}

fn invalid(field: &str, message: impl Into<String>) -> ModelError {
    ModelError::InvalidOption { field: field.to_string(), message: message.into() }
}

impl ModelConfig {
    /// Validates `options` for `variant` and fills in variant defaults.
    ///
    /// # Errors
    /// Returns `ModelError::InvalidOption` when an option does not apply to the
    /// variant or a value is out of range.
    pub fn from_options(variant: ModelVariant, options: &ModelOptions) -> Result<Self, ModelError> {
        if variant != ModelVariant::Lmkt
            && let Some(field) = options.lmkt_only().first()
        {
            return Err(invalid(field, format!("only applies to lmkt, not {variant}")));
        }
        if variant != ModelVariant::Dkt && options.emb_size.is_some() {
            return Err(invalid("emb_size", format!("only applies to dkt, not {variant}")));
        }

        match variant {
            ModelVariant::Lmkt => {
                let defaults = LoraConfig::default();
                let lora = LoraConfig {
                    rank: options.r.unwrap_or(defaults.rank),
                    alpha: options.lora_alpha.unwrap_or(defaults.alpha),
                    dropout: options.lora_dropout.unwrap_or(defaults.dropout),
                };
                if lora.rank == 0 {
                    return Err(invalid("r", "must be at least 1"));
                }
                if !lora.alpha.is_finite() || lora.alpha < 1.0 {
                    return Err(invalid("lora_alpha", "must be at least 1"));
                }
                if !(0.0..1.0).contains(&lora.dropout) {
                    return Err(invalid("lora_dropout", "must be in [0, 1)"));
                }
                let base_model = options.base_model.clone().unwrap_or_else(|| DEFAULT_BASE_MODEL.to_string());
                if base_model.trim().is_empty() {
                    return Err(invalid("base_model", "cannot be empty"));
                }
                Ok(Self::Lmkt(LmktConfig { base_model, lora, quantize: options.quantize.unwrap_or(false) }))
            }
            ModelVariant::Dkt => {
                let emb_size = options.emb_size.unwrap_or(DEFAULT_EMB_SIZE);
                if emb_size == 0 {
                    return Err(invalid("emb_size", "must be at least 1"));
                }
                Ok(Self::Dkt(DktConfig { emb_size }))
            }
            ModelVariant::Bkt => Ok(Self::Bkt),
            ModelVariant::Majority => Ok(Self::Majority),
            ModelVariant::Random => Ok(Self::Random),
        }
    }

    #[must_use]
    pub const fn variant(&self) -> ModelVariant {
        match self {
            Self::Lmkt(_) => ModelVariant::Lmkt,
            Self::Dkt(_) => ModelVariant::Dkt,
            Self::Bkt => ModelVariant::Bkt,
            Self::Majority => ModelVariant::Majority,
            Self::Random => ModelVariant::Random,
        }
    }
}

/// Factory for creating model instances.
#[derive(Default)]
pub struct ModelFactory {
    bases: Mutex<HashMap<(String, bool), Arc<dyn BaseModel>>>,
}

impl ModelFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared frozen base model, loading it on first use.
    ///
    /// # Errors
    /// Returns `ModelError::Other` if the cache lock is poisoned.
    pub fn base_model(&self, id: &str, quantize: bool) -> Result<Arc<dyn BaseModel>, ModelError> {
        let mut bases = self.bases.lock().map_err(|e| ModelError::Other(format!("base model cache: {e}")))?;
        if let Some(base) = bases.get(&(id.to_string(), quantize)) {
            return Ok(Arc::clone(base));
        }

        info!(base_model = %id, quantize, "Loading frozen base model");
        let full: Arc<dyn BaseModel> = Arc::new(HashedEncoder::load(id, DEFAULT_HIDDEN_SIZE));
        let base: Arc<dyn BaseModel> = if quantize { Arc::new(QuantizedBase::new(full)?) } else { full };
        bases.insert((id.to_string(), quantize), Arc::clone(&base));
        Ok(base)
    }

    /// Creates a model at its initial state.
    ///
    /// # Arguments
    /// * `config` - Validated model configuration
    /// * `vocab` - KCs of the dataset (used by vocabulary-indexed variants)
    /// * `seed` - Seed for parameter initialization and random predictions
    ///
    /// # Errors
    /// Returns a `ModelError` if the base model cannot be loaded or the
    /// configuration is unusable with this vocabulary.
    pub fn create(&self, config: &ModelConfig, vocab: &KcVocab, seed: u64) -> Result<Box<dyn KtModel>, ModelError> {
        debug!(model_type = %config.variant(), kcs = vocab.len(), seed, "Creating model instance");

        match config {
            ModelConfig::Lmkt(cfg) => {
                let base = self.base_model(&cfg.base_model, cfg.quantize)?;
                Ok(Box::new(LmktModel::new(base, cfg.lora.clone(), cfg.quantize, seed)))
            }
            ModelConfig::Dkt(cfg) => {
                if vocab.is_empty() {
                    return Err(invalid("dataset", "dkt needs at least one tagged KC"));
                }
                Ok(Box::new(DktModel::new(vocab.clone(), cfg.emb_size, seed)))
            }
            ModelConfig::Bkt => Ok(Box::new(BktModel::new())),
            ModelConfig::Majority => Ok(Box::new(MajorityModel::new())),
            ModelConfig::Random => Ok(Box::new(RandomModel::new(seed))),
        }
    }

    /// Parses `model_type`, validates `options` and creates the model.
    ///
    /// # Errors
    /// Returns `ModelError::UnknownVariant` for an unknown type, or any error
    /// from [`ModelConfig::from_options`] and [`ModelFactory::create`].
    pub fn create_from_str(
        &self,
        model_type: &str,
        options: &ModelOptions,
        vocab: &KcVocab,
        seed: u64,
    ) -> Result<Box<dyn KtModel>, ModelError> {
        let variant: ModelVariant = model_type.parse()?;
        let config = ModelConfig::from_options(variant, options)?;
        self.create(&config, vocab, seed)
    }
}
