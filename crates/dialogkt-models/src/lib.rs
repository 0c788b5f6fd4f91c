//! Knowledge-tracing model implementations for dialogkt.
//!
//! This crate provides concrete implementations of the `KtModel` trait.
//!
//! # Supported Variants
//!
//! - **lmkt**: Frozen base model with trainable low-rank adapters, optional 4-bit quantization
//! - **dkt**: Deep knowledge tracing over turn-level interactions
//! - **bkt**: Bayesian knowledge tracing fitted per KC
//! - **majority**: Training-set positive rate
//! - **random**: Hash-seeded uniform predictions

pub mod baselines;
pub mod bkt;
pub mod dkt;
pub mod encoder;
pub mod factory;
pub mod lmkt;
pub mod quant;

pub use baselines::{MajorityModel, RandomModel};
pub use bkt::{BktModel, BktParams};
pub use dkt::DktModel;
pub use encoder::{BaseModel, HashedEncoder};
pub use factory::{DktConfig, LmktConfig, ModelConfig, ModelFactory, ModelOptions};
pub use lmkt::{LmktModel, LoraConfig};
pub use quant::{QuantizedBase, Quantized4Bit};
