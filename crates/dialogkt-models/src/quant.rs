//! Block-wise symmetric 4-bit quantization of frozen base weights.
//!
//! Each block of [`BLOCK_SIZE`] values shares one scale (`max_abs / 7`); values
//! are rounded to integers in `-7..=7` and packed two per byte.

use crate::encoder::BaseModel;
use dialogkt_abstraction::{ModelError, TurnContext};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const BLOCK_SIZE: usize = 64;

const QMAX: f64 = 7.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantized4Bit {
    pub scales: Vec<f32>,
    /// Two signed nibbles per byte, low nibble first.
    pub data: Vec<u8>,
    pub rows: usize,
    pub cols: usize,
}

impl Quantized4Bit {
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.scales.len() * 4 + self.data.len()
    }
}

fn encode_nibble(q: i8) -> u8 {
    (q as u8) & 0x0F
}

fn decode_nibble(n: u8) -> i8 {
    // sign-extend the low 4 bits
    ((n << 4) as i8) >> 4
}

#[must_use]
pub fn quantize_4bit(weights: &Array2<f64>) -> Quantized4Bit {
    let (rows, cols) = weights.dim();
    let values: Vec<f64> = weights.iter().copied().collect();
    let mut scales = Vec::with_capacity(values.len().div_ceil(BLOCK_SIZE));
    let mut nibbles = Vec::with_capacity(values.len());

    for block in values.chunks(BLOCK_SIZE) {
        let max_abs = block.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let scale = if max_abs > 0.0 { max_abs / QMAX } else { 1.0 };
        scales.push(scale as f32);
        for v in block {
            let q = (v / scale).round().clamp(-QMAX, QMAX) as i8;
            nibbles.push(encode_nibble(q));
        }
    }

    let data = nibbles
        .chunks(2)
        .map(|pair| pair[0] | (pair.get(1).copied().unwrap_or(0) << 4))
        .collect();

    Quantized4Bit { scales, data, rows, cols }
}

/// Expands packed blocks back to a dense matrix.
///
/// # Errors
/// Returns `ModelError::State` when the packed buffers are too short for the
/// declared shape.
pub fn dequantize_4bit(q: &Quantized4Bit) -> Result<Array2<f64>, ModelError> {
    let n = q.len();
    if q.data.len() < n.div_ceil(2) || q.scales.len() < n.div_ceil(BLOCK_SIZE) {
        return Err(ModelError::State(format!(
            "packed 4-bit weights hold {} bytes and {} scales, {}x{} needs {} and {}",
            q.data.len(),
            q.scales.len(),
            q.rows,
            q.cols,
            n.div_ceil(2),
            n.div_ceil(BLOCK_SIZE)
        )));
    }
    let mut values = Vec::with_capacity(n);
    for i in 0..n {
        let byte = q.data[i / 2];
        let nibble = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
        let scale = f64::from(q.scales[i / BLOCK_SIZE]);
        values.push(f64::from(decode_nibble(nibble)) * scale);
    }
    Array2::from_shape_vec((q.rows, q.cols), values).map_err(|e| ModelError::State(format!("4-bit weights: {e}")))
}

/// A base model whose hidden projection is stored in 4-bit blocks.
///
/// The forward pass runs on the dequantized projection, so predictions reflect
/// the rounding error of the compressed weights.
#[derive(Debug)]
pub struct QuantizedBase {
    inner: Arc<dyn BaseModel>,
    packed: Quantized4Bit,
    projection: Array2<f64>,
}

impl QuantizedBase {
    /// Packs the projection of `inner` and keeps its dequantized form.
    ///
    /// # Errors
    /// Returns `ModelError::State` if the packed weights cannot be expanded.
    pub fn new(inner: Arc<dyn BaseModel>) -> Result<Self, ModelError> {
        let packed = quantize_4bit(inner.projection());
        let projection = dequantize_4bit(&packed)?;
        Ok(Self { inner, packed, projection })
    }

    #[must_use]
    pub const fn packed(&self) -> &Quantized4Bit {
        &self.packed
    }
}

impl BaseModel for QuantizedBase {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn hidden_size(&self) -> usize {
        self.inner.hidden_size()
    }

    fn encode_context(&self, context: &TurnContext) -> Array1<f64> {
        self.inner.encode_context(context)
    }

    fn encode_query(&self, context: &TurnContext, kc: &str) -> Array1<f64> {
        self.inner.encode_query(context, kc)
    }

    fn projection(&self) -> &Array2<f64> {
        &self.projection
    }

    fn readout(&self) -> &Array1<f64> {
        self.inner.readout()
    }

    fn nominal_parameters(&self) -> Option<u64> {
        self.inner.nominal_parameters()
    }
}
