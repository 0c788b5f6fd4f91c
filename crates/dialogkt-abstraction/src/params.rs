//! Named parameter tensors and the arithmetic the optimizer loop needs.

use crate::ModelError;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// A named 2-D parameter. Vectors are stored as `1 x n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamTensor {
    pub name: String,
    pub value: Array2<f64>,
}

/// Ordered collection of parameters; gradients use the same layout.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParamSet {
    tensors: Vec<ParamTensor>,
}

impl ParamSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: Array2<f64>) {
        self.tensors.push(ParamTensor { name: name.into(), value });
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Array2<f64>> {
        self.tensors.iter().find(|t| t.name == name).map(|t| &t.value)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Array2<f64>> {
        self.tensors.iter_mut().find(|t| t.name == name).map(|t| &mut t.value)
    }

    /// Like [`ParamSet::get`], but a missing tensor is a state error.
    pub fn require(&self, name: &str) -> Result<&Array2<f64>, ModelError> {
        self.get(name).ok_or_else(|| ModelError::State(format!("missing parameter `{name}`")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParamTensor> {
        self.tensors.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ParamTensor> {
        self.tensors.iter_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of scalar values.
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.tensors.iter().map(|t| t.value.len()).sum()
    }

    /// Same names and shapes, all zeros.
    #[must_use]
    pub fn zeros_like(&self) -> Self {
        Self {
            tensors: self
                .tensors
                .iter()
                .map(|t| ParamTensor { name: t.name.clone(), value: Array2::zeros(t.value.raw_dim()) })
                .collect(),
        }
    }

    /// Whether `other` has the same names and shapes in the same order.
    #[must_use]
    pub fn same_layout(&self, other: &Self) -> bool {
        self.tensors.len() == other.tensors.len()
            && self
                .tensors
                .iter()
                .zip(&other.tensors)
                .all(|(a, b)| a.name == b.name && a.value.dim() == b.value.dim())
    }

    /// `self += scale * other`.
    pub fn add_scaled(&mut self, other: &Self, scale: f64) -> Result<(), ModelError> {
        if !self.same_layout(other) {
            return Err(ModelError::State("parameter layouts differ".to_string()));
        }
        for (dst, src) in self.tensors.iter_mut().zip(&other.tensors) {
            dst.value.scaled_add(scale, &src.value);
        }
        Ok(())
    }

    pub fn scale(&mut self, factor: f64) {
        for t in &mut self.tensors {
            t.value.mapv_inplace(|v| v * factor);
        }
    }

    /// L2 norm over every element of every tensor.
    #[must_use]
    pub fn global_norm(&self) -> f64 {
        self.tensors
            .iter()
            .map(|t| t.value.iter().map(|v| v * v).sum::<f64>())
            .sum::<f64>()
            .sqrt()
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.tensors.iter().all(|t| t.value.iter().all(|v| v.is_finite()))
    }

    /// Copies values from `other`, which must share the layout.
    pub fn assign(&mut self, other: &Self) -> Result<(), ModelError> {
        if !self.same_layout(other) {
            return Err(ModelError::State(format!(
                "cannot load parameters: expected {:?}, got {:?}",
                self.describe(),
                other.describe()
            )));
        }
        for (dst, src) in self.tensors.iter_mut().zip(&other.tensors) {
            dst.value.assign(&src.value);
        }
        Ok(())
    }

    fn describe(&self) -> Vec<(String, (usize, usize))> {
        self.tensors.iter().map(|t| (t.name.clone(), t.value.dim())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn sample() -> ParamSet {
        let mut p = ParamSet::new();
        p.push("a", array![[3.0, 0.0]]);
        p.push("b", array![[0.0], [4.0]]);
        p
    }

    #[test]
    fn test_global_norm() {
        assert_abs_diff_eq!(sample().global_norm(), 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_add_scaled_and_scale() {
        let mut p = sample();
        let q = sample();
        p.add_scaled(&q, 1.0).unwrap();
        p.scale(0.5);
        assert_eq!(p, sample());
    }

    #[test]
    fn test_layout_mismatch_is_an_error() {
        let mut p = sample();
        let mut q = ParamSet::new();
        q.push("a", array![[1.0]]);
        assert!(p.add_scaled(&q, 1.0).is_err());
        assert!(p.assign(&q).is_err());
    }

    #[test]
    fn test_zeros_like_keeps_layout() {
        let z = sample().zeros_like();
        assert!(z.same_layout(&sample()));
        assert_abs_diff_eq!(z.global_norm(), 0.0);
        assert_eq!(z.num_elements(), 4);
    }

    #[test]
    fn test_is_finite_detects_nan() {
        let mut p = sample();
        p.get_mut("a").unwrap()[[0, 1]] = f64::NAN;
        assert!(!p.is_finite());
    }
}
