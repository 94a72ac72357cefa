// data.rs — Host-side token batches and their conversion to tensors.
//
// A batch is time-major: `inputs[t * batch_size + b]` is the token fed at
// step t to session b, `targets` holds the token the decoder should predict
// at that step. Reading and shuffling real session files is left to the
// caller; `SessionBatch::random` stands in for it during smoke runs.

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use rand::Rng;

use crate::boundary::{boundary_mask, BoundaryRule};
use crate::error::HredError;

/// A validated `(max_length, batch_size)` batch of input and target ids.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionBatch {
    inputs: Vec<i64>,
    targets: Vec<i64>,
    max_length: usize,
    batch_size: usize,
}

/// Device tensors for one batch.
#[derive(Debug, Clone)]
pub struct BatchTensors<B: Backend> {
    pub inputs: Tensor<B, 2, Int>,
    pub targets: Tensor<B, 2, Int>,
    pub mask: Tensor<B, 2>,
}

impl SessionBatch {
    /// Check lengths and id ranges before anything reaches the graph.
    pub fn new(
        inputs: Vec<i64>,
        targets: Vec<i64>,
        max_length: usize,
        batch_size: usize,
        vocab_size: usize,
    ) -> Result<Self, HredError> {
        let expected = max_length * batch_size;
        if inputs.len() != expected {
            return Err(HredError::shape("input tokens", &[expected], &[inputs.len()]));
        }
        if targets.len() != expected {
            return Err(HredError::shape("target tokens", &[expected], &[targets.len()]));
        }

        if let Some(&token) = inputs
            .iter()
            .chain(&targets)
            .find(|&&t| t < 0 || t as usize >= vocab_size)
        {
            return Err(HredError::TokenOutOfRange { token, vocab_size });
        }

        Ok(Self { inputs, targets, max_length, batch_size })
    }

    /// Draw `max_length + 1` rows of uniform ids and shift by one row:
    /// inputs are rows `0..max_length`, targets rows `1..=max_length`.
    pub fn random<R: Rng + ?Sized>(rng: &mut R, max_length: usize, batch_size: usize, vocab_size: usize) -> Self {
        let rows: Vec<i64> = (0..(max_length + 1) * batch_size)
            .map(|_| rng.gen_range(0..vocab_size as i64))
            .collect();
        let split = max_length * batch_size;

        Self {
            inputs: rows[..split].to_vec(),
            targets: rows[batch_size..].to_vec(),
            max_length,
            batch_size,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn inputs(&self) -> &[i64] {
        &self.inputs
    }

    pub fn targets(&self) -> &[i64] {
        &self.targets
    }

    /// Reset/retain mask for the inputs under `rule`, same layout as the ids.
    pub fn mask<R: BoundaryRule + ?Sized>(&self, rule: &R) -> Vec<f32> {
        boundary_mask(&self.inputs, rule)
    }

    pub fn to_tensors<B: Backend, R: BoundaryRule + ?Sized>(&self, rule: &R, device: &B::Device) -> BatchTensors<B> {
        let shape = [self.max_length, self.batch_size];
        BatchTensors {
            inputs: Tensor::from_data(TensorData::new(self.inputs.clone(), shape), device),
            targets: Tensor::from_data(TensorData::new(self.targets.clone(), shape), device),
            mask: Tensor::from_data(TensorData::new(self.mask(rule), shape), device),
        }
    }
}
