// init.rs — Weight initializers used by the HRED layers.
//
// Recurrent (hidden-to-hidden) matrices are orthogonal so that repeated
// multiplication across a long unroll neither shrinks nor blows up the state.
// Everything else is a narrow Gaussian; biases start at zero.

use burn::{
    module::Param,
    nn::Initializer,
    tensor::{backend::Backend, Tensor, TensorData},
};
use rand::Rng;
use rand_distr::StandardNormal;

/// Standard deviation of every non-recurrent weight.
pub const WEIGHT_STD: f64 = 0.001;

/// `Normal(0, 0.001)` initializer.
pub fn small_normal() -> Initializer {
    Initializer::Normal { mean: 0.0, std: WEIGHT_STD }
}

/// Square `dim × dim` orthogonal matrix.
///
/// Draws a standard-normal matrix on the host and orthonormalises its rows
/// with modified Gram-Schmidt. Rows that collapse numerically are redrawn.
pub fn orthogonal<B: Backend, R: Rng + ?Sized>(
    dim: usize,
    device: &B::Device,
    rng: &mut R,
) -> Param<Tensor<B, 2>> {
    let values = orthogonal_values(dim, rng);
    let data = TensorData::new(values, [dim, dim]);
    Param::from_tensor(Tensor::from_data(data, device))
}

/// Row-major `dim × dim` orthogonal matrix as plain values.
pub fn orthogonal_values<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> Vec<f32> {
    let mut rows: Vec<Vec<f64>> = Vec::with_capacity(dim);

    while rows.len() < dim {
        let mut v: Vec<f64> = (0..dim).map(|_| rng.sample(StandardNormal)).collect();

        for q in &rows {
            let proj = dot(&v, q);
            for (vi, qi) in v.iter_mut().zip(q) {
                *vi -= proj * qi;
            }
        }

        let norm = dot(&v, &v).sqrt();
        if norm < 1e-6 {
            continue;
        }
        v.iter_mut().for_each(|x| *x /= norm);
        rows.push(v);
    }

    rows.into_iter().flatten().map(|x| x as f32).collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
