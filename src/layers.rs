// layers.rs — Building blocks of the HRED graph.
//
//   token ids ──► TokenEmbedding ──► QueryEncoder ──► SessionEncoder ─┐
//                      │                                              │ state
//                      └──────────────► Decoder ◄─────────────────────┤
//                      │                   │                          │
//                      └──────────────► OutputLayer ◄─────────────────┘
//                                          │
//                                     LogitsLayer ──► vocabulary scores
//
// Every layer is a Burn module generic over the backend. Recurrent layers
// expose a single-timestep `step`; the unroll lives in `model.rs`.
// Masks are `[batch, 1]` float tensors and broadcast over the hidden size.

use burn::{
    module::{Module, Param},
    nn::{Embedding, EmbeddingConfig, Initializer, Linear, LinearConfig},
    tensor::{activation, backend::Backend, Int, Tensor},
};
use rand::Rng;

use crate::config::GatePreactivation;
use crate::init::{orthogonal, small_normal};

// ──────────────────────────────────────────────────────────────────────────────
// Token Embedding
// ──────────────────────────────────────────────────────────────────────────────

/// Learned token embeddings: vocabulary → embedding_dim.
#[derive(Module, Debug)]
pub struct TokenEmbedding<B: Backend> {
    embedding: Embedding<B>,
}

impl<B: Backend> TokenEmbedding<B> {
    pub fn new(device: &B::Device, vocab_size: usize, embedding_dim: usize) -> Self {
        let embedding = EmbeddingConfig::new(vocab_size, embedding_dim)
            .with_initializer(small_normal())
            .init(device);
        Self { embedding }
    }

    /// Look up ids of any rank. `D2` must be `D + 1`:
    /// `[d0, …, dn]` → `[d0, …, dn, embedding_dim]`.
    pub fn forward<const D: usize, const D2: usize>(&self, ids: Tensor<B, D, Int>) -> Tensor<B, D2> {
        assert_eq!(D2, D + 1, "embedding output rank must be input rank + 1");

        let dims = ids.dims();
        let count: usize = dims.iter().product();
        let [_, embedding_dim] = self.embedding.weight.dims();

        let flat = ids.reshape([1, count]);
        let vectors = self.embedding.forward(flat); // [1, count, E]

        let mut shape = [0usize; D2];
        shape[..D].copy_from_slice(&dims);
        shape[D] = embedding_dim;
        vectors.reshape(shape)
    }

    /// The `[vocab_size, embedding_dim]` lookup table.
    pub fn weight(&self) -> Tensor<B, 2> {
        self.embedding.weight.val()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// GRU gate parameters
// ──────────────────────────────────────────────────────────────────────────────

/// Parameters of one GRU gate: input, recurrent and (optionally) state
/// projections plus a bias.
#[derive(Module, Debug)]
pub struct Gate<B: Backend> {
    pub input_weight: Param<Tensor<B, 2>>,
    pub hidden_weight: Param<Tensor<B, 2>>,
    pub state_weight: Option<Param<Tensor<B, 2>>>,
    pub bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> Gate<B> {
    pub fn new<R: Rng + ?Sized>(
        device: &B::Device,
        x_dim: usize,
        y_dim: usize,
        state_dim: Option<usize>,
        rng: &mut R,
    ) -> Self {
        Self {
            input_weight: small_normal().init([x_dim, y_dim], device),
            hidden_weight: orthogonal(y_dim, device, rng),
            state_weight: state_dim.map(|s_dim| small_normal().init([s_dim, y_dim], device)),
            bias: Initializer::Zeros.init([y_dim], device),
        }
    }

    /// Projection of the input, kept separate so the caller decides where the
    /// nonlinearity goes.
    fn input_term(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        x.matmul(self.input_weight.val())
    }

    /// Recurrent + state + bias terms.
    fn remaining_terms(&self, h: Tensor<B, 2>, state: Option<&Tensor<B, 2>>) -> Tensor<B, 2> {
        let mut sum = h.matmul(self.hidden_weight.val()) + self.bias.val().unsqueeze::<2>();
        if let (Some(weight), Some(state)) = (&self.state_weight, state) {
            sum = sum + state.clone().matmul(weight.val());
        }
        sum
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// GRU cell
// ──────────────────────────────────────────────────────────────────────────────

/// Gated recurrent unit, optionally conditioned on an external state vector.
///
/// ```text
/// r  = σ(x·Wi_r + h·Wh_r [+ s·Ws_r] + b_r)
/// z  = σ(x·Wi_z + h·Wh_z [+ s·Ws_z] + b_z)
/// h~ = tanh(x·Wi_h + (r ⊙ h)·Wh_h [+ s·Ws_h] + b_h)
/// h' = (1 − z) ⊙ h + z ⊙ h~
/// ```
///
/// With `GatePreactivation::InputOnly` the nonlinearity wraps `x·Wi` alone.
#[derive(Module, Debug)]
pub struct GruCell<B: Backend> {
    reset: Gate<B>,
    update: Gate<B>,
    candidate: Gate<B>,
    input_only: bool,
    hidden_size: usize,
}

impl<B: Backend> GruCell<B> {
    pub fn new<R: Rng + ?Sized>(
        device: &B::Device,
        x_dim: usize,
        y_dim: usize,
        state_dim: Option<usize>,
        preactivation: GatePreactivation,
        rng: &mut R,
    ) -> Self {
        Self {
            reset: Gate::new(device, x_dim, y_dim, state_dim, rng),
            update: Gate::new(device, x_dim, y_dim, state_dim, rng),
            candidate: Gate::new(device, x_dim, y_dim, state_dim, rng),
            input_only: preactivation == GatePreactivation::InputOnly,
            hidden_size: y_dim,
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// One transition without state conditioning.
    pub fn step(&self, h_prev: Tensor<B, 2>, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.transition(h_prev, x, None)
    }

    /// One transition with every gate additionally driven by `state`.
    pub fn step_with_state(&self, h_prev: Tensor<B, 2>, x: Tensor<B, 2>, state: &Tensor<B, 2>) -> Tensor<B, 2> {
        self.transition(h_prev, x, Some(state))
    }

    pub fn reset_gate(&self) -> &Gate<B> {
        &self.reset
    }

    pub fn update_gate(&self) -> &Gate<B> {
        &self.update
    }

    pub fn candidate_gate(&self) -> &Gate<B> {
        &self.candidate
    }

    fn transition(&self, h_prev: Tensor<B, 2>, x: Tensor<B, 2>, state: Option<&Tensor<B, 2>>) -> Tensor<B, 2> {
        let r = self.gate(&self.reset, x.clone(), h_prev.clone(), state, activation::sigmoid);
        let z = self.gate(&self.update, x.clone(), h_prev.clone(), state, activation::sigmoid);
        let h_tilde = self.gate(&self.candidate, x, r * h_prev.clone(), state, activation::tanh);

        let keep = z.clone().neg().add_scalar(1.0);
        keep * h_prev + z * h_tilde
    }

    fn gate(
        &self,
        gate: &Gate<B>,
        x: Tensor<B, 2>,
        h: Tensor<B, 2>,
        state: Option<&Tensor<B, 2>>,
        act: fn(Tensor<B, 2>) -> Tensor<B, 2>,
    ) -> Tensor<B, 2> {
        let input = gate.input_term(x);
        let rest = gate.remaining_terms(h, state);
        if self.input_only {
            act(input) + rest
        } else {
            act(input + rest)
        }
    }
}

/// `mask ⊙ keep + (1 − mask) ⊙ fresh`.
pub fn blend<B: Backend>(mask: Tensor<B, 2>, keep: Tensor<B, 2>, fresh: Tensor<B, 2>) -> Tensor<B, 2> {
    let inverse = mask.clone().neg().add_scalar(1.0);
    mask * keep + inverse * fresh
}

// ──────────────────────────────────────────────────────────────────────────────
// Query encoder
// ──────────────────────────────────────────────────────────────────────────────

/// GRU whose carried state is zeroed right after an end-of-query token.
#[derive(Module, Debug)]
pub struct QueryEncoder<B: Backend> {
    cell: GruCell<B>,
}

impl<B: Backend> QueryEncoder<B> {
    pub fn new<R: Rng + ?Sized>(
        device: &B::Device,
        embedding_dim: usize,
        hidden_size: usize,
        preactivation: GatePreactivation,
        rng: &mut R,
    ) -> Self {
        let cell = GruCell::new(device, embedding_dim, hidden_size, None, preactivation, rng);
        Self { cell }
    }

    /// Returns `(h, reset ⊙ h)`. The second value is what the next step
    /// receives as `h_prev`; the first is the query summary before the reset.
    pub fn step(&self, h_prev: Tensor<B, 2>, x: Tensor<B, 2>, reset: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let h = self.cell.step(h_prev, x);
        let h_reset = reset * h.clone();
        (h, h_reset)
    }

    pub fn cell(&self) -> &GruCell<B> {
        &self.cell
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Session encoder
// ──────────────────────────────────────────────────────────────────────────────

/// GRU that holds its state while a query is in progress and only takes the
/// freshly computed state at a query boundary.
#[derive(Module, Debug)]
pub struct SessionEncoder<B: Backend> {
    cell: GruCell<B>,
}

impl<B: Backend> SessionEncoder<B> {
    pub fn new<R: Rng + ?Sized>(
        device: &B::Device,
        query_hidden_size: usize,
        hidden_size: usize,
        preactivation: GatePreactivation,
        rng: &mut R,
    ) -> Self {
        let cell = GruCell::new(device, query_hidden_size, hidden_size, None, preactivation, rng);
        Self { cell }
    }

    /// Returns `(h, retain ⊙ h_prev + (1 − retain) ⊙ h)`.
    pub fn step(&self, h_prev: Tensor<B, 2>, x: Tensor<B, 2>, retain: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let h = self.cell.step(h_prev.clone(), x);
        let h_retain = blend(retain, h_prev, h.clone());
        (h, h_retain)
    }

    pub fn cell(&self) -> &GruCell<B> {
        &self.cell
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Decoder
// ──────────────────────────────────────────────────────────────────────────────

/// State-conditioned GRU that restarts from `tanh(state·W + b)` at every
/// session boundary.
#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    start_weight: Param<Tensor<B, 2>>,
    start_bias: Param<Tensor<B, 1>>,
    cell: GruCell<B>,
}

impl<B: Backend> Decoder<B> {
    pub fn new<R: Rng + ?Sized>(
        device: &B::Device,
        embedding_dim: usize,
        session_hidden_size: usize,
        hidden_size: usize,
        preactivation: GatePreactivation,
        rng: &mut R,
    ) -> Self {
        Self {
            start_weight: small_normal().init([session_hidden_size, hidden_size], device),
            start_bias: Initializer::Zeros.init([hidden_size], device),
            cell: GruCell::new(
                device,
                embedding_dim,
                hidden_size,
                Some(session_hidden_size),
                preactivation,
                rng,
            ),
        }
    }

    /// Learned initial decoder state for a fresh utterance.
    pub fn cold_start(&self, state: Tensor<B, 2>) -> Tensor<B, 2> {
        activation::tanh(state.matmul(self.start_weight.val()) + self.start_bias.val().unsqueeze::<2>())
    }

    /// `retain ⊙ h_prev + (1 − retain) ⊙ cold_start(state)`.
    pub fn effective_previous(&self, h_prev: Tensor<B, 2>, retain: Tensor<B, 2>, state: Tensor<B, 2>) -> Tensor<B, 2> {
        blend(retain, h_prev, self.cold_start(state))
    }

    pub fn step(&self, h_prev: Tensor<B, 2>, x: Tensor<B, 2>, retain: Tensor<B, 2>, state: Tensor<B, 2>) -> Tensor<B, 2> {
        let h_prev = self.effective_previous(h_prev, retain, state.clone());
        self.cell.step_with_state(h_prev, x, &state)
    }

    pub fn cell(&self) -> &GruCell<B> {
        &self.cell
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Output and logits
// ──────────────────────────────────────────────────────────────────────────────

/// Linear readout `h·Wh + state·Ws + x·Wi + b`.
#[derive(Module, Debug)]
pub struct OutputLayer<B: Backend> {
    hidden_weight: Param<Tensor<B, 2>>,
    state_weight: Param<Tensor<B, 2>>,
    input_weight: Param<Tensor<B, 2>>,
    bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> OutputLayer<B> {
    pub fn new(
        device: &B::Device,
        embedding_dim: usize,
        decoder_hidden_size: usize,
        session_hidden_size: usize,
        output_size: usize,
    ) -> Self {
        Self {
            hidden_weight: small_normal().init([decoder_hidden_size, output_size], device),
            state_weight: small_normal().init([session_hidden_size, output_size], device),
            input_weight: small_normal().init([embedding_dim, output_size], device),
            bias: small_normal().init([output_size], device),
        }
    }

    pub fn forward(&self, h: Tensor<B, 2>, x: Tensor<B, 2>, state: Tensor<B, 2>) -> Tensor<B, 2> {
        h.matmul(self.hidden_weight.val())
            + state.matmul(self.state_weight.val())
            + x.matmul(self.input_weight.val())
            + self.bias.val().unsqueeze::<2>()
    }
}

/// Projection from the readout to raw vocabulary scores.
#[derive(Module, Debug)]
pub struct LogitsLayer<B: Backend> {
    projection: Linear<B>,
}

impl<B: Backend> LogitsLayer<B> {
    pub fn new(device: &B::Device, output_size: usize, vocab_size: usize) -> Self {
        let projection = LinearConfig::new(output_size, vocab_size)
            .with_bias(true)
            .with_initializer(small_normal())
            .init(device);
        Self { projection }
    }

    /// `[batch, output_size]` → `[batch, vocab_size]`, no softmax.
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.projection.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData};
    use rand::{rngs::StdRng, SeedableRng};

    type TB = NdArray<f32>;

    fn values(t: Tensor<TB, 2>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    fn random(batch: usize, dim: usize) -> Tensor<TB, 2> {
        Tensor::random([batch, dim], Distribution::Normal(0.0, 1.0), &Default::default())
    }

    fn mask(value: f32, batch: usize) -> Tensor<TB, 2> {
        Tensor::from_data(TensorData::new(vec![value; batch], [batch, 1]), &Default::default())
    }

    #[test]
    fn embedding_shape_and_rows() {
        let device = Default::default();
        let emb = TokenEmbedding::<TB>::new(&device, 10, 4);
        let ids = Tensor::<TB, 2, Int>::from_data(TensorData::new(vec![3i64, 0, 9, 3, 1, 7], [3, 2]), &device);

        let out: Tensor<TB, 3> = emb.forward(ids);
        assert_eq!(out.dims(), [3, 2, 4]);

        let table = values(emb.weight());
        let got = out.into_data().to_vec::<f32>().unwrap();
        for (i, id) in [3usize, 0, 9, 3, 1, 7].iter().enumerate() {
            assert_eq!(&got[i * 4..(i + 1) * 4], &table[id * 4..(id + 1) * 4]);
        }
    }

    #[test]
    fn embedding_of_a_vector_is_a_matrix() {
        let device = Default::default();
        let emb = TokenEmbedding::<TB>::new(&device, 5, 3);
        let ids = Tensor::<TB, 1, Int>::from_data(TensorData::new(vec![4i64, 2], [2]), &device);
        let out: Tensor<TB, 2> = emb.forward(ids);
        assert_eq!(out.dims(), [2, 3]);
    }

    #[test]
    fn recurrent_weights_are_orthogonal() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(1);
        let cell = GruCell::<TB>::new(&device, 4, 6, None, GatePreactivation::FullSum, &mut rng);

        assert_eq!(cell.hidden_size(), 6);
        for gate in [cell.reset_gate(), cell.update_gate(), cell.candidate_gate()] {
            let w = gate.hidden_weight.val();
            assert_eq!(w.dims(), [6, 6]);
            let product = values(w.clone().matmul(w.transpose()));
            for i in 0..6 {
                for j in 0..6 {
                    let expected = if i == j { 1.0 } else { 0.0 };
                    assert!((product[i * 6 + j] - expected).abs() < 1e-4);
                }
            }
            assert!(gate.state_weight.is_none());
        }

        // Each gate draws its own matrix.
        let reset = values(cell.reset_gate().hidden_weight.val());
        assert_ne!(reset, values(cell.update_gate().hidden_weight.val()));
    }

    #[test]
    fn gru_output_has_hidden_shape_and_stays_bounded() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(2);
        let cell = GruCell::<TB>::new(&device, 4, 6, Some(3), GatePreactivation::FullSum, &mut rng);

        let h = cell.step_with_state(activation::tanh(random(2, 6)), random(2, 4), &random(2, 3));
        assert_eq!(h.dims(), [2, 6]);
        // Convex mix of values in (-1, 1) stays inside (-1, 1).
        assert!(values(h).iter().all(|v| v.abs() < 1.0));
    }

    #[test]
    fn input_only_form_differs_from_full_sum() {
        let device = Default::default();
        let full = GruCell::<TB>::new(&device, 4, 6, None, GatePreactivation::FullSum, &mut StdRng::seed_from_u64(3));
        // Same weights, other gate form.
        let partial = GruCell { input_only: true, ..full.clone() };

        let h_prev = random(2, 6);
        let x = random(2, 4);
        let a = values(full.step(h_prev.clone(), x.clone()));
        let b = values(partial.step(h_prev, x));
        assert!(a.iter().zip(&b).any(|(p, q)| (p - q).abs() > 1e-6));
    }

    #[test]
    fn query_reset_zero_clears_state() {
        let device = Default::default();
        let enc = QueryEncoder::<TB>::new(&device, 4, 6, GatePreactivation::FullSum, &mut StdRng::seed_from_u64(4));

        let (h, h_reset) = enc.step(random(3, 6), random(3, 4), mask(0.0, 3));
        assert!(values(h_reset).iter().all(|&v| v == 0.0));
        assert!(values(h).iter().any(|&v| v != 0.0));
    }

    #[test]
    fn query_reset_one_keeps_raw_state() {
        let device = Default::default();
        let enc = QueryEncoder::<TB>::new(&device, 4, 6, GatePreactivation::FullSum, &mut StdRng::seed_from_u64(5));

        let (h, h_reset) = enc.step(random(3, 6), random(3, 4), mask(1.0, 3));
        assert_eq!(values(h), values(h_reset));
    }

    #[test]
    fn session_retain_one_freezes_state() {
        let device = Default::default();
        let enc = SessionEncoder::<TB>::new(&device, 6, 5, GatePreactivation::FullSum, &mut StdRng::seed_from_u64(6));

        let h_prev = random(2, 5);
        let (_, h_retain) = enc.step(h_prev.clone(), random(2, 6), mask(1.0, 2));
        assert_eq!(values(h_retain), values(h_prev));
    }

    #[test]
    fn session_retain_zero_takes_fresh_state() {
        let device = Default::default();
        let enc = SessionEncoder::<TB>::new(&device, 6, 5, GatePreactivation::FullSum, &mut StdRng::seed_from_u64(7));

        let (h, h_retain) = enc.step(random(2, 5), random(2, 6), mask(0.0, 2));
        assert_eq!(values(h), values(h_retain));
    }

    #[test]
    fn decoder_cold_start_ignores_previous_state() {
        let device = Default::default();
        let dec = Decoder::<TB>::new(&device, 4, 5, 7, GatePreactivation::FullSum, &mut StdRng::seed_from_u64(8));

        let state = random(2, 5);
        let expected = values(dec.cold_start(state.clone()));
        let a = dec.effective_previous(random(2, 7), mask(0.0, 2), state.clone());
        let b = dec.effective_previous(random(2, 7).mul_scalar(50.0), mask(0.0, 2), state);
        assert_eq!(values(a), expected);
        assert_eq!(values(b), expected);
    }

    #[test]
    fn decoder_retain_keeps_previous_state() {
        let device = Default::default();
        let dec = Decoder::<TB>::new(&device, 4, 5, 7, GatePreactivation::FullSum, &mut StdRng::seed_from_u64(9));

        let h_prev = random(2, 7);
        let eff = dec.effective_previous(h_prev.clone(), mask(1.0, 2), random(2, 5));
        assert_eq!(values(eff), values(h_prev));

        let h = dec.step(random(2, 7), random(2, 4), mask(1.0, 2), random(2, 5));
        assert_eq!(h.dims(), [2, 7]);
    }

    #[test]
    fn output_and_logits_shapes() {
        let device = Default::default();
        let out = OutputLayer::<TB>::new(&device, 4, 7, 5, 6);
        let logits = LogitsLayer::<TB>::new(&device, 6, 11);

        let y = out.forward(random(2, 7), random(2, 4), random(2, 5));
        assert_eq!(y.dims(), [2, 6]);
        assert_eq!(logits.forward(y).dims(), [2, 11]);
    }

    #[test]
    fn output_layer_is_linear() {
        let device = Default::default();
        let out = OutputLayer::<TB>::new(&device, 4, 7, 5, 6);
        let zeros = |b, d| Tensor::<TB, 2>::zeros([b, d], &device);

        // With all inputs zero only the bias remains.
        let y = values(out.forward(zeros(1, 7), zeros(1, 4), zeros(1, 5)));
        assert_eq!(y, values(out.bias.val().unsqueeze::<2>()));
    }
}
