// model.rs — The full HRED graph.
//
// Per timestep t (time-major batch, shape [max_length, batch]):
//
//   x_t      = embed(X[t])
//   q, q_c   = query_encoder(q_c, x_t, mask_t)       q_c: carried (reset) state
//   s_raw, s = session_encoder(s, q, mask_t)         s:   carried (retained) state
//   d        = decoder(d, x_t, mask_t, s)
//   o        = output(d, x_t, s)
//   logits_t = logits(o)
//
// The model is generic over the Burn Backend so it runs on NdArray for tests
// and on any other backend without changes.

use burn::{
    module::Module,
    nn::loss::CrossEntropyLossConfig,
    tensor::{backend::Backend, Int, Tensor},
};
use rand::{rngs::StdRng, SeedableRng};

use crate::config::ModelConfig;
use crate::error::HredError;
use crate::layers::{Decoder, LogitsLayer, OutputLayer, QueryEncoder, SessionEncoder, TokenEmbedding};

// ──────────────────────────────────────────────────────────────────────────────
// Recurrent state
// ──────────────────────────────────────────────────────────────────────────────

/// Hidden states threaded through the unroll. Each tensor is `[batch, dim]`.
#[derive(Debug, Clone)]
pub struct HredState<B: Backend> {
    /// Query encoder output before the reset.
    pub query: Tensor<B, 2>,
    /// Query encoder state after the reset (what the next step receives).
    pub query_reset: Tensor<B, 2>,
    /// Freshly computed session encoder state.
    pub session: Tensor<B, 2>,
    /// Session encoder state after retain masking (what the next step receives).
    pub session_retain: Tensor<B, 2>,
    pub decoder: Tensor<B, 2>,
    pub output: Tensor<B, 2>,
}

impl<B: Backend> HredState<B> {
    /// Zero seeds for a batch of `batch_size` sessions.
    pub fn zeros(cfg: &ModelConfig, batch_size: usize, device: &B::Device) -> Self {
        let zeros = |dim: usize| Tensor::zeros([batch_size, dim], device);
        Self {
            query: zeros(cfg.query_hidden_size),
            query_reset: zeros(cfg.query_hidden_size),
            session: zeros(cfg.session_hidden_size),
            session_retain: zeros(cfg.session_hidden_size),
            decoder: zeros(cfg.decoder_hidden_size),
            output: zeros(cfg.output_hidden_size),
        }
    }

    /// Build from the packed layout: `query` and `session` are `[2, batch, dim]`
    /// with the raw state at index 0 and the masked state at index 1.
    pub fn from_packed(
        query: Tensor<B, 3>,
        session: Tensor<B, 3>,
        decoder: Tensor<B, 2>,
        output: Tensor<B, 2>,
    ) -> Result<Self, HredError> {
        let (query, query_reset) = unpack("query state", query)?;
        let (session, session_retain) = unpack("session state", session)?;
        Ok(Self { query, query_reset, session, session_retain, decoder, output })
    }

    /// Inverse of [`HredState::from_packed`] for the two encoder states.
    pub fn packed(&self) -> (Tensor<B, 3>, Tensor<B, 3>) {
        (
            Tensor::stack(vec![self.query.clone(), self.query_reset.clone()], 0),
            Tensor::stack(vec![self.session.clone(), self.session_retain.clone()], 0),
        )
    }

    /// Drop the autodiff graph so the state can seed the next batch.
    pub fn detach(self) -> Self {
        Self {
            query: self.query.detach(),
            query_reset: self.query_reset.detach(),
            session: self.session.detach(),
            session_retain: self.session_retain.detach(),
            decoder: self.decoder.detach(),
            output: self.output.detach(),
        }
    }
}

fn unpack<B: Backend>(what: &'static str, packed: Tensor<B, 3>) -> Result<(Tensor<B, 2>, Tensor<B, 2>), HredError> {
    let [pair, batch, dim] = packed.dims();
    if pair != 2 {
        return Err(HredError::shape(what, &[2, batch, dim], &[pair, batch, dim]));
    }
    let raw = packed.clone().slice([0..1, 0..batch, 0..dim]).reshape([batch, dim]);
    let masked = packed.slice([1..2, 0..batch, 0..dim]).reshape([batch, dim]);
    Ok((raw, masked))
}

/// Result of unrolling the graph over one batch.
#[derive(Debug, Clone)]
pub struct HredOutput<B: Backend> {
    /// Raw vocabulary scores, `[max_length, batch, vocab_size]`.
    pub logits: Tensor<B, 3>,
    /// Carried session state after every step, `[max_length, batch, session_hidden]`.
    pub session: Tensor<B, 3>,
    /// State after the last step.
    pub state: HredState<B>,
}

// ──────────────────────────────────────────────────────────────────────────────
// Complete HRED model
// ──────────────────────────────────────────────────────────────────────────────

/// Hierarchical recurrent encoder-decoder, generic over the Burn Backend.
#[derive(Module, Debug)]
pub struct Hred<B: Backend> {
    embedding: TokenEmbedding<B>,
    query_encoder: QueryEncoder<B>,
    session_encoder: SessionEncoder<B>,
    decoder: Decoder<B>,
    output: OutputLayer<B>,
    logits: LogitsLayer<B>,
    vocab_size: usize,
    query_hidden_size: usize,
    session_hidden_size: usize,
    decoder_hidden_size: usize,
    output_hidden_size: usize,
}

impl<B: Backend> Hred<B> {
    /// Construct every layer from a `ModelConfig`. Recurrent weights are drawn
    /// from a generator seeded with `cfg.seed`.
    pub fn new(cfg: &ModelConfig, device: &B::Device) -> Self {
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let gates = cfg.gate_preactivation;

        let embedding = TokenEmbedding::new(device, cfg.vocab_size, cfg.embedding_dim);
        let query_encoder = QueryEncoder::new(device, cfg.embedding_dim, cfg.query_hidden_size, gates, &mut rng);
        let session_encoder = SessionEncoder::new(
            device,
            cfg.query_hidden_size,
            cfg.session_hidden_size,
            gates,
            &mut rng,
        );
        let decoder = Decoder::new(
            device,
            cfg.embedding_dim,
            cfg.session_hidden_size,
            cfg.decoder_hidden_size,
            gates,
            &mut rng,
        );
        let output = OutputLayer::new(
            device,
            cfg.embedding_dim,
            cfg.decoder_hidden_size,
            cfg.session_hidden_size,
            cfg.output_hidden_size,
        );
        let logits = LogitsLayer::new(device, cfg.output_hidden_size, cfg.vocab_size);

        Self {
            embedding,
            query_encoder,
            session_encoder,
            decoder,
            output,
            logits,
            vocab_size: cfg.vocab_size,
            query_hidden_size: cfg.query_hidden_size,
            session_hidden_size: cfg.session_hidden_size,
            decoder_hidden_size: cfg.decoder_hidden_size,
            output_hidden_size: cfg.output_hidden_size,
        }
    }

    /// Unroll over a whole batch.
    ///
    /// # Arguments
    /// * `inputs`: token ids `[max_length, batch]`.
    /// * `mask`: 1.0 inside a query, 0.0 at an end-of-query step, `[max_length, batch]`.
    /// * `state`: seed states, usually [`HredState::zeros`].
    pub fn forward(
        &self,
        inputs: Tensor<B, 2, Int>,
        mask: Tensor<B, 2>,
        state: HredState<B>,
    ) -> Result<HredOutput<B>, HredError> {
        let [max_length, batch] = inputs.dims();
        self.check_shapes(&inputs, &mask, &state)?;

        let embedded: Tensor<B, 3> = self.embedding.forward(inputs); // [T, B, E]
        let [_, _, embedding_dim] = embedded.dims();

        let mut state = state;
        let mut logits = Vec::with_capacity(max_length);
        let mut sessions = Vec::with_capacity(max_length);

        for t in 0..max_length {
            let x_t = embedded
                .clone()
                .slice([t..t + 1, 0..batch, 0..embedding_dim])
                .reshape([batch, embedding_dim]);
            let mask_t = mask.clone().slice([t..t + 1, 0..batch]).reshape([batch, 1]);

            state = self.step(state, x_t, mask_t);
            logits.push(self.logits.forward(state.output.clone()));
            sessions.push(state.session_retain.clone());
        }

        Ok(HredOutput {
            logits: Tensor::stack(logits, 0),
            session: Tensor::stack(sessions, 0),
            state,
        })
    }

    /// One timestep over embedded input `x_t` `[batch, E]` and mask `[batch, 1]`.
    pub fn step(&self, state: HredState<B>, x_t: Tensor<B, 2>, mask_t: Tensor<B, 2>) -> HredState<B> {
        let (query, query_reset) = self.query_encoder.step(state.query_reset, x_t.clone(), mask_t.clone());
        let (session, session_retain) =
            self.session_encoder.step(state.session_retain, query.clone(), mask_t.clone());
        let decoder = self.decoder.step(state.decoder, x_t.clone(), mask_t, session_retain.clone());
        let output = self.output.forward(decoder.clone(), x_t, session_retain.clone());

        HredState { query, query_reset, session, session_retain, decoder, output }
    }

    /// Mean token-level cross-entropy of `logits` `[T, B, V]` against `targets` `[T, B]`.
    pub fn loss(&self, logits: Tensor<B, 3>, targets: Tensor<B, 2, Int>) -> Result<Tensor<B, 1>, HredError> {
        let [max_length, batch, vocab] = logits.dims();
        if targets.dims() != [max_length, batch] {
            return Err(HredError::shape("targets", &[max_length, batch], &targets.dims()));
        }

        let loss_fn = CrossEntropyLossConfig::new().init(&logits.device());
        Ok(loss_fn.forward(
            logits.reshape([max_length * batch, vocab]),
            targets.reshape([max_length * batch]),
        ))
    }

    pub fn embedding(&self) -> &TokenEmbedding<B> {
        &self.embedding
    }

    pub fn query_encoder(&self) -> &QueryEncoder<B> {
        &self.query_encoder
    }

    pub fn session_encoder(&self) -> &SessionEncoder<B> {
        &self.session_encoder
    }

    pub fn decoder(&self) -> &Decoder<B> {
        &self.decoder
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn check_shapes(&self, inputs: &Tensor<B, 2, Int>, mask: &Tensor<B, 2>, state: &HredState<B>) -> Result<(), HredError> {
        let [max_length, batch] = inputs.dims();
        if max_length == 0 || batch == 0 {
            return Err(HredError::shape("inputs", &[max_length.max(1), batch.max(1)], &[max_length, batch]));
        }
        if mask.dims() != [max_length, batch] {
            return Err(HredError::shape("mask", &[max_length, batch], &mask.dims()));
        }

        let expected = [
            ("query state", &state.query_reset, self.query_hidden_size),
            ("session state", &state.session_retain, self.session_hidden_size),
            ("decoder state", &state.decoder, self.decoder_hidden_size),
            ("output state", &state.output, self.output_hidden_size),
        ];
        for (what, tensor, dim) in expected {
            if tensor.dims() != [batch, dim] {
                return Err(HredError::shape(what, &[batch, dim], &tensor.dims()));
            }
        }
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Model parameter summary helper
// ──────────────────────────────────────────────────────────────────────────────

/// Number of trainable scalars for a configuration.
pub fn count_parameters(cfg: &ModelConfig) -> usize {
    let e = cfg.embedding_dim;
    let q = cfg.query_hidden_size;
    let s = cfg.session_hidden_size;
    let d = cfg.decoder_hidden_size;
    let o = cfg.output_hidden_size;
    let v = cfg.vocab_size;

    // Three gates, each: input matrix + square recurrent matrix + bias
    // (+ state matrix for the decoder).
    let gru = |x: usize, y: usize, state: usize| 3 * (x * y + y * y + state * y + y);

    let embedding = v * e;
    let query = gru(e, q, 0);
    let session = gru(q, s, 0);
    let decoder = s * d + d + gru(e, d, s);
    let output = d * o + s * o + e * o + o;
    let logits = o * v + v;

    embedding + query + session + decoder + output + logits
}
