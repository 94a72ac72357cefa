//! Hierarchical Recurrent Encoder-Decoder (HRED) on Burn.
//!
//! A query encoder summarises each query, a session encoder folds query
//! summaries into a session state, and a state-conditioned decoder predicts
//! the next token. [`model::Hred`] unrolls the whole graph over a
//! time-major `(max_length, batch_size)` batch; [`optim::HredOptimizer`]
//! trains it with global-norm clipping and staircase learning-rate decay.
//!
//! ```no_run
//! use burn::backend::{Autodiff, NdArray};
//! use hred::{boundary::EndOfQuery, config::TrainingConfig, data::SessionBatch};
//! use hred::model::{Hred, HredState};
//!
//! type B = Autodiff<NdArray<f32>>;
//! let cfg = TrainingConfig::small();
//! let device = Default::default();
//! let model: Hred<B> = Hred::new(&cfg.model, &device);
//!
//! let mut rng = rand::thread_rng();
//! let batch = SessionBatch::random(&mut rng, cfg.max_length, cfg.batch_size, cfg.model.vocab_size);
//! let t = batch.to_tensors::<B, _>(&EndOfQuery::new(cfg.model.end_of_query_id), &device);
//! let out = model.forward(t.inputs, t.mask, HredState::zeros(&cfg.model, cfg.batch_size, &device))?;
//! let loss = model.loss(out.logits, t.targets)?;
//! # Ok::<(), hred::error::HredError>(())
//! ```

pub mod boundary;
pub mod config;
pub mod data;
pub mod error;
pub mod init;
pub mod layers;
pub mod model;
pub mod optim;
pub mod training;

pub use config::{GatePreactivation, ModelConfig, OptimizerConfig, TrainingConfig};
pub use error::HredError;
pub use model::{Hred, HredOutput, HredState};
