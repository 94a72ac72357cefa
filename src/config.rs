// config.rs — Hyperparameters for the HRED graph, the optimizer and the
// training driver.
//
// Every component receives the config it needs through its constructor;
// nothing reads these defaults implicitly.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::HredError;

/// How a GRU gate combines its projections before the nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GatePreactivation {
    /// `act(x·Wi + h·Wh [+ s·Ws] + b)`, the conventional GRU gate.
    #[default]
    FullSum,
    /// `act(x·Wi) + h·Wh [+ s·Ws] + b`, the nonlinearity covers the input
    /// projection only. This is not the published HRED cell, which uses the
    /// conventional GRU; it reproduces a misplaced parenthesis found in an
    /// early TensorFlow port, for comparison runs against that code.
    InputOnly,
}

/// HRED architecture hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size (logits width, embedding rows).
    pub vocab_size: usize,
    /// Token embedding dimensionality.
    pub embedding_dim: usize,
    /// Query encoder hidden size.
    pub query_hidden_size: usize,
    /// Session encoder hidden size.
    pub session_hidden_size: usize,
    /// Decoder hidden size.
    pub decoder_hidden_size: usize,
    /// Output (readout) layer size.
    pub output_hidden_size: usize,
    /// Token id that closes a query.
    pub end_of_query_id: u32,
    /// Gate pre-activation form used by every GRU cell.
    pub gate_preactivation: GatePreactivation,
    /// Seed for the host-side orthogonal initializer.
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 90_004,
            embedding_dim: 256,
            query_hidden_size: 512,
            session_hidden_size: 512,
            decoder_hidden_size: 1024,
            output_hidden_size: 512,
            end_of_query_id: 2,
            gate_preactivation: GatePreactivation::FullSum,
            seed: 42,
        }
    }
}

impl ModelConfig {
    /// Small variant for quick experiments and tests.
    pub fn small() -> Self {
        Self {
            vocab_size: 1_000,
            embedding_dim: 32,
            query_hidden_size: 48,
            session_hidden_size: 48,
            decoder_hidden_size: 64,
            output_hidden_size: 32,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), HredError> {
        let dims = [
            ("vocab_size", self.vocab_size),
            ("embedding_dim", self.embedding_dim),
            ("query_hidden_size", self.query_hidden_size),
            ("session_hidden_size", self.session_hidden_size),
            ("decoder_hidden_size", self.decoder_hidden_size),
            ("output_hidden_size", self.output_hidden_size),
        ];
        for (field, value) in dims {
            if value == 0 {
                return Err(HredError::invalid_config(field, "must be > 0"));
            }
        }

        if self.end_of_query_id as usize >= self.vocab_size {
            return Err(HredError::invalid_config(
                "end_of_query_id",
                format!("{} is outside the vocabulary (size {})", self.end_of_query_id, self.vocab_size),
            ));
        }

        Ok(())
    }
}

/// Optimizer scalars: staircase exponential decay plus global-norm clipping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Learning rate at step 0.
    pub initial_learning_rate: f64,
    /// Number of steps between two decays.
    pub num_steps_per_decay: usize,
    /// Multiplicative factor applied at every decay.
    pub decay_rate: f64,
    /// Upper bound on the global gradient norm.
    pub max_global_norm: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            initial_learning_rate: 1e-2,
            num_steps_per_decay: 15_000,
            decay_rate: 0.1,
            max_global_norm: 1.0,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), HredError> {
        if !(self.initial_learning_rate > 0.0 && self.initial_learning_rate.is_finite()) {
            return Err(HredError::invalid_config("initial_learning_rate", "must be finite and > 0"));
        }
        if self.num_steps_per_decay == 0 {
            return Err(HredError::invalid_config("num_steps_per_decay", "must be > 0"));
        }
        if !(self.decay_rate > 0.0 && self.decay_rate <= 1.0) {
            return Err(HredError::invalid_config("decay_rate", "must be in (0, 1]"));
        }
        if !(self.max_global_norm > 0.0 && self.max_global_norm.is_finite()) {
            return Err(HredError::invalid_config("max_global_norm", "must be finite and > 0"));
        }
        Ok(())
    }
}

/// Top-level training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of optimizer steps.
    pub steps: usize,
    /// Sessions per batch (columns of the token matrix).
    pub batch_size: usize,
    /// Tokens per session (rows of the token matrix).
    pub max_length: usize,
    /// Log the loss every N steps.
    pub log_every: usize,
    /// Save a checkpoint every N steps. 0 turns off all file output
    /// (checkpoints and the metrics log).
    pub checkpoint_every: usize,
    /// Directory in which checkpoints and metrics are written.
    pub checkpoint_dir: String,
    /// HRED hyperparameters.
    pub model: ModelConfig,
    /// Optimizer hyperparameters.
    pub optimizer: OptimizerConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            steps: 100,
            batch_size: 10,
            max_length: 5,
            log_every: 10,
            checkpoint_every: 50,
            checkpoint_dir: "checkpoints".into(),
            model: ModelConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Small configuration for fast experimentation.
    pub fn small() -> Self {
        Self {
            steps: 20,
            batch_size: 4,
            max_length: 6,
            log_every: 5,
            checkpoint_every: 0,
            model: ModelConfig::small(),
            ..Default::default()
        }
    }

    /// Read a JSON configuration file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HredError> {
        let text = fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), HredError> {
        if self.batch_size == 0 {
            return Err(HredError::invalid_config("batch_size", "must be > 0"));
        }
        if self.max_length == 0 {
            return Err(HredError::invalid_config("max_length", "must be > 0"));
        }
        if self.log_every == 0 {
            return Err(HredError::invalid_config("log_every", "must be > 0"));
        }
        self.model.validate()?;
        self.optimizer.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_published_dimensions() {
        let cfg = ModelConfig::default();
        assert_eq!(cfg.vocab_size, 90_004);
        assert_eq!(cfg.embedding_dim, 256);
        assert_eq!(cfg.query_hidden_size, 512);
        assert_eq!(cfg.session_hidden_size, 512);
        assert_eq!(cfg.decoder_hidden_size, 1024);
        assert_eq!(cfg.output_hidden_size, 512);
        assert_eq!(cfg.gate_preactivation, GatePreactivation::FullSum);
        assert!(TrainingConfig::default().validate().is_ok());
        assert!(TrainingConfig::small().validate().is_ok());
    }

    #[test]
    fn zero_dimension_is_rejected() {
        let cfg = ModelConfig { decoder_hidden_size: 0, ..ModelConfig::small() };
        match cfg.validate() {
            Err(HredError::InvalidConfig { field, .. }) => assert_eq!(field, "decoder_hidden_size"),
            other => panic!("expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn end_of_query_must_be_in_vocabulary() {
        let cfg = ModelConfig { vocab_size: 2, end_of_query_id: 2, ..ModelConfig::small() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_optimizer_scalars_are_rejected() {
        let base = OptimizerConfig::default();
        assert!(OptimizerConfig { decay_rate: 0.0, ..base.clone() }.validate().is_err());
        assert!(OptimizerConfig { decay_rate: 1.5, ..base.clone() }.validate().is_err());
        assert!(OptimizerConfig { num_steps_per_decay: 0, ..base.clone() }.validate().is_err());
        assert!(OptimizerConfig { max_global_norm: f64::NAN, ..base.clone() }.validate().is_err());
        assert!(OptimizerConfig { initial_learning_rate: -1.0, ..base }.validate().is_err());
    }

    #[test]
    fn config_survives_json() {
        let cfg = TrainingConfig::small();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: TrainingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.model.vocab_size, cfg.model.vocab_size);
        assert_eq!(back.optimizer.num_steps_per_decay, cfg.optimizer.num_steps_per_decay);
    }
}
