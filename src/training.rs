// training.rs — Training driver around the HRED graph and optimizer.
//
// Steps:
//   1. Validate the configuration and build the model and optimizer.
//   2. Each step: draw a batch, unroll the graph from zero seeds, compute the
//      loss, refuse non-finite losses, clip + update.
//   3. Save checkpoints periodically and on completion.
//   4. Write the per-step metrics log.
//
// Batches come from `SessionBatch::random`; reading real session files is the
// caller's concern.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::{
    backend::{ndarray::NdArray, Autodiff},
    module::Module,
    optim::Optimizer,
    record::{BinFileRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
};
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use tracing::{info, warn};

use crate::boundary::{BoundaryRule, EndOfQuery};
use crate::config::TrainingConfig;
use crate::data::SessionBatch;
use crate::error::HredError;
use crate::model::{count_parameters, Hred, HredState};
use crate::optim::{adam, HredOptimizer, StepReport};

// NdArray (CPU) backend for portability.
pub type TrainBackend = NdArray<f32>;
pub type TrainAutodiffBackend = Autodiff<TrainBackend>;

/// One line of the metrics log.
#[derive(Debug, Clone, Serialize)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f64,
    pub learning_rate: f64,
    pub grad_norm: f64,
    pub clipped: bool,
}

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub metrics: Vec<StepMetrics>,
    pub elapsed_secs: f32,
}

impl TrainingSummary {
    pub fn final_loss(&self) -> Option<f64> {
        self.metrics.last().map(|m| m.loss)
    }
}

/// Entry point called from main: CPU backend, random batches.
pub fn train_model(cfg: &TrainingConfig) -> Result<TrainingSummary, HredError> {
    train::<TrainAutodiffBackend>(cfg, &Default::default())
}

/// Full training run on any autodiff backend.
pub fn train<B: AutodiffBackend>(cfg: &TrainingConfig, device: &B::Device) -> Result<TrainingSummary, HredError> {
    cfg.validate()?;
    B::seed(cfg.model.seed);

    info!(
        steps = cfg.steps,
        batch_size = cfg.batch_size,
        max_length = cfg.max_length,
        vocab_size = cfg.model.vocab_size,
        parameters = count_parameters(&cfg.model),
        "starting training"
    );

    let rule = EndOfQuery::new(cfg.model.end_of_query_id);
    let mut rng = StdRng::seed_from_u64(cfg.model.seed.wrapping_add(1));
    let mut model: Hred<B> = Hred::new(&cfg.model, device);
    let mut optimizer = adam::<B>(&cfg.optimizer);

    if cfg.checkpoint_every > 0 {
        fs::create_dir_all(&cfg.checkpoint_dir)?;
    }

    let start = Instant::now();
    let mut metrics = Vec::with_capacity(cfg.steps);

    for step in 0..cfg.steps {
        let batch = SessionBatch::random(&mut rng, cfg.max_length, cfg.batch_size, cfg.model.vocab_size);
        let (next, loss, report) = train_step(model, &mut optimizer, &batch, &rule, cfg, device)?;
        model = next;

        if step % cfg.log_every == 0 || step + 1 == cfg.steps {
            info!(
                step,
                loss,
                lr = report.learning_rate,
                grad_norm = report.global_norm,
                "training"
            );
        }

        metrics.push(StepMetrics {
            step,
            loss,
            learning_rate: report.learning_rate,
            grad_norm: report.global_norm,
            clipped: report.clipped,
        });

        if cfg.checkpoint_every > 0 && (step + 1) % cfg.checkpoint_every == 0 {
            save_checkpoint(&model, step + 1, &cfg.checkpoint_dir)?;
        }
    }

    let elapsed_secs = start.elapsed().as_secs_f32();
    info!(elapsed_secs, "training complete");

    if cfg.checkpoint_every > 0 {
        save_checkpoint(&model, cfg.steps, &cfg.checkpoint_dir)?;
        save_metrics(&metrics, &cfg.checkpoint_dir)?;
    }

    Ok(TrainingSummary { metrics, elapsed_secs })
}

// ──────────────────────────────────────────────────────────────────────────────
// Single step
// ──────────────────────────────────────────────────────────────────────────────

/// Forward, loss, finiteness check, optimizer update.
///
/// A NaN/Inf loss aborts the step before any parameter changes and is
/// reported as [`HredError::NonFiniteLoss`].
pub fn train_step<B, O, R>(
    model: Hred<B>,
    optimizer: &mut HredOptimizer<B, O>,
    batch: &SessionBatch,
    rule: &R,
    cfg: &TrainingConfig,
    device: &B::Device,
) -> Result<(Hred<B>, f64, StepReport), HredError>
where
    B: AutodiffBackend,
    O: Optimizer<Hred<B>, B>,
    R: BoundaryRule + ?Sized,
{
    let tensors = batch.to_tensors::<B, R>(rule, device);
    let state = HredState::zeros(&cfg.model, batch.batch_size(), device);

    let output = model.forward(tensors.inputs, tensors.mask, state)?;
    let loss = model.loss(output.logits, tensors.targets)?;

    let loss_value = ensure_finite(optimizer.steps_taken(), loss.clone().into_scalar().elem::<f64>())?;
    let (model, report) = optimizer.step(model, loss);
    Ok((model, loss_value, report))
}

/// Pass finite losses through, turn NaN/Inf into an error.
pub fn ensure_finite(step: usize, loss: f64) -> Result<f64, HredError> {
    if loss.is_finite() {
        Ok(loss)
    } else {
        warn!(step, loss, "non-finite loss");
        Err(HredError::NonFiniteLoss { step, loss })
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Checkpoint and metrics helpers
// ──────────────────────────────────────────────────────────────────────────────

pub fn save_checkpoint<B: Backend>(model: &Hred<B>, step: usize, dir: &str) -> Result<PathBuf, HredError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let path = Path::new(dir).join(format!("hred_step_{}", step));

    recorder
        .record(model.clone().into_record(), path.clone())
        .map_err(|e| HredError::Checkpoint(e.to_string()))?;
    info!(path = %path.display(), "checkpoint saved");
    Ok(path)
}

/// Load a checkpoint written by [`save_checkpoint`] into a freshly built model.
pub fn load_checkpoint<B: Backend>(model: Hred<B>, path: impl Into<PathBuf>, device: &B::Device) -> Result<Hred<B>, HredError> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let record = recorder
        .load(path.into(), device)
        .map_err(|e| HredError::Checkpoint(e.to_string()))?;
    Ok(model.load_record(record))
}

fn save_metrics(metrics: &[StepMetrics], dir: &str) -> Result<(), HredError> {
    let path = Path::new(dir).join("metrics.json");
    fs::write(&path, serde_json::to_string_pretty(metrics)?)?;
    info!(path = %path.display(), "metrics saved");
    Ok(())
}

// ──────────────────────────────────────────────────────────────────────────────
// Configuration overview
// ──────────────────────────────────────────────────────────────────────────────

/// `(name, parameter count, config)` for the built-in presets.
pub fn describe_configurations() -> Vec<(&'static str, usize, TrainingConfig)> {
    [
        ("Default (vocab 90004, decoder 1024)", TrainingConfig::default()),
        ("Small   (vocab 1000,  decoder 64)", TrainingConfig::small()),
    ]
    .into_iter()
    .map(|(name, cfg)| (name, count_parameters(&cfg.model), cfg))
    .collect()
}
