// optim.rs — Optimizer wrapper: gradients, global-norm clipping, staircase
// exponential learning-rate decay, parameter update.
//
// One call to `HredOptimizer::step`:
//   1. backward pass on the loss,
//   2. collect per-parameter gradients,
//   3. rescale them jointly so the global norm is at most `max_global_norm`,
//   4. hand them to the inner Burn optimizer at the scheduled learning rate.
//
// A NaN/Inf loss is not inspected here; it flows into the gradients and the
// caller decides what to do with it.

use std::marker::PhantomData;

use burn::{
    module::{AutodiffModule, ModuleVisitor, ParamId},
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion, Tensor},
};
use tracing::debug;

use crate::config::OptimizerConfig;
use crate::model::Hred;

// ──────────────────────────────────────────────────────────────────────────────
// Learning-rate schedule
// ──────────────────────────────────────────────────────────────────────────────

/// `initial · decay_rate^⌊step / steps_per_decay⌋`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRateSchedule {
    pub initial: f64,
    pub steps_per_decay: usize,
    pub decay_rate: f64,
}

impl LearningRateSchedule {
    pub fn new(initial: f64, steps_per_decay: usize, decay_rate: f64) -> Self {
        Self { initial, steps_per_decay, decay_rate }
    }

    pub fn from_config(cfg: &OptimizerConfig) -> Self {
        Self::new(cfg.initial_learning_rate, cfg.num_steps_per_decay, cfg.decay_rate)
    }

    pub fn learning_rate(&self, step: usize) -> f64 {
        let decays = step / self.steps_per_decay.max(1);
        self.initial * self.decay_rate.powi(decays as i32)
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Global-norm clipping
// ──────────────────────────────────────────────────────────────────────────────

/// Factor that brings `global_norm` down to `max_norm`, or 1.0 if it is
/// already within bounds.
pub fn clip_scale(global_norm: f64, max_norm: f64) -> f64 {
    if global_norm > max_norm {
        max_norm / global_norm
    } else {
        1.0
    }
}

/// Sums squared gradient entries over every float parameter of a module.
struct GradNormVisitor<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    sum_squares: f64,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradNormVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            self.sum_squares += grad.powf_scalar(2.0).sum().into_scalar().elem::<f64>();
        }
    }
}

/// Multiplies every gradient of a module by a fixed factor.
struct GradScaleVisitor<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    scale: f64,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradScaleVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads.register::<B::InnerBackend, D>(id, grad.mul_scalar(self.scale));
        }
    }
}

/// `sqrt(Σ ‖g‖²)` over all gradients of `module`.
pub fn global_norm<B, M>(module: &M, grads: &GradientsParams) -> f64
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = GradNormVisitor::<B> { grads, sum_squares: 0.0, _backend: PhantomData };
    module.visit(&mut visitor);
    visitor.sum_squares.sqrt()
}

/// Rescale all gradients of `module` so their global norm is at most
/// `max_norm`. Direction is preserved. Returns the norm before clipping.
pub fn clip_by_global_norm<B, M>(module: &M, grads: &mut GradientsParams, max_norm: f64) -> f64
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let norm = global_norm::<B, M>(module, grads);
    let scale = clip_scale(norm, max_norm);
    if scale < 1.0 {
        let mut visitor = GradScaleVisitor::<B> { grads, scale, _backend: PhantomData };
        module.visit(&mut visitor);
    }
    norm
}

// ──────────────────────────────────────────────────────────────────────────────
// Optimizer wrapper
// ──────────────────────────────────────────────────────────────────────────────

/// What happened during one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Zero-based index of the step just applied.
    pub step: usize,
    pub learning_rate: f64,
    /// Gradient norm before clipping.
    pub global_norm: f64,
    pub clipped: bool,
}

/// Burn optimizer plus clipping and the decay schedule.
pub struct HredOptimizer<B: AutodiffBackend, O> {
    inner: O,
    schedule: LearningRateSchedule,
    max_global_norm: f64,
    step: usize,
    _backend: PhantomData<B>,
}

/// Adam with the usual moments wrapped in clipping and decay.
pub fn adam<B: AutodiffBackend>(cfg: &OptimizerConfig) -> HredOptimizer<B, impl Optimizer<Hred<B>, B>> {
    let inner = AdamConfig::new()
        .with_beta_1(0.9)
        .with_beta_2(0.999)
        .with_epsilon(1e-8)
        .init::<B, Hred<B>>();
    HredOptimizer::new(inner, cfg)
}

impl<B, O> HredOptimizer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<Hred<B>, B>,
{
    pub fn new(inner: O, cfg: &OptimizerConfig) -> Self {
        Self {
            inner,
            schedule: LearningRateSchedule::from_config(cfg),
            max_global_norm: cfg.max_global_norm,
            step: 0,
            _backend: PhantomData,
        }
    }

    /// Number of steps applied so far.
    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Rate the next step will use.
    pub fn current_learning_rate(&self) -> f64 {
        self.schedule.learning_rate(self.step)
    }

    /// Backpropagate `loss`, clip, and return the updated model.
    pub fn step(&mut self, model: Hred<B>, loss: Tensor<B, 1>) -> (Hred<B>, StepReport) {
        let grads = loss.backward();
        let mut grads = GradientsParams::from_grads(grads, &model);

        let global_norm = clip_by_global_norm::<B, Hred<B>>(&model, &mut grads, self.max_global_norm);
        let learning_rate = self.current_learning_rate();
        let report = StepReport {
            step: self.step,
            learning_rate,
            global_norm,
            clipped: global_norm > self.max_global_norm,
        };

        debug!(
            step = report.step,
            lr = report.learning_rate,
            grad_norm = report.global_norm,
            clipped = report.clipped,
            "optimizer step"
        );

        let model = self.inner.step(learning_rate, model, grads);
        self.step += 1;
        (model, report)
    }
}
