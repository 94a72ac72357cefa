//! End-to-end tests for the HRED graph and its optimizer on the NdArray
//! backend.

use burn::backend::{Autodiff, NdArray};
use burn::optim::GradientsParams;
use burn::tensor::{Int, Tensor, TensorData};

use hred::boundary::EndOfQuery;
use hred::config::{ModelConfig, OptimizerConfig, TrainingConfig};
use hred::data::SessionBatch;
use hred::model::{Hred, HredState};
use hred::optim::{adam, clip_by_global_norm, global_norm};
use hred::training::{self, load_checkpoint, save_checkpoint, train_step};

type Backend = NdArray<f32>;
type AdBackend = Autodiff<Backend>;

const EOQ: u32 = 2;

fn tiny_model_config() -> ModelConfig {
    ModelConfig {
        vocab_size: 10,
        embedding_dim: 8,
        query_hidden_size: 12,
        session_hidden_size: 12,
        decoder_hidden_size: 16,
        output_hidden_size: 8,
        end_of_query_id: EOQ,
        ..ModelConfig::default()
    }
}

fn tiny_training_config() -> TrainingConfig {
    TrainingConfig {
        steps: 5,
        batch_size: 2,
        max_length: 3,
        log_every: 1,
        checkpoint_every: 0,
        model: tiny_model_config(),
        ..TrainingConfig::default()
    }
}

/// Two sessions of three steps, end-of-query at step 1 in both.
fn boundary_batch() -> SessionBatch {
    SessionBatch::new(vec![5, 6, 2, 2, 7, 8], vec![2, 2, 7, 8, 3, 4], 3, 2, 10).unwrap()
}

fn to_vec<const D: usize>(t: Tensor<Backend, D>) -> Vec<f32> {
    t.into_data().to_vec::<f32>().unwrap()
}

#[test]
fn session_state_changes_only_at_the_boundary() {
    let cfg = tiny_model_config();
    let device = Default::default();
    let model: Hred<Backend> = Hred::new(&cfg, &device);

    let batch = boundary_batch();
    let t = batch.to_tensors::<Backend, _>(&EndOfQuery::new(EOQ), &device);
    let out = model
        .forward(t.inputs, t.mask, HredState::zeros(&cfg, 2, &device))
        .unwrap();

    assert_eq!(out.logits.dims(), [3, 2, 10]);
    assert!(to_vec(out.logits).iter().all(|v| v.is_finite()));

    let session = |step: usize| to_vec(out.session.clone().slice([step..step + 1, 0..2, 0..12]));
    let before = session(0);
    let at = session(1);
    let after = session(2);

    // Inside the first query the session is held at its zero seed.
    assert!(before.iter().all(|&v| v == 0.0));
    // The boundary updates it, and the next step holds the new value.
    assert_ne!(before, after);
    assert!(after.iter().any(|&v| v != 0.0));
    assert_eq!(at, after);
}

#[test]
fn query_state_is_zero_after_the_marker() {
    let cfg = tiny_model_config();
    let device = Default::default();
    let model: Hred<Backend> = Hred::new(&cfg, &device);

    let batch = boundary_batch();
    let t = batch.to_tensors::<Backend, _>(&EndOfQuery::new(EOQ), &device);

    // Stop the unroll right after the marker step.
    let first_two = t.inputs.slice([0..2, 0..2]);
    let mask = t.mask.slice([0..2, 0..2]);
    let out = model.forward(first_two, mask, HredState::zeros(&cfg, 2, &device)).unwrap();

    assert!(to_vec(out.state.query_reset).iter().all(|&v| v == 0.0));
    assert!(to_vec(out.state.query).iter().any(|&v| v != 0.0));
}

#[test]
fn custom_boundary_rule_is_honoured() {
    let cfg = tiny_model_config();
    let device = Default::default();
    let model: Hred<Backend> = Hred::new(&cfg, &device);

    // No token counts as a boundary: the session never leaves its seed.
    let never = |_: i64| false;
    let t = boundary_batch().to_tensors::<Backend, _>(&never, &device);
    let out = model.forward(t.inputs, t.mask, HredState::zeros(&cfg, 2, &device)).unwrap();
    assert!(to_vec(out.session).iter().all(|&v| v == 0.0));
}

#[test]
fn clipping_caps_the_global_norm() {
    let cfg = tiny_model_config();
    let device = Default::default();
    let model: Hred<AdBackend> = Hred::new(&cfg, &device);

    let t = boundary_batch().to_tensors::<AdBackend, _>(&EndOfQuery::new(EOQ), &device);
    let out = model.forward(t.inputs, t.mask, HredState::zeros(&cfg, 2, &device)).unwrap();
    let loss = model.loss(out.logits, t.targets).unwrap();
    let mut grads = GradientsParams::from_grads(loss.backward(), &model);

    let raw = global_norm::<AdBackend, _>(&model, &grads);
    assert!(raw > 0.0 && raw.is_finite());

    // Above the threshold: scaled down to it.
    let max = raw / 10.0;
    let reported = clip_by_global_norm::<AdBackend, _>(&model, &mut grads, max);
    assert!((reported - raw).abs() < 1e-9);
    let clipped = global_norm::<AdBackend, _>(&model, &grads);
    assert!(clipped <= max * (1.0 + 1e-4), "clipped {} > max {}", clipped, max);
    assert!((clipped - max).abs() <= max * 1e-3);

    // Below the threshold: untouched, element for element.
    let bias_id = model.decoder().cell().update_gate().bias.id;
    let recurrent_id = model.query_encoder().cell().candidate_gate().hidden_weight.id;
    let bias_before = to_vec(grads.get::<Backend, 1>(bias_id).unwrap());
    let recurrent_before = to_vec(grads.get::<Backend, 2>(recurrent_id).unwrap());

    clip_by_global_norm::<AdBackend, _>(&model, &mut grads, clipped * 10.0);
    let unchanged = global_norm::<AdBackend, _>(&model, &grads);
    assert_eq!(unchanged, clipped);
    assert_eq!(to_vec(grads.get::<Backend, 1>(bias_id).unwrap()), bias_before);
    assert_eq!(to_vec(grads.get::<Backend, 2>(recurrent_id).unwrap()), recurrent_before);
}

#[test]
fn repeated_batch_loss_goes_down() {
    let cfg = tiny_training_config();
    let device = Default::default();
    let mut model: Hred<AdBackend> = Hred::new(&cfg.model, &device);
    let mut optimizer = adam::<AdBackend>(&OptimizerConfig::default());
    let rule = EndOfQuery::new(EOQ);
    let batch = boundary_batch();

    let mut losses = Vec::new();
    for _ in 0..15 {
        let (next, loss, report) = train_step(model, &mut optimizer, &batch, &rule, &cfg, &device).unwrap();
        assert_eq!(report.learning_rate, 1e-2);
        model = next;
        losses.push(loss);
    }

    assert_eq!(optimizer.steps_taken(), 15);
    assert!(losses.iter().all(|l| l.is_finite()));
    assert!(losses[14] < losses[0], "loss did not decrease: {:?}", losses);
}

#[test]
fn training_driver_runs_and_reports_every_step() {
    let cfg = tiny_training_config();
    let summary = training::train::<AdBackend>(&cfg, &Default::default()).unwrap();

    assert_eq!(summary.metrics.len(), cfg.steps);
    for (i, m) in summary.metrics.iter().enumerate() {
        assert_eq!(m.step, i);
        assert!(m.loss.is_finite());
        assert!(m.grad_norm.is_finite());
    }
    assert!(summary.final_loss().is_some());
}

#[test]
fn training_driver_rejects_invalid_config() {
    let cfg = TrainingConfig { batch_size: 0, ..tiny_training_config() };
    assert!(training::train::<AdBackend>(&cfg, &Default::default()).is_err());
}

#[test]
fn checkpoint_round_trip() {
    let cfg = tiny_model_config();
    let device = Default::default();
    let dir = std::env::temp_dir().join(format!("hred-checkpoint-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();

    let saved: Hred<Backend> = Hred::new(&cfg, &device);
    let path = save_checkpoint(&saved, 7, dir.to_str().unwrap()).unwrap();

    let fresh: Hred<Backend> = Hred::new(&ModelConfig { seed: 99, ..cfg }, &device);
    let loaded = load_checkpoint(fresh, path, &device).unwrap();

    assert_eq!(to_vec(loaded.embedding().weight()), to_vec(saved.embedding().weight()));

    let ids = Tensor::<Backend, 2, Int>::from_data(TensorData::new(vec![1i64, 3], [1, 2]), &device);
    let mask = Tensor::<Backend, 2>::ones([1, 2], &device);
    let a = saved.forward(ids.clone(), mask.clone(), HredState::zeros(&tiny_model_config(), 2, &device)).unwrap();
    let b = loaded.forward(ids, mask, HredState::zeros(&tiny_model_config(), 2, &device)).unwrap();
    assert_eq!(to_vec(a.logits), to_vec(b.logits));

    std::fs::remove_dir_all(&dir).ok();
}
