//! Tests for the training loop

use std::f64::consts::LN_2;
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::training::checkpoints::WEIGHTS_NAME;
use crate::training::config::NonFinitePolicy;
use crate::training::data::{DataError, PreferenceExample};
use crate::training::loss::utils::softplus_f64;
use crate::training::trainer::{SimpoTrainer, TrainingEvent, TrainingStatus};

use super::fixtures::{loader, test_config, toy_examples, BigramLm, NanLm};
use super::test_utils::{assert_metrics_valid, create_test_device};

#[test]
fn test_trainer_creation_validates_config() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.simpo.beta = -1.0;
    let train = loader(toy_examples(), 2, &config);

    let result = SimpoTrainer::new(config, BigramLm::new(&create_test_device())?, train, None);
    assert!(matches!(result, Err(Error::Config(_))));
    Ok(())
}

#[test]
fn test_initial_loss_of_uniform_model() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let train = loader(toy_examples(), 4, &config);
    let trainer = SimpoTrainer::new(config, BigramLm::new(&create_test_device())?, train.clone(), None)?;

    let batch = train.batch(&[0, 1, 2, 3])?;
    let output = trainer.compute_loss(&batch)?;

    // Uniform logits give equal averages, so the margin is -gamma = -1
    assert!((output.metrics.loss - softplus_f64(1.0)).abs() < 1e-5);
    assert_eq!(output.metrics.rewards_accuracy, 0.0);
    assert_eq!(output.metrics.logits_chosen, Some(0.0));
    assert_metrics_valid(&output.metrics.to_map(""));
    Ok(())
}

#[tokio::test]
async fn test_training_reduces_loss() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.training.num_train_epochs = 10;
    let train = loader(toy_examples(), 2, &config);

    let mut trainer = SimpoTrainer::new(config, BigramLm::new(&create_test_device())?, train, None)?;
    let summary = trainer.train().await?;

    assert_eq!(summary.global_step, 20);
    assert_eq!(*trainer.status(), TrainingStatus::Completed);

    let losses: Vec<f64> = trainer
        .metrics()
        .history()
        .iter()
        .filter_map(|r| r.metrics.get("loss").copied())
        .collect();
    assert_eq!(losses.len(), 20);
    assert!(losses[0] > LN_2);
    assert!(losses[19] < losses[0] / 2.0, "loss went from {} to {}", losses[0], losses[19]);

    let last = trainer.metrics().history().pop().unwrap();
    assert!(last.metrics["rewards/accuracy"] > 0.99);
    assert!(summary.output_dir.join(WEIGHTS_NAME).exists());
    Ok(())
}

#[tokio::test]
async fn test_gradient_accumulation_matches_full_batch() -> Result<()> {
    let device = create_test_device();

    let full_dir = TempDir::new().unwrap();
    let mut full_config = test_config(&full_dir);
    full_config.training.max_steps = Some(1);
    let full_loader = loader(toy_examples(), 4, &full_config);
    let mut full = SimpoTrainer::new(full_config, BigramLm::new(&device)?, full_loader, None)?;
    full.train().await?;

    let accum_dir = TempDir::new().unwrap();
    let mut accum_config = test_config(&accum_dir);
    accum_config.training.max_steps = Some(1);
    accum_config.training.gradient_accumulation_steps = 2;
    let accum_loader = loader(toy_examples(), 2, &accum_config);
    let mut accum = SimpoTrainer::new(accum_config, BigramLm::new(&device)?, accum_loader, None)?;
    accum.train().await?;

    let a = full.model().weights()?;
    let b = accum.model().weights()?;
    for (row_a, row_b) in a.iter().zip(&b) {
        for (x, y) in row_a.iter().zip(row_b) {
            assert!((x - y).abs() < 1e-5, "{x} != {y}");
        }
    }
    // Something actually moved
    assert!(a.iter().flatten().any(|w| w.abs() > 1e-3));
    Ok(())
}

#[tokio::test]
async fn test_short_final_window_still_steps() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.training.gradient_accumulation_steps = 3;
    let train = loader(toy_examples(), 1, &config);

    let mut trainer = SimpoTrainer::new(config, BigramLm::new(&create_test_device())?, train, None)?;
    let summary = trainer.train().await?;
    // four micro-batches: one full window of three and one of one
    assert_eq!(summary.global_step, 2);
    Ok(())
}

#[tokio::test]
async fn test_evaluation_metrics_are_prefixed() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.training.do_eval = true;
    config.training.eval_steps = 1;
    let train = loader(toy_examples(), 2, &config);
    let eval = loader(toy_examples()[..3].to_vec(), 2, &config);

    let mut trainer = SimpoTrainer::new(config, BigramLm::new(&create_test_device())?, train, Some(eval))?;
    let summary = trainer.train().await?;

    let eval_metrics = summary.eval_metrics.expect("final evaluation");
    for name in ["eval_loss", "eval_rewards/chosen", "eval_rewards/margin", "eval_rewards/accuracy"] {
        assert!(eval_metrics.contains_key(name), "missing {name}");
    }
    assert_metrics_valid(&eval_metrics);
    // eval at steps 1 and 2 only; the final step was already evaluated
    let evals = trainer
        .metrics()
        .history()
        .iter()
        .filter(|r| r.metrics.contains_key("eval_loss"))
        .count();
    assert_eq!(evals, 2);
    Ok(())
}

#[tokio::test]
async fn test_non_finite_loss_aborts_and_saves_partial_model() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let partial = dir.path().join("run_partial");
    let train = loader(toy_examples(), 2, &config);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let model = NanLm(BigramLm::new(&create_test_device())?);
    let mut trainer = SimpoTrainer::new(config, model, train, None)?.with_event_monitoring(tx);

    let err = trainer.train().await.unwrap_err();
    assert!(matches!(err, Error::NonFiniteLoss { step: 0, .. }));
    assert!(matches!(trainer.status(), TrainingStatus::Failed { .. }));
    assert!(partial.join(WEIGHTS_NAME).exists());

    let mut saw_non_finite = false;
    while let Ok(event) = rx.try_recv() {
        if let TrainingEvent::NonFiniteLoss { value, .. } = event {
            assert!(value.is_nan());
            saw_non_finite = true;
        }
    }
    assert!(saw_non_finite);
    Ok(())
}

#[tokio::test]
async fn test_non_finite_loss_can_be_skipped() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.training.non_finite_policy = NonFinitePolicy::SkipBatch;
    let train = loader(toy_examples(), 2, &config);

    let model = NanLm(BigramLm::new(&create_test_device())?);
    let mut trainer = SimpoTrainer::new(config, model, train, None)?;
    let summary = trainer.train().await?;

    assert_eq!(summary.skipped_batches, 2);
    assert_eq!(summary.global_step, 2);
    // no gradient was ever applied
    assert!(trainer.model().0.weights()?.iter().flatten().all(|w| *w == 0.0));
    Ok(())
}

#[tokio::test]
async fn test_events_follow_the_loop() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.training.num_train_epochs = 2;
    let train = loader(toy_examples(), 2, &config);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut trainer =
        SimpoTrainer::new(config, BigramLm::new(&create_test_device())?, train, None)?.with_event_monitoring(tx);
    trainer.train().await?;

    let mut epochs_started = 0;
    let mut steps = Vec::new();
    let mut completed = None;
    while let Ok(event) = rx.try_recv() {
        match event {
            TrainingEvent::EpochStarted { .. } => epochs_started += 1,
            TrainingEvent::StepCompleted { step, lr, .. } => {
                assert!((lr - 0.05).abs() < 1e-12);
                steps.push(step);
            }
            TrainingEvent::TrainingCompleted { total_steps } => completed = Some(total_steps),
            _ => {}
        }
    }
    assert_eq!(epochs_started, 2);
    assert_eq!(steps, vec![1, 2, 3, 4]);
    assert_eq!(completed, Some(4));
    Ok(())
}

fn toy_with_empty_completion() -> Vec<PreferenceExample> {
    let mut examples = toy_examples();
    examples.insert(1, PreferenceExample::new(vec![1], vec![], vec![4]));
    examples
}

#[tokio::test]
async fn test_degenerate_example_is_skipped() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.training.non_finite_policy = NonFinitePolicy::SkipBatch;
    let train = loader(toy_with_empty_completion(), 1, &config);

    let mut trainer = SimpoTrainer::new(config, BigramLm::new(&create_test_device())?, train, None)?;
    let summary = trainer.train().await?;
    assert_eq!(summary.skipped_batches, 1);
    assert_eq!(summary.global_step, 5);
    Ok(())
}

#[tokio::test]
async fn test_degenerate_example_aborts_by_default() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let train = loader(toy_with_empty_completion(), 1, &config);

    let mut trainer = SimpoTrainer::new(config, BigramLm::new(&create_test_device())?, train, None)?;
    let err = trainer.train().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Data(DataError::EmptyCompletion { which: "chosen", row: 0 })
    ));
    assert_eq!(trainer.state().global_step, 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_final_save_marks_run_failed() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    // A file where the output directory should go
    std::fs::write(&config.training.output_dir, b"occupied")?;
    let train = loader(toy_examples(), 2, &config);

    let mut trainer = SimpoTrainer::new(config, BigramLm::new(&create_test_device())?, train, None)?;
    assert!(trainer.train().await.is_err());
    assert_eq!(trainer.state().global_step, 2);
    assert!(matches!(trainer.status(), TrainingStatus::Failed { .. }));
    assert!(dir.path().join("run_partial").join(WEIGHTS_NAME).exists());
    Ok(())
}
