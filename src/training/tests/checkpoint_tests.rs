//! Checkpoint save, rotation and resume tests

use candle_core::Tensor;
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::training::checkpoints::{
    CheckpointManager, TrainerState, OPTIMIZER_STATE_NAME, TRAINER_STATE_NAME, WEIGHTS_NAME,
};
use crate::training::config::TrainingArgs;
use crate::training::model::PolicyModel;
use crate::training::optimizers::AdamWOptimizer;
use crate::training::trainer::{SimpoTrainer, TrainingEvent};

use super::fixtures::{loader, test_config, toy_examples, BigramLm, VOCAB};
use super::test_utils::create_test_device;

#[tokio::test]
async fn test_checkpoint_save_load() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let device = create_test_device();
    let manager = CheckpointManager::new(dir.path(), None);

    let source = BigramLm::new(&device)?;
    let values: Vec<f32> = (0..VOCAB * VOCAB).map(|i| i as f32 * 0.01).collect();
    let weight = Tensor::from_vec(values, (VOCAB, VOCAB), &device)?;
    source
        .var_map()
        .data()
        .lock()
        .unwrap()
        .get("bigram.weight")
        .expect("bigram weight")
        .set(&weight)?;

    let mut state = TrainerState::new(10);
    state.global_step = 7;
    state.batches_in_epoch = 3;
    state.last_loss = Some(0.25);
    let optimizer = AdamWOptimizer::new(source.var_map(), &TrainingArgs::default())?;
    let path = manager.save(source.var_map(), &optimizer, &state).await?;
    assert_eq!(path, dir.path().join("checkpoint-7"));
    assert!(path.join(WEIGHTS_NAME).exists());
    assert!(path.join(TRAINER_STATE_NAME).exists());
    assert!(path.join(OPTIMIZER_STATE_NAME).exists());

    let target = BigramLm::new(&device)?;
    let mut var_map = target.var_map().clone();
    let restored = manager.load(&path, &mut var_map).await?;

    assert_eq!(restored.global_step, 7);
    assert_eq!(restored.batches_in_epoch, 3);
    assert_eq!(restored.last_loss, Some(0.25));
    assert_eq!(target.weights()?, source.weights()?);

    let mut target_optimizer = AdamWOptimizer::new(target.var_map(), &TrainingArgs::default())?;
    assert!(manager.load_optimizer(&path, &mut target_optimizer, &restored).await?);
    assert_eq!(target_optimizer.step_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_checkpoint_without_optimizer_state_still_loads() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path(), None);
    let model = BigramLm::new(&create_test_device())?;
    let mut optimizer = AdamWOptimizer::new(model.var_map(), &TrainingArgs::default())?;

    let path = manager.save(model.var_map(), &optimizer, &TrainerState::new(1)).await?;
    tokio::fs::remove_file(path.join(OPTIMIZER_STATE_NAME)).await?;

    let mut var_map = model.var_map().clone();
    let state = manager.load(&path, &mut var_map).await?;
    assert!(!manager.load_optimizer(&path, &mut optimizer, &state).await?);
    Ok(())
}

#[tokio::test]
async fn test_latest_without_checkpoints() -> Result<()> {
    let dir = TempDir::new().unwrap();
    assert!(CheckpointManager::new(dir.path(), None).latest().await?.is_none());
    let missing = CheckpointManager::new(dir.path().join("nope"), None);
    assert!(missing.list().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_load_missing_checkpoint_fails() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(dir.path(), None);
    let mut var_map = BigramLm::new(&create_test_device())?.var_map().clone();
    let err = manager.load(&dir.path().join("checkpoint-3"), &mut var_map).await.unwrap_err();
    assert!(matches!(err, crate::Error::Checkpoint(_)));
    Ok(())
}

#[tokio::test]
async fn test_rotation_keeps_newest() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.training.save_steps = 1;
    config.training.save_total_limit = Some(2);
    let output_dir = config.training.output_dir.clone();
    let train = loader(toy_examples(), 1, &config);

    let mut trainer = SimpoTrainer::new(config, BigramLm::new(&create_test_device())?, train, None)?;
    trainer.train().await?;

    let manager = CheckpointManager::new(&output_dir, None);
    let steps: Vec<usize> = manager.list().await?.into_iter().map(|(step, _)| step).collect();
    assert_eq!(steps, vec![3, 4]);
    assert_eq!(manager.latest().await?, Some(output_dir.join("checkpoint-4")));
    Ok(())
}

#[tokio::test]
async fn test_resume_matches_uninterrupted_run() -> Result<()> {
    let device = create_test_device();

    // Reference: two optimizer steps in one go
    let straight_dir = TempDir::new().unwrap();
    let mut straight_config = test_config(&straight_dir);
    straight_config.training.gradient_accumulation_steps = 2;
    straight_config.training.max_steps = Some(2);
    let train = loader(toy_examples(), 1, &straight_config);
    let mut straight = SimpoTrainer::new(straight_config, BigramLm::new(&device)?, train, None)?;
    straight.train().await?;

    // Same run stopped after one step and resumed from its checkpoint
    let dir = TempDir::new().unwrap();
    let mut first = test_config(&dir);
    first.training.gradient_accumulation_steps = 2;
    first.training.save_steps = 1;
    first.training.max_steps = Some(1);
    let train = loader(toy_examples(), 1, &first);
    let mut trainer = SimpoTrainer::new(first.clone(), BigramLm::new(&device)?, train, None)?;
    trainer.train().await?;
    let after_first = trainer.model().weights()?;

    let mut second = first;
    second.training.max_steps = Some(2);
    second.training.resume_from_checkpoint = Some("latest".to_string());
    let train = loader(toy_examples(), 1, &second);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut resumed = SimpoTrainer::new(second, BigramLm::new(&device)?, train, None)?.with_event_monitoring(tx);
    let summary = resumed.train().await?;
    assert_eq!(summary.global_step, 2);

    let mut resumed_at = None;
    let mut steps = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            TrainingEvent::Resumed { step, .. } => resumed_at = Some(step),
            TrainingEvent::StepCompleted { step, .. } => steps.push(step),
            _ => {}
        }
    }
    assert_eq!(resumed_at, Some(1));
    // only the remaining step runs
    assert_eq!(steps, vec![2]);

    let expected = straight.model().weights()?;
    let actual = resumed.model().weights()?;
    assert_ne!(actual, after_first);
    for (row_a, row_b) in actual.iter().zip(&expected) {
        for (a, b) in row_a.iter().zip(row_b) {
            assert!((a - b).abs() < 1e-6, "{a} != {b}");
        }
    }
    Ok(())
}
