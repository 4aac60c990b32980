//! Tiny models and datasets for exercising the training pipeline

use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Init, Module, VarBuilder, VarMap};
use std::sync::Arc;
use tempfile::TempDir;

use crate::error::Result;
use crate::training::config::{SchedulerType, TrainingConfig};
use crate::training::data::{DataLoader, DataLoaderConfig, PreferenceCollator, PreferenceDataset, PreferenceExample};
use crate::training::model::PolicyModel;

/// Vocabulary of the toy models
pub const VOCAB: usize = 8;

/// Bigram language model: logits at position `t` depend only on token `t`.
///
/// Weights start at zero, so every token initially has probability
/// `1 / VOCAB` and runs are deterministic.
pub struct BigramLm {
    embedding: Embedding,
    var_map: VarMap,
    device: Device,
}

impl BigramLm {
    /// Zero-initialized model on `device`
    pub fn new(device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let weight = vb.get_with_hints((VOCAB, VOCAB), "bigram.weight", Init::Const(0.0))?;
        Ok(Self {
            embedding: Embedding::new(weight, VOCAB),
            var_map,
            device: device.clone(),
        })
    }

    /// Current weights as rows
    pub fn weights(&self) -> Result<Vec<Vec<f32>>> {
        Ok(self.embedding.embeddings().to_vec2::<f32>()?)
    }
}

impl PolicyModel for BigramLm {
    fn forward(&self, input_ids: &Tensor, _attention_mask: &Tensor) -> Result<Tensor> {
        Ok(self.embedding.forward(input_ids)?)
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Bigram model whose logits are all NaN
pub struct NanLm(pub BigramLm);

impl PolicyModel for NanLm {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        Ok(self.0.forward(input_ids, attention_mask)?.affine(f64::NAN, 0.0)?)
    }

    fn var_map(&self) -> &VarMap {
        self.0.var_map()
    }

    fn device(&self) -> &Device {
        self.0.device()
    }
}

/// Four pairs where the chosen completion always starts with token 3
pub fn toy_examples() -> Vec<PreferenceExample> {
    vec![
        PreferenceExample::new(vec![1, 2], vec![3, 5], vec![4, 6]),
        PreferenceExample::new(vec![1], vec![3], vec![4, 4, 6]),
        PreferenceExample::new(vec![2, 2, 1], vec![3, 7], vec![6]),
        PreferenceExample::new(vec![1, 5], vec![3, 3, 5], vec![4]),
    ]
}

/// Loader over `examples` with fixed order
pub fn loader(examples: Vec<PreferenceExample>, batch_size: usize, config: &TrainingConfig) -> DataLoader {
    let dataset = Arc::new(PreferenceDataset::new("toy", examples));
    DataLoader::new(
        dataset,
        DataLoaderConfig {
            batch_size,
            shuffle: false,
            drop_last: false,
            seed: config.training.seed,
        },
        PreferenceCollator::new(&config.data, Device::Cpu),
    )
}

/// Training config writing into `dir`: constant schedule without warmup,
/// no clipping and no periodic saves
pub fn test_config(dir: &TempDir) -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.training.output_dir = dir.path().join("run");
    config.training.learning_rate = 0.05;
    config.training.warmup_ratio = 0.0;
    config.training.lr_scheduler_type = SchedulerType::Constant;
    config.training.gradient_accumulation_steps = 1;
    config.training.logging_steps = 1;
    config.training.eval_steps = 0;
    config.training.save_steps = 0;
    config.training.max_grad_norm = 0.0;
    config.training.do_eval = false;
    config
}
