//! Preference datasets and a seeded batch loader

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::{DataError, Message, PreferenceBatch, PreferenceCollator, PreferenceDialogue, PreferenceExample};

/// In-memory collection of tokenized preference examples
#[derive(Debug, Clone, Default)]
pub struct PreferenceDataset {
    name: String,
    examples: Vec<PreferenceExample>,
}

impl PreferenceDataset {
    /// Wrap already tokenized examples
    pub fn new(name: impl Into<String>, examples: Vec<PreferenceExample>) -> Self {
        Self {
            name: name.into(),
            examples,
        }
    }

    /// Load a JSONL file with one [`PreferenceExample`] per line.
    ///
    /// Blank lines are skipped. `max_samples` keeps the first N records.
    #[instrument]
    pub async fn from_jsonl(path: &Path, max_samples: Option<usize>) -> Result<Self, DataError> {
        let text = read_dataset(path).await?;
        let mut examples = Vec::new();
        for (index, line) in non_empty_lines(&text, max_samples) {
            let example: PreferenceExample = serde_json::from_str(line).map_err(|e| DataError::MalformedData {
                index,
                reason: e.to_string(),
            })?;
            examples.push(example);
        }
        info!(path = %path.display(), samples = examples.len(), "loaded preference dataset");
        Ok(Self::new(dataset_name(path), examples))
    }

    /// Load a JSONL file of [`PreferenceDialogue`] records and tokenize them
    /// with `tokenize`.
    #[instrument(skip(tokenize))]
    pub async fn from_dialogue_jsonl<F>(
        path: &Path,
        max_samples: Option<usize>,
        auto_insert_empty_system_msg: bool,
        bos_token_id: Option<u32>,
        mut tokenize: F,
    ) -> Result<Self, DataError>
    where
        F: FnMut(&[Message]) -> Result<Vec<u32>, DataError>,
    {
        let text = read_dataset(path).await?;
        let mut examples = Vec::new();
        for (index, line) in non_empty_lines(&text, max_samples) {
            let dialogue: PreferenceDialogue = serde_json::from_str(line).map_err(|e| DataError::MalformedData {
                index,
                reason: e.to_string(),
            })?;
            let example = dialogue
                .tokenize(auto_insert_empty_system_msg, bos_token_id, &mut tokenize)
                .map_err(|e| DataError::MalformedData {
                    index,
                    reason: e.to_string(),
                })?;
            examples.push(example);
        }
        info!(path = %path.display(), samples = examples.len(), "loaded dialogue dataset");
        Ok(Self::new(dataset_name(path), examples))
    }

    /// Dataset name, the file stem for loaded datasets
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of examples
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Whether the dataset holds no examples
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Example by index
    pub fn get(&self, index: usize) -> Option<&PreferenceExample> {
        self.examples.get(index)
    }

    /// All examples
    pub fn examples(&self) -> &[PreferenceExample] {
        &self.examples
    }
}

async fn read_dataset(path: &Path) -> Result<String, DataError> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Err(DataError::DatasetNotFound {
            path: path.display().to_string(),
        });
    }
    Ok(tokio::fs::read_to_string(path).await?)
}

fn non_empty_lines(text: &str, max_samples: Option<usize>) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .take(max_samples.unwrap_or(usize::MAX))
}

fn dataset_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Configuration for DataLoader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLoaderConfig {
    /// Pairs per batch
    pub batch_size: usize,
    /// Whether to shuffle each epoch
    pub shuffle: bool,
    /// Whether to drop the last incomplete batch
    pub drop_last: bool,
    /// Shuffle seed; epoch `e` uses `seed + e`
    pub seed: u64,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            shuffle: true,
            drop_last: false,
            seed: 42,
        }
    }
}

/// Batches a [`PreferenceDataset`] through a [`PreferenceCollator`]
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Arc<PreferenceDataset>,
    config: DataLoaderConfig,
    collator: PreferenceCollator,
}

impl DataLoader {
    /// Create a new DataLoader
    pub fn new(dataset: Arc<PreferenceDataset>, config: DataLoaderConfig, collator: PreferenceCollator) -> Self {
        debug!(
            batch_size = config.batch_size,
            shuffle = config.shuffle,
            samples = dataset.len(),
            "creating preference data loader"
        );
        Self {
            dataset,
            config,
            collator,
        }
    }

    /// Number of batches per epoch
    pub fn num_batches(&self) -> usize {
        let size = self.dataset.len();
        let batch = self.config.batch_size.max(1);
        if self.config.drop_last {
            size / batch
        } else {
            size.div_ceil(batch)
        }
    }

    /// Number of examples
    pub fn dataset_size(&self) -> usize {
        self.dataset.len()
    }

    /// Index groups for one epoch, deterministic for a given seed and epoch
    pub fn epoch_indices(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }

        let batch = self.config.batch_size.max(1);
        indices
            .chunks(batch)
            .filter(|chunk| !self.config.drop_last || chunk.len() == batch)
            .map(<[usize]>::to_vec)
            .collect()
    }

    /// Collate the examples at `indices`
    pub fn batch(&self, indices: &[usize]) -> Result<PreferenceBatch, DataError> {
        let examples = indices
            .iter()
            .map(|&index| {
                self.dataset.get(index).cloned().ok_or_else(|| DataError::MalformedData {
                    index,
                    reason: format!("index out of range for dataset of {}", self.dataset.len()),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.collator.collate(&examples)
    }

    /// Iterator over the collated batches of one epoch
    pub fn epoch(&self, epoch: usize) -> impl Iterator<Item = Result<PreferenceBatch, DataError>> + '_ {
        self.epoch_indices(epoch)
            .into_iter()
            .map(move |indices| self.batch(&indices))
    }
}
