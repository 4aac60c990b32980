//! Batch collation for preference training

use candle_core::{Device, Tensor};
use tracing::{debug, instrument};

use super::{DataError, PreferenceExample};
use crate::training::config::{DataArgs, TruncationMode};

/// Padded chosen and rejected sequences for one batch.
///
/// All six tensors are `[batch_size, seq_len]` with a single shared
/// `seq_len`, so the concatenated `[2 * batch_size, seq_len]` view needs no
/// further padding.
#[derive(Debug, Clone)]
pub struct PreferenceBatch {
    /// Chosen prompt+completion ids (`u32`)
    pub chosen_input_ids: Tensor,
    /// Chosen attention mask (`u32`, 1 for real tokens)
    pub chosen_attention_mask: Tensor,
    /// Chosen labels (`i64`, label pad id on prompt and padding)
    pub chosen_labels: Tensor,
    /// Rejected prompt+completion ids
    pub rejected_input_ids: Tensor,
    /// Rejected attention mask
    pub rejected_attention_mask: Tensor,
    /// Rejected labels
    pub rejected_labels: Tensor,
    /// Prompt length per row
    pub prompt_lengths: Vec<usize>,
    /// Chosen completion length per row
    pub chosen_lengths: Vec<usize>,
    /// Rejected completion length per row
    pub rejected_lengths: Vec<usize>,
}

impl PreferenceBatch {
    /// Assemble a batch, checking that chosen and rejected agree in shape
    pub fn new(
        chosen: (Tensor, Tensor, Tensor),
        rejected: (Tensor, Tensor, Tensor),
        prompt_lengths: Vec<usize>,
        chosen_lengths: Vec<usize>,
        rejected_lengths: Vec<usize>,
    ) -> crate::Result<Self> {
        let (chosen_input_ids, chosen_attention_mask, chosen_labels) = chosen;
        let (rejected_input_ids, rejected_attention_mask, rejected_labels) = rejected;

        let expected = chosen_input_ids.dims2()?;
        for (what, tensor) in [
            ("chosen attention mask", &chosen_attention_mask),
            ("chosen labels", &chosen_labels),
            ("rejected input ids", &rejected_input_ids),
            ("rejected attention mask", &rejected_attention_mask),
            ("rejected labels", &rejected_labels),
        ] {
            let dims = tensor.dims2()?;
            if dims != expected {
                return Err(crate::Error::shape_mismatch(
                    what,
                    &[expected.0, expected.1],
                    &[dims.0, dims.1],
                ));
            }
        }
        for lengths in [&prompt_lengths, &chosen_lengths, &rejected_lengths] {
            if lengths.len() != expected.0 {
                return Err(crate::Error::shape_mismatch(
                    "per-row lengths",
                    &[expected.0],
                    &[lengths.len()],
                ));
            }
        }

        Ok(Self {
            chosen_input_ids,
            chosen_attention_mask,
            chosen_labels,
            rejected_input_ids,
            rejected_attention_mask,
            rejected_labels,
            prompt_lengths,
            chosen_lengths,
            rejected_lengths,
        })
    }

    /// Number of preference pairs
    pub fn batch_size(&self) -> usize {
        self.prompt_lengths.len()
    }

    /// Shared padded sequence length
    pub fn seq_len(&self) -> usize {
        self.chosen_input_ids.dims().get(1).copied().unwrap_or(0)
    }

    /// `(input_ids, attention_mask, labels)` of shape `[2B, T]`, chosen rows first
    pub fn concatenated(&self) -> crate::Result<(Tensor, Tensor, Tensor)> {
        Ok((
            Tensor::cat(&[&self.chosen_input_ids, &self.rejected_input_ids], 0)?,
            Tensor::cat(&[&self.chosen_attention_mask, &self.rejected_attention_mask], 0)?,
            Tensor::cat(&[&self.chosen_labels, &self.rejected_labels], 0)?,
        ))
    }

    /// Move batch to a different device
    pub fn to_device(&mut self, device: &Device) -> Result<(), candle_core::Error> {
        self.chosen_input_ids = self.chosen_input_ids.to_device(device)?;
        self.chosen_attention_mask = self.chosen_attention_mask.to_device(device)?;
        self.chosen_labels = self.chosen_labels.to_device(device)?;
        self.rejected_input_ids = self.rejected_input_ids.to_device(device)?;
        self.rejected_attention_mask = self.rejected_attention_mask.to_device(device)?;
        self.rejected_labels = self.rejected_labels.to_device(device)?;
        Ok(())
    }
}

/// Truncates, decorates and pads [`PreferenceExample`]s into batches
#[derive(Debug, Clone)]
pub struct PreferenceCollator {
    max_length: usize,
    max_prompt_length: usize,
    truncation_mode: TruncationMode,
    label_pad_token_id: i64,
    padding_value: u32,
    bos_token_id: Option<u32>,
    eos_token_id: Option<u32>,
    device: Device,
}

/// One example after truncation, before padding
#[derive(Debug, Clone, PartialEq, Eq)]
struct PreparedExample {
    prompt: Vec<u32>,
    chosen: Vec<u32>,
    rejected: Vec<u32>,
}

impl PreferenceCollator {
    /// Create a collator from the data arguments
    pub fn new(args: &DataArgs, device: Device) -> Self {
        Self {
            max_length: args.max_length,
            max_prompt_length: args.max_prompt_length,
            truncation_mode: args.truncation_mode,
            label_pad_token_id: args.label_pad_token_id,
            padding_value: args.padding_value,
            bos_token_id: args.bos_token_id,
            eos_token_id: args.eos_token_id,
            device,
        }
    }

    /// Target device of the produced tensors
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Collate examples into one padded batch
    #[instrument(skip(self, examples), fields(batch_size = examples.len()))]
    pub fn collate(&self, examples: &[PreferenceExample]) -> Result<PreferenceBatch, DataError> {
        if examples.is_empty() {
            return Err(DataError::BatchCollationError {
                reason: "cannot collate an empty batch".to_string(),
            });
        }

        let prepared: Vec<PreparedExample> = examples.iter().map(|e| self.prepare(e)).collect();
        for (row, example) in prepared.iter().enumerate() {
            if example.prompt.is_empty() {
                return Err(DataError::EmptyPrompt { row });
            }
            if example.chosen.is_empty() {
                return Err(DataError::EmptyCompletion { which: "chosen", row });
            }
            if example.rejected.is_empty() {
                return Err(DataError::EmptyCompletion { which: "rejected", row });
            }
        }

        let seq_len = prepared
            .iter()
            .map(|e| e.prompt.len() + e.chosen.len().max(e.rejected.len()))
            .max()
            .unwrap_or(0);
        debug!(seq_len, "padding preference batch");

        let chosen = self.pad_rows(prepared.iter().map(|e| (&e.prompt, &e.chosen)), seq_len)?;
        let rejected = self.pad_rows(prepared.iter().map(|e| (&e.prompt, &e.rejected)), seq_len)?;

        PreferenceBatch::new(
            chosen,
            rejected,
            prepared.iter().map(|e| e.prompt.len()).collect(),
            prepared.iter().map(|e| e.chosen.len()).collect(),
            prepared.iter().map(|e| e.rejected.len()).collect(),
        )
        .map_err(|e| DataError::BatchCollationError { reason: e.to_string() })
    }

    /// Add BOS/EOS and truncate one example to `max_length`
    fn prepare(&self, example: &PreferenceExample) -> PreparedExample {
        let mut prompt = example.prompt_ids.clone();
        let mut chosen = example.chosen_ids.clone();
        let mut rejected = example.rejected_ids.clone();

        if let Some(bos) = self.bos_token_id {
            if prompt.first() != Some(&bos) {
                prompt.insert(0, bos);
            }
        }
        if let Some(eos) = self.eos_token_id {
            for response in [&mut chosen, &mut rejected] {
                if response.last() != Some(&eos) {
                    response.push(eos);
                }
            }
        }

        let longer = chosen.len().max(rejected.len());
        if prompt.len() + longer > self.max_length {
            prompt = match self.truncation_mode {
                TruncationMode::KeepStart => prompt.into_iter().take(self.max_prompt_length).collect(),
                TruncationMode::KeepEnd => {
                    let skip = prompt.len().saturating_sub(self.max_prompt_length);
                    prompt.into_iter().skip(skip).collect()
                }
            };
        }
        if prompt.len() + longer > self.max_length {
            let budget = self.max_length.saturating_sub(self.max_prompt_length);
            chosen.truncate(budget);
            rejected.truncate(budget);
        }

        PreparedExample { prompt, chosen, rejected }
    }

    fn pad_rows<'a>(
        &self,
        rows: impl Iterator<Item = (&'a Vec<u32>, &'a Vec<u32>)>,
        seq_len: usize,
    ) -> Result<(Tensor, Tensor, Tensor), DataError> {
        let mut ids = Vec::new();
        let mut mask = Vec::new();
        let mut labels = Vec::new();
        let mut batch = 0;

        for (prompt, response) in rows {
            let used = prompt.len() + response.len();
            ids.extend(prompt.iter().chain(response.iter()).copied());
            ids.extend(std::iter::repeat(self.padding_value).take(seq_len - used));

            mask.extend(std::iter::repeat(1u32).take(used));
            mask.extend(std::iter::repeat(0u32).take(seq_len - used));

            labels.extend(std::iter::repeat(self.label_pad_token_id).take(prompt.len()));
            labels.extend(response.iter().map(|&t| t as i64));
            labels.extend(std::iter::repeat(self.label_pad_token_id).take(seq_len - used));
            batch += 1;
        }

        Ok((
            Tensor::from_vec(ids, (batch, seq_len), &self.device)?,
            Tensor::from_vec(mask, (batch, seq_len), &self.device)?,
            Tensor::from_vec(labels, (batch, seq_len), &self.device)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> DataArgs {
        DataArgs {
            max_length: 8,
            max_prompt_length: 4,
            bos_token_id: Some(1),
            eos_token_id: Some(2),
            ..DataArgs::default()
        }
    }

    #[test]
    fn test_bos_and_eos_added_once() {
        let collator = PreferenceCollator::new(&args(), Device::Cpu);
        let prepared = collator.prepare(&PreferenceExample::new(vec![1, 5], vec![6, 2], vec![7]));
        assert_eq!(prepared.prompt, vec![1, 5]);
        assert_eq!(prepared.chosen, vec![6, 2]);
        assert_eq!(prepared.rejected, vec![7, 2]);
    }

    #[test]
    fn test_keep_end_truncates_prompt_head() {
        let collator = PreferenceCollator::new(&args(), Device::Cpu);
        let example = PreferenceExample::new(vec![10, 11, 12, 13, 14, 15], vec![20, 21], vec![30]);
        let prepared = collator.prepare(&example);
        // BOS + six prompt tokens, keep the last four
        assert_eq!(prepared.prompt, vec![12, 13, 14, 15]);
        assert_eq!(prepared.chosen, vec![20, 21, 2]);
    }

    #[test]
    fn test_keep_start_and_response_truncation() {
        let args = DataArgs {
            truncation_mode: TruncationMode::KeepStart,
            ..args()
        };
        let collator = PreferenceCollator::new(&args, Device::Cpu);
        let example = PreferenceExample::new(vec![10, 11, 12, 13, 14], vec![20, 21, 22, 23, 24, 25], vec![30]);
        let prepared = collator.prepare(&example);
        assert_eq!(prepared.prompt, vec![1, 10, 11, 12]);
        assert_eq!(prepared.chosen, vec![20, 21, 22, 23]);
        assert_eq!(prepared.rejected, vec![30, 2]);
    }

    #[test]
    fn test_empty_completion_is_rejected() {
        let args = DataArgs {
            eos_token_id: None,
            ..args()
        };
        let collator = PreferenceCollator::new(&args, Device::Cpu);
        let err = collator
            .collate(&[PreferenceExample::new(vec![5], vec![6], vec![])])
            .unwrap_err();
        assert!(matches!(err, DataError::EmptyCompletion { which: "rejected", row: 0 }));
    }

    #[test]
    fn test_empty_prompt_needs_bos() {
        let example = PreferenceExample::new(vec![], vec![6], vec![7]);

        let without_bos = DataArgs {
            bos_token_id: None,
            ..args()
        };
        let err = PreferenceCollator::new(&without_bos, Device::Cpu)
            .collate(&[example.clone()])
            .unwrap_err();
        assert!(matches!(err, DataError::EmptyPrompt { row: 0 }));

        let batch = PreferenceCollator::new(&args(), Device::Cpu).collate(&[example]).unwrap();
        assert_eq!(batch.prompt_lengths, vec![1]);
    }
}
