//! Sequence log-probabilities from causal LM logits
//!
//! Position `t` of the logits predicts label `t + 1`, so logits and labels are
//! shifted by one before gathering. Prompt and padding positions carry the
//! label pad id and are excluded from both the sum and the length normalizer.

use candle_core::{DType, Tensor, D};
use candle_nn::ops::log_softmax;
use tracing::instrument;

use crate::error::{Error, Result};

/// Label value marking positions that do not contribute to the log-probability
pub const DEFAULT_LABEL_PAD_TOKEN_ID: i64 = -100;

/// Per-sequence log-probabilities for a batch
#[derive(Debug, Clone)]
pub struct SequenceLogps {
    /// `[B]` summed or length-normalized log-probabilities (keeps the graph)
    pub logps: Tensor,
    /// `[B]` summed log-probabilities (keeps the graph)
    pub summed: Tensor,
    /// Number of completion tokens per row
    pub token_counts: Vec<usize>,
}

impl SequenceLogps {
    /// Batch size
    pub fn len(&self) -> usize {
        self.token_counts.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.token_counts.is_empty()
    }

    /// Split into the first `n` rows and the rest
    pub fn split_at(&self, n: usize) -> Result<(SequenceLogps, SequenceLogps)> {
        let total = self.len();
        if n > total {
            return Err(Error::shape_mismatch("split point beyond batch", &[total], &[n]));
        }
        let head = SequenceLogps {
            logps: self.logps.narrow(0, 0, n)?,
            summed: self.summed.narrow(0, 0, n)?,
            token_counts: self.token_counts[..n].to_vec(),
        };
        let tail = SequenceLogps {
            logps: self.logps.narrow(0, n, total - n)?,
            summed: self.summed.narrow(0, n, total - n)?,
            token_counts: self.token_counts[n..].to_vec(),
        };
        Ok((head, tail))
    }
}

/// Compute per-sequence log-probabilities of `labels` under `logits`.
///
/// * `logits` - `[B, T, V]` model outputs
/// * `labels` - `[B, T]` target ids, `label_pad_token_id` where masked
/// * `average` - divide by the number of completion tokens
///
/// Rows without any completion token are rejected with
/// [`Error::DegenerateSequence`].
#[instrument(skip(logits, labels), level = "debug")]
pub fn sequence_logps(
    logits: &Tensor,
    labels: &Tensor,
    label_pad_token_id: i64,
    average: bool,
) -> Result<SequenceLogps> {
    let (_batch, seq_len) = shifted_dims(logits, labels)?;

    // Shift for next-token prediction
    let logits = logits.narrow(1, 0, seq_len - 1)?.to_dtype(DType::F32)?;
    let labels = labels.narrow(1, 1, seq_len - 1)?.to_dtype(DType::I64)?;

    let valid = labels.ne(label_pad_token_id)?;
    let safe_labels = valid.where_cond(&labels, &labels.zeros_like()?)?;
    let index = safe_labels.to_dtype(DType::U32)?.unsqueeze(D::Minus1)?;

    let per_token = log_softmax(&logits, D::Minus1)?
        .gather(&index, D::Minus1)?
        .squeeze(D::Minus1)?;

    let mask = valid.to_dtype(DType::F32)?;
    let summed = (per_token * &mask)?.sum(D::Minus1)?;
    let counts = mask.sum(D::Minus1)?;

    let token_counts: Vec<usize> = counts
        .to_vec1::<f32>()?
        .into_iter()
        .map(|c| c.round() as usize)
        .collect();
    if let Some(row) = token_counts.iter().position(|&c| c == 0) {
        return Err(Error::DegenerateSequence { row });
    }

    let logps = if average {
        summed.div(&counts)?
    } else {
        summed.clone()
    };

    Ok(SequenceLogps {
        logps,
        summed,
        token_counts,
    })
}

/// Mean of the raw logits over every completion position and vocabulary
/// entry of the batch, as a single value.
///
/// Only used for logging (`logits/chosen`, `logits/rejected`).
pub fn masked_mean_logits(logits: &Tensor, labels: &Tensor, label_pad_token_id: i64) -> Result<f64> {
    let (_batch, seq_len) = shifted_dims(logits, labels)?;
    let vocab = logits.dim(D::Minus1)?;
    let shifted = logits.narrow(1, 0, seq_len - 1)?.to_dtype(DType::F32)?;
    let valid = labels
        .narrow(1, 1, seq_len - 1)?
        .to_dtype(DType::I64)?
        .ne(label_pad_token_id)?
        .to_dtype(DType::F32)?;

    let per_position = shifted.sum(D::Minus1)?;
    let total = (per_position * &valid)?.sum_all()?.to_scalar::<f32>()? as f64;
    let count = valid.sum_all()?.to_scalar::<f32>()? as f64 * vocab as f64;
    if count == 0.0 {
        return Ok(0.0);
    }
    Ok(total / count)
}

/// `(batch, seq_len)` of logits `[B, T, V]` and labels `[B, T]`, with `T >= 2`
fn shifted_dims(logits: &Tensor, labels: &Tensor) -> Result<(usize, usize)> {
    let (batch, seq_len, _vocab) = logits.dims3()?;
    let label_dims = labels.dims2()?;
    if label_dims != (batch, seq_len) {
        return Err(Error::shape_mismatch(
            "logits and labels",
            &[batch, seq_len],
            &[label_dims.0, label_dims.1],
        ));
    }
    if seq_len < 2 {
        return Err(Error::shape_mismatch("sequence too short to shift", &[2], &[seq_len]));
    }
    Ok((batch, seq_len))
}
