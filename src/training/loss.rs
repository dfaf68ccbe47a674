//! Token-level losses with an ignore label

use candle_core::{DType, Tensor, D};

use crate::error::{RecipeError, Result};
use crate::models::Logits;

/// Loss over model logits and shifted labels
pub trait LossFn {
    /// Label value excluded from the loss
    fn ignore_index(&self) -> i64;

    /// Chunk count when the loss consumes per-chunk logits
    fn num_output_chunks(&self) -> Option<usize> {
        None
    }

    /// Scalar loss; consumes the logits so they are freed on return
    ///
    /// Full logits arrive flattened to `[N, vocab]` with `[N]` labels. Chunked
    /// logits arrive as produced by the model with `[batch, seq]` labels.
    fn compute(&self, logits: Logits, labels: &Tensor) -> Result<Tensor>;
}

/// Mean cross entropy over non-ignored tokens
#[derive(Debug, Clone)]
pub struct CrossEntropyLoss {
    ignore_index: i64,
}

impl CrossEntropyLoss {
    pub fn new(ignore_index: i64) -> Self {
        Self { ignore_index }
    }
}

impl LossFn for CrossEntropyLoss {
    fn ignore_index(&self) -> i64 {
        self.ignore_index
    }

    fn compute(&self, logits: Logits, labels: &Tensor) -> Result<Tensor> {
        let Logits::Full(logits) = logits else {
            return Err(RecipeError::config(
                "cross_entropy expects full logits; use chunked_cross_entropy for chunked output",
            ));
        };
        let (sum, count) = masked_nll_sum(&logits, labels, self.ignore_index)?;
        Ok(sum.affine(1.0 / count.max(1) as f64, 0.0)?)
    }
}

/// Cross entropy computed chunk by chunk along the sequence
///
/// Each chunk is upcast to f32 separately, which bounds the memory of the
/// upcast to one chunk at a time.
#[derive(Debug, Clone)]
pub struct ChunkedCrossEntropyLoss {
    num_output_chunks: usize,
    ignore_index: i64,
}

impl ChunkedCrossEntropyLoss {
    pub fn new(num_output_chunks: usize, ignore_index: i64) -> Self {
        Self {
            num_output_chunks: num_output_chunks.max(1),
            ignore_index,
        }
    }
}

impl LossFn for ChunkedCrossEntropyLoss {
    fn ignore_index(&self) -> i64 {
        self.ignore_index
    }

    fn num_output_chunks(&self) -> Option<usize> {
        Some(self.num_output_chunks)
    }

    fn compute(&self, logits: Logits, labels: &Tensor) -> Result<Tensor> {
        let chunks = match logits {
            Logits::Chunked(chunks) => chunks,
            Logits::Full(full) => vec![full],
        };
        let label_chunks = if chunks.len() == 1 {
            vec![labels.clone()]
        } else {
            labels.chunk(chunks.len(), 1)?
        };
        if label_chunks.len() != chunks.len() {
            return Err(RecipeError::InvalidBatch(format!(
                "{} logit chunks but {} label chunks",
                chunks.len(),
                label_chunks.len()
            )));
        }

        let mut total: Option<Tensor> = None;
        let mut count = 0usize;
        for (logits, labels) in chunks.into_iter().zip(label_chunks.iter()) {
            let vocab = logits.dim(D::Minus1)?;
            let logits = logits.reshape(((), vocab))?;
            let labels = labels.flatten_all()?;
            let (sum, n) = masked_nll_sum(&logits, &labels, self.ignore_index)?;
            count += n;
            total = Some(match total {
                Some(acc) => (acc + sum)?,
                None => sum,
            });
        }

        let total = total.ok_or_else(|| RecipeError::InvalidBatch("no logits".to_string()))?;
        Ok(total.affine(1.0 / count.max(1) as f64, 0.0)?)
    }
}

/// Summed negative log-likelihood over non-ignored rows, and their count
fn masked_nll_sum(logits: &Tensor, labels: &Tensor, ignore_index: i64) -> Result<(Tensor, usize)> {
    let logits = logits.to_dtype(DType::F32)?;
    let labels = labels.to_dtype(DType::I64)?;

    let ignore = Tensor::full(ignore_index, labels.shape(), labels.device())?;
    let valid = labels.ne(&ignore)?;
    let safe_labels = valid.where_cond(&labels, &labels.zeros_like()?)?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs.gather(&safe_labels.unsqueeze(1)?, 1)?.squeeze(1)?;
    let weights = valid.to_dtype(DType::F32)?;

    let sum = (picked * &weights)?.sum_all()?.neg()?;
    let count = weights.sum_all()?.to_scalar::<f32>()? as usize;
    Ok((sum, count))
}
