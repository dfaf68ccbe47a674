//! Training batches and label alignment

use candle_core::{DType, Device, Tensor};

use crate::error::{RecipeError, Result};

/// One collated micro-batch
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[batch, seq]` token ids (i64)
    pub tokens: Tensor,
    /// `[batch, seq]` target ids (i64), ignore index where not supervised
    pub labels: Tensor,
    /// Optional `[batch, seq, seq]` attention mask
    pub mask: Option<Tensor>,
    /// Optional `[batch, seq]` positions
    pub input_pos: Option<Tensor>,
}

impl Batch {
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            tokens: self.tokens.to_device(device)?,
            labels: self.labels.to_device(device)?,
            mask: self.mask.as_ref().map(|m| m.to_device(device)).transpose()?,
            input_pos: self
                .input_pos
                .as_ref()
                .map(|p| p.to_device(device))
                .transpose()?,
        })
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.tokens.dim(0)?)
    }

    pub fn num_tokens(&self) -> usize {
        self.tokens.elem_count()
    }
}

/// Pre-allocated `[batch_size, 1]` column of ignore labels
#[derive(Debug, Clone)]
pub struct IgnoreLabelCache {
    column: Tensor,
    ignore_index: i64,
}

impl IgnoreLabelCache {
    pub fn new(batch_size: usize, ignore_index: i64, device: &Device) -> Result<Self> {
        let column = Tensor::full(ignore_index, (batch_size, 1), device)?;
        Ok(Self {
            column,
            ignore_index,
        })
    }

    pub fn ignore_index(&self) -> i64 {
        self.ignore_index
    }

    pub fn capacity(&self) -> usize {
        self.column.dims()[0]
    }

    /// Shift labels left by one, filling the last column with the ignore index
    ///
    /// Position `i` of the result holds the label of position `i + 1`, so the
    /// logits at `i` are scored against the next token. The result is always
    /// `i64` so a negative ignore index survives unsigned label inputs.
    /// Batches larger than the cache are rejected.
    pub fn shift_labels(&self, labels: &Tensor) -> Result<Tensor> {
        let (batch, seq_len) = labels.dims2()?;
        if batch > self.capacity() {
            return Err(RecipeError::InvalidBatch(format!(
                "batch of {} rows exceeds configured batch_size {}",
                batch,
                self.capacity()
            )));
        }
        let labels = labels.to_dtype(DType::I64)?;
        let fill = self.column.narrow(0, 0, batch)?.to_device(labels.device())?;
        if seq_len == 0 {
            return Ok(labels);
        }
        let rest = labels.narrow(1, 1, seq_len - 1)?;
        Ok(Tensor::cat(&[&rest, &fill], 1)?)
    }
}

/// Stack ragged samples into a padded batch
///
/// Tokens are padded with `pad_id`, labels with `ignore_index`.
pub fn padded_collate(
    samples: &[(&[i64], &[i64])],
    pad_id: i64,
    ignore_index: i64,
) -> Result<Batch> {
    if samples.is_empty() {
        return Err(RecipeError::InvalidBatch("cannot collate an empty batch".to_string()));
    }
    let max_len = samples
        .iter()
        .map(|(t, l)| t.len().max(l.len()))
        .max()
        .unwrap_or(0);

    let mut tokens = Vec::with_capacity(samples.len() * max_len);
    let mut labels = Vec::with_capacity(samples.len() * max_len);
    for (t, l) in samples {
        tokens.extend_from_slice(t);
        tokens.extend(std::iter::repeat(pad_id).take(max_len - t.len()));
        labels.extend_from_slice(l);
        labels.extend(std::iter::repeat(ignore_index).take(max_len - l.len()));
    }

    let shape = (samples.len(), max_len);
    Ok(Batch {
        tokens: Tensor::from_vec(tokens, shape, &Device::Cpu)?,
        labels: Tensor::from_vec(labels, shape, &Device::Cpu)?,
        mask: None,
        input_pos: None,
    })
}

/// Ensure a tensor holds integer ids
pub(crate) fn ensure_ids(t: &Tensor, what: &str) -> Result<()> {
    match t.dtype() {
        DType::I64 | DType::U32 | DType::U8 => Ok(()),
        other => Err(RecipeError::InvalidBatch(format!(
            "{} must be integer ids, got {:?}",
            what, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Logits;
    use crate::training::loss::{CrossEntropyLoss, LossFn};

    #[test]
    fn test_shift_labels() {
        let cache = IgnoreLabelCache::new(4, -100, &Device::Cpu).unwrap();
        let labels = Tensor::from_vec(vec![1i64, 2, 3, 4, 5, 6], (2, 3), &Device::Cpu).unwrap();

        let shifted = cache.shift_labels(&labels).unwrap();
        assert_eq!(
            shifted.to_vec2::<i64>().unwrap(),
            vec![vec![2, 3, -100], vec![5, 6, -100]]
        );
    }

    #[test]
    fn test_shift_unsigned_labels_keeps_ignore_index() {
        let cache = IgnoreLabelCache::new(1, -100, &Device::Cpu).unwrap();
        let labels = Tensor::from_vec(vec![1u32, 2, 3], (1, 3), &Device::Cpu).unwrap();

        let shifted = cache.shift_labels(&labels).unwrap();
        assert_eq!(shifted.dtype(), DType::I64);
        assert_eq!(shifted.to_vec2::<i64>().unwrap(), vec![vec![2, 3, -100]]);

        // the ignored last position drops out of the loss
        let logits = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let loss = CrossEntropyLoss::new(-100)
            .compute(Logits::Full(logits), &shifted.flatten_all().unwrap())
            .unwrap();
        let value: f32 = loss.to_scalar().unwrap();
        assert!((value - 4f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_shift_rejects_oversized_batch() {
        let cache = IgnoreLabelCache::new(1, -100, &Device::Cpu).unwrap();
        let labels = Tensor::zeros((2, 3), DType::I64, &Device::Cpu).unwrap();
        assert!(matches!(
            cache.shift_labels(&labels),
            Err(RecipeError::InvalidBatch(_))
        ));
    }

    #[test]
    fn test_padded_collate() {
        let a: (&[i64], &[i64]) = (&[5, 6, 7], &[5, 6, 7]);
        let b: (&[i64], &[i64]) = (&[8], &[8]);
        let batch = padded_collate(&[a, b], 0, -100).unwrap();

        assert_eq!(
            batch.tokens.to_vec2::<i64>().unwrap(),
            vec![vec![5, 6, 7], vec![8, 0, 0]]
        );
        assert_eq!(
            batch.labels.to_vec2::<i64>().unwrap(),
            vec![vec![5, 6, 7], vec![8, -100, -100]]
        );
        assert_eq!(batch.num_tokens(), 6);
    }

    #[test]
    fn test_ensure_ids() {
        let f = Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap();
        assert!(ensure_ids(&f, "tokens").is_err());
        let i = Tensor::zeros(2, DType::I64, &Device::Cpu).unwrap();
        assert!(ensure_ids(&i, "tokens").is_ok());
    }
}
