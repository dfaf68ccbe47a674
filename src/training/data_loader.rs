//! Training data loading for pre-tokenized datasets

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::DatasetConfig;
use crate::error::{RecipeError, Result};
use crate::training::batch::{padded_collate, Batch};

/// A single pre-tokenized training sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizedSample {
    pub tokens: Vec<i64>,
    /// Supervision targets; defaults to the tokens themselves
    #[serde(default)]
    pub labels: Option<Vec<i64>>,
}

impl TokenizedSample {
    pub fn labels(&self) -> &[i64] {
        self.labels.as_deref().unwrap_or(&self.tokens)
    }
}

/// Token-level vocabulary facts the data pipeline needs
pub trait Tokenizer {
    fn pad_id(&self) -> i64;

    fn vocab_size(&self) -> Option<usize>;
}

/// Tokenizer for data that is already tokenized on disk
#[derive(Debug, Clone)]
pub struct PretokenizedTokenizer {
    pad_id: i64,
    vocab_size: Option<usize>,
}

impl PretokenizedTokenizer {
    pub fn new(pad_id: i64, vocab_size: Option<usize>) -> Self {
        Self { pad_id, vocab_size }
    }
}

impl Tokenizer for PretokenizedTokenizer {
    fn pad_id(&self) -> i64 {
        self.pad_id
    }

    fn vocab_size(&self) -> Option<usize> {
        self.vocab_size
    }
}

/// Map-style dataset held in memory
pub trait Dataset {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Option<&TokenizedSample>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dataset read from a JSONL file of `{"tokens": [...], "labels": [...]}` records
#[derive(Debug, Clone)]
pub struct JsonlDataset {
    samples: Vec<TokenizedSample>,
}

impl JsonlDataset {
    pub fn from_jsonl(path: &Path, tokenizer: &dyn Tokenizer, max_seq_len: Option<usize>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RecipeError::config(format!("Failed to read training data from {:?}: {}", path, e))
        })?;

        let mut samples = Vec::new();
        let mut dropped = 0usize;
        for (line_num, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let sample: TokenizedSample = serde_json::from_str(line).map_err(|e| {
                RecipeError::config(format!(
                    "Failed to parse line {} in {:?}: {}",
                    line_num + 1,
                    path,
                    e
                ))
            })?;
            validate_sample(&sample, tokenizer, line_num + 1)?;

            if max_seq_len.is_some_and(|max| sample.tokens.len() > max) {
                dropped += 1;
                continue;
            }
            samples.push(sample);
        }

        if dropped > 0 {
            warn!("Dropped {} samples longer than max_seq_len from {:?}", dropped, path);
        }
        debug!("Loaded {} samples from {:?}", samples.len(), path);
        Ok(Self { samples })
    }

    pub fn from_samples(samples: Vec<TokenizedSample>) -> Self {
        Self { samples }
    }
}

impl Dataset for JsonlDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Option<&TokenizedSample> {
        self.samples.get(index)
    }
}

fn validate_sample(sample: &TokenizedSample, tokenizer: &dyn Tokenizer, line: usize) -> Result<()> {
    if sample.tokens.is_empty() {
        return Err(RecipeError::config(format!("line {}: empty token list", line)));
    }
    if sample.labels().len() != sample.tokens.len() {
        return Err(RecipeError::config(format!(
            "line {}: {} tokens but {} labels",
            line,
            sample.tokens.len(),
            sample.labels().len()
        )));
    }
    if let Some(vocab) = tokenizer.vocab_size() {
        if let Some(t) = sample.tokens.iter().find(|&&t| t < 0 || t as usize >= vocab) {
            return Err(RecipeError::config(format!(
                "line {}: token id {} outside vocabulary of {}",
                line, t, vocab
            )));
        }
    }
    Ok(())
}

/// Several datasets read back to back
pub struct ConcatDataset {
    datasets: Vec<Box<dyn Dataset>>,
    offsets: Vec<usize>,
    len: usize,
}

impl ConcatDataset {
    pub fn new(datasets: Vec<Box<dyn Dataset>>) -> Self {
        let mut offsets = Vec::with_capacity(datasets.len());
        let mut len = 0;
        for ds in &datasets {
            offsets.push(len);
            len += ds.len();
        }
        Self {
            datasets,
            offsets,
            len,
        }
    }
}

impl Dataset for ConcatDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> Option<&TokenizedSample> {
        if index >= self.len {
            return None;
        }
        let which = self.offsets.partition_point(|&start| start <= index) - 1;
        self.datasets[which].get(index - self.offsets[which])
    }
}

/// Ordered, finite, restartable sequence of batches per epoch
pub trait DataPipeline {
    /// Reseed the epoch order
    fn set_epoch(&mut self, epoch: usize);

    /// Number of batches per epoch
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;
}

/// Single-replica sampler: a seeded permutation per epoch, or identity order
#[derive(Debug, Clone)]
pub struct EpochSampler {
    num_samples: usize,
    shuffle: bool,
    seed: u64,
    epoch: usize,
}

impl EpochSampler {
    pub fn new(num_samples: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            num_samples,
            shuffle,
            seed,
            epoch: 0,
        }
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    pub fn indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.num_samples).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
            indices.shuffle(&mut rng);
        }
        indices
    }
}

/// Batches a dataset with padded collation
pub struct DataLoader {
    dataset: Box<dyn Dataset>,
    sampler: EpochSampler,
    batch_size: usize,
    pad_id: i64,
    ignore_index: i64,
}

impl DataLoader {
    pub fn new(
        dataset: Box<dyn Dataset>,
        shuffle: bool,
        batch_size: usize,
        pad_id: i64,
        ignore_index: i64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(RecipeError::config("batch_size must be at least 1"));
        }
        let sampler = EpochSampler::new(dataset.len(), shuffle, 0);
        info!("Dataset and Sampler are initialized ({} samples)", dataset.len());
        Ok(Self {
            dataset,
            sampler,
            batch_size,
            pad_id,
            ignore_index,
        })
    }
}

impl DataPipeline for DataLoader {
    fn set_epoch(&mut self, epoch: usize) {
        self.sampler.set_epoch(epoch);
    }

    fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        let order = self.sampler.indices();
        let batches: Vec<Vec<usize>> = order.chunks(self.batch_size).map(<[usize]>::to_vec).collect();
        Box::new(batches.into_iter().map(move |indices| {
            let samples = indices
                .iter()
                .map(|&i| {
                    self.dataset
                        .get(i)
                        .map(|s| (s.tokens.as_slice(), s.labels()))
                        .ok_or_else(|| RecipeError::InvalidBatch(format!("no sample at index {}", i)))
                })
                .collect::<Result<Vec<_>>>()?;
            padded_collate(&samples, self.pad_id, self.ignore_index)
        }))
    }
}

/// Build one dataset, or a concatenation for a list of sections
pub fn build_dataset(
    configs: &[&DatasetConfig],
    tokenizer: &dyn Tokenizer,
    mut build: impl FnMut(&DatasetConfig, &dyn Tokenizer) -> Result<Box<dyn Dataset>>,
) -> Result<Box<dyn Dataset>> {
    match configs {
        [] => Err(RecipeError::config("no dataset configured")),
        [single] => build(single, tokenizer),
        many => {
            let datasets = many
                .iter()
                .map(|cfg| build(cfg, tokenizer))
                .collect::<Result<Vec<_>>>()?;
            Ok(Box::new(ConcatDataset::new(datasets)))
        }
    }
}
