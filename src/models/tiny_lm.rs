//! Small single-head causal decoder with LoRA-adaptable projections
//!
//! Parameter namespace:
//! - `tok_embeddings.weight`, `pos_embeddings.weight`
//! - `layers.{i}.sa_norm.scale`, `layers.{i}.attn.{q,k,v,output}_proj.weight`
//! - `layers.{i}.mlp_norm.scale`, `layers.{i}.mlp.{w1,w2,w3}.weight`
//! - `norm.scale`, `output.weight`
//!
//! Adapted projections additionally own `lora_a.weight`, `lora_b.weight` and,
//! with DoRA, `magnitude`.

use candle_core::{DType, Device, Tensor, D};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use super::{CausalLm, Logits, ModelBuildContext};
use crate::config::ModelConfig;
use crate::error::{RecipeError, Result};
use crate::lora::layer::uniform;
use crate::lora::{AdapterModule, AdapterSpec, LoRALinear, ParameterStore};

const ATTN_PROJECTIONS: [&str; 4] = ["q_proj", "k_proj", "v_proj", "output_proj"];
const NORM_EPS: f64 = 1e-6;

#[derive(Debug)]
struct DecoderLayer {
    prefix: String,
    q_proj: LoRALinear,
    k_proj: LoRALinear,
    v_proj: LoRALinear,
    output_proj: LoRALinear,
    w1: LoRALinear,
    w2: LoRALinear,
    w3: LoRALinear,
}

impl DecoderLayer {
    fn linears(&self) -> [&LoRALinear; 7] {
        [
            &self.q_proj,
            &self.k_proj,
            &self.v_proj,
            &self.output_proj,
            &self.w1,
            &self.w2,
            &self.w3,
        ]
    }

    fn forward(&self, store: &ParameterStore, h: &Tensor, attn_bias: &Tensor) -> Result<Tensor> {
        let x = rms_norm(h, &store.tensor(&format!("{}.sa_norm.scale", self.prefix))?)?;
        let q = self.q_proj.forward(store, &x)?;
        let k = self.k_proj.forward(store, &x)?;
        let v = self.v_proj.forward(store, &x)?;

        let head_dim = q.dim(D::Minus1)? as f64;
        let scores = q
            .matmul(&k.t()?.contiguous()?)?
            .affine(1.0 / head_dim.sqrt(), 0.0)?
            .broadcast_add(attn_bias)?;
        let attn = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let attn_out = self.output_proj.forward(store, &attn.matmul(&v)?)?;
        let h = (h + attn_out)?;

        let x = rms_norm(&h, &store.tensor(&format!("{}.mlp_norm.scale", self.prefix))?)?;
        let gate = silu(&self.w1.forward(store, &x)?)?;
        let up = self.w3.forward(store, &x)?;
        let mlp_out = self.w2.forward(store, &(gate * up)?)?;
        Ok((h + mlp_out)?)
    }
}

/// Tiny decoder used for recipe runs and tests
#[derive(Debug)]
pub struct LoraTinyLm {
    vocab_size: usize,
    embed_dim: usize,
    max_seq_len: usize,
    layers: Vec<DecoderLayer>,
    output: LoRALinear,
    store: ParameterStore,
    num_output_chunks: usize,
    dtype: DType,
    device: Device,
}

impl LoraTinyLm {
    pub fn new(cfg: &ModelConfig, ctx: &ModelBuildContext) -> Result<Self> {
        validate_model_config(cfg)?;

        let spec = AdapterSpec {
            rank: cfg.lora_rank,
            alpha: cfg.lora_alpha,
            use_dora: cfg.use_dora,
        };
        let attn_adapter = |name: &str| {
            cfg.lora_attn_modules
                .iter()
                .any(|m| m == name)
                .then_some(spec)
        };
        let mlp_adapter = cfg.apply_lora_to_mlp.then_some(spec);
        let (dim, hidden) = (cfg.embed_dim, cfg.intermediate_dim);

        let layers: Vec<DecoderLayer> = (0..cfg.num_layers)
            .map(|i| {
                let prefix = format!("layers.{}", i);
                let attn = |name: &str| {
                    LoRALinear::new(format!("{}.attn.{}", prefix, name), dim, dim, attn_adapter(name))
                };
                DecoderLayer {
                    q_proj: attn("q_proj"),
                    k_proj: attn("k_proj"),
                    v_proj: attn("v_proj"),
                    output_proj: attn("output_proj"),
                    w1: LoRALinear::new(format!("{}.mlp.w1", prefix), dim, hidden, mlp_adapter),
                    w2: LoRALinear::new(format!("{}.mlp.w2", prefix), hidden, dim, mlp_adapter),
                    w3: LoRALinear::new(format!("{}.mlp.w3", prefix), dim, hidden, mlp_adapter),
                    prefix,
                }
            })
            .collect();
        let output = LoRALinear::new(
            "output",
            dim,
            cfg.vocab_size,
            cfg.apply_lora_to_output.then_some(spec),
        );

        let mut rng = StdRng::seed_from_u64(ctx.seed);
        let mut store = ParameterStore::new();
        let (dtype, device) = (ctx.dtype, &ctx.device);

        store.insert(
            "tok_embeddings.weight",
            &uniform(&mut rng, 1.0, (cfg.vocab_size, dim), dtype, device)?,
        )?;
        store.insert(
            "pos_embeddings.weight",
            &uniform(&mut rng, 1.0, (cfg.max_seq_len, dim), dtype, device)?,
        )?;
        for layer in &layers {
            store.insert(
                format!("{}.sa_norm.scale", layer.prefix),
                &Tensor::ones(dim, dtype, device)?,
            )?;
            store.insert(
                format!("{}.mlp_norm.scale", layer.prefix),
                &Tensor::ones(dim, dtype, device)?,
            )?;
            for linear in layer.linears() {
                linear.init(&mut store, &mut rng, dtype, device)?;
            }
        }
        store.insert("norm.scale", &Tensor::ones(dim, dtype, device)?)?;
        output.init(&mut store, &mut rng, dtype, device)?;

        debug!(
            "Built lora_tiny_lm: {} layers, {} parameters",
            cfg.num_layers,
            store.len()
        );

        Ok(Self {
            vocab_size: cfg.vocab_size,
            embed_dim: dim,
            max_seq_len: cfg.max_seq_len,
            layers,
            output,
            store,
            num_output_chunks: 1,
            dtype,
            device: ctx.device.clone(),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn num_output_chunks(&self) -> usize {
        self.num_output_chunks
    }

    fn linears(&self) -> impl Iterator<Item = &LoRALinear> {
        self.layers
            .iter()
            .flat_map(|l| l.linears())
            .chain(std::iter::once(&self.output))
    }

    /// Additive attention bias of shape `[batch | 1, seq, seq]`: 0 where attending
    fn attention_bias(&self, seq_len: usize, mask: Option<&Tensor>) -> Result<Tensor> {
        let allowed = match mask {
            Some(mask) => mask.to_dtype(DType::F32)?.to_device(&self.device)?,
            None => Tensor::tril2(seq_len, DType::F32, &self.device)?.unsqueeze(0)?,
        };
        // 1 -> 0, 0 -> -1e9
        Ok(allowed.affine(1e9, -1e9)?.to_dtype(self.dtype)?)
    }
}

impl CausalLm for LoraTinyLm {
    fn forward(
        &self,
        tokens: &Tensor,
        mask: Option<&Tensor>,
        input_pos: Option<&Tensor>,
    ) -> Result<Logits> {
        let (batch, seq_len) = tokens.dims2()?;
        if seq_len > self.max_seq_len {
            return Err(RecipeError::InvalidBatch(format!(
                "sequence length {} exceeds max_seq_len {}",
                seq_len, self.max_seq_len
            )));
        }

        let tok_emb = self.store.tensor("tok_embeddings.weight")?;
        let mut h = tok_emb
            .index_select(&tokens.flatten_all()?, 0)?
            .reshape((batch, seq_len, self.embed_dim))?;

        let pos_emb = self.store.tensor("pos_embeddings.weight")?;
        h = match input_pos {
            Some(pos) => {
                let pos = pos_emb
                    .index_select(&pos.flatten_all()?, 0)?
                    .reshape((batch, seq_len, self.embed_dim))?;
                (h + pos)?
            }
            None => h.broadcast_add(&pos_emb.narrow(0, 0, seq_len)?)?,
        };

        let attn_bias = self.attention_bias(seq_len, mask)?;
        for layer in &self.layers {
            h = layer.forward(&self.store, &h, &attn_bias)?;
        }
        let h = rms_norm(&h, &self.store.tensor("norm.scale")?)?;

        if self.num_output_chunks <= 1 {
            return Ok(Logits::Full(self.output.forward(&self.store, &h)?));
        }
        let chunks = h
            .chunk(self.num_output_chunks, 1)?
            .iter()
            .map(|chunk| self.output.forward(&self.store, chunk))
            .collect::<Result<Vec<_>>>()?;
        Ok(Logits::Chunked(chunks))
    }

    fn parameters(&self) -> &ParameterStore {
        &self.store
    }

    fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.store
    }

    fn adapter_modules(&self) -> Vec<&dyn AdapterModule> {
        self.linears()
            .filter(|l| l.adapter().is_some())
            .map(|l| l as &dyn AdapterModule)
            .collect()
    }

    fn set_num_output_chunks(&mut self, num_output_chunks: usize) {
        self.num_output_chunks = num_output_chunks.max(1);
    }

    fn load_dora_magnitudes(&mut self) -> Result<()> {
        for linear in self.linears() {
            linear.initialize_dora_magnitude(&self.store)?;
        }
        Ok(())
    }
}

fn validate_model_config(cfg: &ModelConfig) -> Result<()> {
    if let Some(m) = cfg
        .lora_attn_modules
        .iter()
        .find(|m| !ATTN_PROJECTIONS.contains(&m.as_str()))
    {
        return Err(RecipeError::config(format!(
            "unknown attention module '{}', expected one of {:?}",
            m, ATTN_PROJECTIONS
        )));
    }
    let max_rank = cfg.embed_dim.min(cfg.intermediate_dim);
    if cfg.lora_rank == 0 || cfg.lora_rank > max_rank {
        return Err(RecipeError::config(format!(
            "Invalid rank {}: must be between 1 and {}",
            cfg.lora_rank, max_rank
        )));
    }
    if cfg.vocab_size == 0 || cfg.embed_dim == 0 || cfg.max_seq_len == 0 {
        return Err(RecipeError::config(
            "vocab_size, embed_dim and max_seq_len must be non-zero",
        ));
    }
    Ok(())
}

fn rms_norm(x: &Tensor, scale: &Tensor) -> Result<Tensor> {
    let rms = x.sqr()?.mean_keepdim(D::Minus1)?.affine(1.0, NORM_EPS)?.sqrt()?;
    Ok(x.broadcast_div(&rms)?.broadcast_mul(scale)?)
}

fn silu(x: &Tensor) -> Result<Tensor> {
    let denom = x.neg()?.exp()?.affine(1.0, 1.0)?;
    Ok(x.div(&denom)?)
}
