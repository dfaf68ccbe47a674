//! LoRA and DoRA linear layers over a [`ParameterStore`]

use candle_core::{DType, Device, Tensor, D};
use rand::rngs::StdRng;
use rand::Rng;

use super::params::ParameterStore;
use crate::error::Result;

/// A module that owns adapter parameters
///
/// Adapter parameters are found structurally: each adapter module reports its
/// own path in the model namespace and the names of the parameters it adds.
pub trait AdapterModule {
    /// Fully-qualified module path, e.g. `layers.0.attn.q_proj`
    fn module_path(&self) -> &str;

    /// Adapter parameter names relative to the module path
    fn adapter_params(&self) -> Vec<&'static str>;
}

/// Rank, scaling and variant of an adapter attached to a linear layer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdapterSpec {
    pub rank: usize,
    pub alpha: f64,
    pub use_dora: bool,
}

impl AdapterSpec {
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }
}

/// Bias-free linear layer `y = x Wᵀ`, optionally carrying a low-rank adapter
///
/// With an adapter the effective weight is `W + (alpha / rank) * B A`, where
/// `A` is `[rank, in]` and `B` is `[out, rank]`. The DoRA variant rescales
/// each output row of the effective weight to the learned magnitude.
#[derive(Debug, Clone)]
pub struct LoRALinear {
    path: String,
    in_dim: usize,
    out_dim: usize,
    adapter: Option<AdapterSpec>,
}

impl LoRALinear {
    pub fn new(
        path: impl Into<String>,
        in_dim: usize,
        out_dim: usize,
        adapter: Option<AdapterSpec>,
    ) -> Self {
        Self {
            path: path.into(),
            in_dim,
            out_dim,
            adapter,
        }
    }

    pub fn adapter(&self) -> Option<&AdapterSpec> {
        self.adapter.as_ref()
    }

    pub fn weight_key(&self) -> String {
        format!("{}.weight", self.path)
    }

    pub fn lora_a_key(&self) -> String {
        format!("{}.lora_a.weight", self.path)
    }

    pub fn lora_b_key(&self) -> String {
        format!("{}.lora_b.weight", self.path)
    }

    pub fn magnitude_key(&self) -> String {
        format!("{}.magnitude", self.path)
    }

    /// Register this layer's parameters
    ///
    /// Base weights and `A` use a kaiming-uniform bound of `1/sqrt(in)`; `B`
    /// starts at zero so a fresh adapter leaves the base output unchanged.
    pub fn init(
        &self,
        store: &mut ParameterStore,
        rng: &mut StdRng,
        dtype: DType,
        device: &Device,
    ) -> Result<()> {
        let bound = 1.0 / (self.in_dim as f32).sqrt();
        let weight = uniform(rng, bound, (self.out_dim, self.in_dim), dtype, device)?;
        store.insert(self.weight_key(), &weight)?;

        if let Some(spec) = &self.adapter {
            let lora_a = uniform(rng, bound, (spec.rank, self.in_dim), dtype, device)?;
            let lora_b = Tensor::zeros((self.out_dim, spec.rank), dtype, device)?;
            store.insert(self.lora_a_key(), &lora_a)?;
            store.insert(self.lora_b_key(), &lora_b)?;
            if spec.use_dora {
                let magnitude = Tensor::ones(self.out_dim, dtype, device)?;
                store.insert(self.magnitude_key(), &magnitude)?;
            }
        }
        Ok(())
    }

    pub fn forward(&self, store: &ParameterStore, x: &Tensor) -> Result<Tensor> {
        let weight = store.tensor(&self.weight_key())?;
        let base = linear(x, &weight)?;

        let Some(spec) = &self.adapter else {
            return Ok(base);
        };

        let lora_a = store.tensor(&self.lora_a_key())?;
        let lora_b = store.tensor(&self.lora_b_key())?;
        let lora = linear(&linear(x, &lora_a)?, &lora_b)?.affine(spec.scaling(), 0.0)?;
        let out = (base + lora)?;

        if !spec.use_dora {
            return Ok(out);
        }

        // Row norms are treated as constants in the backward pass
        let magnitude = store.tensor(&self.magnitude_key())?;
        let delta = lora_b.matmul(&lora_a)?.affine(spec.scaling(), 0.0)?;
        let norm = row_norm(&(weight + delta)?)?.detach();
        let scale = magnitude.div(&norm)?;
        Ok(out.broadcast_mul(&scale)?)
    }

    /// Set the DoRA magnitude to the row norms of the current effective weight
    pub fn initialize_dora_magnitude(&self, store: &ParameterStore) -> Result<()> {
        let Some(spec) = self.adapter.filter(|s| s.use_dora) else {
            return Ok(());
        };
        let weight = store.tensor(&self.weight_key())?;
        let lora_a = store.tensor(&self.lora_a_key())?;
        let lora_b = store.tensor(&self.lora_b_key())?;
        let delta = lora_b.matmul(&lora_a)?.affine(spec.scaling(), 0.0)?;
        let norm = row_norm(&(weight + delta)?)?;
        store.assign(&self.magnitude_key(), &norm.detach())
    }
}

impl AdapterModule for LoRALinear {
    fn module_path(&self) -> &str {
        &self.path
    }

    fn adapter_params(&self) -> Vec<&'static str> {
        match &self.adapter {
            None => Vec::new(),
            Some(spec) if spec.use_dora => vec!["lora_a.weight", "lora_b.weight", "magnitude"],
            Some(_) => vec!["lora_a.weight", "lora_b.weight"],
        }
    }
}

/// `x Wᵀ` for inputs of any rank, with `W` shaped `[out, in]`
pub fn linear(x: &Tensor, weight: &Tensor) -> Result<Tensor> {
    let dims = x.dims().to_vec();
    let in_dim = dims.last().copied().unwrap_or(1);
    let rows = x.elem_count() / in_dim.max(1);
    let flat = x.reshape((rows, in_dim))?;
    let out = flat.matmul(&weight.t()?)?;

    let mut out_dims = dims;
    if let Some(last) = out_dims.last_mut() {
        *last = weight.dim(0)?;
    }
    Ok(out.reshape(out_dims)?)
}

/// L2 norm of each row of a 2-D tensor
pub fn row_norm(weight: &Tensor) -> Result<Tensor> {
    Ok(weight.sqr()?.sum(D::Minus1)?.sqrt()?)
}

pub(crate) fn uniform(
    rng: &mut StdRng,
    bound: f32,
    shape: (usize, usize),
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let data: Vec<f32> = (0..shape.0 * shape.1)
        .map(|_| rng.gen_range(-bound..bound))
        .collect();
    Ok(Tensor::from_vec(data, shape, device)?.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn build(adapter: Option<AdapterSpec>) -> (LoRALinear, ParameterStore) {
        let layer = LoRALinear::new("proj", 4, 3, adapter);
        let mut store = ParameterStore::new();
        let mut rng = StdRng::seed_from_u64(7);
        layer
            .init(&mut store, &mut rng, DType::F32, &Device::Cpu)
            .unwrap();
        (layer, store)
    }

    #[test]
    fn test_fresh_adapter_matches_base() {
        let spec = AdapterSpec {
            rank: 2,
            alpha: 4.0,
            use_dora: false,
        };
        let (layer, store) = build(Some(spec));
        let x = Tensor::ones((2, 5, 4), DType::F32, &Device::Cpu).unwrap();

        let out = layer.forward(&store, &x).unwrap();
        let base = linear(&x, &store.tensor("proj.weight").unwrap()).unwrap();
        assert_eq!(out.dims(), &[2, 5, 3]);

        let diff: f32 = (out - base)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_adapter_param_names() {
        let dora = AdapterSpec {
            rank: 2,
            alpha: 2.0,
            use_dora: true,
        };
        let (layer, store) = build(Some(dora));
        assert_eq!(
            layer.adapter_params(),
            vec!["lora_a.weight", "lora_b.weight", "magnitude"]
        );
        assert!(store.contains("proj.magnitude"));

        let (plain, _) = build(None);
        assert!(plain.adapter_params().is_empty());
    }

    #[test]
    fn test_dora_magnitude_from_row_norms() {
        let dora = AdapterSpec {
            rank: 2,
            alpha: 2.0,
            use_dora: true,
        };
        let (layer, store) = build(Some(dora));
        layer.initialize_dora_magnitude(&store).unwrap();

        let expected = row_norm(&store.tensor("proj.weight").unwrap())
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let magnitude = store
            .tensor("proj.magnitude")
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for (m, e) in magnitude.iter().zip(expected.iter()) {
            assert!((m - e).abs() < 1e-6);
        }

        // With the magnitude equal to the norm, DoRA reproduces the base output
        let x = Tensor::ones((1, 4), DType::F32, &Device::Cpu).unwrap();
        let out = layer.forward(&store, &x).unwrap().to_vec2::<f32>().unwrap();
        let base = linear(&x, &store.tensor("proj.weight").unwrap())
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        for (o, b) in out[0].iter().zip(base[0].iter()) {
            assert!((o - b).abs() < 1e-5);
        }
    }
}
