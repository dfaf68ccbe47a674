//! Named parameter storage with per-parameter trainability
//!
//! Every model parameter lives here as a candle [`Var`]. Frozen parameters are
//! handed to the forward pass detached, so autograd only ever produces
//! gradients for the trainable set.

use candle_core::{DType, Device, Tensor, Var};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{RecipeError, Result};

/// Parameter name to tensor, ordered by name
pub type StateDict = BTreeMap<String, Tensor>;

/// Keys that did not line up during a non-strict state-dict load
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    /// Parameters of the model that the state dict did not provide
    pub missing: Vec<String>,
    /// Entries of the state dict the model has no parameter for
    pub unexpected: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ParameterStore {
    params: BTreeMap<String, Var>,
    trainable: BTreeSet<String>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new parameter; it starts out trainable
    pub fn insert(&mut self, name: impl Into<String>, value: &Tensor) -> Result<()> {
        let name = name.into();
        if self.params.contains_key(&name) {
            return Err(RecipeError::config(format!(
                "parameter '{}' registered twice",
                name
            )));
        }
        self.params.insert(name.clone(), Var::from_tensor(value)?);
        self.trainable.insert(name);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn var(&self, name: &str) -> Option<&Var> {
        self.params.get(name)
    }

    /// Tensor used in the forward pass: tracked when trainable, detached otherwise
    pub fn tensor(&self, name: &str) -> Result<Tensor> {
        let var = self
            .params
            .get(name)
            .ok_or_else(|| RecipeError::config(format!("no parameter named '{}'", name)))?;
        if self.trainable.contains(name) {
            Ok(var.as_tensor().clone())
        } else {
            Ok(var.as_tensor().detach())
        }
    }

    /// Overwrite a parameter in place, keeping its dtype and device
    pub fn assign(&self, name: &str, value: &Tensor) -> Result<()> {
        let var = self
            .params
            .get(name)
            .ok_or_else(|| RecipeError::config(format!("no parameter named '{}'", name)))?;
        let value = value.to_dtype(var.dtype())?.to_device(var.device())?;
        var.set(&value)?;
        Ok(())
    }

    pub fn set_requires_grad(&mut self, name: &str, requires_grad: bool) -> Result<()> {
        if !self.params.contains_key(name) {
            return Err(RecipeError::config(format!("no parameter named '{}'", name)));
        }
        if requires_grad {
            self.trainable.insert(name.to_string());
        } else {
            self.trainable.remove(name);
        }
        Ok(())
    }

    pub fn requires_grad(&self, name: &str) -> bool {
        self.trainable.contains(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Trainable parameters, in name order
    pub fn trainable_vars(&self) -> Vec<(String, Var)> {
        self.trainable
            .iter()
            .filter_map(|name| self.params.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }

    pub fn num_trainable(&self) -> usize {
        self.trainable.len()
    }

    /// Total element count over trainable parameters
    pub fn num_trainable_elements(&self) -> usize {
        self.trainable
            .iter()
            .filter_map(|name| self.params.get(name))
            .map(|v| v.elem_count())
            .sum()
    }

    /// Detached deep copies of every parameter on the host
    pub fn state_dict(&self) -> Result<StateDict> {
        let mut out = StateDict::new();
        for (name, var) in &self.params {
            let host = var.as_tensor().detach().to_device(&Device::Cpu)?.copy()?;
            out.insert(name.clone(), host);
        }
        Ok(out)
    }

    /// Non-strict load: copies every matching entry, reports the rest
    ///
    /// Incoming tensors are cast to the live parameter's dtype and moved to its
    /// device. A shape disagreement is an adapter mismatch rather than a silent skip.
    pub fn load_state_dict(&self, state_dict: &StateDict) -> Result<LoadOutcome> {
        let mut outcome = LoadOutcome::default();

        for (name, value) in state_dict {
            let Some(var) = self.params.get(name) else {
                outcome.unexpected.push(name.clone());
                continue;
            };
            if var.dims() != value.dims() {
                return Err(RecipeError::adapter_mismatch(format!(
                    "shape of '{}' is {:?} in the checkpoint but {:?} in the model",
                    name,
                    value.dims(),
                    var.dims()
                )));
            }
            let value = value.to_dtype(var.dtype())?.to_device(var.device())?;
            var.set(&value)?;
        }

        outcome.missing = self
            .params
            .keys()
            .filter(|name| !state_dict.contains_key(*name))
            .cloned()
            .collect();

        Ok(outcome)
    }

    pub fn dtype_of(&self, name: &str) -> Option<DType> {
        self.params.get(name).map(|v| v.dtype())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ParameterStore {
        let mut store = ParameterStore::new();
        store
            .insert("w", &Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        store
            .insert("b", &Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        store
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut store = store();
        let t = Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap();
        assert!(store.insert("b", &t).is_err());
    }

    #[test]
    fn test_frozen_params_get_no_gradient() {
        let mut store = store();
        store.set_requires_grad("w", false).unwrap();
        assert_eq!(store.num_trainable(), 1);

        let w = store.tensor("w").unwrap();
        let b = store.tensor("b").unwrap();
        let loss = w.sum_all().unwrap().add(&b.sum_all().unwrap()).unwrap();
        let grads = loss.backward().unwrap();

        assert!(grads.get(store.var("w").unwrap().as_tensor()).is_none());
        assert!(grads.get(store.var("b").unwrap().as_tensor()).is_some());
    }

    #[test]
    fn test_state_dict_is_a_copy() {
        let store = store();
        let sd = store.state_dict().unwrap();
        store
            .assign("w", &Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap())
            .unwrap();

        let copied: f32 = sd["w"].sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(copied, 6.0);
    }

    #[test]
    fn test_load_reports_missing_and_unexpected() {
        let store = store();
        let mut sd = StateDict::new();
        sd.insert(
            "w".to_string(),
            Tensor::full(2f32, (2, 3), &Device::Cpu).unwrap(),
        );
        sd.insert(
            "extra".to_string(),
            Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap(),
        );

        let outcome = store.load_state_dict(&sd).unwrap();
        assert_eq!(outcome.missing, vec!["b".to_string()]);
        assert_eq!(outcome.unexpected, vec!["extra".to_string()]);

        let loaded: f32 = store.tensor("w").unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(loaded, 12.0);
    }

    #[test]
    fn test_load_shape_mismatch() {
        let store = store();
        let mut sd = StateDict::new();
        sd.insert(
            "w".to_string(),
            Tensor::zeros((3, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        let err = store.load_state_dict(&sd).unwrap_err();
        assert!(matches!(err, RecipeError::AdapterMismatch(_)));
    }
}
