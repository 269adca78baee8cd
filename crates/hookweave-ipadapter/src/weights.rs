//! IP-Adapter checkpoint tensors
//!
//! Checkpoints carry two groups of tensors: `image_proj.*` for the image
//! projection model and `ip_adapter.*` for the per-block key/value
//! projections. Flat checkpoints prefix every key with its group name.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::{LayerNorm, Linear};
use hookweave_core::Error;

use crate::error::Result;

const LAYER_NORM_EPS: f64 = 1e-5;

/// Checkpoint tensors split by group
#[derive(Debug, Clone, Default)]
pub struct IpAdapterWeights {
    /// Image projection tensors, keys without the `image_proj.` prefix
    pub image_proj: HashMap<String, Tensor>,
    /// Key/value projection tensors, keys without the `ip_adapter.` prefix
    pub ip_adapter: HashMap<String, Tensor>,
}

impl IpAdapterWeights {
    /// Split a flat checkpoint on its group prefixes.
    ///
    /// Keys outside both groups are ignored.
    pub fn from_flat(flat: HashMap<String, Tensor>) -> Self {
        let mut weights = Self::default();
        for (key, tensor) in flat {
            if let Some(rest) = key.strip_prefix("image_proj.") {
                weights.image_proj.insert(rest.to_string(), tensor);
            } else if let Some(rest) = key.strip_prefix("ip_adapter.") {
                weights.ip_adapter.insert(rest.to_string(), tensor);
            }
        }
        weights
    }

    /// Image projection tensor lookup
    pub fn image_proj_tensor(&self, key: &str) -> Result<&Tensor> {
        self.image_proj
            .get(key)
            .ok_or_else(|| Error::MissingKey(format!("image_proj.{key}")).into())
    }

    /// Key/value projection tensor lookup
    pub fn ip_adapter_tensor(&self, key: &str) -> Result<&Tensor> {
        self.ip_adapter
            .get(key)
            .ok_or_else(|| Error::MissingKey(format!("ip_adapter.{key}")).into())
    }
}

/// Builds layers from one tensor group on a target device and dtype
pub(crate) struct WeightSource<'a> {
    tensors: &'a HashMap<String, Tensor>,
    group: &'static str,
    prefix: String,
    device: &'a Device,
    dtype: DType,
}

impl<'a> WeightSource<'a> {
    pub(crate) fn new(
        tensors: &'a HashMap<String, Tensor>,
        group: &'static str,
        device: &'a Device,
        dtype: DType,
    ) -> Self {
        Self {
            tensors,
            group,
            prefix: String::new(),
            device,
            dtype,
        }
    }

    /// Source scoped below `name`
    pub(crate) fn pp(&self, name: impl AsRef<str>) -> Self {
        Self {
            tensors: self.tensors,
            group: self.group,
            prefix: self.key(name.as_ref()),
            device: self.device,
            dtype: self.dtype,
        }
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.prefix)
        }
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(&self.key(name))
    }

    /// Tensor at `name`, moved to the target device and dtype
    pub(crate) fn get(&self, name: &str) -> Result<Tensor> {
        let key = self.key(name);
        let tensor = self
            .tensors
            .get(&key)
            .ok_or_else(|| Error::MissingKey(format!("{}.{key}", self.group)))?;
        Ok(tensor.to_device(self.device)?.to_dtype(self.dtype)?)
    }

    /// Linear layer at this scope, with a bias when the checkpoint has one
    pub(crate) fn linear(&self) -> Result<Linear> {
        let weight = self.get("weight")?;
        let bias = if self.contains("bias") {
            Some(self.get("bias")?)
        } else {
            None
        };
        Ok(Linear::new(weight, bias))
    }

    /// Layer norm at this scope
    pub(crate) fn layer_norm(&self) -> Result<LayerNorm> {
        Ok(LayerNorm::new(self.get("weight")?, self.get("bias")?, LAYER_NORM_EPS))
    }
}
