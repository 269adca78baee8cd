//! Per-block key/value projections of the image tokens

use std::collections::HashMap;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Linear;

use crate::error::{AdapterError, Result};
use crate::weights::WeightSource;

/// Bias-free projections keyed `{n}_to_k_ip` / `{n}_to_v_ip`
#[derive(Debug, Clone)]
pub struct ToKv {
    layers: HashMap<String, Linear>,
}

impl ToKv {
    /// Build one projection per `ip_adapter` weight: `3.to_v_ip.weight` becomes `3_to_v_ip`
    pub(crate) fn load(tensors: &HashMap<String, Tensor>, device: &Device, dtype: DType) -> Result<Self> {
        let source = WeightSource::new(tensors, "ip_adapter", device, dtype);
        let mut layers = HashMap::new();
        for key in tensors.keys() {
            let Some(stem) = key.strip_suffix(".weight") else {
                continue;
            };
            layers.insert(stem.replace('.', "_"), Linear::new(source.get(key)?, None));
        }
        Ok(Self { layers })
    }

    /// Key for block `number`'s key projection
    pub fn k_key(number: usize) -> String {
        format!("{}_to_k_ip", number * 2 + 1)
    }

    /// Key for block `number`'s value projection
    pub fn v_key(number: usize) -> String {
        format!("{}_to_v_ip", number * 2 + 1)
    }

    /// Project `feat` with the layer at `key`
    pub fn project(&self, key: &str, feat: &Tensor) -> Result<Tensor> {
        let layer = self
            .layers
            .get(key)
            .ok_or_else(|| AdapterError::MissingProjection(key.to_string()))?;
        Ok(layer.forward(feat)?)
    }

    /// Number of projections
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Check if there are no projections
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn test_keys() {
        assert_eq!(ToKv::k_key(0), "1_to_k_ip");
        assert_eq!(ToKv::v_key(15), "31_to_v_ip");
    }

    #[test]
    fn test_load_and_project() {
        let weights = fixtures::base_weights(16, 8, 1, 3);
        let kv = ToKv::load(&weights.ip_adapter, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(kv.len(), 6);

        let feat = fixtures::randn(&[2, 4, 16]);
        let k = kv.project(&ToKv::k_key(2), &feat).unwrap();
        assert_eq!(k.dims(), &[2, 4, fixtures::INNER]);

        assert!(matches!(
            kv.project("7_to_k_ip", &feat),
            Err(AdapterError::MissingProjection(_))
        ));
    }
}
