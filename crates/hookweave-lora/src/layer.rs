//! Low-rank adapted layers
//!
//! Linear and 2D-convolution layers that hold an optional base weight plus
//! optional low-rank `up`/`down` factors. The base weight is not owned by the
//! layer's own checkpoint: it is bound from the base network right before
//! sampling and released afterwards.
//!
//! The effective weight is
//!
//! ```text
//! W' = W + up @ down        (both factors present)
//! W' = W                    (otherwise)
//! ```
//!
//! A layer without a bound base weight returns `Ok(None)` from `forward`.
//! Hosts that probe graph shapes with a first dry pass rely on that.

use candle_core::{Device, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Linear};
use hookweave_core::{Bindable, Node, Result};
use serde::{Deserialize, Serialize};

/// Tensor slots shared by both adapted layer kinds
#[derive(Debug, Clone, Default)]
pub struct LoraSlots {
    /// Base weight, bound from the base network
    pub weight: Option<Tensor>,
    /// Bias
    pub bias: Option<Tensor>,
    /// Up projection factor
    pub up: Option<Tensor>,
    /// Down projection factor
    pub down: Option<Tensor>,
}

impl LoraSlots {
    /// Both low-rank factors are present
    pub fn has_factors(&self) -> bool {
        self.up.is_some() && self.down.is_some()
    }

    fn tensors(&self) -> Vec<(&str, Tensor)> {
        [
            ("weight", &self.weight),
            ("bias", &self.bias),
            ("up", &self.up),
            ("down", &self.down),
        ]
        .into_iter()
        .filter_map(|(name, slot)| slot.as_ref().map(|t| (name, t.clone())))
        .collect()
    }

    fn set(&mut self, name: &str, value: Tensor) -> bool {
        let slot = match name {
            "weight" => &mut self.weight,
            "bias" => &mut self.bias,
            "up" => &mut self.up,
            "down" => &mut self.down,
            _ => return false,
        };
        *slot = Some(value);
        true
    }

    fn bias_on(&self, device: &Device) -> Result<Option<Tensor>> {
        match &self.bias {
            Some(bias) => Ok(Some(bias.to_device(device)?)),
            None => Ok(None),
        }
    }

    fn bind(&mut self, weight: Tensor) {
        self.weight = Some(weight);
    }

    fn unbind(&mut self) {
        // Without factors the base weight must stay resident for the shape-probe pass
        if self.has_factors() {
            self.weight = None;
        }
    }
}

/// Linear layer with optional low-rank factors
#[derive(Debug, Clone)]
pub struct LoraLinear {
    slots: LoraSlots,
    in_features: usize,
    out_features: usize,
}

impl LoraLinear {
    /// Create an unbound layer
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self {
            slots: LoraSlots::default(),
            in_features,
            out_features,
        }
    }

    /// Input dimension
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output dimension
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Tensor slots
    pub fn slots(&self) -> &LoraSlots {
        &self.slots
    }

    /// Set the low-rank factors: `up` is `[out, rank]`, `down` is `[rank, in]`
    pub fn set_factors(&mut self, up: Tensor, down: Tensor) {
        self.slots.up = Some(up);
        self.slots.down = Some(down);
    }

    /// Set the bias
    pub fn set_bias(&mut self, bias: Tensor) {
        self.slots.bias = Some(bias);
    }

    /// Weight the layer would apply, on `device`
    pub fn effective_weight(&self, device: &Device) -> Result<Option<Tensor>> {
        let Some(weight) = &self.slots.weight else {
            return Ok(None);
        };
        let weight = weight.to_device(device)?;
        match (&self.slots.up, &self.slots.down) {
            (Some(up), Some(down)) => {
                let delta = up.matmul(down)?.to_device(device)?;
                Ok(Some(weight.add(&delta)?))
            }
            _ => Ok(Some(weight)),
        }
    }

    /// Apply the layer, or `None` while no base weight is bound
    pub fn forward(&self, x: &Tensor) -> Result<Option<Tensor>> {
        let Some(weight) = self.effective_weight(x.device())? else {
            return Ok(None);
        };
        let bias = self.slots.bias_on(x.device())?;
        Ok(Some(Linear::new(weight, bias).forward(x)?))
    }
}

/// Convolution options captured at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvOptions {
    /// Zero padding on each side
    pub padding: usize,
    /// Stride
    pub stride: usize,
    /// Dilation
    pub dilation: usize,
    /// Channel groups
    pub groups: usize,
}

impl Default for ConvOptions {
    fn default() -> Self {
        Self {
            padding: 0,
            stride: 1,
            dilation: 1,
            groups: 1,
        }
    }
}

impl ConvOptions {
    /// Options with the given padding
    pub fn padded(padding: usize) -> Self {
        Self {
            padding,
            ..Default::default()
        }
    }

    /// Convert to the candle convolution config
    pub fn to_config(self) -> Conv2dConfig {
        Conv2dConfig {
            padding: self.padding,
            stride: self.stride,
            dilation: self.dilation,
            groups: self.groups,
            ..Default::default()
        }
    }
}

/// 2D convolution with optional low-rank factors
#[derive(Debug, Clone)]
pub struct LoraConv2d {
    slots: LoraSlots,
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    options: ConvOptions,
}

impl LoraConv2d {
    /// Create an unbound layer
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        options: ConvOptions,
    ) -> Self {
        Self {
            slots: LoraSlots::default(),
            in_channels,
            out_channels,
            kernel_size,
            options,
        }
    }

    /// Input channels
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Output channels
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Square kernel size
    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// Convolution options
    pub fn options(&self) -> ConvOptions {
        self.options
    }

    /// Tensor slots
    pub fn slots(&self) -> &LoraSlots {
        &self.slots
    }

    /// Set the low-rank factors. Both are flattened from dim 1 before the product.
    pub fn set_factors(&mut self, up: Tensor, down: Tensor) {
        self.slots.up = Some(up);
        self.slots.down = Some(down);
    }

    /// Set the bias
    pub fn set_bias(&mut self, bias: Tensor) {
        self.slots.bias = Some(bias);
    }

    /// Weight the layer would apply, on `device`
    pub fn effective_weight(&self, device: &Device) -> Result<Option<Tensor>> {
        let Some(weight) = &self.slots.weight else {
            return Ok(None);
        };
        let weight = weight.to_device(device)?;
        match (&self.slots.up, &self.slots.down) {
            (Some(up), Some(down)) => {
                let delta = up
                    .flatten_from(1)?
                    .matmul(&down.flatten_from(1)?)?
                    .reshape(weight.shape())?
                    .to_device(device)?;
                Ok(Some(weight.add(&delta)?))
            }
            _ => Ok(Some(weight)),
        }
    }

    /// Apply the layer, or `None` while no base weight is bound
    pub fn forward(&self, x: &Tensor) -> Result<Option<Tensor>> {
        let Some(weight) = self.effective_weight(x.device())? else {
            return Ok(None);
        };
        let bias = self.slots.bias_on(x.device())?;
        let conv = Conv2d::new(weight, bias, self.options.to_config());
        Ok(Some(conv.forward(x)?))
    }
}

macro_rules! impl_lora_node {
    ($layer:ty) => {
        impl Bindable for $layer {
            fn bind(&mut self, weight: Tensor) {
                self.slots.bind(weight);
            }

            fn unbind(&mut self) {
                self.slots.unbind();
            }

            fn is_bound(&self) -> bool {
                self.slots.weight.is_some()
            }
        }

        impl Node for $layer {
            fn children(&self) -> Vec<(&str, &dyn Node)> {
                Vec::new()
            }

            fn children_mut(&mut self) -> Vec<&mut dyn Node> {
                Vec::new()
            }

            fn child_mut(&mut self, _name: &str) -> Option<&mut dyn Node> {
                None
            }

            fn tensors(&self) -> Vec<(&str, Tensor)> {
                self.slots.tensors()
            }

            fn set_tensor(&mut self, name: &str, value: Tensor) -> bool {
                self.slots.set(name, value)
            }

            fn as_bindable(&mut self) -> Option<&mut dyn Bindable> {
                Some(self)
            }
        }
    };
}

impl_lora_node!(LoraLinear);
impl_lora_node!(LoraConv2d);

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn randn(shape: &[usize]) -> Tensor {
        Tensor::randn(0f32, 1f32, shape, &Device::Cpu).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        a.sub(b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_linear_effective_weight_with_factors() {
        let mut layer = LoraLinear::new(6, 4);
        let weight = randn(&[4, 6]);
        let up = randn(&[4, 2]);
        let down = randn(&[2, 6]);
        layer.set_factors(up.clone(), down.clone());
        layer.bind(weight.clone());

        let effective = layer.effective_weight(&Device::Cpu).unwrap().unwrap();
        let expected = weight.add(&up.matmul(&down).unwrap()).unwrap();
        assert!(max_abs_diff(&effective, &expected) < 1e-6);
    }

    #[test]
    fn test_linear_effective_weight_without_factors() {
        let mut layer = LoraLinear::new(6, 4);
        let weight = randn(&[4, 6]);
        layer.bind(weight.clone());

        let effective = layer.effective_weight(&Device::Cpu).unwrap().unwrap();
        assert_eq!(effective.to_vec2::<f32>().unwrap(), weight.to_vec2::<f32>().unwrap());

        // A lone factor is not enough
        layer.set_tensor("up", randn(&[4, 2]));
        let effective = layer.effective_weight(&Device::Cpu).unwrap().unwrap();
        assert_eq!(effective.to_vec2::<f32>().unwrap(), weight.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_conv_effective_weight_reshapes_delta() {
        let mut layer = LoraConv2d::new(3, 5, 3, ConvOptions::padded(1));
        let weight = randn(&[5, 3, 3, 3]);
        let up = randn(&[5, 2, 1, 1]);
        let down = randn(&[2, 3, 3, 3]);
        layer.set_factors(up.clone(), down.clone());
        layer.bind(weight.clone());

        let effective = layer.effective_weight(&Device::Cpu).unwrap().unwrap();
        assert_eq!(effective.dims(), &[5, 3, 3, 3]);

        let delta = up
            .flatten_from(1)
            .unwrap()
            .matmul(&down.flatten_from(1).unwrap())
            .unwrap()
            .reshape((5, 3, 3, 3))
            .unwrap();
        let expected = weight.add(&delta).unwrap();
        assert!(max_abs_diff(&effective, &expected) < 1e-5);
    }

    #[test]
    fn test_unbound_forward_is_sentinel() {
        let linear = LoraLinear::new(4, 2);
        let x = randn(&[3, 4]);
        assert!(linear.forward(&x).unwrap().is_none());

        let conv = LoraConv2d::new(2, 2, 3, ConvOptions::default());
        let x = randn(&[1, 2, 8, 8]);
        assert!(conv.forward(&x).unwrap().is_none());
    }

    #[test]
    fn test_bound_forward_shapes() {
        let mut linear = LoraLinear::new(4, 2);
        linear.bind(randn(&[2, 4]));
        linear.set_bias(Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap());
        let out = linear.forward(&randn(&[3, 4])).unwrap().unwrap();
        assert_eq!(out.dims(), &[3, 2]);

        let mut conv = LoraConv2d::new(2, 4, 3, ConvOptions::padded(1));
        conv.bind(randn(&[4, 2, 3, 3]));
        let out = conv.forward(&randn(&[1, 2, 8, 8])).unwrap().unwrap();
        assert_eq!(out.dims(), &[1, 4, 8, 8]);
    }

    #[test]
    fn test_unbind_without_factors_is_noop() {
        let mut layer = LoraLinear::new(4, 2);
        layer.bind(randn(&[2, 4]));

        layer.unbind();
        assert!(layer.is_bound());
    }

    #[test]
    fn test_unbind_with_factors_clears_weight() {
        let mut layer = LoraConv2d::new(2, 2, 1, ConvOptions::default());
        layer.set_factors(randn(&[2, 1, 1, 1]), randn(&[1, 2, 1, 1]));
        layer.bind(randn(&[2, 2, 1, 1]));

        layer.unbind();
        assert!(!layer.is_bound());

        // Idempotent
        layer.unbind();
        assert!(!layer.is_bound());
        assert!(layer.slots().has_factors());
    }

    #[test]
    fn test_node_slots() {
        let mut layer = LoraLinear::new(4, 2);
        assert!(layer.tensors().is_empty());

        assert!(layer.set_tensor("down", randn(&[1, 4])));
        assert!(layer.set_tensor("bias", randn(&[2])));
        assert!(!layer.set_tensor("scale", randn(&[1])));

        let names: Vec<&str> = layer.tensors().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["bias", "down"]);
        assert!(layer.as_bindable().is_some());
    }

    #[test]
    fn test_conv_options_config() {
        let options = ConvOptions::default();
        let config = options.to_config();
        assert_eq!(config.stride, 1);
        assert_eq!(config.groups, 1);
        assert_eq!(ConvOptions::padded(1).padding, 1);
    }
}
