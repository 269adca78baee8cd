//! Layer construction with a scoped hijack
//!
//! Network builders ask a [`LayerFactory`] for their linear and convolution
//! layers instead of calling the constructors directly. Inside a hijack
//! scope the factory hands out the adapter-capable variants; everywhere
//! else it builds ordinary layers from a [`VarBuilder`]. The scope is an
//! RAII guard, so the previous kind comes back on every exit path,
//! unwinding included.

use std::cell::Cell;

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Linear, VarBuilder};
use hookweave_core::{Bindable, Node, Result};
use tracing::debug;

use crate::layer::{ConvOptions, LoraConv2d, LoraLinear};

/// Which layer variants a factory builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerKind {
    /// Ordinary layers with loaded weights
    #[default]
    Standard,
    /// Adapter-capable layers, weights bound later
    LoraCapable,
}

/// A layer built by a [`LayerFactory`]
#[derive(Debug, Clone)]
pub enum Layer {
    Linear(Linear),
    Conv2d(Conv2d),
    LoraLinear(LoraLinear),
    LoraConv2d(LoraConv2d),
}

impl Layer {
    /// Apply the layer. Adapted layers without a bound weight yield `None`.
    pub fn forward(&self, x: &Tensor) -> Result<Option<Tensor>> {
        match self {
            Self::Linear(linear) => Ok(Some(linear.forward(x)?)),
            Self::Conv2d(conv) => Ok(Some(conv.forward(x)?)),
            Self::LoraLinear(linear) => linear.forward(x),
            Self::LoraConv2d(conv) => conv.forward(x),
        }
    }

    /// Check if this is an adapter-capable variant
    pub fn is_lora(&self) -> bool {
        matches!(self, Self::LoraLinear(_) | Self::LoraConv2d(_))
    }
}

impl Node for Layer {
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
        let (weight, bias) = match self {
            Self::Linear(linear) => (linear.weight(), linear.bias()),
            Self::Conv2d(conv) => (conv.weight(), conv.bias()),
            Self::LoraLinear(linear) => return linear.tensors(),
            Self::LoraConv2d(conv) => return conv.tensors(),
        };
        let mut tensors = vec![("weight", weight.clone())];
        if let Some(bias) = bias {
            tensors.push(("bias", bias.clone()));
        }
        tensors
    }

    fn set_tensor(&mut self, name: &str, value: Tensor) -> bool {
        match self {
            Self::Linear(linear) => {
                let (weight, bias) = match name {
                    "weight" => (value, linear.bias().cloned()),
                    "bias" => (linear.weight().clone(), Some(value)),
                    _ => return false,
                };
                *linear = Linear::new(weight, bias);
                true
            }
            Self::Conv2d(conv) => {
                let config = *conv.config();
                let (weight, bias) = match name {
                    "weight" => (value, conv.bias().cloned()),
                    "bias" => (conv.weight().clone(), Some(value)),
                    _ => return false,
                };
                *conv = Conv2d::new(weight, bias, config);
                true
            }
            Self::LoraLinear(linear) => linear.set_tensor(name, value),
            Self::LoraConv2d(conv) => conv.set_tensor(name, value),
        }
    }

    fn as_bindable(&mut self) -> Option<&mut dyn Bindable> {
        match self {
            Self::LoraLinear(linear) => Some(linear),
            Self::LoraConv2d(conv) => Some(conv),
            _ => None,
        }
    }
}

/// Builds linear and convolution layers for network construction
#[derive(Debug, Default)]
pub struct LayerFactory {
    kind: Cell<LayerKind>,
}

impl LayerFactory {
    /// Create a factory building standard layers
    pub fn new() -> Self {
        Self::default()
    }

    /// Kind of layer currently built
    pub fn kind(&self) -> LayerKind {
        self.kind.get()
    }

    /// Build adapter-capable layers until the returned guard is dropped
    pub fn hijack(&self) -> HijackGuard<'_> {
        let previous = self.kind.replace(LayerKind::LoraCapable);
        debug!(?previous, "layer constructors hijacked");
        HijackGuard {
            factory: self,
            previous,
        }
    }

    /// Build a linear layer. `bias` selects whether a bias is loaded.
    pub fn linear(
        &self,
        in_features: usize,
        out_features: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Layer> {
        let layer = match self.kind() {
            LayerKind::LoraCapable => Layer::LoraLinear(LoraLinear::new(in_features, out_features)),
            LayerKind::Standard if bias => {
                Layer::Linear(candle_nn::linear(in_features, out_features, vb)?)
            }
            LayerKind::Standard => {
                Layer::Linear(candle_nn::linear_no_bias(in_features, out_features, vb)?)
            }
        };
        Ok(layer)
    }

    /// Build a square-kernel 2D convolution
    pub fn conv2d(
        &self,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        options: ConvOptions,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Layer> {
        let layer = match self.kind() {
            LayerKind::LoraCapable => Layer::LoraConv2d(LoraConv2d::new(
                in_channels,
                out_channels,
                kernel_size,
                options,
            )),
            LayerKind::Standard if bias => Layer::Conv2d(candle_nn::conv2d(
                in_channels,
                out_channels,
                kernel_size,
                options.to_config(),
                vb,
            )?),
            LayerKind::Standard => Layer::Conv2d(candle_nn::conv2d_no_bias(
                in_channels,
                out_channels,
                kernel_size,
                options.to_config(),
                vb,
            )?),
        };
        Ok(layer)
    }
}

/// Restores a factory's previous layer kind when dropped
#[must_use = "the hijack ends as soon as the guard is dropped"]
pub struct HijackGuard<'a> {
    factory: &'a LayerFactory,
    previous: LayerKind,
}

impl Drop for HijackGuard<'_> {
    fn drop(&mut self) {
        self.factory.kind.set(self.previous);
        debug!(restored = ?self.previous, "layer constructors restored");
    }
}

/// Run `build` with the factory hijacked, restoring it afterwards
pub fn scoped_hijack<T, E>(
    factory: &LayerFactory,
    build: impl FnOnce(&LayerFactory) -> std::result::Result<T, E>,
) -> std::result::Result<T, E> {
    let _guard = factory.hijack();
    build(factory)
}
