//! Hookweave LoRA - Adapter-capable layers for control networks
//!
//! Control-LoRA networks are built with low-rank adapted linear and
//! convolution layers whose base weights come from the base U-Net at
//! sampling time.
//!
//! # Flow
//!
//! 1. Build the control network with a [`LayerFactory`] inside
//!    [`scoped_hijack`], so every linear/conv layer is adapter-capable
//! 2. [`force_load_state_dict`] the control checkpoint (factors, biases)
//! 3. [`bind_all`] base weights before sampling
//! 4. [`unbind_all`] afterwards; layers with factors drop the borrowed weight
//!
//! [`ControlLora`] wraps the four steps.

pub mod binding;
pub mod control;
pub mod factory;
pub mod layer;

pub use binding::{bind_all, force_load_state_dict, unbind_all};
pub use control::ControlLora;
pub use factory::{HijackGuard, Layer, LayerFactory, LayerKind, scoped_hijack};
pub use layer::{ConvOptions, LoraConv2d, LoraLinear, LoraSlots};
