//! Hookweave Core - Host network model for diffusion plugins
//!
//! Hookweave extends a diffusion inference host with two kinds of model
//! surgery: binding low-rank adapted layers into a control network, and
//! hooking cross-attention blocks of a U-Net to inject image-prompt
//! conditioning. Both operate on a network the host has already built.
//!
//! This crate defines what that host network looks like to the plugins:
//!
//! - [`Node`]: a tree of named nodes addressable by dotted paths, with
//!   capability accessors instead of runtime type inspection
//! - [`Bindable`]: layers whose base weight comes from another network
//! - [`CrossAttention`]: the host attention module, with a replaceable
//!   forward slot and an ordered list of [`AttentionHook`]s
//! - [`StepState`]: per-step values (sampling progress, cond marker) the
//!   host publishes for hooks to read
//!
//! ```text
//! HostModel ─ root: Node tree ─ input_blocks.4.1.transformer_blocks.0.attn2
//!           │                                              │
//!           └ state: StepState ◄── read by hooks ── CrossAttention.hooks
//! ```

pub mod attention;
pub mod bind;
pub mod error;
pub mod graph;
pub mod host;

// Re-export commonly used types
pub use attention::{
    AttentionForward, AttentionHook, AttentionNode, AttentionParts, Contribution, CrossAttention,
    SharedAttention, StandardForward, scaled_dot_product_attention,
};
pub use bind::Bindable;
pub use error::{Error, Result};
pub use graph::{ModuleDict, Node, resolve, resolve_mut, set_by_path, state_dict, visit_mut};
pub use host::{HostModel, StepState, cond_mark_from_flags};
