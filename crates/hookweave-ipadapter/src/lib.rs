//! Hookweave IP-Adapter - Image-prompt conditioning for diffusion U-Nets
//!
//! Loads an IP-Adapter checkpoint, detects its variant (base, plus, full,
//! faceid, faceid-plus, instant-id; SD 1.x or SDXL) and conditions a host
//! U-Net on an image by hooking every cross-attention block.
//!
//! ```text
//! preprocessor output ─► IpAdapterModel ─► ImageEmbed (cond / uncond)
//!                                               │
//! HostModel attn2 blocks ◄── IpAttentionHook ◄──┘  (per block K/V, cached)
//! ```
//!
//! Hooks are registered through a caller-owned
//! [`HookRegistry`](hookweave_attention::HookRegistry); clearing the
//! registry restores the host network.

pub mod adapter;
pub mod embed;
pub mod error;
pub mod layout;
pub mod model;
pub mod params;
pub mod preprocess;
pub mod variant;
pub mod weights;

#[cfg(test)]
mod fixtures;

// Re-export commonly used types
pub use adapter::{IpAttentionHook, PlugableIpAdapter};
pub use embed::ImageEmbed;
pub use error::{AdapterError, Result};
pub use layout::{hook_locations, sd15_locations, sdxl_locations};
pub use model::{ImageProjection, IpAdapterModel};
pub use params::HookParams;
pub use preprocess::{ClipVisionOutput, ConditioningInput, PreprocessorOutput};
pub use variant::{AdapterVariant, SDXL_CROSS_ATTENTION_DIM};
pub use weights::IpAdapterWeights;
