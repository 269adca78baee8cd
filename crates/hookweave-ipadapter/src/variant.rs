//! Adapter variant detection
//!
//! The variant is inferred once, at construction, from the checkpoint file
//! name and from which keys the checkpoint carries.

use tracing::info;

use crate::error::Result;
use crate::weights::IpAdapterWeights;

/// Cross-attention width of SDXL U-Nets
pub const SDXL_CROSS_ATTENTION_DIM: usize = 2048;

/// CLIP hidden size consumed by faceid-plus models
const FACEID_PLUS_CLIP_DIM: usize = 1280;

/// Architecture flags of one adapter checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterVariant {
    pub is_v2: bool,
    pub is_faceid: bool,
    pub is_instantid: bool,
    pub is_portrait: bool,
    /// MLP projection (`image_proj.proj.3`)
    pub is_full: bool,
    /// Token-sequence projection (full, resampler or face resampler)
    pub is_plus: bool,
    pub sdxl: bool,
    pub sdxl_plus: bool,
    /// Width of the host cross-attention context
    pub cross_attention_dim: usize,
    /// Width of the CLIP features the projection consumes
    pub clip_embeddings_dim: Option<usize>,
}

impl AdapterVariant {
    /// Detect the variant of a checkpoint loaded from `model_name`
    pub fn detect(weights: &IpAdapterWeights, model_name: &str) -> Result<Self> {
        let is_v2 = model_name.contains("v2");
        let is_faceid = model_name.contains("faceid");
        let is_instantid = model_name.contains("instant_id");
        let is_portrait = model_name.contains("portrait");

        let image_proj = &weights.image_proj;
        let is_full = image_proj.contains_key("proj.3.weight");
        let is_plus = is_full
            || image_proj.contains_key("latents")
            || image_proj.contains_key("perceiver_resampler.proj_in.weight");

        let cross_attention_dim = weights.ip_adapter_tensor("1.to_k_ip.weight")?.dim(1)?;
        let sdxl = cross_attention_dim == SDXL_CROSS_ATTENTION_DIM;
        let sdxl_plus = sdxl && is_plus;

        if is_faceid && is_v2 && is_plus {
            info!("faceid plus v2 detected");
        }

        let clip_embeddings_dim = if is_instantid {
            None
        } else if is_faceid {
            is_plus.then_some(FACEID_PLUS_CLIP_DIM)
        } else if is_plus {
            let dim = if sdxl_plus {
                weights.image_proj_tensor("latents")?.dim(2)?
            } else if is_full {
                weights.image_proj_tensor("proj.0.weight")?.dim(1)?
            } else {
                weights.image_proj_tensor("proj_in.weight")?.dim(1)?
            };
            Some(dim)
        } else {
            Some(weights.image_proj_tensor("proj.weight")?.dim(1)?)
        };

        let variant = Self {
            is_v2,
            is_faceid,
            is_instantid,
            is_portrait,
            is_full,
            is_plus,
            sdxl,
            sdxl_plus,
            cross_attention_dim,
            clip_embeddings_dim,
        };
        info!(
            model_name,
            kind = variant.kind(),
            sdxl,
            cross_attention_dim,
            "detected ip-adapter variant"
        );
        Ok(variant)
    }

    /// Short name of the projection family
    pub fn kind(&self) -> &'static str {
        if self.is_instantid {
            "instant-id"
        } else if self.is_faceid && self.is_plus {
            "faceid-plus"
        } else if self.is_faceid {
            "faceid"
        } else if self.is_full {
            "full"
        } else if self.is_plus {
            "plus"
        } else {
            "base"
        }
    }

    /// Image tokens a plain faceid projection emits
    pub fn faceid_tokens(&self) -> usize {
        if self.is_portrait { 16 } else { 4 }
    }
}
