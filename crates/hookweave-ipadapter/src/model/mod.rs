//! IP-Adapter conditioning model
//!
//! Holds the image projection model selected by the adapter variant and the
//! per-block key/value projections. The model is rebuilt from the retained
//! checkpoint tensors whenever it moves to a new device or dtype.

mod kv;
mod proj;
mod resampler;

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use tracing::debug;

pub use kv::ToKv;
pub use proj::{FaceIdPlusProj, FaceIdProj, ImageProjModel, MlpProjModel};
pub use resampler::{PerceiverStack, Resampler};

use crate::embed::ImageEmbed;
use crate::error::{AdapterError, Result};
use crate::preprocess::ClipVisionOutput;
use crate::variant::AdapterVariant;
use crate::weights::{IpAdapterWeights, WeightSource};

/// Input width of the instant-id resampler
const INSTANTID_EMBED_DIM: usize = 512;

/// Image projection selected by the adapter variant
#[derive(Debug, Clone)]
pub enum ImageProjection {
    Base(ImageProjModel),
    Mlp(MlpProjModel),
    Resampler(Resampler),
    FaceId(FaceIdProj),
    FaceIdPlus(FaceIdPlusProj),
}

impl ImageProjection {
    fn load(src: &WeightSource, variant: &AdapterVariant) -> Result<Self> {
        let cross = variant.cross_attention_dim;
        let projection = if variant.is_instantid {
            Self::Resampler(Resampler::load(src)?)
        } else if variant.is_faceid && variant.is_plus {
            Self::FaceIdPlus(FaceIdPlusProj::load(src, cross)?)
        } else if variant.is_faceid {
            Self::FaceId(FaceIdProj::load(src, cross, variant.faceid_tokens())?)
        } else if variant.is_full {
            Self::Mlp(MlpProjModel::load(src)?)
        } else if variant.is_plus {
            Self::Resampler(Resampler::load(src)?)
        } else {
            Self::Base(ImageProjModel::load(src, cross)?)
        };
        Ok(projection)
    }

    /// Project a single-input embedding
    fn project(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Base(model) => model.forward(x),
            Self::Mlp(model) => model.forward(x),
            Self::Resampler(model) => model.forward(x),
            Self::FaceId(model) => model.forward(x),
            Self::FaceIdPlus(_) => Err(AdapterError::UnexpectedPreprocessorOutput {
                expected: "faceid plus",
                actual: "single embedding",
            }),
        }
    }
}

/// Image projection plus key/value projections on one device and dtype
#[derive(Debug, Clone)]
pub struct IpAdapterModel {
    weights: Arc<IpAdapterWeights>,
    variant: AdapterVariant,
    image_proj: ImageProjection,
    to_kvs: ToKv,
    device: Device,
    dtype: DType,
}

impl IpAdapterModel {
    /// Build the model for `variant` from checkpoint tensors
    pub fn load(
        weights: Arc<IpAdapterWeights>,
        variant: AdapterVariant,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let src = WeightSource::new(&weights.image_proj, "image_proj", device, dtype);
        let image_proj = ImageProjection::load(&src, &variant)?;
        let to_kvs = ToKv::load(&weights.ip_adapter, device, dtype)?;
        Ok(Self {
            image_proj,
            to_kvs,
            device: device.clone(),
            dtype,
            weights,
            variant,
        })
    }

    /// Rebuild on `device` in `dtype`. Returns `self` unchanged when already there.
    pub fn to_device_dtype(self, device: &Device, dtype: DType) -> Result<Self> {
        if self.device.same_device(device) && self.dtype == dtype {
            return Ok(self);
        }
        debug!(from = ?self.dtype, to = ?dtype, "moving ip-adapter model");
        Self::load(self.weights, self.variant, device, dtype)
    }

    /// Variant the model was built for
    pub fn variant(&self) -> &AdapterVariant {
        &self.variant
    }

    /// Selected image projection
    pub fn image_proj(&self) -> &ImageProjection {
        &self.image_proj
    }

    /// Key/value projections
    pub fn to_kvs(&self) -> &ToKv {
        &self.to_kvs
    }

    /// Device the model lives on
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Model dtype
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    fn prepare(&self, t: &Tensor) -> Result<Tensor> {
        Ok(t.to_device(&self.device)?.to_dtype(self.dtype)?)
    }

    fn project_pair(&self, cond: &Tensor, uncond: &Tensor) -> Result<ImageEmbed> {
        Ok(ImageEmbed::new(
            self.image_proj.project(cond)?,
            self.image_proj.project(uncond)?,
        ))
    }

    /// Embedding from CLIP vision output.
    ///
    /// Token-sequence models read the penultimate hidden states, the others
    /// the pooled image embedding. The unconditional branch projects zeros,
    /// or for token-sequence models the supplied unconditional hidden states.
    pub fn get_image_embeds(&self, output: &ClipVisionOutput) -> Result<ImageEmbed> {
        if self.variant.is_plus {
            let cond = self.prepare(&output.penultimate_hidden_states)?;
            let uncond = match &output.uncond_hidden_states {
                Some(uncond) => self.prepare(uncond)?,
                None => cond.zeros_like()?,
            };
            return self.project_pair(&cond, &uncond);
        }
        let cond = self.prepare(&output.image_embeds)?;
        self.project_pair(&cond, &cond.zeros_like()?)
    }

    /// Embedding from a face identity embedding
    pub fn get_image_embeds_faceid(&self, face_embed: &Tensor) -> Result<ImageEmbed> {
        let cond = self.prepare(face_embed)?;
        self.project_pair(&cond, &cond.zeros_like()?)
    }

    /// Embedding from a face identity embedding and CLIP vision output
    pub fn get_image_embeds_faceid_plus(
        &self,
        face_embed: &Tensor,
        clip: &ClipVisionOutput,
        is_v2: bool,
    ) -> Result<ImageEmbed> {
        let ImageProjection::FaceIdPlus(model) = &self.image_proj else {
            return Err(AdapterError::UnexpectedPreprocessorOutput {
                expected: self.variant.kind(),
                actual: "faceid plus",
            });
        };
        let face = self.prepare(face_embed)?;
        let clip_embeds = self.prepare(&clip.penultimate_hidden_states)?;
        let uncond_clip = match &clip.uncond_hidden_states {
            Some(uncond) => self.prepare(uncond)?,
            None => clip_embeds.zeros_like()?,
        };
        Ok(ImageEmbed::new(
            model.forward(&face, &clip_embeds, 1.0, is_v2)?,
            model.forward(&face.zeros_like()?, &uncond_clip, 1.0, is_v2)?,
        ))
    }

    /// Embedding from an instant-id face embedding, any shape with 512-wide rows
    pub fn get_image_embeds_instantid(&self, prompt_image_emb: &Tensor) -> Result<ImageEmbed> {
        let cond = self
            .prepare(prompt_image_emb)?
            .reshape((1, (), INSTANTID_EMBED_DIM))?;
        self.project_pair(&cond, &cond.zeros_like()?)
    }

    /// Project image tokens with the key/value layer at `key`
    pub fn project_kv(&self, key: &str, feat: &Tensor) -> Result<Tensor> {
        self.to_kvs.project(key, feat)
    }
}
