//! Image projection models
//!
//! Each maps an image or face embedding to `[batch, tokens, cross_dim]`
//! context tokens for the U-Net's cross-attention.

use candle_core::{Module, Tensor};
use candle_nn::{LayerNorm, Linear};
use hookweave_core::Error;

use super::resampler::PerceiverStack;
use crate::error::Result;
use crate::weights::WeightSource;

/// Linear projection to a few tokens, then layer norm
#[derive(Debug, Clone)]
pub struct ImageProjModel {
    proj: Linear,
    norm: LayerNorm,
    tokens: usize,
    cross_attention_dim: usize,
}

impl ImageProjModel {
    pub(crate) fn load(src: &WeightSource, cross_attention_dim: usize) -> Result<Self> {
        let proj = src.pp("proj").linear()?;
        let tokens = proj.weight().dim(0)? / cross_attention_dim;
        Ok(Self {
            proj,
            norm: src.pp("norm").layer_norm()?,
            tokens,
            cross_attention_dim,
        })
    }

    /// Number of output tokens
    pub fn tokens(&self) -> usize {
        self.tokens
    }

    /// `[b, clip_dim]` -> `[b, tokens, cross_dim]`
    pub fn forward(&self, image_embeds: &Tensor) -> Result<Tensor> {
        let tokens = self.proj.forward(image_embeds)?.reshape((
            (),
            self.tokens,
            self.cross_attention_dim,
        ))?;
        Ok(self.norm.forward(&tokens)?)
    }
}

/// Two-layer MLP applied per token
#[derive(Debug, Clone)]
pub struct MlpProjModel {
    fc1: Linear,
    fc2: Linear,
    norm: LayerNorm,
}

impl MlpProjModel {
    pub(crate) fn load(src: &WeightSource) -> Result<Self> {
        Ok(Self {
            fc1: src.pp("proj.0").linear()?,
            fc2: src.pp("proj.2").linear()?,
            norm: src.pp("proj.3").layer_norm()?,
        })
    }

    /// `[b, seq, clip_dim]` -> `[b, seq, cross_dim]`
    pub fn forward(&self, image_embeds: &Tensor) -> Result<Tensor> {
        let h = self.fc1.forward(image_embeds)?.gelu_erf()?;
        let h = self.fc2.forward(&h)?;
        Ok(self.norm.forward(&h)?)
    }
}

/// Face identity MLP shared by the faceid projections
#[derive(Debug, Clone)]
struct FaceMlp {
    fc1: Linear,
    fc2: Linear,
    norm: LayerNorm,
    tokens: usize,
    cross_attention_dim: usize,
}

impl FaceMlp {
    fn load(src: &WeightSource, cross_attention_dim: usize, tokens: usize) -> Result<Self> {
        let fc1 = src.pp("proj.0").linear()?;
        let fc2 = src.pp("proj.2").linear()?;
        let out = fc2.weight().dim(0)?;
        if out != tokens * cross_attention_dim {
            return Err(Error::ShapeMismatch {
                name: "image_proj.proj.2.weight".to_string(),
                expected: vec![tokens * cross_attention_dim, fc2.weight().dim(1)?],
                actual: fc2.weight().dims().to_vec(),
            }
            .into());
        }
        Ok(Self {
            fc1,
            fc2,
            norm: src.pp("norm").layer_norm()?,
            tokens,
            cross_attention_dim,
        })
    }

    fn forward(&self, face_embed: &Tensor) -> Result<Tensor> {
        let h = self.fc1.forward(face_embed)?.gelu_erf()?;
        let h = self
            .fc2
            .forward(&h)?
            .reshape(((), self.tokens, self.cross_attention_dim))?;
        Ok(self.norm.forward(&h)?)
    }
}

/// Face identity embedding to a few tokens
#[derive(Debug, Clone)]
pub struct FaceIdProj {
    mlp: FaceMlp,
}

impl FaceIdProj {
    pub(crate) fn load(src: &WeightSource, cross_attention_dim: usize, tokens: usize) -> Result<Self> {
        Ok(Self {
            mlp: FaceMlp::load(src, cross_attention_dim, tokens)?,
        })
    }

    /// Number of output tokens
    pub fn tokens(&self) -> usize {
        self.mlp.tokens
    }

    /// `[b, id_dim]` -> `[b, tokens, cross_dim]`
    pub fn forward(&self, face_embed: &Tensor) -> Result<Tensor> {
        self.mlp.forward(face_embed)
    }
}

/// Face identity tokens refined against CLIP features
#[derive(Debug, Clone)]
pub struct FaceIdPlusProj {
    mlp: FaceMlp,
    resampler: PerceiverStack,
}

impl FaceIdPlusProj {
    const TOKENS: usize = 4;

    pub(crate) fn load(src: &WeightSource, cross_attention_dim: usize) -> Result<Self> {
        Ok(Self {
            mlp: FaceMlp::load(src, cross_attention_dim, Self::TOKENS)?,
            resampler: PerceiverStack::load(&src.pp("perceiver_resampler"))?,
        })
    }

    /// Project `face_embed` `[b, id_dim]` with `clip_embeds` `[b, seq, clip_dim]`.
    ///
    /// With `shortcut` the face tokens are added back onto the resampled
    /// tokens, scaled by `scale`.
    pub fn forward(
        &self,
        face_embed: &Tensor,
        clip_embeds: &Tensor,
        scale: f64,
        shortcut: bool,
    ) -> Result<Tensor> {
        let tokens = self.mlp.forward(face_embed)?;
        let out = self.resampler.forward(&tokens, clip_embeds)?;
        if shortcut {
            Ok(tokens.add(&(out * scale)?)?)
        } else {
            Ok(out)
        }
    }
}
