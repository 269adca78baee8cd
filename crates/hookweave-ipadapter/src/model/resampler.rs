//! Perceiver resampler
//!
//! A small stack of perceiver-attention and feed-forward blocks that
//! compresses a sequence of image features into a fixed number of tokens.
//! Layer widths and depth are read from the checkpoint.

use candle_core::{D, DType, Module, Tensor};
use candle_nn::{LayerNorm, Linear};

use crate::error::Result;
use crate::weights::WeightSource;

const DIM_HEAD: usize = 64;

/// Attention from latent queries over `[features; latents]`
#[derive(Debug, Clone)]
struct PerceiverAttention {
    norm1: LayerNorm,
    norm2: LayerNorm,
    to_q: Linear,
    to_kv: Linear,
    to_out: Linear,
    heads: usize,
}

impl PerceiverAttention {
    fn load(src: &WeightSource) -> Result<Self> {
        let to_q = src.pp("to_q").linear()?;
        let heads = to_q.weight().dim(0)? / DIM_HEAD;
        Ok(Self {
            norm1: src.pp("norm1").layer_norm()?,
            norm2: src.pp("norm2").layer_norm()?,
            to_q,
            to_kv: src.pp("to_kv").linear()?,
            to_out: src.pp("to_out").linear()?,
            heads,
        })
    }

    /// `[b, len, heads * d]` -> `[b, heads, len, d]`
    fn split_heads(&self, t: &Tensor) -> Result<Tensor> {
        let (b, len, width) = t.dims3()?;
        Ok(t.reshape((b, len, self.heads, width / self.heads))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn forward(&self, x: &Tensor, latents: &Tensor) -> Result<Tensor> {
        let x = self.norm1.forward(x)?;
        let latents = self.norm2.forward(latents)?;
        let (b, len, _) = latents.dims3()?;

        let q = self.to_q.forward(&latents)?;
        let kv_input = Tensor::cat(&[&x, &latents], 1)?;
        let kv = self.to_kv.forward(&kv_input)?.chunk(2, D::Minus1)?;

        let q = self.split_heads(&q)?;
        let k = self.split_heads(&kv[0])?;
        let v = self.split_heads(&kv[1])?;

        // Scale is split across q and k
        let scale = 1.0 / (DIM_HEAD as f64).sqrt().sqrt();
        let weight = (q * scale)?.matmul(&(k * scale)?.t()?.contiguous()?)?;
        let dtype = weight.dtype();
        let weight = candle_nn::ops::softmax_last_dim(&weight.to_dtype(DType::F32)?)?.to_dtype(dtype)?;

        let out = weight
            .matmul(&v)?
            .permute((0, 2, 1, 3))?
            .reshape((b, len, self.heads * DIM_HEAD))?;
        Ok(self.to_out.forward(&out)?)
    }
}

/// Layer norm, linear, GELU, linear
#[derive(Debug, Clone)]
struct FeedForward {
    norm: LayerNorm,
    up: Linear,
    down: Linear,
}

impl FeedForward {
    fn load(src: &WeightSource) -> Result<Self> {
        Ok(Self {
            norm: src.pp("0").layer_norm()?,
            up: src.pp("1").linear()?,
            down: src.pp("3").linear()?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.up.forward(&self.norm.forward(x)?)?.gelu_erf()?;
        Ok(self.down.forward(&h)?)
    }
}

/// Perceiver layers between an input and an output projection
#[derive(Debug, Clone)]
pub struct PerceiverStack {
    proj_in: Linear,
    layers: Vec<(PerceiverAttention, FeedForward)>,
    proj_out: Linear,
    norm_out: LayerNorm,
}

impl PerceiverStack {
    pub(crate) fn load(src: &WeightSource) -> Result<Self> {
        let mut layers = Vec::new();
        while src.contains(&format!("layers.{}.0.to_q.weight", layers.len())) {
            let layer = src.pp(format!("layers.{}", layers.len()));
            layers.push((
                PerceiverAttention::load(&layer.pp("0"))?,
                FeedForward::load(&layer.pp("1"))?,
            ));
        }
        Ok(Self {
            proj_in: src.pp("proj_in").linear()?,
            layers,
            proj_out: src.pp("proj_out").linear()?,
            norm_out: src.pp("norm_out").layer_norm()?,
        })
    }

    /// Number of perceiver layers
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Refine `latents` `[b, tokens, dim]` against features `x` `[b, seq, in]`
    pub fn forward(&self, latents: &Tensor, x: &Tensor) -> Result<Tensor> {
        let x = self.proj_in.forward(x)?;
        let mut latents = latents.clone();
        for (attn, ff) in &self.layers {
            latents = (attn.forward(&x, &latents)? + &latents)?;
            latents = (ff.forward(&latents)? + &latents)?;
        }
        let latents = self.proj_out.forward(&latents)?;
        Ok(self.norm_out.forward(&latents)?)
    }
}

/// Resampler with learned latent queries
#[derive(Debug, Clone)]
pub struct Resampler {
    latents: Tensor,
    stack: PerceiverStack,
}

impl Resampler {
    pub(crate) fn load(src: &WeightSource) -> Result<Self> {
        Ok(Self {
            latents: src.get("latents")?,
            stack: PerceiverStack::load(src)?,
        })
    }

    /// Number of output tokens
    pub fn num_queries(&self) -> Result<usize> {
        Ok(self.latents.dim(1)?)
    }

    /// `[b, seq, in]` features to `[b, queries, out]` tokens
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let batch = x.dim(0)?;
        let latents = self.latents.repeat((batch, 1, 1))?;
        self.stack.forward(&latents, x)
    }
}
