//! Conditional/unconditional image embedding pair

use candle_core::{IndexOp, Tensor};

use crate::error::{AdapterError, Result};

/// Projected image-prompt tokens for the conditional and unconditional
/// halves of a classifier-free guidance batch
#[derive(Debug, Clone)]
pub struct ImageEmbed {
    /// Conditional tokens, `[1, tokens, dim]`
    pub cond: Tensor,
    /// Unconditional tokens, same shape as `cond`
    pub uncond: Tensor,
    /// Use as-is instead of averaging with other embeddings
    pub bypass_average: bool,
}

impl ImageEmbed {
    /// Create an embedding pair
    pub fn new(cond: Tensor, uncond: Tensor) -> Self {
        Self {
            cond,
            uncond,
            bypass_average: false,
        }
    }

    /// Mark this embedding as final
    pub fn bypassing_average(mut self) -> Self {
        self.bypass_average = true;
        self
    }

    /// Select per batch row between the conditional and unconditional tokens.
    ///
    /// `cond_mark` is `[batch, 1, 1, 1]` with 1.0 on conditional rows. The
    /// result is `[batch, tokens, dim]` in the embedding's dtype and device.
    pub fn eval(&self, cond_mark: &Tensor) -> Result<Tensor> {
        let mark = cond_mark
            .i((.., .., .., 0))?
            .to_device(self.cond.device())?
            .to_dtype(self.cond.dtype())?;
        let inverse = mark.affine(-1.0, 1.0)?;
        let cond = self.cond.broadcast_mul(&mark)?;
        let uncond = self.uncond.broadcast_mul(&inverse)?;
        Ok(cond.add(&uncond)?)
    }

    /// Element-wise mean of several embeddings.
    ///
    /// A single embedding is returned unchanged.
    pub fn average_of(embeds: &[ImageEmbed]) -> Result<ImageEmbed> {
        match embeds {
            [] => Err(AdapterError::EmptyConditioning),
            [single] => Ok(single.clone()),
            many => {
                let conds: Vec<&Tensor> = many.iter().map(|e| &e.cond).collect();
                let unconds: Vec<&Tensor> = many.iter().map(|e| &e.uncond).collect();
                Ok(ImageEmbed::new(
                    Tensor::stack(&conds, 0)?.mean(0)?,
                    Tensor::stack(&unconds, 0)?.mean(0)?,
                ))
            }
        }
    }
}
