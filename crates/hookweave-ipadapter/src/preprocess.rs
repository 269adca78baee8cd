//! Preprocessor outputs consumed by the adapter

use candle_core::Tensor;

use crate::embed::ImageEmbed;

/// Output of a CLIP vision encoder
#[derive(Debug, Clone)]
pub struct ClipVisionOutput {
    /// Pooled, projected image embedding, `[batch, clip_dim]`
    pub image_embeds: Tensor,
    /// Second-to-last hidden states, `[batch, patches, hidden]`
    pub penultimate_hidden_states: Tensor,
    /// Penultimate hidden states of an empty image, for the unconditional
    /// branch of resampler models. Zeros are used when absent.
    pub uncond_hidden_states: Option<Tensor>,
}

impl ClipVisionOutput {
    /// Create an output without unconditional hidden states
    pub fn new(image_embeds: Tensor, penultimate_hidden_states: Tensor) -> Self {
        Self {
            image_embeds,
            penultimate_hidden_states,
            uncond_hidden_states: None,
        }
    }

    /// Attach unconditional hidden states
    pub fn with_uncond_hidden_states(mut self, uncond: Tensor) -> Self {
        self.uncond_hidden_states = Some(uncond);
        self
    }
}

/// One preprocessor result
#[derive(Debug, Clone)]
pub enum PreprocessorOutput {
    /// CLIP vision encoder output
    ClipVision(ClipVisionOutput),
    /// Face identity embedding, `[batch, 512]`
    FaceEmbedding(Tensor),
    /// Face identity embedding plus CLIP vision output
    FaceIdPlus {
        face_embed: Tensor,
        clip: ClipVisionOutput,
    },
    /// An embedding computed earlier, averaged like any other output
    Embed(ImageEmbed),
}

impl PreprocessorOutput {
    /// Variant name, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClipVision(_) => "clip vision",
            Self::FaceEmbedding(_) => "face embedding",
            Self::FaceIdPlus { .. } => "faceid plus",
            Self::Embed(_) => "image embed",
        }
    }
}

impl From<ClipVisionOutput> for PreprocessorOutput {
    fn from(output: ClipVisionOutput) -> Self {
        Self::ClipVision(output)
    }
}

/// What an adapter is conditioned on
#[derive(Debug, Clone)]
pub enum ConditioningInput {
    /// A finished embedding flagged `bypass_average`, used as-is
    Averaged(ImageEmbed),
    /// Raw outputs, each projected and then averaged
    Outputs(Vec<PreprocessorOutput>),
}

impl From<ImageEmbed> for ConditioningInput {
    fn from(embed: ImageEmbed) -> Self {
        if embed.bypass_average {
            Self::Averaged(embed)
        } else {
            Self::Outputs(vec![PreprocessorOutput::Embed(embed)])
        }
    }
}

impl From<PreprocessorOutput> for ConditioningInput {
    fn from(output: PreprocessorOutput) -> Self {
        Self::Outputs(vec![output])
    }
}

impl From<ClipVisionOutput> for ConditioningInput {
    fn from(output: ClipVisionOutput) -> Self {
        Self::Outputs(vec![output.into()])
    }
}

impl From<Vec<PreprocessorOutput>> for ConditioningInput {
    fn from(outputs: Vec<PreprocessorOutput>) -> Self {
        Self::Outputs(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn embed() -> ImageEmbed {
        let t = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        ImageEmbed::new(t.clone(), t)
    }

    #[test]
    fn test_embed_routes_on_bypass_flag() {
        let plain: ConditioningInput = embed().into();
        assert!(matches!(
            plain,
            ConditioningInput::Outputs(ref outputs)
                if matches!(outputs.as_slice(), [PreprocessorOutput::Embed(_)])
        ));

        let bypassing: ConditioningInput = embed().bypassing_average().into();
        assert!(matches!(bypassing, ConditioningInput::Averaged(e) if e.bypass_average));
    }
}
