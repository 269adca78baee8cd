//! U-Net cross-attention layout
//!
//! Describes where the cross-attention blocks of an LDM-style U-Net sit and
//! how wide they are, and assembles the matching host graph skeleton so the
//! blocks resolve by [`BlockLocation`].

use candle_nn::VarBuilder;
use hookweave_core::{AttentionNode, CrossAttention, ModuleDict, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::locate::{BlockFlag, BlockLocation};

/// How the head count of a block is derived from its channel width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadConfig {
    /// Same number of heads everywhere
    Fixed(usize),
    /// Fixed head width, head count scales with channels
    HeadDim(usize),
}

impl HeadConfig {
    /// `(heads, head_dim)` for a block with `channels` channels
    pub fn split(self, channels: usize) -> (usize, usize) {
        match self {
            Self::Fixed(heads) => (heads, channels / heads),
            Self::HeadDim(head_dim) => (channels / head_dim, head_dim),
        }
    }
}

/// One U-Net stage that carries a spatial transformer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLayout {
    /// Stage list
    pub flag: BlockFlag,
    /// Stage index within the list
    pub index: usize,
    /// Transformer blocks in the stage
    pub depth: usize,
    /// Channel width
    pub channels: usize,
}

impl StageLayout {
    const fn new(flag: BlockFlag, index: usize, depth: usize, channels: usize) -> Self {
        Self {
            flag,
            index,
            depth,
            channels,
        }
    }
}

/// Cross-attention layout of a U-Net
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UNetLayout {
    /// Text-encoder hidden size fed to cross-attention
    pub context_dim: usize,
    /// Head split
    pub heads: HeadConfig,
    /// Length of the `input_blocks` list
    pub input_blocks: usize,
    /// Length of the `output_blocks` list
    pub output_blocks: usize,
    /// Stages with transformers, input first, then output, then middle
    pub stages: Vec<StageLayout>,
}

impl UNetLayout {
    /// Stable Diffusion 1.x
    pub fn sd15() -> Self {
        use BlockFlag::*;
        Self {
            context_dim: 768,
            heads: HeadConfig::Fixed(8),
            input_blocks: 12,
            output_blocks: 12,
            stages: vec![
                StageLayout::new(Input, 1, 1, 320),
                StageLayout::new(Input, 2, 1, 320),
                StageLayout::new(Input, 4, 1, 640),
                StageLayout::new(Input, 5, 1, 640),
                StageLayout::new(Input, 7, 1, 1280),
                StageLayout::new(Input, 8, 1, 1280),
                StageLayout::new(Output, 3, 1, 1280),
                StageLayout::new(Output, 4, 1, 1280),
                StageLayout::new(Output, 5, 1, 1280),
                StageLayout::new(Output, 6, 1, 640),
                StageLayout::new(Output, 7, 1, 640),
                StageLayout::new(Output, 8, 1, 640),
                StageLayout::new(Output, 9, 1, 320),
                StageLayout::new(Output, 10, 1, 320),
                StageLayout::new(Output, 11, 1, 320),
                StageLayout::new(Middle, 0, 1, 1280),
            ],
        }
    }

    /// Stable Diffusion XL base
    pub fn sdxl() -> Self {
        use BlockFlag::*;
        Self {
            context_dim: 2048,
            heads: HeadConfig::HeadDim(64),
            input_blocks: 9,
            output_blocks: 9,
            stages: vec![
                StageLayout::new(Input, 4, 2, 640),
                StageLayout::new(Input, 5, 2, 640),
                StageLayout::new(Input, 7, 10, 1280),
                StageLayout::new(Input, 8, 10, 1280),
                StageLayout::new(Output, 0, 10, 1280),
                StageLayout::new(Output, 1, 10, 1280),
                StageLayout::new(Output, 2, 10, 1280),
                StageLayout::new(Output, 3, 2, 640),
                StageLayout::new(Output, 4, 2, 640),
                StageLayout::new(Output, 5, 2, 640),
                StageLayout::new(Middle, 0, 10, 1280),
            ],
        }
    }

    /// Every cross-attention location, in stage order
    pub fn attention_locations(&self) -> Vec<BlockLocation> {
        self.stages
            .iter()
            .flat_map(|stage| {
                (0..stage.depth).map(move |t| BlockLocation::new(stage.flag, stage.index, t))
            })
            .collect()
    }

    /// Assemble the host graph skeleton, creating each attention module with
    /// `make_attn`. Stages without a transformer are empty placeholders.
    pub fn build(
        &self,
        mut make_attn: impl FnMut(&StageLayout, &BlockLocation) -> Result<CrossAttention>,
    ) -> Result<ModuleDict> {
        let mut input = placeholders(self.input_blocks);
        let mut output = placeholders(self.output_blocks);
        let mut middle = None;

        for stage in &self.stages {
            let mut transformers = ModuleDict::new();
            for t in 0..stage.depth {
                let location = BlockLocation::new(stage.flag, stage.index, t);
                let attn = make_attn(stage, &location)?.shared();
                transformers.push(ModuleDict::new().with_child("attn2", AttentionNode::new(attn)));
            }
            let spatial = ModuleDict::new().with_child("transformer_blocks", transformers);
            let block = ModuleDict::new()
                .with_child("0", ModuleDict::new())
                .with_child("1", spatial);
            match stage.flag {
                BlockFlag::Input => input.insert(stage.index.to_string(), block),
                BlockFlag::Output => output.insert(stage.index.to_string(), block),
                BlockFlag::Middle => middle = Some(block),
            }
        }

        debug!(
            stages = self.stages.len(),
            blocks = self.attention_locations().len(),
            "built attention skeleton"
        );
        Ok(ModuleDict::new()
            .with_child("input_blocks", input)
            .with_child("middle_block", middle.unwrap_or_default())
            .with_child("output_blocks", output))
    }

    /// Assemble the skeleton with weights from `vb`, using LDM parameter names
    pub fn build_with(&self, vb: VarBuilder) -> Result<ModuleDict> {
        self.build(|stage, location| {
            let (heads, head_dim) = self.heads.split(stage.channels);
            let path = location.path()?;
            CrossAttention::new(stage.channels, Some(self.context_dim), heads, head_dim, vb.pp(path))
        })
    }
}

fn placeholders(len: usize) -> ModuleDict {
    ModuleDict::list((0..len).map(|_| ModuleDict::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locate::locate;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use hookweave_core::{resolve, state_dict};

    fn tiny(layout: &UNetLayout) -> ModuleDict {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        layout
            .build(|_, location| {
                CrossAttention::new(8, Some(4), 2, 4, vb.pp(location.path()?))
            })
            .unwrap()
    }

    #[test]
    fn test_location_counts() {
        assert_eq!(UNetLayout::sd15().attention_locations().len(), 16);
        assert_eq!(UNetLayout::sdxl().attention_locations().len(), 70);
    }

    #[test]
    fn test_head_split() {
        assert_eq!(HeadConfig::Fixed(8).split(640), (8, 80));
        assert_eq!(HeadConfig::HeadDim(64).split(1280), (20, 64));
    }

    #[test]
    fn test_skeleton_resolves_every_location() {
        let layout = UNetLayout::sdxl();
        let root = tiny(&layout);

        for location in layout.attention_locations() {
            assert!(locate(&root, &location).is_ok(), "{location}");
        }
        assert!(resolve(&root, "input_blocks.0").is_some());
        assert!(locate(&root, &BlockLocation::new(BlockFlag::Input, 1, 0)).is_err());
    }

    #[test]
    fn test_skeleton_state_dict_keys() {
        let root = tiny(&UNetLayout::sd15());
        let keys: Vec<String> = state_dict(&root).into_iter().map(|(k, _)| k).collect();

        assert!(keys.contains(&"input_blocks.1.1.transformer_blocks.0.attn2.to_k.weight".to_string()));
        assert!(keys.contains(&"middle_block.1.transformer_blocks.0.attn2.to_out.0.bias".to_string()));
        assert_eq!(keys.len(), 16 * 5);
    }

    #[test]
    fn test_build_with_uses_real_widths() {
        let layout = UNetLayout {
            context_dim: 16,
            heads: HeadConfig::HeadDim(4),
            input_blocks: 2,
            output_blocks: 0,
            stages: vec![StageLayout::new(BlockFlag::Input, 1, 1, 8)],
        };
        let varmap = VarMap::new();
        let root = layout
            .build_with(VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu))
            .unwrap();

        let attn = locate(&root, &BlockLocation::new(BlockFlag::Input, 1, 0)).unwrap();
        assert_eq!(attn.read().heads(), 2);
    }
}
