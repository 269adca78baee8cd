//! Block addressing in the host U-Net
//!
//! Cross-attention blocks are addressed by a topology flag, a stage index
//! and a transformer-block index within the stage:
//!
//! ```text
//! input  4 1  ->  input_blocks.4.1.transformer_blocks.1.attn2
//! middle 0 3  ->  middle_block.1.transformer_blocks.3.attn2
//! output 9 0  ->  output_blocks.9.1.transformer_blocks.0.attn2
//! ```
//!
//! The middle stage list has a single element, the middle block itself.

use std::fmt;
use std::str::FromStr;

use hookweave_core::{Error, Node, Result, SharedAttention, resolve};
use serde::{Deserialize, Serialize};

/// Which stage list of the U-Net a block lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockFlag {
    Input,
    Middle,
    Output,
}

impl BlockFlag {
    /// Name of the host graph container for this stage list
    pub fn container(self) -> &'static str {
        match self {
            Self::Input => "input_blocks",
            Self::Middle => "middle_block",
            Self::Output => "output_blocks",
        }
    }

    /// Flag name as used in location tables
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Middle => "middle",
            Self::Output => "output",
        }
    }
}

impl FromStr for BlockFlag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "input" => Ok(Self::Input),
            "middle" => Ok(Self::Middle),
            "output" => Ok(Self::Output),
            other => Err(Error::UnknownBlockFlag(other.to_string())),
        }
    }
}

impl fmt::Display for BlockFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location of one cross-attention block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockLocation {
    /// Stage list
    pub flag: BlockFlag,
    /// Stage index within the list
    pub index: usize,
    /// Transformer block within the stage
    pub transformer: usize,
}

impl BlockLocation {
    /// Create a location
    pub const fn new(flag: BlockFlag, index: usize, transformer: usize) -> Self {
        Self {
            flag,
            index,
            transformer,
        }
    }

    /// Create a location from a textual flag
    pub fn parse(flag: &str, index: usize, transformer: usize) -> Result<Self> {
        Ok(Self::new(flag.parse()?, index, transformer))
    }

    /// Dotted path of the attention module in the host graph
    pub fn path(&self) -> Result<String> {
        let stage = match self.flag {
            BlockFlag::Middle if self.index != 0 => {
                return Err(Error::BlockNotFound(format!("middle {}", self.index)));
            }
            BlockFlag::Middle => self.flag.container().to_string(),
            _ => format!("{}.{}", self.flag.container(), self.index),
        };
        Ok(format!("{stage}.1.transformer_blocks.{}.attn2", self.transformer))
    }
}

impl fmt::Display for BlockLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.flag, self.index, self.transformer)
    }
}

/// Resolve `location` to the shared attention module in `root`
pub fn locate(root: &dyn Node, location: &BlockLocation) -> Result<SharedAttention> {
    let path = location.path()?;
    let node = resolve(root, &path).ok_or_else(|| Error::BlockNotFound(path.clone()))?;
    node.attention().ok_or(Error::NotAttention(path))
}
