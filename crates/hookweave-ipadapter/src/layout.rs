//! Attention blocks an adapter hooks, in key/value numbering order
//!
//! Hook `n` reads the projections `{2n+1}_to_k_ip` / `{2n+1}_to_v_ip`, so the
//! order here must match the order the checkpoint was trained with: input
//! stages, then output stages, then the middle block.

use hookweave_attention::{BlockFlag, BlockLocation};

/// SD 1.x input stages with cross-attention
const SD15_INPUT: [usize; 6] = [1, 2, 4, 5, 7, 8];
/// SD 1.x output stages with cross-attention
const SD15_OUTPUT: [usize; 9] = [3, 4, 5, 6, 7, 8, 9, 10, 11];

/// SDXL input stages and their transformer depth
const SDXL_INPUT: [(usize, usize); 4] = [(4, 2), (5, 2), (7, 10), (8, 10)];
/// SDXL output stages and their transformer depth
const SDXL_OUTPUT: [(usize, usize); 6] = [(0, 10), (1, 10), (2, 10), (3, 2), (4, 2), (5, 2)];
/// SDXL middle block transformer depth
const SDXL_MIDDLE_DEPTH: usize = 10;

/// Locations hooked on an SD 1.x U-Net
pub fn sd15_locations() -> Vec<BlockLocation> {
    SD15_INPUT
        .iter()
        .map(|&i| BlockLocation::new(BlockFlag::Input, i, 0))
        .chain(
            SD15_OUTPUT
                .iter()
                .map(|&i| BlockLocation::new(BlockFlag::Output, i, 0)),
        )
        .chain(std::iter::once(BlockLocation::new(BlockFlag::Middle, 0, 0)))
        .collect()
}

/// Locations hooked on an SDXL U-Net
pub fn sdxl_locations() -> Vec<BlockLocation> {
    let staged = |flag: BlockFlag, stages: &'static [(usize, usize)]| {
        stages.iter().flat_map(move |&(index, depth)| {
            (0..depth).map(move |t| BlockLocation::new(flag, index, t))
        })
    };
    staged(BlockFlag::Input, &SDXL_INPUT)
        .chain(staged(BlockFlag::Output, &SDXL_OUTPUT))
        .chain((0..SDXL_MIDDLE_DEPTH).map(|t| BlockLocation::new(BlockFlag::Middle, 0, t)))
        .collect()
}

/// Locations for the U-Net family of an adapter
pub fn hook_locations(sdxl: bool) -> Vec<BlockLocation> {
    if sdxl { sdxl_locations() } else { sd15_locations() }
}
