//! Hooked attention forward

use candle_core::Tensor;
use hookweave_core::{AttentionForward, CrossAttention, Result};

/// Forward routine that adds every registered hook's contribution to the
/// attention output, in registration order, before the output projection.
///
/// With no hooks registered the result is identical to the stock routine.
#[derive(Debug, Default, Clone, Copy)]
pub struct HookedForward;

impl AttentionForward for HookedForward {
    fn forward(
        &self,
        attn: &CrossAttention,
        x: &Tensor,
        context: Option<&Tensor>,
    ) -> Result<Tensor> {
        let parts = attn.attend(x, context)?;
        let mut output = parts.output;
        for hook in attn.hooks() {
            output = hook.contribute(attn, x, &parts.query)?.apply(output)?;
        }
        attn.project_out(&output)
    }
}
