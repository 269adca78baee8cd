//! Host cross-attention module
//!
//! The attention module used inside the host U-Net's transformer blocks.
//! Its forward routine lives in a replaceable slot, and it carries an
//! ordered list of contribution hooks. The stock routine ignores the hooks;
//! a hooked routine adds each hook's contribution to the attention output
//! before the output projection. Swapping the slot is how hook managers
//! patch a block without touching the attention math.

use std::sync::Arc;

use candle_core::{D, DType, Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use parking_lot::RwLock;

use crate::error::Result;
use crate::graph::Node;

/// Shared, identity-carrying handle to an attention module in the host graph
pub type SharedAttention = Arc<RwLock<CrossAttention>>;

/// A forward routine installed in an attention module's slot
pub trait AttentionForward: Send + Sync {
    /// Run attention for `x`. `context` defaults to `x` (self-attention).
    fn forward(&self, attn: &CrossAttention, x: &Tensor, context: Option<&Tensor>)
    -> Result<Tensor>;
}

/// The stock forward routine: attention followed by the output projection
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardForward;

impl AttentionForward for StandardForward {
    fn forward(
        &self,
        attn: &CrossAttention,
        x: &Tensor,
        context: Option<&Tensor>,
    ) -> Result<Tensor> {
        let parts = attn.attend(x, context)?;
        attn.project_out(&parts.output)
    }
}

/// What a hook adds to the attention output for one call
#[derive(Debug, Clone)]
pub enum Contribution {
    /// Nothing this call
    Zero,
    /// A tensor shaped like the flat attention output
    Tensor(Tensor),
}

impl Contribution {
    /// Check if this contribution adds nothing
    pub fn is_zero(&self) -> bool {
        matches!(self, Self::Zero)
    }

    /// Add this contribution to `output`
    pub fn apply(self, output: Tensor) -> Result<Tensor> {
        match self {
            Self::Zero => Ok(output),
            Self::Tensor(t) => Ok(output.add(&t)?),
        }
    }
}

/// A per-block contribution callback
pub trait AttentionHook: Send + Sync {
    /// Compute the contribution for input `x` given the multi-head query `q`
    /// (`[batch, heads, seq, head_dim]`).
    fn contribute(&self, attn: &CrossAttention, x: &Tensor, q: &Tensor) -> Result<Contribution>;
}

/// Intermediate results of an attention pass
#[derive(Debug, Clone)]
pub struct AttentionParts {
    /// Attention output before the output projection, `[batch, seq, inner]`
    pub output: Tensor,
    /// Multi-head query, `[batch, heads, seq, head_dim]`
    pub query: Tensor,
}

/// Multi-head cross-attention with a replaceable forward slot
pub struct CrossAttention {
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    heads: usize,
    forward: Arc<dyn AttentionForward>,
    hooks: Vec<Arc<dyn AttentionHook>>,
}

impl CrossAttention {
    /// Load an attention module using LDM parameter names
    /// (`to_q`, `to_k`, `to_v`, `to_out.0`).
    pub fn new(
        query_dim: usize,
        context_dim: Option<usize>,
        heads: usize,
        dim_head: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let inner_dim = heads * dim_head;
        let context_dim = context_dim.unwrap_or(query_dim);
        let to_q = candle_nn::linear_no_bias(query_dim, inner_dim, vb.pp("to_q"))?;
        let to_k = candle_nn::linear_no_bias(context_dim, inner_dim, vb.pp("to_k"))?;
        let to_v = candle_nn::linear_no_bias(context_dim, inner_dim, vb.pp("to_v"))?;
        let to_out = candle_nn::linear(inner_dim, query_dim, vb.pp("to_out.0"))?;
        Ok(Self::from_linears(to_q, to_k, to_v, to_out, heads))
    }

    /// Assemble an attention module from existing projections
    pub fn from_linears(
        to_q: Linear,
        to_k: Linear,
        to_v: Linear,
        to_out: Linear,
        heads: usize,
    ) -> Self {
        Self {
            to_q,
            to_k,
            to_v,
            to_out,
            heads,
            forward: Arc::new(StandardForward),
            hooks: Vec::new(),
        }
    }

    /// Wrap into a shared handle for insertion into a host graph
    pub fn shared(self) -> SharedAttention {
        Arc::new(RwLock::new(self))
    }

    /// Number of attention heads
    pub fn heads(&self) -> usize {
        self.heads
    }

    /// Run the installed forward routine
    pub fn forward(&self, x: &Tensor, context: Option<&Tensor>) -> Result<Tensor> {
        self.forward.forward(self, x, context)
    }

    /// Compute attention for `x` against `context` (or `x`), stopping before
    /// the output projection.
    pub fn attend(&self, x: &Tensor, context: Option<&Tensor>) -> Result<AttentionParts> {
        let (batch, seq_len, _) = x.dims3()?;
        let context = context.unwrap_or(x);

        let q = self.to_q.forward(x)?;
        let k = self.to_k.forward(context)?;
        let v = self.to_v.forward(context)?;

        let inner_dim = q.dim(D::Minus1)?;
        let q = self.split_heads(&q)?;
        let k = self.split_heads(&k)?;
        let v = self.split_heads(&v)?;

        let output = scaled_dot_product_attention(&q, &k, &v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, inner_dim))?;

        Ok(AttentionParts { output, query: q })
    }

    /// Apply the output projection
    pub fn project_out(&self, output: &Tensor) -> Result<Tensor> {
        Ok(self.to_out.forward(output)?)
    }

    /// `[batch, len, heads * head_dim]` -> `[batch, heads, len, head_dim]`
    pub fn split_heads(&self, t: &Tensor) -> Result<Tensor> {
        let (batch, len, inner_dim) = t.dims3()?;
        let head_dim = inner_dim / self.heads;
        Ok(t.reshape((batch, len, self.heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Currently installed forward routine
    pub fn forward_fn(&self) -> &Arc<dyn AttentionForward> {
        &self.forward
    }

    /// Install a forward routine, returning the previous one
    pub fn replace_forward(&mut self, forward: Arc<dyn AttentionForward>) -> Arc<dyn AttentionForward> {
        std::mem::replace(&mut self.forward, forward)
    }

    /// Registered hooks, in registration order
    pub fn hooks(&self) -> &[Arc<dyn AttentionHook>] {
        &self.hooks
    }

    /// Append a hook
    pub fn push_hook(&mut self, hook: Arc<dyn AttentionHook>) {
        self.hooks.push(hook);
    }

    /// Drop every hook
    pub fn clear_hooks(&mut self) {
        self.hooks.clear();
    }

    /// Keep only the hooks for which `keep` returns true
    pub fn retain_hooks(&mut self, keep: impl FnMut(&Arc<dyn AttentionHook>) -> bool) {
        self.hooks.retain(keep);
    }
}

impl std::fmt::Debug for CrossAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossAttention")
            .field("heads", &self.heads)
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

/// Scaled dot-product attention over `[batch, heads, seq, head_dim]` inputs.
///
/// Half-precision inputs are upcast to F32 for the softmax and cast back.
pub fn scaled_dot_product_attention(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
    let head_dim = q.dim(D::Minus1)?;
    let scale = 1.0 / (head_dim as f64).sqrt();
    let dtype = q.dtype();
    let work_dtype = match dtype {
        DType::F16 | DType::BF16 => DType::F32,
        other => other,
    };

    let q = q.to_dtype(work_dtype)?.contiguous()?;
    let k = k.to_dtype(work_dtype)?.contiguous()?;
    let v = v.to_dtype(work_dtype)?.contiguous()?;

    let logits = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
    let probs = candle_nn::ops::softmax_last_dim(&logits)?;
    Ok(probs.matmul(&v)?.to_dtype(dtype)?)
}

/// Graph node exposing a shared attention module
#[derive(Debug, Clone)]
pub struct AttentionNode(SharedAttention);

impl AttentionNode {
    /// Wrap a shared attention handle
    pub fn new(attention: SharedAttention) -> Self {
        Self(attention)
    }
}

impl Node for AttentionNode {
    fn children(&self) -> Vec<(&str, &dyn Node)> {
        Vec::new()
    }

    fn children_mut(&mut self) -> Vec<&mut dyn Node> {
        Vec::new()
    }

    fn child_mut(&mut self, _name: &str) -> Option<&mut dyn Node> {
        None
    }

    fn tensors(&self) -> Vec<(&str, Tensor)> {
        let attn = self.0.read();
        let mut tensors = vec![
            ("to_q.weight", attn.to_q.weight().clone()),
            ("to_k.weight", attn.to_k.weight().clone()),
            ("to_v.weight", attn.to_v.weight().clone()),
            ("to_out.0.weight", attn.to_out.weight().clone()),
        ];
        if let Some(bias) = attn.to_out.bias() {
            tensors.push(("to_out.0.bias", bias.clone()));
        }
        tensors
    }

    fn attention(&self) -> Option<SharedAttention> {
        Some(self.0.clone())
    }
}
