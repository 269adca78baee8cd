//! Synthetic checkpoints and host graphs for tests

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use hookweave_attention::UNetLayout;
use hookweave_core::{CrossAttention, HostModel};

use crate::weights::IpAdapterWeights;

/// Inner width of the tiny host attention blocks
pub const INNER: usize = 8;
/// Heads of the tiny host attention blocks
pub const HEADS: usize = 2;
/// Perceiver layers in resampler checkpoints
pub const DEPTH: usize = 2;
/// Latent queries in resampler checkpoints
pub const QUERIES: usize = 4;

pub fn randn(shape: &[usize]) -> Tensor {
    Tensor::randn(0f32, 1f32, shape, &Device::Cpu).unwrap()
}

fn ones(len: usize) -> Tensor {
    Tensor::ones(len, DType::F32, &Device::Cpu).unwrap()
}

fn zeros(len: usize) -> Tensor {
    Tensor::zeros(len, DType::F32, &Device::Cpu).unwrap()
}

fn insert(map: &mut HashMap<String, Tensor>, key: impl Into<String>, tensor: Tensor) {
    map.insert(key.into(), tensor);
}

fn linear(map: &mut HashMap<String, Tensor>, prefix: &str, out: usize, input: usize, bias: bool) {
    // Scaled down to keep stacked layers bounded
    insert(map, format!("{prefix}.weight"), (randn(&[out, input]) * 0.1).unwrap());
    if bias {
        insert(map, format!("{prefix}.bias"), zeros(out));
    }
}

fn layer_norm(map: &mut HashMap<String, Tensor>, prefix: &str, dim: usize) {
    insert(map, format!("{prefix}.weight"), ones(dim));
    insert(map, format!("{prefix}.bias"), zeros(dim));
}

/// Key/value projections for `blocks` attention blocks reading `cross`-wide tokens
pub fn kv_weights(weights: &mut IpAdapterWeights, cross: usize, blocks: usize) {
    for n in 0..blocks {
        let id = n * 2 + 1;
        linear(&mut weights.ip_adapter, &format!("{id}.to_k_ip"), INNER, cross, false);
        linear(&mut weights.ip_adapter, &format!("{id}.to_v_ip"), INNER, cross, false);
    }
}

fn perceiver_layers(map: &mut HashMap<String, Tensor>, prefix: &str, dim: usize) {
    let inner = (dim / 64) * 64;
    for i in 0..DEPTH {
        let attn = format!("{prefix}layers.{i}.0");
        layer_norm(map, &format!("{attn}.norm1"), dim);
        layer_norm(map, &format!("{attn}.norm2"), dim);
        linear(map, &format!("{attn}.to_q"), inner, dim, false);
        linear(map, &format!("{attn}.to_kv"), inner * 2, dim, false);
        linear(map, &format!("{attn}.to_out"), dim, inner, false);

        let ff = format!("{prefix}layers.{i}.1");
        layer_norm(map, &format!("{ff}.0"), dim);
        linear(map, &format!("{ff}.1"), dim * 4, dim, false);
        linear(map, &format!("{ff}.3"), dim, dim * 4, false);
    }
}

fn perceiver_io(map: &mut HashMap<String, Tensor>, prefix: &str, dim: usize, input: usize, output: usize) {
    linear(map, &format!("{prefix}proj_in"), dim, input, true);
    linear(map, &format!("{prefix}proj_out"), output, dim, true);
    layer_norm(map, &format!("{prefix}norm_out"), output);
    perceiver_layers(map, prefix, dim);
}

/// Base checkpoint: `proj` `[tokens * cross, clip]` and `norm`
pub fn base_weights(cross: usize, clip: usize, tokens: usize, blocks: usize) -> IpAdapterWeights {
    let mut weights = IpAdapterWeights::default();
    linear(&mut weights.image_proj, "proj", tokens * cross, clip, true);
    layer_norm(&mut weights.image_proj, "norm", cross);
    kv_weights(&mut weights, cross, blocks);
    weights
}

/// Resampler checkpoint with `dim`-wide latents (a multiple of 64)
pub fn resampler_weights(dim: usize, embedding: usize, output: usize) -> IpAdapterWeights {
    let mut weights = IpAdapterWeights::default();
    insert(&mut weights.image_proj, "latents", randn(&[1, QUERIES, dim]));
    perceiver_io(&mut weights.image_proj, "", dim, embedding, output);
    kv_weights(&mut weights, output, 1);
    weights
}

/// Full (MLP) checkpoint
pub fn mlp_weights(clip: usize, cross: usize) -> IpAdapterWeights {
    let mut weights = IpAdapterWeights::default();
    linear(&mut weights.image_proj, "proj.0", clip, clip, true);
    linear(&mut weights.image_proj, "proj.2", cross, clip, true);
    layer_norm(&mut weights.image_proj, "proj.3", cross);
    kv_weights(&mut weights, cross, 1);
    weights
}

fn face_mlp(map: &mut HashMap<String, Tensor>, cross: usize, id_dim: usize, tokens: usize) {
    linear(map, "proj.0", id_dim * 2, id_dim, true);
    linear(map, "proj.2", cross * tokens, id_dim * 2, true);
    layer_norm(map, "norm", cross);
}

/// Faceid checkpoint emitting `tokens` tokens
pub fn faceid_weights(cross: usize, id_dim: usize, tokens: usize) -> IpAdapterWeights {
    let mut weights = IpAdapterWeights::default();
    face_mlp(&mut weights.image_proj, cross, id_dim, tokens);
    kv_weights(&mut weights, cross, 1);
    weights
}

/// Faceid-plus checkpoint; `cross` must be a multiple of 64
pub fn faceid_plus_weights(cross: usize, id_dim: usize, clip: usize) -> IpAdapterWeights {
    let mut weights = IpAdapterWeights::default();
    face_mlp(&mut weights.image_proj, cross, id_dim, 4);
    perceiver_io(&mut weights.image_proj, "perceiver_resampler.", cross, clip, cross);
    kv_weights(&mut weights, cross, 1);
    weights
}

/// Host model with tiny attention blocks at every location of `layout`
pub fn host_model(layout: &UNetLayout) -> HostModel {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let root = layout
        .build(|_, location| {
            CrossAttention::new(INNER, Some(4), HEADS, INNER / HEADS, vb.pp(location.path()?))
        })
        .unwrap();
    HostModel::new(root)
}
