//! Pluggable IP-Adapter
//!
//! [`PlugableIpAdapter`] owns one adapter's conditioning model and installs
//! one [`IpAttentionHook`] per cross-attention block of the host U-Net.
//! Each hook attends the block's query over image tokens projected by that
//! block's key/value layers, and adds the result to the attention output.
//!
//! Key/value projections are computed once per hook session and cached
//! under their checkpoint key.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use hookweave_attention::HookRegistry;
use hookweave_core::{
    AttentionHook, Contribution, CrossAttention, HostModel, StepState,
    scaled_dot_product_attention,
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::embed::ImageEmbed;
use crate::error::{AdapterError, Result};
use crate::layout::hook_locations;
use crate::model::{IpAdapterModel, ToKv};
use crate::params::HookParams;
use crate::preprocess::{ConditioningInput, PreprocessorOutput};
use crate::variant::AdapterVariant;
use crate::weights::IpAdapterWeights;

/// Sampling progress assumed when the host has not published one
const DEFAULT_SAMPLING_PERCENT: f64 = 0.5;

/// Mutable state shared between an adapter and its hooks
#[derive(Debug)]
struct AdapterState {
    model: IpAdapterModel,
    params: HookParams,
    cache: HashMap<String, Tensor>,
    image_emb: Option<ImageEmbed>,
}

impl AdapterState {
    fn call_ip(&mut self, key: &str, feat: &Tensor, device: &Device) -> Result<Tensor> {
        if let Some(cached) = self.cache.get(key) {
            return Ok(cached.clone());
        }
        let projected = self.model.project_kv(key, feat)?.to_device(device)?;
        self.cache.insert(key.to_string(), projected.clone());
        Ok(projected)
    }

    fn get_image_emb(&self, output: &PreprocessorOutput) -> Result<ImageEmbed> {
        let variant = self.model.variant();
        let mismatch = |expected| AdapterError::UnexpectedPreprocessorOutput {
            expected,
            actual: output.kind(),
        };
        match output {
            PreprocessorOutput::Embed(embed) => Ok(embed.clone()),
            PreprocessorOutput::FaceEmbedding(embed) if variant.is_instantid => {
                self.model.get_image_embeds_instantid(embed)
            }
            _ if variant.is_instantid => Err(mismatch("face embedding")),
            PreprocessorOutput::FaceIdPlus { face_embed, clip }
                if variant.is_faceid && variant.is_plus =>
            {
                self.model
                    .get_image_embeds_faceid_plus(face_embed, clip, variant.is_v2)
            }
            _ if variant.is_faceid && variant.is_plus => Err(mismatch("faceid plus")),
            PreprocessorOutput::FaceEmbedding(embed) if variant.is_faceid => {
                self.model.get_image_embeds_faceid(embed)
            }
            _ if variant.is_faceid => Err(mismatch("face embedding")),
            PreprocessorOutput::ClipVision(clip) => self.model.get_image_embeds(clip),
            _ => Err(mismatch("clip vision")),
        }
    }
}

/// One IP-Adapter checkpoint, ready to hook into host models
#[derive(Debug, Clone)]
pub struct PlugableIpAdapter {
    variant: AdapterVariant,
    state: Arc<Mutex<AdapterState>>,
}

impl PlugableIpAdapter {
    /// Detect the variant of `weights` loaded from `model_name` and build its
    /// conditioning model on the CPU
    pub fn new(weights: IpAdapterWeights, model_name: &str) -> Result<Self> {
        let variant = AdapterVariant::detect(&weights, model_name)?;
        let model = IpAdapterModel::load(
            Arc::new(weights),
            variant.clone(),
            &Device::Cpu,
            DType::F32,
        )?;
        Ok(Self {
            variant,
            state: Arc::new(Mutex::new(AdapterState {
                model,
                params: HookParams::default(),
                cache: HashMap::new(),
                image_emb: None,
            })),
        })
    }

    /// Detected variant
    pub fn variant(&self) -> &AdapterVariant {
        &self.variant
    }

    /// Current hook parameters
    pub fn params(&self) -> HookParams {
        self.state.lock().params
    }

    /// Image embedding of the current hook session
    pub fn image_emb(&self) -> Option<ImageEmbed> {
        self.state.lock().image_emb.clone()
    }

    /// Number of cached key/value projections
    pub fn cached(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Drop every cached key/value projection
    pub fn reset(&self) {
        self.state.lock().cache.clear();
    }

    /// Embed one preprocessor output with the branch matching the variant
    pub fn get_image_emb(&self, output: &PreprocessorOutput) -> Result<ImageEmbed> {
        self.state.lock().get_image_emb(output)
    }

    /// Project `feat` with the key/value layer `key`, reusing the cached
    /// result within a hook session
    pub fn call_ip(&self, key: &str, feat: &Tensor, device: &Device) -> Result<Tensor> {
        self.state.lock().call_ip(key, feat, device)
    }

    /// Condition `model` on `input`: compute the image embedding and install
    /// a hook on every cross-attention block. Returns the number of hooks.
    pub fn hook(
        &self,
        registry: &mut HookRegistry,
        model: &HostModel,
        input: impl Into<ConditioningInput>,
        params: &HookParams,
        dtype: DType,
    ) -> Result<usize> {
        registry.set_current_model(model.state().clone());
        {
            let mut state = self.state.lock();
            state.params = *params;
            state.cache.clear();
            state.model = state.model.clone().to_device_dtype(&Device::Cpu, dtype)?;

            let image_emb = match input.into() {
                ConditioningInput::Averaged(embed) => embed,
                ConditioningInput::Outputs(outputs) => {
                    let embeds = outputs
                        .iter()
                        .map(|output| state.get_image_emb(output))
                        .collect::<Result<Vec<_>>>()?;
                    ImageEmbed::average_of(&embeds)?
                }
            };
            state.image_emb = Some(image_emb);
        }

        let locations = hook_locations(self.variant.sdxl);
        for (number, location) in locations.iter().enumerate() {
            let hook = IpAttentionHook {
                number,
                state: self.state.clone(),
                host: model.state().clone(),
            };
            registry.install(model.root(), location, Arc::new(hook))?;
        }

        info!(
            kind = self.variant.kind(),
            sdxl = self.variant.sdxl,
            hooks = locations.len(),
            weight = params.weight,
            "hooked ip-adapter"
        );
        Ok(locations.len())
    }
}

/// Contribution of one adapter to one attention block
pub struct IpAttentionHook {
    number: usize,
    state: Arc<Mutex<AdapterState>>,
    host: Arc<StepState>,
}

impl IpAttentionHook {
    /// Sequence number of the hooked block
    pub fn number(&self) -> usize {
        self.number
    }

    fn compute(&self, q: &Tensor) -> Result<Contribution> {
        let mut state = self.state.lock();
        let progress = self
            .host
            .sampling_percent()
            .unwrap_or(DEFAULT_SAMPLING_PERCENT);
        if !state.params.is_active(progress) {
            return Ok(Contribution::Zero);
        }

        let cond_mark = self
            .host
            .cond_mark()
            .ok_or(hookweave_core::Error::MissingStepState("cond_mark"))?;
        let image_emb = state
            .image_emb
            .as_ref()
            .ok_or(AdapterError::NotHooked)?
            .eval(&cond_mark)?;

        let device = q.device();
        let ip_k = state.call_ip(&ToKv::k_key(self.number), &image_emb, device)?;
        let ip_v = state.call_ip(&ToKv::v_key(self.number), &image_emb, device)?;

        let (batch, heads, seq_len, head_dim) = q.dims4()?;
        let to_heads = |t: Tensor| -> Result<Tensor> {
            let t = if t.dtype() != q.dtype() {
                t.to_dtype(q.dtype())?
            } else {
                t
            };
            Ok(t.reshape((batch, (), heads, head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let ip_k = to_heads(ip_k)?;
        let ip_v = to_heads(ip_v)?;

        let out = scaled_dot_product_attention(q, &ip_k, &ip_v)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, heads * head_dim))?;
        Ok(Contribution::Tensor((out * state.params.weight)?))
    }
}

impl AttentionHook for IpAttentionHook {
    fn contribute(
        &self,
        _attn: &CrossAttention,
        _x: &Tensor,
        q: &Tensor,
    ) -> hookweave_core::Result<Contribution> {
        self.compute(q).map_err(|err| {
            debug!(number = self.number, %err, "ip-adapter hook failed");
            err.into()
        })
    }
}

impl std::fmt::Debug for IpAttentionHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpAttentionHook")
            .field("number", &self.number)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::preprocess::ClipVisionOutput;
    use hookweave_attention::{BlockFlag, BlockLocation, UNetLayout, locate};
    use hookweave_core::cond_mark_from_flags;

    fn sd15_adapter() -> PlugableIpAdapter {
        PlugableIpAdapter::new(fixtures::base_weights(16, 8, 4, 16), "ip-adapter_sd15").unwrap()
    }

    fn clip() -> ClipVisionOutput {
        ClipVisionOutput::new(fixtures::randn(&[1, 8]), fixtures::randn(&[1, 5, 6]))
    }

    fn run_block(model: &HostModel, x: &Tensor, ctx: &Tensor) -> Vec<Vec<Vec<f32>>> {
        let location = BlockLocation::new(BlockFlag::Input, 4, 0);
        let attention = locate(model.root(), &location).unwrap();
        let out = attention.read().forward(x, Some(ctx)).unwrap();
        out.to_vec3::<f32>().unwrap()
    }

    #[test]
    fn test_call_ip_caches_per_session() {
        let adapter = sd15_adapter();
        let feat = fixtures::randn(&[1, 4, 16]);
        let key = ToKv::k_key(0);

        let first = adapter.call_ip(&key, &feat, &Device::Cpu).unwrap();
        let second = adapter.call_ip(&key, &feat, &Device::Cpu).unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(adapter.cached(), 1);

        adapter.reset();
        adapter.reset();
        assert_eq!(adapter.cached(), 0);
        let third = adapter.call_ip(&key, &feat, &Device::Cpu).unwrap();
        assert_ne!(first.id(), third.id());
    }

    #[test]
    fn test_hook_clears_cache() {
        let adapter = sd15_adapter();
        let model = fixtures::host_model(&UNetLayout::sd15());
        let mut registry = HookRegistry::new();
        let feat = fixtures::randn(&[1, 4, 16]);

        let before = adapter.call_ip(&ToKv::v_key(3), &feat, &Device::Cpu).unwrap();
        adapter
            .hook(&mut registry, &model, clip(), &HookParams::default(), DType::F32)
            .unwrap();
        assert_eq!(adapter.cached(), 0);

        let after = adapter.call_ip(&ToKv::v_key(3), &feat, &Device::Cpu).unwrap();
        assert_ne!(before.id(), after.id());
    }

    #[test]
    fn test_hook_installs_sd15_blocks() {
        let adapter = sd15_adapter();
        let model = fixtures::host_model(&UNetLayout::sd15());
        let mut registry = HookRegistry::new();

        let hooks = adapter
            .hook(&mut registry, &model, clip(), &HookParams::default(), DType::F32)
            .unwrap();
        assert_eq!(hooks, 16);
        assert_eq!(registry.len(), 16);
        assert!(Arc::ptr_eq(registry.current_model().unwrap(), model.state()));
        assert!(adapter.image_emb().is_some());

        assert_eq!(registry.clear_all_ip_adapter(), 16);
        assert!(registry.current_model().is_none());
    }

    #[test]
    fn test_hook_installs_sdxl_blocks() {
        let weights = fixtures::base_weights(2048, 8, 1, 70);
        let adapter = PlugableIpAdapter::new(weights, "ip-adapter_sdxl").unwrap();
        assert!(adapter.variant().sdxl);

        let model = fixtures::host_model(&UNetLayout::sdxl());
        let mut registry = HookRegistry::new();
        let hooks = adapter
            .hook(&mut registry, &model, clip(), &HookParams::default(), DType::F32)
            .unwrap();
        assert_eq!(hooks, 70);
        assert_eq!(registry.len(), 70);
        // Two projections per hook, numbered 1, 3, .., 139
        assert_eq!(adapter.state.lock().model.to_kvs().len(), 140);
        assert_eq!(ToKv::k_key(hooks - 1), "139_to_k_ip");
    }

    #[test]
    fn test_forward_changes_and_restores() {
        let adapter = sd15_adapter();
        let model = fixtures::host_model(&UNetLayout::sd15());
        let mut registry = HookRegistry::new();
        let x = fixtures::randn(&[2, 3, fixtures::INNER]);
        let ctx = fixtures::randn(&[2, 2, 4]);
        let baseline = run_block(&model, &x, &ctx);

        adapter
            .hook(&mut registry, &model, clip(), &HookParams::default(), DType::F32)
            .unwrap();
        let mark = cond_mark_from_flags(&[true, false], &Device::Cpu).unwrap();
        model.state().begin_step(0.5, mark);

        let hooked = run_block(&model, &x, &ctx);
        assert_ne!(baseline, hooked);
        assert_eq!(adapter.cached(), 2);

        registry.clear_all();
        assert_eq!(baseline, run_block(&model, &x, &ctx));
    }

    #[test]
    fn test_window_gates_contribution() {
        let adapter = sd15_adapter();
        let model = fixtures::host_model(&UNetLayout::sd15());
        let mut registry = HookRegistry::new();
        let x = fixtures::randn(&[1, 3, fixtures::INNER]);
        let ctx = fixtures::randn(&[1, 2, 4]);
        let baseline = run_block(&model, &x, &ctx);

        let params = HookParams::with_weight(0.8).window(0.2, 0.8);
        adapter
            .hook(&mut registry, &model, clip(), &params, DType::F32)
            .unwrap();
        let mark = cond_mark_from_flags(&[true], &Device::Cpu).unwrap();

        model.state().begin_step(0.1, mark.clone());
        assert_eq!(baseline, run_block(&model, &x, &ctx));

        model.state().begin_step(0.5, mark.clone());
        assert_ne!(baseline, run_block(&model, &x, &ctx));

        model.state().begin_step(0.9, mark);
        assert_eq!(baseline, run_block(&model, &x, &ctx));
    }

    #[test]
    fn test_missing_cond_mark() {
        let adapter = sd15_adapter();
        let model = fixtures::host_model(&UNetLayout::sd15());
        let mut registry = HookRegistry::new();
        adapter
            .hook(&mut registry, &model, clip(), &HookParams::default(), DType::F32)
            .unwrap();

        let location = BlockLocation::new(BlockFlag::Middle, 0, 0);
        let attention = locate(model.root(), &location).unwrap();
        let x = fixtures::randn(&[1, 3, fixtures::INNER]);
        let ctx = fixtures::randn(&[1, 2, 4]);
        let err = attention.read().forward(&x, Some(&ctx)).unwrap_err();
        assert!(matches!(err, hookweave_core::Error::MissingStepState("cond_mark")));
    }

    #[test]
    fn test_averaged_input_used_directly() {
        let adapter = sd15_adapter();
        let model = fixtures::host_model(&UNetLayout::sd15());
        let mut registry = HookRegistry::new();
        let embed = adapter
            .get_image_emb(&clip().into())
            .unwrap()
            .bypassing_average();

        adapter
            .hook(&mut registry, &model, embed.clone(), &HookParams::default(), DType::F32)
            .unwrap();
        let stored = adapter.image_emb().unwrap();
        assert_eq!(stored.cond.id(), embed.cond.id());
    }

    #[test]
    fn test_unflagged_embed_is_averaged() {
        let adapter = sd15_adapter();
        let model = fixtures::host_model(&UNetLayout::sd15());
        let mut registry = HookRegistry::new();
        let embed = adapter.get_image_emb(&clip().into()).unwrap();
        let outputs = vec![PreprocessorOutput::Embed(embed.clone()), clip().into()];

        adapter
            .hook(&mut registry, &model, outputs, &HookParams::default(), DType::F32)
            .unwrap();
        let stored = adapter.image_emb().unwrap();
        assert_ne!(stored.cond.id(), embed.cond.id());
        assert_eq!(stored.cond.dims(), embed.cond.dims());
    }

    #[test]
    fn test_multiple_outputs_are_averaged() {
        let adapter = sd15_adapter();
        let model = fixtures::host_model(&UNetLayout::sd15());
        let mut registry = HookRegistry::new();
        let outputs: Vec<PreprocessorOutput> = vec![clip().into(), clip().into()];

        adapter
            .hook(&mut registry, &model, outputs, &HookParams::default(), DType::F32)
            .unwrap();
        assert_eq!(adapter.image_emb().unwrap().cond.dims(), &[1, 4, 16]);
    }

    #[test]
    fn test_empty_conditioning() {
        let adapter = sd15_adapter();
        let model = fixtures::host_model(&UNetLayout::sd15());
        let mut registry = HookRegistry::new();

        let err = adapter
            .hook(
                &mut registry,
                &model,
                ConditioningInput::Outputs(Vec::new()),
                &HookParams::default(),
                DType::F32,
            )
            .unwrap_err();
        assert!(matches!(err, AdapterError::EmptyConditioning));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_mismatched_preprocessor_output() {
        let adapter = sd15_adapter();
        let err = adapter
            .get_image_emb(&PreprocessorOutput::FaceEmbedding(fixtures::randn(&[1, 32])))
            .unwrap_err();
        assert!(matches!(
            err,
            AdapterError::UnexpectedPreprocessorOutput {
                expected: "clip vision",
                actual: "face embedding",
            }
        ));
    }

    #[test]
    fn test_faceid_dispatch() {
        let weights = fixtures::faceid_weights(16, 32, 4);
        let adapter = PlugableIpAdapter::new(weights, "ip-adapter-faceid_sd15").unwrap();

        let embed = adapter
            .get_image_emb(&PreprocessorOutput::FaceEmbedding(fixtures::randn(&[1, 32])))
            .unwrap();
        assert_eq!(embed.cond.dims(), &[1, 4, 16]);
        assert!(adapter.get_image_emb(&clip().into()).is_err());
    }

    #[test]
    fn test_half_precision_hook() {
        let adapter = sd15_adapter();
        let model = fixtures::host_model(&UNetLayout::sd15());
        let mut registry = HookRegistry::new();
        adapter
            .hook(&mut registry, &model, clip(), &HookParams::default(), DType::F16)
            .unwrap();
        assert_eq!(adapter.image_emb().unwrap().cond.dtype(), DType::F16);

        // F16 key/values are cast to the F32 query
        let mark = cond_mark_from_flags(&[true], &Device::Cpu).unwrap();
        model.state().begin_step(0.5, mark);
        let x = fixtures::randn(&[1, 3, fixtures::INNER]);
        let ctx = fixtures::randn(&[1, 2, 4]);
        assert_eq!(run_block(&model, &x, &ctx).len(), 1);
    }
}
