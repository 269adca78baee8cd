//! Host network and per-step state
//!
//! The host publishes its sampling progress and the conditional/unconditional
//! batch marker on a [`StepState`] before each denoising step. Hooks read it
//! during the forward pass.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use parking_lot::RwLock;

use crate::error::Result;
use crate::graph::Node;

/// Values the host updates once per denoising step
#[derive(Debug, Default)]
pub struct StepState {
    /// Normalized progress through the sampling trajectory (0.0 - 1.0)
    sampling_percent: RwLock<Option<f64>>,
    /// `[batch, 1, 1, 1]` marker: 1.0 for conditional rows, 0.0 for unconditional
    cond_mark: RwLock<Option<Tensor>>,
}

impl StepState {
    /// Create an empty step state
    pub fn new() -> Self {
        Self::default()
    }

    /// Current sampling progress, if published
    pub fn sampling_percent(&self) -> Option<f64> {
        *self.sampling_percent.read()
    }

    /// Publish (or clear) the sampling progress
    pub fn set_sampling_percent(&self, percent: Option<f64>) {
        *self.sampling_percent.write() = percent;
    }

    /// Current conditional marker, if published
    pub fn cond_mark(&self) -> Option<Tensor> {
        self.cond_mark.read().clone()
    }

    /// Publish (or clear) the conditional marker
    pub fn set_cond_mark(&self, cond_mark: Option<Tensor>) {
        *self.cond_mark.write() = cond_mark;
    }

    /// Publish both values for a new step
    pub fn begin_step(&self, percent: f64, cond_mark: Tensor) {
        self.set_sampling_percent(Some(percent));
        self.set_cond_mark(Some(cond_mark));
    }
}

/// Build a `[batch, 1, 1, 1]` conditional marker from per-row flags
pub fn cond_mark_from_flags(conditional: &[bool], device: &Device) -> Result<Tensor> {
    let values: Vec<f32> = conditional
        .iter()
        .map(|&c| if c { 1.0 } else { 0.0 })
        .collect();
    Ok(Tensor::from_vec(values, (conditional.len(), 1, 1, 1), device)?)
}

/// A host diffusion network: its graph plus the step state it publishes
pub struct HostModel {
    root: Box<dyn Node>,
    state: Arc<StepState>,
}

impl HostModel {
    /// Wrap a host graph with a fresh step state
    pub fn new(root: impl Node + 'static) -> Self {
        Self {
            root: Box::new(root),
            state: Arc::new(StepState::new()),
        }
    }

    /// Graph root
    pub fn root(&self) -> &dyn Node {
        self.root.as_ref()
    }

    /// Mutable graph root
    pub fn root_mut(&mut self) -> &mut dyn Node {
        self.root.as_mut()
    }

    /// Shared step state
    pub fn state(&self) -> &Arc<StepState> {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ModuleDict;

    #[test]
    fn test_step_state() {
        let state = StepState::new();
        assert_eq!(state.sampling_percent(), None);
        assert!(state.cond_mark().is_none());

        let mark = cond_mark_from_flags(&[true, false], &Device::Cpu).unwrap();
        state.begin_step(0.25, mark);

        assert_eq!(state.sampling_percent(), Some(0.25));
        assert_eq!(state.cond_mark().unwrap().dims(), &[2, 1, 1, 1]);
    }

    #[test]
    fn test_cond_mark_values() {
        let mark = cond_mark_from_flags(&[false, true], &Device::Cpu).unwrap();
        let values = mark.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(values, vec![0.0, 1.0]);
    }

    #[test]
    fn test_host_model_shares_state() {
        let host = HostModel::new(ModuleDict::new());
        let handle = host.state().clone();

        handle.set_sampling_percent(Some(0.9));
        assert_eq!(host.state().sampling_percent(), Some(0.9));
    }
}
