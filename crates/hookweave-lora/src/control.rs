//! Control-LoRA network lifecycle
//!
//! A control-LoRA checkpoint only carries the low-rank factors and the few
//! layers that differ from the base U-Net. The control network is built with
//! adapter-capable layers, its own checkpoint is force-loaded, and the
//! remaining weights are borrowed from the base network for the duration of
//! a sampling run.

use std::collections::HashMap;

use candle_core::Tensor;
use hookweave_core::Node;
use tracing::info;

use crate::binding::{bind_all, force_load_state_dict, unbind_all};
use crate::factory::{LayerFactory, scoped_hijack};

/// A control network built from adapter-capable layers
pub struct ControlLora {
    model: Box<dyn Node>,
    bound: bool,
}

impl ControlLora {
    /// Wrap an already built control network
    pub fn new(model: impl Node + 'static) -> Self {
        Self {
            model: Box::new(model),
            bound: false,
        }
    }

    /// Build the control network with `factory` hijacked
    pub fn build<N, E>(
        factory: &LayerFactory,
        build: impl FnOnce(&LayerFactory) -> std::result::Result<N, E>,
    ) -> std::result::Result<Self, E>
    where
        N: Node + 'static,
    {
        let model = scoped_hijack(factory, build)?;
        Ok(Self::new(model))
    }

    /// Load the control checkpoint. The mapping is drained.
    pub fn load(&mut self, flat: &mut HashMap<String, Tensor>) -> usize {
        let total = flat.len();
        let assigned = force_load_state_dict(self.model.as_mut(), flat);
        info!(assigned, total, "loaded control-lora checkpoint");
        assigned
    }

    /// Borrow base weights from `base` for a sampling run
    pub fn bind_to(&mut self, base: &dyn Node) -> usize {
        let bound = bind_all(base, self.model.as_mut());
        self.bound = true;
        bound
    }

    /// Release borrowed base weights. Does nothing when not bound.
    pub fn unbind(&mut self) {
        if self.bound {
            unbind_all(self.model.as_mut());
            self.bound = false;
        }
    }

    /// Whether base weights are currently borrowed
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Control network
    pub fn model(&self) -> &dyn Node {
        self.model.as_ref()
    }

    /// Mutable control network
    pub fn model_mut(&mut self) -> &mut dyn Node {
        self.model.as_mut()
    }
}

impl std::fmt::Debug for ControlLora {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLora")
            .field("bound", &self.bound)
            .finish_non_exhaustive()
    }
}
