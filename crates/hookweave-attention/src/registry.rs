//! Attention hook registry
//!
//! Tracks the attention modules a registry has hooked. A module is patched
//! with [`HookedForward`] when it receives its first hook, judged by the
//! module's own hook list rather than by this registry, so a module already
//! patched through another registry is joined instead of patched twice.
//!
//! Teardown restores every module this registry patched and drops all of
//! its hooks, whichever adapter registered them. On modules it only joined,
//! it removes just its own hooks and leaves the forward routine to the
//! registry that patched them.

use std::sync::Arc;

use hookweave_core::{AttentionForward, AttentionHook, Node, Result, SharedAttention, StepState};
use tracing::{debug, info};

use crate::forward::HookedForward;
use crate::locate::{BlockLocation, locate};

struct PatchedBlock {
    attention: SharedAttention,
    /// Routine replaced by this registry; `None` when the module was joined
    original: Option<Arc<dyn AttentionForward>>,
    hooks: Vec<Arc<dyn AttentionHook>>,
}

/// Caller-owned record of patched attention modules
pub struct HookRegistry {
    hooked: Arc<dyn AttentionForward>,
    patched: Vec<PatchedBlock>,
    current_model: Option<Arc<StepState>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            hooked: Arc::new(HookedForward),
            patched: Vec::new(),
            current_model: None,
        }
    }

    fn find(&self, attention: &SharedAttention) -> Option<&PatchedBlock> {
        self.patched
            .iter()
            .find(|block| Arc::ptr_eq(&block.attention, attention))
    }

    /// Register `hook` on `attention`, patching its forward slot if the
    /// module has no hooks yet
    pub fn hook_blk(&mut self, attention: &SharedAttention, hook: Arc<dyn AttentionHook>) {
        let mut attn = attention.write();
        let index = match self
            .patched
            .iter()
            .position(|block| Arc::ptr_eq(&block.attention, attention))
        {
            Some(index) => index,
            None => {
                self.patched.push(PatchedBlock {
                    attention: attention.clone(),
                    original: None,
                    hooks: Vec::new(),
                });
                self.patched.len() - 1
            }
        };
        let block = &mut self.patched[index];
        if attn.hooks().is_empty() {
            // First hook on the module, whichever registry added the others
            block.original = Some(attn.replace_forward(self.hooked.clone()));
        }
        attn.push_hook(hook.clone());
        block.hooks.push(hook);
    }

    /// Locate the block at `location` under `root` and register `hook` on it
    pub fn install(
        &mut self,
        root: &dyn Node,
        location: &BlockLocation,
        hook: Arc<dyn AttentionHook>,
    ) -> Result<()> {
        let attention = locate(root, location)?;
        self.hook_blk(&attention, hook);
        debug!(%location, "installed attention hook");
        Ok(())
    }

    /// Whether `attention` has been hooked through this registry
    pub fn is_patched(&self, attention: &SharedAttention) -> bool {
        self.find(attention).is_some()
    }

    /// Forward routine `attention` had before this registry patched it.
    /// `None` when this registry did not patch it.
    pub fn original_forward(&self, attention: &SharedAttention) -> Option<Arc<dyn AttentionForward>> {
        self.find(attention).and_then(|block| block.original.clone())
    }

    /// Number of hooked attention modules
    pub fn len(&self) -> usize {
        self.patched.len()
    }

    /// Check if no module is hooked
    pub fn is_empty(&self) -> bool {
        self.patched.is_empty()
    }

    /// Record the step state of the model currently being hooked
    pub fn set_current_model(&mut self, state: Arc<StepState>) {
        self.current_model = Some(state);
    }

    /// Step state of the model currently being hooked
    pub fn current_model(&self) -> Option<&Arc<StepState>> {
        self.current_model.as_ref()
    }

    /// Restore every module this registry patched, drop hooks and forget
    /// the current model. Returns the number of modules restored.
    pub fn clear_all(&mut self) -> usize {
        let mut restored = 0;
        for block in self.patched.drain(..) {
            let mut attn = block.attention.write();
            match block.original {
                Some(original) => {
                    attn.replace_forward(original);
                    attn.clear_hooks();
                    restored += 1;
                }
                None => attn.retain_hooks(|hook| {
                    !block.hooks.iter().any(|own| Arc::ptr_eq(own, hook))
                }),
            }
        }
        self.current_model = None;
        if restored > 0 {
            info!(restored, "cleared ip-adapter attention hooks");
        }
        restored
    }

    /// Alias of [`clear_all`](Self::clear_all) under the host-facing name
    pub fn clear_all_ip_adapter(&mut self) -> usize {
        self.clear_all()
    }
}

impl Drop for HookRegistry {
    fn drop(&mut self) {
        self.clear_all();
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("patched", &self.patched.len())
            .field("has_current_model", &self.current_model.is_some())
            .finish()
    }
}
