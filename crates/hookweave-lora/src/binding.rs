//! State-dict driven weight loading and binding
//!
//! All three operations are best effort: a key whose path does not exist in
//! the target graph, or whose node cannot bind, is skipped silently. The
//! returned counts are informational.

use std::collections::HashMap;

use candle_core::Tensor;
use hookweave_core::graph::split_key;
use hookweave_core::{Node, resolve_mut, set_by_path, state_dict, visit_mut};
use tracing::debug;

/// Assign every entry of the flat state dict `flat` into `target` by dotted path.
///
/// The mapping is drained: it is empty when this returns, whether or not a
/// key found a home. Returns the number of tensors assigned.
pub fn force_load_state_dict(target: &mut dyn Node, flat: &mut HashMap<String, Tensor>) -> usize {
    let total = flat.len();
    let mut assigned = 0;
    for (key, value) in flat.drain() {
        if set_by_path(&mut *target, &key, value) {
            assigned += 1;
        }
    }
    debug!(assigned, skipped = total - assigned, "force-loaded state dict");
    assigned
}

/// Bind every `*.weight` tensor of `base` into the layer at the same path
/// in `control`. Returns the number of layers bound.
pub fn bind_all(base: &dyn Node, control: &mut dyn Node) -> usize {
    let mut bound = 0;
    for (key, weight) in state_dict(base) {
        let (parent, leaf) = split_key(&key);
        if leaf != "weight" {
            continue;
        }
        let Some(node) = resolve_mut(&mut *control, parent) else {
            continue;
        };
        if let Some(layer) = node.as_bindable() {
            layer.bind(weight);
            bound += 1;
        }
    }
    debug!(bound, "bound base weights");
    bound
}

/// Unbind every bindable layer below `control`, depth first.
/// Returns the number of bindable layers visited.
pub fn unbind_all(control: &mut dyn Node) -> usize {
    let mut visited = 0;
    visit_mut(control, &mut |node: &mut dyn Node| {
        if let Some(layer) = node.as_bindable() {
            layer.unbind();
            visited += 1;
        }
    });
    debug!(visited, "unbound control layers");
    visited
}
