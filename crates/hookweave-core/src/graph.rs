//! Host network graph
//!
//! The host owns its network as a tree of named nodes. Surgery code never
//! reflects over concrete types: it walks the tree by dotted path and asks
//! each node for the capabilities it exposes ([`Node::as_bindable`],
//! [`Node::attention`]). Every lookup returns an `Option`, so a path that
//! does not exist in one graph simply resolves to nothing.

use candle_core::Tensor;

use crate::attention::SharedAttention;
use crate::bind::Bindable;

/// A node in the host network graph
pub trait Node: Send + Sync {
    /// Named direct children, in registration order
    fn children(&self) -> Vec<(&str, &dyn Node)>;

    /// Mutable access to every direct child, in registration order
    fn children_mut(&mut self) -> Vec<&mut dyn Node>;

    /// Mutable access to a direct child by name
    fn child_mut(&mut self, name: &str) -> Option<&mut dyn Node>;

    /// Direct child by name
    fn child(&self, name: &str) -> Option<&dyn Node> {
        self.children()
            .into_iter()
            .find(|(child_name, _)| *child_name == name)
            .map(|(_, child)| child)
    }

    /// Tensors held directly by this node
    fn tensors(&self) -> Vec<(&str, Tensor)> {
        Vec::new()
    }

    /// Assign a tensor slot on this node.
    ///
    /// Returns `false` when the node has no slot with that name.
    fn set_tensor(&mut self, _name: &str, _value: Tensor) -> bool {
        false
    }

    /// Weight-binding capability
    fn as_bindable(&mut self) -> Option<&mut dyn Bindable> {
        None
    }

    /// Attention capability
    fn attention(&self) -> Option<SharedAttention> {
        None
    }
}

/// Generic container node, used for module lists and named submodule maps
///
/// List-like containers name their children `"0"`, `"1"`, ... so dotted
/// paths such as `input_blocks.4.1` address them the same way state dict
/// keys do.
#[derive(Default)]
pub struct ModuleDict {
    children: Vec<(String, Box<dyn Node>)>,
    tensors: Vec<(String, Tensor)>,
}

impl ModuleDict {
    /// Create an empty container
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a list-like container with children named by position
    pub fn list<N: Node + 'static>(items: impl IntoIterator<Item = N>) -> Self {
        let mut dict = Self::new();
        for item in items {
            dict.push(item);
        }
        dict
    }

    /// Builder-style child insertion
    pub fn with_child(mut self, name: impl Into<String>, child: impl Node + 'static) -> Self {
        self.insert(name, child);
        self
    }

    /// Builder-style tensor insertion
    pub fn with_tensor(mut self, name: impl Into<String>, value: Tensor) -> Self {
        self.set_tensor_owned(name.into(), value);
        self
    }

    /// Insert or replace a named child
    pub fn insert(&mut self, name: impl Into<String>, child: impl Node + 'static) {
        self.insert_boxed(name, Box::new(child));
    }

    /// Insert or replace a named, already boxed child
    pub fn insert_boxed(&mut self, name: impl Into<String>, child: Box<dyn Node>) {
        let name = name.into();
        match self.children.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = child,
            None => self.children.push((name, child)),
        }
    }

    /// Append a child named after its position
    pub fn push(&mut self, child: impl Node + 'static) {
        let name = self.children.len().to_string();
        self.children.push((name, Box::new(child)));
    }

    /// Tensor held directly by this container
    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.tensors.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Number of direct children
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Check if the container has no children
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    fn set_tensor_owned(&mut self, name: String, value: Tensor) {
        match self.tensors.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.tensors.push((name, value)),
        }
    }
}

impl Node for ModuleDict {
    fn children(&self) -> Vec<(&str, &dyn Node)> {
        self.children
            .iter()
            .map(|(name, child)| (name.as_str(), child.as_ref()))
            .collect()
    }

    fn children_mut(&mut self) -> Vec<&mut dyn Node> {
        self.children
            .iter_mut()
            .map(|(_, child)| child.as_mut() as &mut dyn Node)
            .collect()
    }

    fn child_mut(&mut self, name: &str) -> Option<&mut dyn Node> {
        self.children
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, child)| child.as_mut() as &mut dyn Node)
    }

    fn tensors(&self) -> Vec<(&str, Tensor)> {
        self.tensors
            .iter()
            .map(|(name, t)| (name.as_str(), t.clone()))
            .collect()
    }

    fn set_tensor(&mut self, name: &str, value: Tensor) -> bool {
        self.set_tensor_owned(name.to_string(), value);
        true
    }
}

/// Resolve a dotted path below `root`.
///
/// The empty path resolves to `root` itself.
pub fn resolve<'a>(root: &'a dyn Node, path: &str) -> Option<&'a dyn Node> {
    if path.is_empty() {
        return Some(root);
    }
    let mut node = root;
    for segment in path.split('.') {
        node = node.child(segment)?;
    }
    Some(node)
}

/// Resolve a dotted path below `root` for mutation
pub fn resolve_mut<'a>(root: &'a mut dyn Node, path: &str) -> Option<&'a mut dyn Node> {
    if path.is_empty() {
        return Some(root);
    }
    let mut node = root;
    for segment in path.split('.') {
        node = node.child_mut(segment)?;
    }
    Some(node)
}

/// Split a dotted key into its parent path and final segment
pub fn split_key(key: &str) -> (&str, &str) {
    key.rsplit_once('.').unwrap_or(("", key))
}

/// Assign `value` at the dotted `key`.
///
/// Returns `false` without touching the graph when any segment is absent.
pub fn set_by_path(root: &mut dyn Node, key: &str, value: Tensor) -> bool {
    let (parent, leaf) = split_key(key);
    match resolve_mut(root, parent) {
        Some(node) => node.set_tensor(leaf, value),
        None => false,
    }
}

/// Flatten every tensor below `root` into dotted-key order
pub fn state_dict(root: &dyn Node) -> Vec<(String, Tensor)> {
    let mut out = Vec::new();
    collect_tensors(root, "", &mut out);
    out
}

fn collect_tensors(node: &dyn Node, prefix: &str, out: &mut Vec<(String, Tensor)>) {
    for (name, tensor) in node.tensors() {
        out.push((join_key(prefix, name), tensor));
    }
    for (name, child) in node.children() {
        collect_tensors(child, &join_key(prefix, name), out);
    }
}

fn join_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Depth-first pre-order walk over `root` and all of its descendants
pub fn visit_mut(root: &mut dyn Node, f: &mut dyn FnMut(&mut dyn Node)) {
    f(&mut *root);
    for child in root.children_mut() {
        visit_mut(child, f);
    }
}
