//! Weight-binding capability

use candle_core::Tensor;

/// A layer whose base weight is supplied by another network at run time
pub trait Bindable {
    /// Point the layer at `weight`. No copy is made and no shape check is done.
    fn bind(&mut self, weight: Tensor);

    /// Release the bound weight when the layer can rebuild it from its own factors
    fn unbind(&mut self);

    /// Whether a base weight is currently bound
    fn is_bound(&self) -> bool;
}
