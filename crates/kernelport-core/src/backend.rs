use anyhow::Result;
use futures::future::BoxFuture;

use crate::{IOName, ModelId, ModelSpec, Tensor};

pub trait BackendModel: Send + 'static {
    fn spec(&self) -> &ModelSpec;

    /// Inputs arrive in `spec().inputs` order; outputs must follow `spec().outputs` order.
    fn infer(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>>;
}

pub type NamedTensors = Vec<(IOName, Tensor)>;

/// Future returned by [`ModelInvoker::invoke`]. Resolves exactly once.
pub type InvokeFuture = BoxFuture<'static, Result<NamedTensors>>;

/// Asynchronous "run this model" capability.
///
/// Implementations must accept many outstanding calls per model and must
/// resolve every returned future (with outputs or an error); a dropped call
/// would leave the caller waiting forever.
pub trait ModelInvoker: Send + Sync + 'static {
    fn invoke(&self, model: &ModelId, inputs: NamedTensors) -> InvokeFuture;
}
