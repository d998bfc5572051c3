//! Turning ready steps into sub-model calls.
//!
//! [`prepare`] runs under the request lock: it snapshots the input tensors a
//! step needs and moves the step to `Dispatched`. [`launch`] runs after the
//! lock is released and spawns one task per call; the task's completion is
//! the step's continuation.

use std::sync::Arc;

use anyhow::anyhow;
use kernelport_core::{ModelId, NamedTensors, Tensor};
use tracing::debug;

use crate::context::{Effects, RequestContext, RequestPhase, RequestState};
use crate::error::Result;
use crate::graph::{StepDescriptor, StepId, TensorId};

pub(crate) struct StepCall {
    pub(crate) step: StepId,
    pub(crate) model: ModelId,
    pub(crate) inputs: NamedTensors,
}

pub(crate) fn prepare(state: &mut RequestState, ready: Vec<StepId>, effects: &mut Effects) {
    for step in ready {
        if state.phase != RequestPhase::Running {
            state.suppress(step);
            continue;
        }
        match gather(state, step) {
            Ok(call) => effects.calls.push(call),
            Err(e) => state.fail(e, effects),
        }
    }
}

fn gather(state: &mut RequestState, step: StepId) -> Result<StepCall> {
    let graph = state.graph.clone();
    let descriptor = graph.step(step);

    // Read everything before changing any state so a failure leaves the step pending.
    let mut inputs = Vec::with_capacity(descriptor.inputs.len());
    for binding in &descriptor.inputs {
        inputs.push((binding.model_input.clone(), state.registry.get(binding.tensor)?));
    }

    state.tracker.mark_dispatched(step)?;
    for tensor in &descriptor.required {
        state.registry.release(*tensor);
    }

    Ok(StepCall {
        step,
        model: descriptor.model.clone(),
        inputs,
    })
}

pub(crate) fn launch(ctx: &Arc<RequestContext>, calls: Vec<StepCall>) {
    for call in calls {
        debug!(
            request_id = ctx.id(),
            step = %ctx.graph().step(call.step).name,
            model = %call.model,
            inputs = call.inputs.len(),
            "dispatching step"
        );
        let pending = ctx.invoker().invoke(&call.model, call.inputs);
        let ctx = Arc::clone(ctx);
        let step = call.step;
        tokio::spawn(async move {
            let result = pending.await;
            ctx.complete_step(step, result);
        });
    }
}

/// Rename a sub-model's outputs to the ensemble tensors they are bound to.
/// Outputs the step does not map are dropped.
pub(crate) fn bind_outputs(
    descriptor: &StepDescriptor,
    mut outputs: NamedTensors,
) -> anyhow::Result<Vec<(TensorId, Tensor)>> {
    let mut bound = Vec::with_capacity(descriptor.outputs.len());
    for binding in &descriptor.outputs {
        let pos = outputs
            .iter()
            .position(|(name, _)| *name == binding.model_output)
            .ok_or_else(|| {
                anyhow!(
                    "model '{}' returned no output '{}'",
                    descriptor.model.name,
                    binding.model_output
                )
            })?;
        bound.push((binding.tensor, outputs.swap_remove(pos).1));
    }
    Ok(bound)
}
