//! Per-request tensor slots.

use std::sync::Arc;

use kernelport_core::Tensor;

use crate::error::{EnsembleError, Result};
use crate::graph::{StepGraph, TensorId};

#[derive(Debug)]
pub enum SlotState {
    Empty,
    Ready(Tensor),
    /// Published, and every interested party is done with it.
    Released,
    /// Its producer failed or was never dispatched; it will never be published.
    Unavailable,
}

#[derive(Debug)]
pub struct TensorSlot {
    pub state: SlotState,
    /// Consumers that have not been dispatched yet, plus one if the tensor is
    /// an ensemble output the response still has to collect.
    pub refs: usize,
}

/// Holds the value of every tensor of one request.
///
/// A slot is written exactly once. Its buffer is dropped as soon as `refs`
/// reaches zero, which may be long before the request itself finishes.
pub struct TensorRegistry {
    graph: Arc<StepGraph>,
    slots: Vec<TensorSlot>,
}

impl TensorRegistry {
    pub fn new(graph: Arc<StepGraph>) -> Self {
        let slots = (0..graph.tensor_count())
            .map(|i| {
                let node = graph.tensor(TensorId(i));
                TensorSlot {
                    state: SlotState::Empty,
                    refs: node.consumers.len() + usize::from(node.is_output),
                }
            })
            .collect();
        Self { graph, slots }
    }

    /// Store a tensor's value. A second publish of the same slot is an error
    /// and leaves every slot untouched.
    pub fn publish(&mut self, id: TensorId, tensor: Tensor) -> Result<()> {
        let name = &self.graph.tensor(id).name;
        let slot = &mut self.slots[id.0];
        match slot.state {
            SlotState::Empty => {
                slot.state = if slot.refs == 0 {
                    SlotState::Released
                } else {
                    SlotState::Ready(tensor)
                };
                Ok(())
            }
            SlotState::Ready(_) | SlotState::Released => Err(EnsembleError::internal(format!(
                "tensor '{name}' published twice"
            ))),
            SlotState::Unavailable => Err(EnsembleError::internal(format!(
                "tensor '{name}' published after it was marked unavailable"
            ))),
        }
    }

    /// A handle to a ready tensor. Does not change the reference count.
    pub fn get(&self, id: TensorId) -> Result<Tensor> {
        match &self.slots[id.0].state {
            SlotState::Ready(t) => Ok(t.clone()),
            other => Err(EnsembleError::internal(format!(
                "tensor '{}' read while {}",
                self.graph.tensor(id).name,
                state_name(other)
            ))),
        }
    }

    /// Drop one unit of interest; frees the buffer when none is left.
    pub fn release(&mut self, id: TensorId) {
        let slot = &mut self.slots[id.0];
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 && matches!(slot.state, SlotState::Ready(_)) {
            slot.state = SlotState::Released;
        }
    }

    /// `get` followed by `release`.
    pub fn take(&mut self, id: TensorId) -> Result<Tensor> {
        let tensor = self.get(id)?;
        self.release(id);
        Ok(tensor)
    }

    /// Returns false if the slot was already published or unavailable.
    pub fn mark_unavailable(&mut self, id: TensorId) -> bool {
        let slot = &mut self.slots[id.0];
        if matches!(slot.state, SlotState::Empty) {
            slot.state = SlotState::Unavailable;
            true
        } else {
            false
        }
    }

    pub fn slot(&self, id: TensorId) -> &TensorSlot {
        &self.slots[id.0]
    }

    /// Bytes currently held by ready slots.
    pub fn resident_bytes(&self) -> usize {
        self.slots
            .iter()
            .map(|s| match &s.state {
                SlotState::Ready(t) => t.byte_len(),
                _ => 0,
            })
            .sum()
    }
}

fn state_name(state: &SlotState) -> &'static str {
    match state {
        SlotState::Empty => "empty",
        SlotState::Ready(_) => "ready",
        SlotState::Released => "released",
        SlotState::Unavailable => "unavailable",
    }
}
