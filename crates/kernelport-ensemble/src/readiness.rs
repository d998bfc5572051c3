//! Per-request step readiness.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{EnsembleError, Result};
use crate::graph::{StepGraph, StepId, TensorId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepState {
    Pending,
    Dispatched,
    Completed,
    Failed,
    /// Never dispatched: unreachable after an upstream failure, or the request
    /// had already finished when the step became ready.
    Suppressed,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Suppressed
        )
    }
}

#[derive(Debug)]
pub struct StepInstance {
    pub state: StepState,
    /// Required inputs not yet published. Only ever decreases.
    pub remaining: usize,
    pub dispatched_at: Option<Instant>,
    pub latency: Option<Duration>,
}

pub struct ReadinessTracker {
    graph: Arc<StepGraph>,
    steps: Vec<StepInstance>,
    outstanding: usize,
}

impl ReadinessTracker {
    pub fn new(graph: Arc<StepGraph>) -> Self {
        let steps: Vec<StepInstance> = graph
            .steps()
            .iter()
            .map(|s| StepInstance {
                state: StepState::Pending,
                remaining: s.required.len(),
                dispatched_at: None,
                latency: None,
            })
            .collect();
        let outstanding = steps.len();
        Self {
            graph,
            steps,
            outstanding,
        }
    }

    /// Steps with no inputs at all; ready before anything is published.
    pub fn initially_ready(&self) -> Vec<StepId> {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == StepState::Pending && s.remaining == 0)
            .map(|(i, _)| StepId(i))
            .collect()
    }

    /// Count `tensor` as arrived for each of its consumers and return the
    /// ones that just became ready. Suppressed consumers are left alone.
    pub fn tensor_published(&mut self, tensor: TensorId) -> Result<Vec<StepId>> {
        let mut ready = Vec::new();
        for consumer in &self.graph.tensor(tensor).consumers {
            let step = &mut self.steps[consumer.0];
            match step.state {
                StepState::Suppressed => continue,
                StepState::Pending if step.remaining > 0 => {
                    step.remaining -= 1;
                    if step.remaining == 0 {
                        ready.push(*consumer);
                    }
                }
                _ => {
                    return Err(EnsembleError::internal(format!(
                        "step '{}' would become ready more than once (input '{}')",
                        self.graph.step(*consumer).name,
                        self.graph.tensor(tensor).name
                    )))
                }
            }
        }
        Ok(ready)
    }

    pub fn mark_dispatched(&mut self, id: StepId) -> Result<()> {
        let step = &mut self.steps[id.0];
        if step.state != StepState::Pending || step.remaining != 0 {
            return Err(EnsembleError::internal(format!(
                "step '{}' dispatched while {:?} with {} inputs missing",
                self.graph.step(id).name,
                step.state,
                step.remaining
            )));
        }
        step.state = StepState::Dispatched;
        step.dispatched_at = Some(Instant::now());
        Ok(())
    }

    /// Record the end of a dispatched step as `Completed` or `Failed`.
    pub fn finish(&mut self, id: StepId, state: StepState) -> Result<()> {
        debug_assert!(matches!(state, StepState::Completed | StepState::Failed));
        let step = &mut self.steps[id.0];
        if step.state != StepState::Dispatched {
            return Err(EnsembleError::internal(format!(
                "step '{}' completed while {:?}",
                self.graph.step(id).name,
                step.state
            )));
        }
        step.state = state;
        step.latency = step.dispatched_at.map(|t| t.elapsed());
        self.outstanding -= 1;
        Ok(())
    }

    /// Returns true if the step was pending and is now suppressed.
    pub fn suppress(&mut self, id: StepId) -> bool {
        let step = &mut self.steps[id.0];
        if step.state != StepState::Pending {
            return false;
        }
        step.state = StepState::Suppressed;
        self.outstanding -= 1;
        true
    }

    pub fn pending(&self) -> Vec<StepId> {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == StepState::Pending)
            .map(|(i, _)| StepId(i))
            .collect()
    }

    pub fn state(&self, id: StepId) -> StepState {
        self.steps[id.0].state
    }

    pub fn instance(&self, id: StepId) -> &StepInstance {
        &self.steps[id.0]
    }

    /// Steps that are pending or dispatched.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn in_flight(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.state == StepState::Dispatched)
            .count()
    }
}
