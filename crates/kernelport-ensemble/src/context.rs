//! Per-request execution state.
//!
//! A [`RequestContext`] is shared (`Arc`) by the caller-side handle and by
//! every spawned step task. All state transitions of one request happen under
//! its own mutex; nothing is shared between requests except the immutable
//! [`StepGraph`]. Work that must not run under the lock (delivering the
//! outcome, spawning sub-model calls, recording stats) is collected into
//! [`Effects`] and carried out after the guard is dropped.
//!
//! The context is released when the last step task returns, so a late
//! completion can never observe a destroyed request.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use kernelport_core::{ModelInvoker, NamedTensors, Tensor};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, warn};

use crate::aggregator::{EnsembleResponse, ResponseAggregator};
use crate::dispatcher::{self, StepCall};
use crate::error::{EnsembleError, Result};
use crate::graph::{StepGraph, StepId, TensorId};
use crate::readiness::{ReadinessTracker, StepState};
use crate::registry::{SlotState, TensorRegistry};
use crate::stats::{RequestReport, StatsSink, StepOutcome, StepReport};

pub type Outcome = Result<EnsembleResponse>;

/// Contexts not yet released, with a wakeup for whoever waits for zero.
#[derive(Default)]
pub(crate) struct LiveRequests {
    count: AtomicUsize,
    idle: Notify,
}

impl LiveRequests {
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn enter(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn leave(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Resolves once no context is alive.
    pub(crate) async fn idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestPhase {
    Running,
    Completed,
    Failed,
}

pub(crate) struct RequestState {
    pub(crate) id: u64,
    pub(crate) graph: Arc<StepGraph>,
    pub(crate) phase: RequestPhase,
    pub(crate) registry: TensorRegistry,
    pub(crate) tracker: ReadinessTracker,
    pub(crate) aggregator: ResponseAggregator,
    terminal: Option<oneshot::Sender<Outcome>>,
    reported: bool,
    poisoned: bool,
}

#[derive(Default)]
pub(crate) struct Effects {
    pub(crate) calls: Vec<StepCall>,
    outcome: Option<(oneshot::Sender<Outcome>, Outcome)>,
    report: Option<RequestReport>,
}

impl RequestState {
    fn new(id: u64, graph: Arc<StepGraph>, terminal: oneshot::Sender<Outcome>) -> Self {
        Self {
            id,
            phase: RequestPhase::Running,
            registry: TensorRegistry::new(graph.clone()),
            tracker: ReadinessTracker::new(graph.clone()),
            aggregator: ResponseAggregator::new(graph.clone()),
            graph,
            terminal: Some(terminal),
            reported: false,
            poisoned: false,
        }
    }

    /// Store a tensor and return the steps it made ready.
    pub(crate) fn publish(&mut self, tensor: TensorId, value: Tensor) -> Result<Vec<StepId>> {
        self.registry.publish(tensor, value)?;
        let ready = self.tracker.tensor_published(tensor)?;
        self.aggregator.on_publish(tensor);
        Ok(ready)
    }

    /// Retire a pending step without running it, dropping its hold on its inputs.
    pub(crate) fn suppress(&mut self, step: StepId) -> bool {
        if !self.tracker.suppress(step) {
            return false;
        }
        for t in &self.graph.step(step).required {
            self.registry.release(*t);
        }
        true
    }

    /// Everything downstream of `failed` can no longer run.
    fn mark_unreachable(&mut self, failed: StepId) {
        let graph = self.graph.clone();
        let mut unavailable: Vec<TensorId> =
            graph.step(failed).outputs.iter().map(|b| b.tensor).collect();
        while let Some(t) = unavailable.pop() {
            if !self.registry.mark_unavailable(t) {
                continue;
            }
            for consumer in &graph.tensor(t).consumers {
                if self.suppress(*consumer) {
                    debug!(request_id = self.id, step = %graph.step(*consumer).name, "step unreachable");
                    unavailable.extend(graph.step(*consumer).outputs.iter().map(|b| b.tensor));
                }
            }
        }
    }

    /// First error wins; later ones are only logged.
    pub(crate) fn fail(&mut self, err: EnsembleError, effects: &mut Effects) {
        if self.phase != RequestPhase::Running {
            debug!(request_id = self.id, error = %err, "ignoring error after request finished");
            return;
        }
        if let EnsembleError::InternalConsistency(msg) = &err {
            error!(request_id = self.id, ensemble = self.graph.name(), "{msg}");
        }
        self.settle(Err(err), effects);
    }

    fn settle(&mut self, outcome: Outcome, effects: &mut Effects) {
        self.phase = if outcome.is_ok() {
            RequestPhase::Completed
        } else {
            RequestPhase::Failed
        };
        for step in self.tracker.pending() {
            self.suppress(step);
        }
        if outcome.is_err() {
            self.aggregator.abandon(&mut self.registry);
        }
        if let Some(tx) = self.terminal.take() {
            effects.outcome = Some((tx, outcome));
        }
    }
}

pub struct RequestContext {
    id: u64,
    graph: Arc<StepGraph>,
    invoker: Arc<dyn ModelInvoker>,
    stats: Arc<dyn StatsSink>,
    started: Instant,
    live: Arc<LiveRequests>,
    state: Mutex<RequestState>,
}

impl RequestContext {
    /// Create the context, publish the external inputs and dispatch whatever
    /// they make ready. Inputs must already be validated against the graph.
    ///
    /// Must be called from inside a tokio runtime.
    pub(crate) fn start(
        id: u64,
        graph: Arc<StepGraph>,
        invoker: Arc<dyn ModelInvoker>,
        stats: Arc<dyn StatsSink>,
        live: Arc<LiveRequests>,
        inputs: Vec<(TensorId, Tensor)>,
    ) -> (Arc<Self>, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        live.enter();
        let ctx = Arc::new(Self {
            id,
            state: Mutex::new(RequestState::new(id, graph.clone(), tx)),
            graph,
            invoker,
            stats,
            started: Instant::now(),
            live,
        });
        debug!(request_id = id, ensemble = ctx.graph.name(), "request started");

        let effects = {
            let mut state = ctx.lock();
            let mut effects = Effects::default();
            let mut ready = state.tracker.initially_ready();
            for (tensor, value) in inputs {
                match state.publish(tensor, value) {
                    Ok(newly) => ready.extend(newly),
                    Err(e) => {
                        state.fail(e, &mut effects);
                        break;
                    }
                }
            }
            ctx.advance(&mut state, ready, &mut effects);
            effects
        };
        ctx.apply(effects);
        (ctx, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn graph(&self) -> &Arc<StepGraph> {
        &self.graph
    }

    pub(crate) fn invoker(&self) -> &Arc<dyn ModelInvoker> {
        &self.invoker
    }

    pub fn phase(&self) -> RequestPhase {
        self.lock().phase
    }

    pub fn step_state(&self, step: StepId) -> StepState {
        self.lock().tracker.state(step)
    }

    /// Steps currently running in a sub-model.
    pub fn in_flight(&self) -> usize {
        self.lock().tracker.in_flight()
    }

    /// Whether `tensor`'s buffer has been published and already freed.
    pub fn is_released(&self, tensor: TensorId) -> bool {
        matches!(self.lock().registry.slot(tensor).state, SlotState::Released)
    }

    /// Bytes of tensor buffers this request still holds.
    pub fn resident_bytes(&self) -> usize {
        self.lock().registry.resident_bytes()
    }

    /// Fail the request from outside (deadline, caller abort). Steps already
    /// dispatched keep running and are drained; nothing new is dispatched.
    pub fn fail(self: &Arc<Self>, err: EnsembleError) {
        let effects = {
            let mut state = self.lock();
            let mut effects = Effects::default();
            state.fail(err, &mut effects);
            self.advance(&mut state, Vec::new(), &mut effects);
            effects
        };
        self.apply(effects);
    }

    /// Continuation of one sub-model call. Runs exactly once per dispatched step.
    pub(crate) fn complete_step(self: &Arc<Self>, step: StepId, result: anyhow::Result<NamedTensors>) {
        let descriptor = self.graph.step(step);
        let effects = {
            let mut state = self.lock();
            let mut effects = Effects::default();
            let mut ready = Vec::new();

            match result.and_then(|outputs| dispatcher::bind_outputs(descriptor, outputs)) {
                Ok(tensors) => match state.tracker.finish(step, StepState::Completed) {
                    Ok(()) => {
                        debug!(request_id = self.id, step = %descriptor.name, "step completed");
                        for (tensor, value) in tensors {
                            match state.publish(tensor, value) {
                                Ok(newly) => ready.extend(newly),
                                Err(e) => {
                                    state.fail(e, &mut effects);
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => state.fail(e, &mut effects),
                },
                Err(source) => match state.tracker.finish(step, StepState::Failed) {
                    Ok(()) => {
                        warn!(
                            request_id = self.id,
                            step = %descriptor.name,
                            model = %descriptor.model,
                            error = %source,
                            "step failed"
                        );
                        state.mark_unreachable(step);
                        state.fail(
                            EnsembleError::StepInvocation {
                                step: descriptor.name.clone(),
                                model: descriptor.model.to_string(),
                                source,
                            },
                            &mut effects,
                        );
                    }
                    Err(e) => state.fail(e, &mut effects),
                },
            }

            self.advance(&mut state, ready, &mut effects);
            effects
        };
        self.apply(effects);
    }

    fn lock(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            let mut guard = poisoned.into_inner();
            guard.poisoned = true;
            guard
        })
    }

    /// Settle the response if it is complete, turn ready steps into calls,
    /// and emit the stats report once nothing is outstanding.
    fn advance(&self, state: &mut RequestState, ready: Vec<StepId>, effects: &mut Effects) {
        if state.poisoned {
            state.fail(
                EnsembleError::internal("request state lock poisoned"),
                effects,
            );
        }

        if state.phase == RequestPhase::Running && state.aggregator.is_complete() {
            match state.aggregator.build(&mut state.registry) {
                Ok(response) => state.settle(Ok(response), effects),
                Err(e) => state.fail(e, effects),
            }
        }

        dispatcher::prepare(state, ready, effects);

        if state.tracker.outstanding() == 0 {
            if state.phase == RequestPhase::Running {
                let missing = state.aggregator.missing();
                state.fail(
                    EnsembleError::internal(format!(
                        "no step left to run but outputs {missing:?} were never produced"
                    )),
                    effects,
                );
            }
            if !state.reported {
                state.reported = true;
                effects.report = Some(self.report(state));
            }
        }
    }

    fn apply(self: &Arc<Self>, effects: Effects) {
        if let Some((tx, outcome)) = effects.outcome {
            match &outcome {
                Ok(_) => debug!(request_id = self.id, "request completed"),
                Err(e) => debug!(request_id = self.id, error = %e, "request failed"),
            }
            if tx.send(outcome).is_err() {
                debug!(request_id = self.id, "caller went away before the outcome");
            }
        }
        dispatcher::launch(self, effects.calls);
        if let Some(report) = effects.report {
            self.stats.record(report);
        }
    }

    fn report(&self, state: &RequestState) -> RequestReport {
        let steps = self
            .graph
            .steps()
            .iter()
            .map(|s| {
                let instance = state.tracker.instance(s.id);
                StepReport {
                    step: s.name.clone(),
                    model: s.model.name.clone(),
                    latency: instance.latency,
                    outcome: match instance.state {
                        StepState::Completed => StepOutcome::Success,
                        StepState::Failed => StepOutcome::Failure,
                        _ => StepOutcome::Suppressed,
                    },
                }
            })
            .collect();
        RequestReport {
            request_id: self.id,
            success: state.phase == RequestPhase::Completed,
            duration: self.started.elapsed(),
            steps,
        }
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        debug!(request_id = self.id, "request released");
        self.live.leave();
    }
}
