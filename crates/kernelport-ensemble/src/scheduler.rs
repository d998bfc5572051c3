use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use kernelport_core::{IOName, ModelInvoker, Tensor};
use tokio::sync::oneshot;

use crate::aggregator::EnsembleResponse;
use crate::config::TensorDecl;
use crate::context::{LiveRequests, Outcome, RequestContext};
use crate::error::{EnsembleError, Result};
use crate::graph::{StepGraph, TensorId};
use crate::stats::StatsSink;

/// Runs requests against one compiled ensemble.
///
/// Requests are independent: each gets its own [`RequestContext`], and the
/// scheduler itself holds no per-request state beyond a live counter.
pub struct EnsembleScheduler {
    graph: Arc<StepGraph>,
    invoker: Arc<dyn ModelInvoker>,
    stats: Arc<dyn StatsSink>,
    timeout: Option<Duration>,
    next_id: AtomicU64,
    live: Arc<LiveRequests>,
}

/// Handle to a request that has been started.
pub struct PendingResponse {
    request_id: u64,
    context: Weak<RequestContext>,
    rx: oneshot::Receiver<Outcome>,
}

impl EnsembleScheduler {
    pub fn new(
        graph: Arc<StepGraph>,
        invoker: Arc<dyn ModelInvoker>,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        Self {
            timeout: graph.timeout(),
            graph,
            invoker,
            stats,
            next_id: AtomicU64::new(1),
            live: Arc::default(),
        }
    }

    /// Override the deadline taken from the configuration.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn graph(&self) -> &Arc<StepGraph> {
        &self.graph
    }

    /// Request contexts not yet released, including failed requests whose
    /// dispatched steps are still draining.
    pub fn in_flight(&self) -> usize {
        self.live.count()
    }

    /// Resolves once every request context has been released.
    pub async fn drained(&self) {
        self.live.idle().await
    }

    /// Run one request to its single outcome.
    pub async fn infer(&self, inputs: Vec<(IOName, Tensor)>) -> Result<EnsembleResponse> {
        self.enqueue(inputs)?.wait().await
    }

    /// Validate and start a request without waiting for it. The deadline, if
    /// any, runs from here whether or not the handle is ever awaited.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn enqueue(&self, inputs: Vec<(IOName, Tensor)>) -> Result<PendingResponse> {
        let inputs = self.bind_inputs(inputs)?;
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (ctx, rx) = RequestContext::start(
            request_id,
            self.graph.clone(),
            self.invoker.clone(),
            self.stats.clone(),
            self.live.clone(),
            inputs,
        );
        let context = Arc::downgrade(&ctx);
        if let Some(after) = self.timeout {
            let context = context.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                if let Some(ctx) = context.upgrade() {
                    ctx.fail(EnsembleError::Timeout { after });
                }
            });
        }
        Ok(PendingResponse {
            request_id,
            context,
            rx,
        })
    }

    fn bind_inputs(&self, inputs: Vec<(IOName, Tensor)>) -> Result<Vec<(TensorId, Tensor)>> {
        let declared = self.graph.inputs();
        let mut seen = vec![false; declared.len()];
        let mut bound = Vec::with_capacity(inputs.len());
        for (name, tensor) in inputs {
            let pos = declared
                .iter()
                .position(|(_, decl)| decl.name == name.as_str())
                .ok_or_else(|| {
                    EnsembleError::InvalidRequest(format!(
                        "unexpected input '{name}' for ensemble '{}'",
                        self.graph.name()
                    ))
                })?;
            if seen[pos] {
                return Err(EnsembleError::InvalidRequest(format!(
                    "input '{name}' given more than once"
                )));
            }
            seen[pos] = true;
            let (id, decl) = &declared[pos];
            check_input(decl, &tensor)?;
            bound.push((*id, tensor));
        }
        if let Some(pos) = seen.iter().position(|s| !s) {
            return Err(EnsembleError::InvalidRequest(format!(
                "missing input '{}'",
                declared[pos].1.name
            )));
        }
        Ok(bound)
    }
}

fn check_input(decl: &TensorDecl, tensor: &Tensor) -> Result<()> {
    let invalid = |msg: String| Err(EnsembleError::InvalidRequest(msg));
    if let Some(dtype) = decl.dtype {
        if tensor.dtype() != dtype {
            return invalid(format!(
                "input '{}' expects {:?}, got {:?}",
                decl.name,
                dtype,
                tensor.dtype()
            ));
        }
    }
    if let Some(dims) = &decl.dims {
        let shape = tensor.shape().dims();
        let matches = dims.len() == shape.len()
            && dims
                .iter()
                .zip(shape)
                .all(|(want, got)| *want < 0 || *want as usize == *got);
        if !matches {
            return invalid(format!(
                "input '{}' expects dims {:?}, got {:?}",
                decl.name, dims, shape
            ));
        }
    }
    let Some(expected) = tensor.desc.byte_size() else {
        return invalid(format!(
            "input '{}' has dims {:?}, too large to address",
            decl.name,
            tensor.shape().dims()
        ));
    };
    if tensor.byte_len() != expected {
        return invalid(format!(
            "input '{}' carries {} bytes, its shape needs {}",
            decl.name,
            tensor.byte_len(),
            expected
        ));
    }
    Ok(())
}

impl PendingResponse {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// The request's live context, until it has been released.
    pub fn context(&self) -> Option<Arc<RequestContext>> {
        self.context.upgrade()
    }

    /// Fail the request with [`EnsembleError::Cancelled`] unless it has
    /// already finished. Dispatched steps drain in the background.
    pub fn cancel(&self) {
        if let Some(ctx) = self.context() {
            ctx.fail(EnsembleError::Cancelled);
        }
    }

    /// Wait for the outcome. A request past its deadline resolves to
    /// [`EnsembleError::Timeout`].
    pub async fn wait(self) -> Result<EnsembleResponse> {
        received(self.rx.await)
    }
}

fn received(outcome: std::result::Result<Outcome, oneshot::error::RecvError>) -> Outcome {
    outcome.unwrap_or_else(|_| {
        Err(EnsembleError::internal(
            "request context dropped without an outcome",
        ))
    })
}
