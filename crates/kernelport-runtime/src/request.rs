use std::time::Instant;

use kernelport_core::NamedTensors;
use tokio::sync::oneshot;

pub type ResponseSender = oneshot::Sender<anyhow::Result<InferenceResponse>>;

/// One call into a loaded model version, queued for its worker pool.
#[derive(Debug)]
pub struct InferenceRequest {
    pub model: String,
    pub version: u64,
    /// Named inputs in any order; the worker matches them to the model spec.
    pub inputs: NamedTensors,
    pub enqueued_at: Instant,
    pub resp_tx: ResponseSender,
}

#[derive(Debug)]
pub struct InferenceResponse {
    pub outputs: NamedTensors,
    pub timings: Timings,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Timings {
    /// Submit to worker pickup.
    pub queued_us: u64,
    pub backend_us: u64,
}
