use anyhow::{anyhow, ensure, Result};
use kernelport_core::{BackendModel, IOName, Tensor};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{InferenceRequest, InferenceResponse, Timings};

/// One model instance draining its own inbox.
pub struct Worker {
    pub id: u32,
    pub inbox: mpsc::Receiver<InferenceRequest>,
    pub model: Box<dyn BackendModel>,
}

impl Worker {
    pub async fn run(mut self) -> Result<()> {
        info!(worker_id = self.id, "worker started");
        while let Some(req) = self.inbox.recv().await {
            let queued_us = req.enqueued_at.elapsed().as_micros() as u64;
            let t0 = std::time::Instant::now();
            let result = self.execute(req.inputs).map(|outputs| InferenceResponse {
                outputs,
                timings: Timings {
                    queued_us,
                    backend_us: t0.elapsed().as_micros() as u64,
                },
            });
            if let Err(err) = &result {
                debug!(worker_id = self.id, model = %req.model, error = %err, "inference failed");
            }
            // The caller may have given up on the request; nothing to do then.
            let _ = req.resp_tx.send(result);
        }
        info!(worker_id = self.id, "worker stopped");
        Ok(())
    }

    fn execute(&mut self, mut inputs: Vec<(IOName, Tensor)>) -> Result<Vec<(IOName, Tensor)>> {
        let spec = self.model.spec().clone();
        ensure!(
            inputs.len() == spec.inputs.len(),
            "expected {} inputs, got {}",
            spec.inputs.len(),
            inputs.len()
        );

        let mut ordered = Vec::with_capacity(spec.inputs.len());
        for input_spec in &spec.inputs {
            let idx = inputs
                .iter()
                .position(|(name, _)| *name == input_spec.name)
                .ok_or_else(|| anyhow!("missing input '{}'", input_spec.name))?;
            let (_, tensor) = inputs.swap_remove(idx);
            ensure!(
                tensor.dtype() == input_spec.dtype,
                "input '{}' expects {:?}, got {:?}",
                input_spec.name,
                input_spec.dtype,
                tensor.dtype()
            );
            ordered.push(tensor);
        }

        let outputs = self.model.infer(ordered)?;
        ensure!(
            outputs.len() == spec.outputs.len(),
            "model produced {} outputs, spec declares {}",
            outputs.len(),
            spec.outputs.len()
        );
        Ok(spec
            .outputs
            .iter()
            .map(|s| s.name.clone())
            .zip(outputs)
            .collect())
    }
}
