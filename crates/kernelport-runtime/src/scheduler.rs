use anyhow::Result;
use tokio::sync::mpsc;

use crate::InferenceRequest;

#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<InferenceRequest>,
}

impl SchedulerHandle {
    /// On failure the request is handed back so the caller can still answer it.
    pub async fn submit(
        &self,
        req: InferenceRequest,
    ) -> std::result::Result<(), InferenceRequest> {
        self.tx.send(req).await.map_err(|e| e.0)
    }
}

/// Spreads one model's requests round-robin over its worker instances.
pub struct Scheduler {
    rx: mpsc::Receiver<InferenceRequest>,
    worker_txs: Vec<mpsc::Sender<InferenceRequest>>,
    rr: usize,
}

impl Scheduler {
    pub fn new(
        rx: mpsc::Receiver<InferenceRequest>,
        worker_txs: Vec<mpsc::Sender<InferenceRequest>>,
    ) -> Self {
        Self {
            rx,
            worker_txs,
            rr: 0,
        }
    }

    pub fn handle(tx: mpsc::Sender<InferenceRequest>) -> SchedulerHandle {
        SchedulerHandle { tx }
    }

    pub async fn run(mut self) -> Result<()> {
        while let Some(req) = self.rx.recv().await {
            if self.worker_txs.is_empty() {
                let _ = req
                    .resp_tx
                    .send(Err(anyhow::anyhow!("model '{}' has no instances", req.model)));
                continue;
            }
            let idx = self.rr % self.worker_txs.len();
            self.rr += 1;
            if let Err(e) = self.worker_txs[idx].send(req).await {
                let req = e.0;
                let _ = req
                    .resp_tx
                    .send(Err(anyhow::anyhow!("worker for '{}' exited", req.model)));
            }
        }
        Ok(())
    }
}
