use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use futures::FutureExt;
use kernelport_core::{BackendModel, InvokeFuture, ModelId, ModelInvoker, NamedTensors, VersionPolicy};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, trace};

use crate::{InferenceRequest, Scheduler, SchedulerHandle, Worker};

const SCHEDULER_QUEUE: usize = 1024;
const WORKER_QUEUE: usize = 128;

/// Loaded models by name and version, each served by its own worker pool.
#[derive(Default)]
pub struct ModelRepository {
    models: RwLock<HashMap<String, BTreeMap<u64, SchedulerHandle>>>,
}

impl ModelRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `name`/`version` with one worker per instance.
    ///
    /// Must be called from inside a tokio runtime. Loading an already loaded
    /// version replaces it; requests queued on the old pool still complete.
    pub fn load(
        &self,
        name: &str,
        version: u64,
        instances: Vec<Box<dyn BackendModel>>,
    ) -> Result<()> {
        if instances.is_empty() {
            bail!("model '{name}' version {version} needs at least one instance");
        }

        let mut worker_txs = Vec::with_capacity(instances.len());
        for (id, model) in instances.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE);
            worker_txs.push(tx);
            let worker = Worker {
                id: id as u32,
                inbox: rx,
                model,
            };
            tokio::spawn(async move {
                if let Err(e) = worker.run().await {
                    error!(error = ?e, "worker exited");
                }
            });
        }

        let (sched_tx, sched_rx) = mpsc::channel(SCHEDULER_QUEUE);
        let scheduler = Scheduler::new(sched_rx, worker_txs);
        tokio::spawn(async move {
            if let Err(e) = scheduler.run().await {
                error!(error = ?e, "scheduler exited");
            }
        });

        let mut models = self
            .models
            .write()
            .map_err(|_| anyhow!("model repository lock poisoned"))?;
        models
            .entry(name.to_string())
            .or_default()
            .insert(version, Scheduler::handle(sched_tx));
        info!(model = name, version, "model loaded");
        Ok(())
    }

    pub fn unload(&self, name: &str, version: u64) -> bool {
        let Ok(mut models) = self.models.write() else {
            return false;
        };
        let Some(versions) = models.get_mut(name) else {
            return false;
        };
        let removed = versions.remove(&version).is_some();
        if versions.is_empty() {
            models.remove(name);
        }
        removed
    }

    pub fn versions(&self, name: &str) -> Vec<u64> {
        self.models
            .read()
            .ok()
            .and_then(|m| m.get(name).map(|v| v.keys().copied().collect()))
            .unwrap_or_default()
    }

    /// Resolve a version policy against what is loaded right now.
    pub fn resolve(&self, model: &ModelId) -> Result<(u64, SchedulerHandle)> {
        let models = self
            .models
            .read()
            .map_err(|_| anyhow!("model repository lock poisoned"))?;
        let versions = models
            .get(&model.name)
            .ok_or_else(|| anyhow!("model '{}' is not loaded", model.name))?;
        let found = match model.version {
            VersionPolicy::Latest => versions.iter().next_back(),
            VersionPolicy::Pinned(v) => versions.get_key_value(&v),
        };
        found
            .map(|(v, h)| (*v, h.clone()))
            .ok_or_else(|| anyhow!("model '{}' version {} is not available", model.name, model.version))
    }
}

impl ModelInvoker for ModelRepository {
    fn invoke(&self, model: &ModelId, inputs: NamedTensors) -> InvokeFuture {
        let resolved = self.resolve(model);
        let name = model.name.clone();
        async move {
            let (version, handle) = resolved?;
            let (tx, rx) = oneshot::channel();
            let req = InferenceRequest {
                model: name.clone(),
                version,
                inputs,
                enqueued_at: std::time::Instant::now(),
                resp_tx: tx,
            };
            if handle.submit(req).await.is_err() {
                bail!("model '{name}' version {version} is shutting down");
            }
            let resp = rx
                .await
                .map_err(|_| anyhow!("worker for '{name}' dropped the request"))??;
            trace!(
                model = %name,
                version,
                queued_us = resp.timings.queued_us,
                backend_us = resp.timings.backend_us,
                "backend call finished"
            );
            Ok::<_, anyhow::Error>(resp.outputs)
        }
        .boxed()
    }
}
