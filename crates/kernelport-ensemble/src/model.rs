use std::fmt;
use std::sync::Arc;

use kernelport_core::{IOName, ModelInvoker, Tensor};
use tracing::debug;

use crate::aggregator::EnsembleResponse;
use crate::config::EnsembleConfig;
use crate::error::{ConfigError, Result};
use crate::graph::StepGraph;
use crate::scheduler::EnsembleScheduler;
use crate::stats::StatsSink;

/// A loaded ensemble: a model whose execution is a graph of calls into other models.
pub struct EnsembleModel {
    version: u64,
    scheduler: EnsembleScheduler,
}

impl EnsembleModel {
    /// Compile `config` and wire it to the models it calls.
    pub fn create(
        version: u64,
        config: &EnsembleConfig,
        invoker: Arc<dyn ModelInvoker>,
        stats: Arc<dyn StatsSink>,
    ) -> std::result::Result<Self, ConfigError> {
        let graph = Arc::new(StepGraph::build(config)?);
        let scheduler = EnsembleScheduler::new(graph, invoker, stats);
        let model = Self { version, scheduler };
        debug!(version, "ensemble model for {}", model.name());
        Ok(model)
    }

    pub fn name(&self) -> &str {
        self.scheduler.graph().name()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn graph(&self) -> &Arc<StepGraph> {
        self.scheduler.graph()
    }

    pub fn scheduler(&self) -> &EnsembleScheduler {
        &self.scheduler
    }

    pub async fn infer(&self, inputs: Vec<(IOName, Tensor)>) -> Result<EnsembleResponse> {
        self.scheduler.infer(inputs).await
    }
}

impl fmt::Display for EnsembleModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "name={}", self.name())
    }
}
