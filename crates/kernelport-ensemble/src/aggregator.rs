use std::sync::Arc;

use kernelport_core::{IOName, Tensor};

use crate::error::Result;
use crate::graph::{StepGraph, TensorId};
use crate::registry::TensorRegistry;

/// The outputs of one ensemble request, in declaration order.
#[derive(Debug, Clone)]
pub struct EnsembleResponse {
    pub outputs: Vec<(IOName, Tensor)>,
}

impl EnsembleResponse {
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.outputs
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, t)| t)
    }
}

/// Watches the declared outputs of one request.
pub struct ResponseAggregator {
    graph: Arc<StepGraph>,
    ready: Vec<bool>,
    missing: usize,
    /// Set once the aggregator's interest in the output slots has been given up.
    settled: bool,
}

impl ResponseAggregator {
    pub fn new(graph: Arc<StepGraph>) -> Self {
        let n = graph.outputs().len();
        Self {
            graph,
            ready: vec![false; n],
            missing: n,
            settled: false,
        }
    }

    /// Note a publish; true once every declared output is ready.
    pub fn on_publish(&mut self, tensor: TensorId) -> bool {
        if let Some(pos) = self.graph.outputs().iter().position(|t| *t == tensor) {
            if !self.ready[pos] {
                self.ready[pos] = true;
                self.missing -= 1;
            }
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.missing == 0
    }

    /// Names of declared outputs that have not arrived.
    pub fn missing(&self) -> Vec<String> {
        self.graph
            .outputs()
            .iter()
            .zip(&self.ready)
            .filter(|(_, ready)| !**ready)
            .map(|(t, _)| self.graph.tensor(*t).name.clone())
            .collect()
    }

    /// Move every output out of the registry. Only valid once complete.
    pub fn build(&mut self, registry: &mut TensorRegistry) -> Result<EnsembleResponse> {
        let mut outputs = Vec::with_capacity(self.ready.len());
        for id in self.graph.outputs() {
            let tensor = registry.take(*id)?;
            outputs.push((IOName::new(self.graph.tensor(*id).name.as_str()), tensor));
        }
        self.settled = true;
        Ok(EnsembleResponse { outputs })
    }

    /// Give up on the response: release whatever outputs were already held.
    pub fn abandon(&mut self, registry: &mut TensorRegistry) {
        if self.settled {
            return;
        }
        self.settled = true;
        for id in self.graph.outputs() {
            registry.release(*id);
        }
    }
}
