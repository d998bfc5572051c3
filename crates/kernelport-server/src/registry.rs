use std::collections::BTreeMap;

use anyhow::{bail, Result};
use kernelport_core::{
    BackendModel, DType, IOName, ModelSpec, Shape, Tensor, TensorSpec, VersionPolicy,
};
use kernelport_ensemble::StepGraph;
use kernelport_runtime::ModelRepository;
use tracing::info;

/// Copies its first input (by name) to every output.
pub struct PassthroughModel {
    spec: ModelSpec,
}

impl BackendModel for PassthroughModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn infer(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        let first = match inputs.into_iter().next() {
            Some(t) => t,
            None => Tensor::zeros(DType::F32, Shape::from_slice(&[1])),
        };
        Ok(vec![first; self.spec.outputs.len()])
    }
}

type Signature = (Vec<(IOName, DType)>, Vec<(IOName, DType)>);

/// Serve every model `graph` calls with [`PassthroughModel`]s.
///
/// Dtypes are propagated from the ensemble inputs (`f32` when undeclared)
/// through the steps in dependency order. Latest-version steps get version 1.
pub fn load_passthrough(repo: &ModelRepository, graph: &StepGraph, instances: usize) -> Result<()> {
    let mut dtypes = vec![DType::F32; graph.tensor_count()];
    for (id, decl) in graph.inputs() {
        dtypes[id.0] = decl.dtype.unwrap_or(DType::F32);
    }

    let mut models: BTreeMap<(String, u64), Signature> = BTreeMap::new();
    for id in graph.topological_order() {
        let step = graph.step(*id);
        let mut inputs: Vec<(IOName, DType)> = step
            .inputs
            .iter()
            .map(|b| (b.model_input.clone(), dtypes[b.tensor.0]))
            .collect();
        inputs.sort_by(|a, b| a.0.cmp(&b.0));
        let out_dtype = inputs.first().map_or(DType::F32, |(_, d)| *d);
        let mut outputs: Vec<(IOName, DType)> = Vec::with_capacity(step.outputs.len());
        for binding in &step.outputs {
            dtypes[binding.tensor.0] = out_dtype;
            outputs.push((binding.model_output.clone(), out_dtype));
        }
        outputs.sort_by(|a, b| a.0.cmp(&b.0));

        let version = match step.model.version {
            VersionPolicy::Latest => 1,
            VersionPolicy::Pinned(v) => v,
        };
        let key = (step.model.name.clone(), version);
        let signature = (inputs, outputs);
        match models.get(&key) {
            Some(existing) if *existing != signature => bail!(
                "model '{}' version {} is bound with different inputs or outputs by step '{}'",
                key.0,
                key.1,
                step.name
            ),
            Some(_) => {}
            None => {
                models.insert(key, signature);
            }
        }
    }

    for ((name, version), (inputs, outputs)) in models {
        let spec = ModelSpec {
            inputs: inputs.into_iter().map(tensor_spec).collect(),
            outputs: outputs.into_iter().map(tensor_spec).collect(),
        };
        let pool = (0..instances)
            .map(|_| Box::new(PassthroughModel { spec: spec.clone() }) as Box<dyn BackendModel>)
            .collect();
        repo.load(&name, version, pool)?;
        info!(model = %name, version, instances, "passthrough model ready");
    }
    Ok(())
}

fn tensor_spec((name, dtype): (IOName, DType)) -> TensorSpec {
    TensorSpec {
        name,
        dtype,
        dims: Vec::new(),
    }
}

/// One zero-filled tensor per ensemble input. Wildcard and undeclared
/// extents become 1.
pub fn zero_inputs(graph: &StepGraph) -> Vec<(IOName, Tensor)> {
    graph
        .inputs()
        .iter()
        .map(|(_, decl)| {
            let dims: Vec<usize> = match &decl.dims {
                Some(dims) => dims.iter().map(|d| (*d).max(1) as usize).collect(),
                None => vec![1],
            };
            let dtype = decl.dtype.unwrap_or(DType::F32);
            (
                IOName::new(decl.name.as_str()),
                Tensor::zeros(dtype, Shape::from_slice(&dims)),
            )
        })
        .collect()
}
