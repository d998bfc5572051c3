//! Compile-time step graph.
//!
//! [`StepGraph::build`] turns an [`EnsembleConfig`] into an immutable DAG that
//! every request of the ensemble shares read-only. Tensors and steps are
//! interned to dense indices so per-request state can live in plain vectors.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use kernelport_core::{IOName, ModelId};
use tracing::{debug, warn};

use crate::config::{EnsembleConfig, TensorDecl};
use crate::error::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub usize);

#[derive(Clone, Debug)]
pub struct InputBinding {
    pub tensor: TensorId,
    pub model_input: IOName,
}

#[derive(Clone, Debug)]
pub struct OutputBinding {
    pub model_output: IOName,
    pub tensor: TensorId,
}

#[derive(Clone, Debug)]
pub struct StepDescriptor {
    pub id: StepId,
    pub name: String,
    pub model: ModelId,
    pub inputs: Vec<InputBinding>,
    pub outputs: Vec<OutputBinding>,
    /// Distinct tensors this step waits for; its readiness count is `required.len()`.
    pub required: Vec<TensorId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Producer {
    External,
    Step(StepId),
}

#[derive(Clone, Debug)]
pub struct TensorNode {
    pub name: String,
    pub producer: Producer,
    /// Steps waiting on this tensor, each listed once.
    pub consumers: Vec<StepId>,
    pub is_output: bool,
}

#[derive(Debug)]
pub struct StepGraph {
    name: String,
    steps: Vec<StepDescriptor>,
    tensors: Vec<TensorNode>,
    by_name: HashMap<String, TensorId>,
    inputs: Vec<(TensorId, TensorDecl)>,
    outputs: Vec<TensorId>,
    order: Vec<StepId>,
    timeout: Option<Duration>,
}

fn describe(producer: Producer, steps: &[StepDescriptor]) -> String {
    match producer {
        Producer::External => "the ensemble input".to_string(),
        Producer::Step(id) => format!("step '{}'", steps[id.0].name),
    }
}

impl StepGraph {
    /// Validate `config` and compile it.
    ///
    /// Checks run in a fixed order so the reported error is stable:
    /// unresolved inputs, duplicate producers, cycles, then unproduced outputs.
    pub fn build(config: &EnsembleConfig) -> Result<Self, ConfigError> {
        if config.steps.is_empty() {
            return Err(ConfigError::NoSteps(config.name.clone()));
        }
        if config.inputs.is_empty() {
            return Err(ConfigError::NoInputs(config.name.clone()));
        }
        if config.outputs.is_empty() {
            return Err(ConfigError::NoOutputs(config.name.clone()));
        }

        let mut names = HashSet::new();
        for (idx, step) in config.steps.iter().enumerate() {
            let name = step.step_name(idx);
            if !names.insert(name.clone()) {
                return Err(ConfigError::DuplicateStep(name));
            }
            if step.model_name == config.name {
                return Err(ConfigError::SelfReference {
                    step: name,
                    ensemble: config.name.clone(),
                });
            }
        }

        let mut tensors: Vec<(String, Option<Producer>)> = Vec::new();
        let mut by_name: HashMap<String, TensorId> = HashMap::new();
        let mut intern = |name: &str, tensors: &mut Vec<(String, Option<Producer>)>| {
            *by_name.entry(name.to_string()).or_insert_with(|| {
                tensors.push((name.to_string(), None));
                TensorId(tensors.len() - 1)
            })
        };

        // Producers are claimed first-come; the first collision is kept for
        // reporting after unresolved inputs have been checked.
        let mut duplicate: Option<(TensorId, Producer, Producer)> = None;
        let mut claim = |id: TensorId,
                         producer: Producer,
                         tensors: &mut Vec<(String, Option<Producer>)>| {
            let current = tensors[id.0].1;
            match current {
                None => tensors[id.0].1 = Some(producer),
                Some(existing) => {
                    if duplicate.is_none() {
                        duplicate = Some((id, existing, producer));
                    }
                }
            }
        };

        let mut inputs = Vec::with_capacity(config.inputs.len());
        for decl in &config.inputs {
            let id = intern(&decl.name, &mut tensors);
            claim(id, Producer::External, &mut tensors);
            inputs.push((id, decl.clone()));
        }

        let mut steps = Vec::with_capacity(config.steps.len());
        for (idx, step) in config.steps.iter().enumerate() {
            let name = step.step_name(idx);
            let version = step
                .version_policy()
                .ok_or_else(|| ConfigError::InvalidVersion {
                    step: name.clone(),
                    version: step.model_version,
                })?;

            let mut bound_inputs = Vec::with_capacity(step.input_map.len());
            let mut required = Vec::new();
            for (model_input, tensor) in &step.input_map {
                let id = intern(tensor, &mut tensors);
                bound_inputs.push(InputBinding {
                    tensor: id,
                    model_input: IOName::new(model_input.as_str()),
                });
                if !required.contains(&id) {
                    required.push(id);
                }
            }

            let mut bound_outputs = Vec::with_capacity(step.output_map.len());
            for (model_output, tensor) in &step.output_map {
                let id = intern(tensor, &mut tensors);
                claim(id, Producer::Step(StepId(idx)), &mut tensors);
                bound_outputs.push(OutputBinding {
                    model_output: IOName::new(model_output.as_str()),
                    tensor: id,
                });
            }

            steps.push(StepDescriptor {
                id: StepId(idx),
                name,
                model: ModelId {
                    name: step.model_name.clone(),
                    version,
                },
                inputs: bound_inputs,
                outputs: bound_outputs,
                required,
            });
        }

        // (1) every consumed tensor has a producer
        for step in &steps {
            for binding in &step.inputs {
                if tensors[binding.tensor.0].1.is_none() {
                    return Err(ConfigError::UnresolvedInput {
                        step: step.name.clone(),
                        tensor: tensors[binding.tensor.0].0.clone(),
                    });
                }
            }
        }

        // (2) at most one producer per tensor
        if let Some((id, first, second)) = duplicate {
            return Err(ConfigError::DuplicateProducer {
                tensor: tensors[id.0].0.clone(),
                first: describe(first, &steps),
                second: describe(second, &steps),
            });
        }

        let mut nodes: Vec<TensorNode> = tensors
            .into_iter()
            .map(|(name, producer)| TensorNode {
                name,
                // Every tensor is either consumed (checked above) or produced.
                producer: producer.unwrap_or(Producer::External),
                consumers: Vec::new(),
                is_output: false,
            })
            .collect();
        for step in &steps {
            for id in &step.required {
                nodes[id.0].consumers.push(step.id);
            }
        }

        // (3) acyclic
        let order = topological_order(&steps, &nodes)?;

        // (4) every declared output comes from a step
        let mut outputs = Vec::with_capacity(config.outputs.len());
        for decl in &config.outputs {
            let id = by_name
                .get(&decl.name)
                .copied()
                .filter(|id| matches!(nodes[id.0].producer, Producer::Step(_)))
                .ok_or_else(|| ConfigError::UnproducedOutput {
                    tensor: decl.name.clone(),
                })?;
            if nodes[id.0].is_output {
                return Err(ConfigError::DuplicateOutput(decl.name.clone()));
            }
            nodes[id.0].is_output = true;
            outputs.push(id);
        }

        for (id, _) in &inputs {
            if nodes[id.0].consumers.is_empty() {
                warn!(ensemble = %config.name, tensor = %nodes[id.0].name, "ensemble input is not used by any step");
            }
        }
        for node in &nodes {
            if matches!(node.producer, Producer::Step(_)) && node.consumers.is_empty() && !node.is_output {
                debug!(ensemble = %config.name, tensor = %node.name, "step output is discarded");
            }
        }

        Ok(Self {
            name: config.name.clone(),
            steps,
            tensors: nodes,
            by_name,
            inputs,
            outputs,
            order,
            timeout: config.timeout(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[StepDescriptor] {
        &self.steps
    }

    pub fn step(&self, id: StepId) -> &StepDescriptor {
        &self.steps[id.0]
    }

    pub fn step_by_name(&self, name: &str) -> Option<&StepDescriptor> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    pub fn tensor(&self, id: TensorId) -> &TensorNode {
        &self.tensors[id.0]
    }

    pub fn tensor_id(&self, name: &str) -> Option<TensorId> {
        self.by_name.get(name).copied()
    }

    pub fn inputs(&self) -> &[(TensorId, TensorDecl)] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    /// Steps in an order where every producer precedes its consumers.
    pub fn topological_order(&self) -> &[StepId] {
        &self.order
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl fmt::Display for StepGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ensemble {}", self.name)?;
        for id in &self.order {
            let step = self.step(*id);
            let ins: Vec<&str> = step
                .required
                .iter()
                .map(|t| self.tensor(*t).name.as_str())
                .collect();
            let outs: Vec<&str> = step
                .outputs
                .iter()
                .map(|b| self.tensor(b.tensor).name.as_str())
                .collect();
            writeln!(
                f,
                "  {} [{}] ({}) -> ({})",
                step.name,
                step.model,
                ins.join(", "),
                outs.join(", ")
            )?;
        }
        Ok(())
    }
}

/// Kahn's algorithm over the step-to-step dependency relation.
fn topological_order(
    steps: &[StepDescriptor],
    tensors: &[TensorNode],
) -> Result<Vec<StepId>, ConfigError> {
    let mut successors: Vec<BTreeSet<StepId>> = vec![BTreeSet::new(); steps.len()];
    let mut indegree = vec![0usize; steps.len()];
    for step in steps {
        let mut preds = BTreeSet::new();
        for id in &step.required {
            if let Producer::Step(p) = tensors[id.0].producer {
                preds.insert(p);
            }
        }
        indegree[step.id.0] = preds.len();
        for p in preds {
            successors[p.0].insert(step.id);
        }
    }

    let mut queue: VecDeque<StepId> = steps
        .iter()
        .filter(|s| indegree[s.id.0] == 0)
        .map(|s| s.id)
        .collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(id) = queue.pop_front() {
        order.push(id);
        for next in &successors[id.0] {
            indegree[next.0] -= 1;
            if indegree[next.0] == 0 {
                queue.push_back(*next);
            }
        }
    }

    if order.len() < steps.len() {
        // Leftovers include steps merely downstream of a cycle; keep the ones on it.
        let stuck: Vec<bool> = indegree.iter().map(|d| *d > 0).collect();
        return Err(ConfigError::Cycle {
            steps: steps
                .iter()
                .filter(|s| stuck[s.id.0] && on_cycle(s.id, &successors, &stuck))
                .map(|s| s.name.clone())
                .collect(),
        });
    }
    Ok(order)
}

/// Whether `start` can reach itself through stuck steps.
fn on_cycle(start: StepId, successors: &[BTreeSet<StepId>], stuck: &[bool]) -> bool {
    let mut seen = vec![false; successors.len()];
    let mut stack: Vec<StepId> = successors[start.0].iter().copied().collect();
    while let Some(id) = stack.pop() {
        if id == start {
            return true;
        }
        if !stuck[id.0] || seen[id.0] {
            continue;
        }
        seen[id.0] = true;
        stack.extend(successors[id.0].iter().copied());
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StepConfig;

    fn chain() -> EnsembleConfig {
        EnsembleConfig::new("chain")
            .input("IN")
            .output("OUT")
            .step(StepConfig::new("a").named("A").input("x", "IN").output("y", "t1"))
            .step(StepConfig::new("b").named("B").input("x", "t1").output("y", "t2"))
            .step(StepConfig::new("c").named("C").input("x", "t2").output("y", "OUT"))
    }

    fn position(graph: &StepGraph, name: &str) -> usize {
        let id = graph.step_by_name(name).unwrap().id;
        graph
            .topological_order()
            .iter()
            .position(|s| *s == id)
            .unwrap()
    }

    #[test]
    fn builds_linear_chain() {
        let graph = StepGraph::build(&chain()).unwrap();
        assert_eq!(graph.steps().len(), 3);
        assert_eq!(graph.outputs().len(), 1);
        assert!(position(&graph, "A") < position(&graph, "B"));
        assert!(position(&graph, "B") < position(&graph, "C"));

        let t1 = graph.tensor_id("t1").unwrap();
        let b = graph.step_by_name("B").unwrap().id;
        assert_eq!(graph.tensor(t1).producer, Producer::Step(StepId(0)));
        assert_eq!(graph.tensor(t1).consumers, vec![b]);
        assert!(graph.tensor(graph.tensor_id("OUT").unwrap()).is_output);
    }

    #[test]
    fn topological_order_respects_every_edge() {
        // Declared out of dependency order on purpose.
        let config = EnsembleConfig::new("diamond")
            .input("IN")
            .output("OUT")
            .step(StepConfig::new("m").named("D").input("l", "b").input("r", "c").output("y", "OUT"))
            .step(StepConfig::new("m").named("B").input("x", "a").output("y", "b"))
            .step(StepConfig::new("m").named("C").input("x", "a").output("y", "c"))
            .step(StepConfig::new("m").named("A").input("x", "IN").output("y", "a"));
        let graph = StepGraph::build(&config).unwrap();
        assert_eq!(graph.topological_order().len(), 4);
        for step in graph.steps() {
            for t in &step.required {
                if let Producer::Step(p) = graph.tensor(*t).producer {
                    let pp = graph.topological_order().iter().position(|s| *s == p);
                    let cp = graph.topological_order().iter().position(|s| *s == step.id);
                    assert!(pp < cp, "{} must precede {}", graph.step(p).name, step.name);
                }
            }
        }
        let d = graph.step_by_name("D").unwrap();
        assert_eq!(d.required.len(), 2);
    }

    #[test]
    fn same_tensor_bound_twice_counts_once() {
        let config = EnsembleConfig::new("e")
            .input("IN")
            .output("OUT")
            .step(StepConfig::new("add").input("lhs", "IN").input("rhs", "IN").output("sum", "OUT"));
        let graph = StepGraph::build(&config).unwrap();
        let step = &graph.steps()[0];
        assert_eq!(step.inputs.len(), 2);
        assert_eq!(step.required.len(), 1);
        assert_eq!(graph.tensor(graph.tensor_id("IN").unwrap()).consumers.len(), 1);
    }

    #[test]
    fn unresolved_input_names_step_and_tensor() {
        let config = EnsembleConfig::new("e")
            .input("IN")
            .output("OUT")
            .step(StepConfig::new("m").named("S").input("x", "missing").output("y", "OUT"));
        assert_eq!(
            StepGraph::build(&config).unwrap_err(),
            ConfigError::UnresolvedInput {
                step: "S".into(),
                tensor: "missing".into()
            }
        );
    }

    #[test]
    fn duplicate_producer_is_rejected() {
        let config = EnsembleConfig::new("e")
            .input("IN")
            .output("OUT")
            .step(StepConfig::new("m").named("S1").input("x", "IN").output("y", "OUT"))
            .step(StepConfig::new("m").named("S2").input("x", "IN").output("y", "OUT"));
        match StepGraph::build(&config).unwrap_err() {
            ConfigError::DuplicateProducer { tensor, first, second } => {
                assert_eq!(tensor, "OUT");
                assert_eq!(first, "step 'S1'");
                assert_eq!(second, "step 'S2'");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn step_output_shadowing_input_is_duplicate_producer() {
        let config = EnsembleConfig::new("e")
            .input("IN")
            .output("OUT")
            .step(StepConfig::new("m").input("x", "IN").output("y", "OUT").output("z", "IN"));
        assert!(matches!(
            StepGraph::build(&config),
            Err(ConfigError::DuplicateProducer { tensor, .. }) if tensor == "IN"
        ));
    }

    #[test]
    fn unresolved_input_reported_before_duplicate_producer() {
        let config = EnsembleConfig::new("e")
            .input("IN")
            .output("OUT")
            .step(StepConfig::new("m").named("S1").input("x", "IN").output("y", "OUT"))
            .step(StepConfig::new("m").named("S2").input("x", "nope").output("y", "OUT"));
        assert!(matches!(
            StepGraph::build(&config),
            Err(ConfigError::UnresolvedInput { .. })
        ));
    }

    #[test]
    fn cycle_is_detected() {
        let config = EnsembleConfig::new("e")
            .input("IN")
            .output("OUT")
            .step(StepConfig::new("m").named("A").input("x", "IN").input("fb", "c").output("y", "a"))
            .step(StepConfig::new("m").named("B").input("x", "a").output("y", "b"))
            .step(StepConfig::new("m").named("C").input("x", "b").output("y", "c").output("z", "OUT"));
        match StepGraph::build(&config).unwrap_err() {
            ConfigError::Cycle { steps } => assert_eq!(steps, vec!["A", "B", "C"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cycle_report_leaves_out_downstream_steps() {
        let config = EnsembleConfig::new("e")
            .input("IN")
            .output("OUT")
            .step(StepConfig::new("m").named("A").input("x", "IN").input("fb", "b").output("y", "a"))
            .step(StepConfig::new("m").named("B").input("x", "a").output("y", "b"))
            .step(StepConfig::new("m").named("C").input("x", "b").output("y", "c"))
            .step(StepConfig::new("m").named("D").input("x", "c").output("y", "OUT"));
        match StepGraph::build(&config).unwrap_err() {
            ConfigError::Cycle { steps } => assert_eq!(steps, vec!["A", "B"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let config = EnsembleConfig::new("e")
            .input("IN")
            .output("OUT")
            .step(StepConfig::new("m").named("S").input("x", "IN").input("h", "OUT").output("y", "OUT"));
        assert!(matches!(
            StepGraph::build(&config),
            Err(ConfigError::Cycle { steps }) if steps == vec!["S".to_string()]
        ));
    }

    #[test]
    fn outputs_must_come_from_steps() {
        let unproduced = chain().output("nowhere");
        assert_eq!(
            StepGraph::build(&unproduced).unwrap_err(),
            ConfigError::UnproducedOutput {
                tensor: "nowhere".into()
            }
        );

        let passthrough = chain().output("IN");
        assert!(matches!(
            StepGraph::build(&passthrough),
            Err(ConfigError::UnproducedOutput { tensor }) if tensor == "IN"
        ));

        let twice = chain().output("OUT");
        assert_eq!(
            StepGraph::build(&twice).unwrap_err(),
            ConfigError::DuplicateOutput("OUT".into())
        );
    }

    #[test]
    fn structural_checks() {
        assert!(matches!(
            StepGraph::build(&EnsembleConfig::new("e").input("IN").output("OUT")),
            Err(ConfigError::NoSteps(_))
        ));

        let dup = chain().step(StepConfig::new("z").named("A").input("x", "IN"));
        assert_eq!(
            StepGraph::build(&dup).unwrap_err(),
            ConfigError::DuplicateStep("A".into())
        );

        let recursive = chain().step(StepConfig::new("chain").input("x", "IN"));
        assert!(matches!(
            StepGraph::build(&recursive),
            Err(ConfigError::SelfReference { .. })
        ));

        let mut bad_version = chain();
        bad_version.steps[1].model_version = 0;
        assert_eq!(
            StepGraph::build(&bad_version).unwrap_err(),
            ConfigError::InvalidVersion {
                step: "B".into(),
                version: 0
            }
        );
    }

    #[test]
    fn display_lists_steps_in_order() {
        let graph = StepGraph::build(&chain()).unwrap();
        let text = graph.to_string();
        assert!(text.starts_with("ensemble chain\n"));
        assert!(text.contains("  A [a:latest] (IN) -> (t1)"));
    }
}
