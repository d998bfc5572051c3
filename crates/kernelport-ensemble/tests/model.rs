use std::sync::Arc;

use anyhow::Result;
use kernelport_core::{BackendModel, DType, IOName, ModelSpec, Shape, Tensor, TensorSpec};
use kernelport_ensemble::{
    ConfigError, EnsembleConfig, EnsembleError, EnsembleModel, NoopStats, StatsAggregator,
};
use kernelport_runtime::ModelRepository;

fn f32_spec(inputs: &[&str], outputs: &[&str]) -> ModelSpec {
    let t = |n: &&str| TensorSpec {
        name: IOName::new(*n),
        dtype: DType::F32,
        dims: vec![None],
    };
    ModelSpec {
        inputs: inputs.iter().map(t).collect(),
        outputs: outputs.iter().map(t).collect(),
    }
}

/// `OUTPUT = INPUT * factor`
struct Scale {
    spec: ModelSpec,
    factor: f32,
}

impl Scale {
    fn boxed(factor: f32) -> Box<dyn BackendModel> {
        Box::new(Scale {
            spec: f32_spec(&["INPUT"], &["OUTPUT"]),
            factor,
        })
    }
}

impl BackendModel for Scale {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn infer(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        let out: Vec<f32> = inputs[0].to_f32()?.iter().map(|v| v * self.factor).collect();
        Ok(vec![Tensor::from_f32(Shape::from_slice(&[out.len()]), &out)])
    }
}

/// `SUM = A + B`, `DIFF = A - B`
struct AddSub {
    spec: ModelSpec,
}

impl BackendModel for AddSub {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    fn infer(&mut self, inputs: Vec<Tensor>) -> Result<Vec<Tensor>> {
        let a = inputs[0].to_f32()?;
        let b = inputs[1].to_f32()?;
        let sum: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
        let diff: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x - y).collect();
        let shape = Shape::from_slice(&[a.len()]);
        Ok(vec![
            Tensor::from_f32(shape.clone(), &sum),
            Tensor::from_f32(shape, &diff),
        ])
    }
}

const PIPELINE: &str = r#"
name: pipeline
inputs:
  - name: RAW
    dtype: f32
    dims: [-1]
outputs:
  - name: SUM
  - name: DIFF
steps:
  - name: left
    model_name: scale
    model_version: 1
    input_map: { INPUT: RAW }
    output_map: { OUTPUT: scaled_1 }
  - name: right
    model_name: scale
    input_map: { INPUT: RAW }
    output_map: { OUTPUT: scaled_latest }
  - name: combine
    model_name: addsub
    input_map: { A: scaled_latest, B: scaled_1 }
    output_map: { SUM: SUM, DIFF: DIFF }
"#;

fn parse(yaml: &str) -> EnsembleConfig {
    serde_yaml::from_str(yaml).unwrap()
}

fn repository() -> Arc<ModelRepository> {
    let repo = Arc::new(ModelRepository::new());
    repo.load("scale", 1, vec![Scale::boxed(1.0)]).unwrap();
    repo.load("scale", 2, vec![Scale::boxed(2.0), Scale::boxed(2.0)])
        .unwrap();
    repo.load(
        "addsub",
        1,
        vec![Box::new(AddSub {
            spec: f32_spec(&["A", "B"], &["SUM", "DIFF"]),
        })],
    )
    .unwrap();
    repo
}

fn raw(values: &[f32]) -> Vec<(IOName, Tensor)> {
    vec![(
        IOName::new("RAW"),
        Tensor::from_f32(Shape::from_slice(&[values.len()]), values),
    )]
}

#[tokio::test(flavor = "multi_thread")]
async fn ensemble_over_loaded_models() {
    let repo = repository();
    let stats = Arc::new(StatsAggregator::new());
    let config = parse(PIPELINE);
    let model = EnsembleModel::create(1, &config, repo, stats.clone()).unwrap();

    assert_eq!(model.to_string(), "name=pipeline\n");
    assert_eq!(model.version(), 1);

    let resp = model.infer(raw(&[1.0, 3.0])).await.unwrap();
    let names: Vec<_> = resp.outputs.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["SUM", "DIFF"]);
    assert_eq!(resp.get("SUM").unwrap().to_f32().unwrap(), vec![3.0, 9.0]);
    assert_eq!(resp.get("DIFF").unwrap().to_f32().unwrap(), vec![1.0, 3.0]);
}

#[tokio::test(flavor = "multi_thread")]
async fn latest_version_follows_the_repository() {
    let repo = repository();
    let config = parse(PIPELINE);
    let model =
        EnsembleModel::create(1, &config, repo.clone(), Arc::new(NoopStats)).unwrap();

    let before = model.infer(raw(&[1.0])).await.unwrap();
    assert_eq!(before.get("SUM").unwrap().to_f32().unwrap(), vec![3.0]);

    repo.load("scale", 5, vec![Scale::boxed(5.0)]).unwrap();
    let after = model.infer(raw(&[1.0])).await.unwrap();
    assert_eq!(after.get("SUM").unwrap().to_f32().unwrap(), vec![6.0]);

    // Pinned steps fail once their version is gone.
    assert!(repo.unload("scale", 1));
    let err = model.infer(raw(&[1.0])).await.unwrap_err();
    assert_eq!(err.failed_step(), Some("left"));
    assert!(err.to_string().contains("version 1 is not available"), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn mistyped_inputs_never_reach_backends() {
    let repo = repository();
    let config = parse(PIPELINE);
    let model = EnsembleModel::create(1, &config, repo, Arc::new(NoopStats)).unwrap();

    let ints = vec![(
        IOName::new("RAW"),
        Tensor::zeros(DType::I32, Shape::from_slice(&[2])),
    )];
    assert!(matches!(
        model.infer(ints).await,
        Err(EnsembleError::InvalidRequest(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_model_is_a_step_failure() {
    let repo = repository();
    let config = parse(&PIPELINE.replace("model_name: addsub", "model_name: nope"));
    let model = EnsembleModel::create(1, &config, repo, Arc::new(NoopStats)).unwrap();

    let err = model.infer(raw(&[1.0])).await.unwrap_err();
    assert_eq!(err.failed_step(), Some("combine"));
    assert!(err.to_string().contains("'nope' is not loaded"), "{err}");
}

#[test]
fn invalid_configuration_is_rejected_at_load() {
    let repo = Arc::new(ModelRepository::new());
    let config = parse(&PIPELINE.replace("B: scaled_1", "B: nowhere"));
    let err = EnsembleModel::create(1, &config, repo.clone(), Arc::new(NoopStats))
        .err()
        .unwrap();
    assert!(matches!(err, ConfigError::UnresolvedInput { ref tensor, .. } if tensor == "nowhere"));

    let config =
        parse(&PIPELINE.replace("model_name: addsub", "model_name: pipeline"));
    let err = EnsembleModel::create(1, &config, repo, Arc::new(NoopStats))
        .err()
        .unwrap();
    assert!(matches!(err, ConfigError::SelfReference { .. }));
}
