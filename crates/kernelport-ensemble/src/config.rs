//! Declarative ensemble description.
//!
//! This is what a model repository hands over once it has resolved an
//! ensemble's configuration file. Only the graph shape is checked here
//! (see [`crate::StepGraph::build`]); everything else is taken as given.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use kernelport_core::{DType, VersionPolicy};
use serde::{Deserialize, Serialize};

/// `model_version` value meaning "whatever is newest at dispatch time".
pub const LATEST_VERSION: i64 = -1;

fn latest_version() -> i64 {
    LATEST_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnsembleConfig {
    pub name: String,

    /// Per-request deadline; no deadline when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    pub inputs: Vec<TensorDecl>,
    pub outputs: Vec<TensorDecl>,
    pub steps: Vec<StepConfig>,
}

/// An ensemble input or output. `dtype` and `dims` are optional; when given,
/// requests are checked against them (`-1` in `dims` matches any extent).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TensorDecl {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<DType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dims: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepConfig {
    /// Defaults to `<model_name>_<index>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub model_name: String,
    #[serde(default = "latest_version")]
    pub model_version: i64,
    /// model input name -> ensemble tensor name
    #[serde(default)]
    pub input_map: BTreeMap<String, String>,
    /// model output name -> ensemble tensor name
    #[serde(default)]
    pub output_map: BTreeMap<String, String>,
}

impl EnsembleConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout_ms: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Load configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Pick the parser from the file extension.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml(path),
            Some("json") => Self::from_json(path),
            _ => Err(anyhow!(
                "unsupported config format: {} (expected .yaml, .yml or .json)",
                path.display()
            )),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(TensorDecl::new(name));
        self
    }

    pub fn typed_input(mut self, name: impl Into<String>, dtype: DType, dims: &[i64]) -> Self {
        self.inputs.push(TensorDecl {
            name: name.into(),
            dtype: Some(dtype),
            dims: Some(dims.to_vec()),
        });
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(TensorDecl::new(name));
        self
    }

    pub fn step(mut self, step: StepConfig) -> Self {
        self.steps.push(step);
        self
    }
}

impl TensorDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dtype: None,
            dims: None,
        }
    }
}

impl StepConfig {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            name: None,
            model_name: model_name.into(),
            model_version: LATEST_VERSION,
            input_map: BTreeMap::new(),
            output_map: BTreeMap::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn version(mut self, version: i64) -> Self {
        self.model_version = version;
        self
    }

    /// Bind ensemble tensor `tensor` to the model input `model_input`.
    pub fn input(mut self, model_input: impl Into<String>, tensor: impl Into<String>) -> Self {
        self.input_map.insert(model_input.into(), tensor.into());
        self
    }

    /// Publish the model output `model_output` as ensemble tensor `tensor`.
    pub fn output(mut self, model_output: impl Into<String>, tensor: impl Into<String>) -> Self {
        self.output_map.insert(model_output.into(), tensor.into());
        self
    }

    pub fn step_name(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.model_name, index))
    }

    /// `None` for versions that are neither `-1` nor positive.
    pub fn version_policy(&self) -> Option<VersionPolicy> {
        match self.model_version {
            LATEST_VERSION => Some(VersionPolicy::Latest),
            v if v >= 1 => Some(VersionPolicy::Pinned(v as u64)),
            _ => None,
        }
    }
}
