#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::FutureExt;
use kernelport_core::{
    IOName, InvokeFuture, ModelId, ModelInvoker, NamedTensors, Shape, Tensor,
};
use kernelport_ensemble::EnsembleScheduler;
use tokio::sync::{mpsc, oneshot};

pub fn f32s(values: &[f32]) -> Tensor {
    Tensor::from_f32(Shape::from_slice(&[values.len()]), values)
}

pub fn named(name: &str, values: &[f32]) -> (IOName, Tensor) {
    (IOName::new(name), f32s(values))
}

fn input<'a>(inputs: &'a NamedTensors, name: &str) -> Result<&'a Tensor> {
    inputs
        .iter()
        .find(|(n, _)| n.as_str() == name)
        .map(|(_, t)| t)
        .with_context(|| format!("missing input '{name}'"))
}

/// Elementwise models keyed by name. Every model reads `x` (or `l`/`r`) and
/// writes `y`:
///
/// - `inc`: x + 1
/// - `double`: 2x
/// - `sum`: l + r
/// - `fail`: always errors
///
/// A model name may carry a delay suffix in milliseconds, e.g. `inc@5`. The
/// first input element adds a few milliseconds of jitter so completions of
/// concurrent requests interleave.
#[derive(Default)]
pub struct ArithmeticInvoker {
    log: Mutex<Vec<String>>,
}

impl ArithmeticInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

fn compute(op: &str, inputs: &NamedTensors) -> Result<NamedTensors> {
    let y: Vec<f32> = match op {
        "inc" => input(inputs, "x")?.to_f32()?.iter().map(|v| v + 1.0).collect(),
        "double" => input(inputs, "x")?.to_f32()?.iter().map(|v| v * 2.0).collect(),
        "sum" => {
            let l = input(inputs, "l")?.to_f32()?;
            let r = input(inputs, "r")?.to_f32()?;
            l.iter().zip(&r).map(|(a, b)| a + b).collect::<Vec<f32>>()
        }
        "fail" => bail!("model exploded"),
        other => bail!("unknown model '{other}'"),
    };
    Ok(vec![(IOName::new("y"), f32s(&y))])
}

impl ModelInvoker for ArithmeticInvoker {
    fn invoke(&self, model: &ModelId, inputs: NamedTensors) -> InvokeFuture {
        self.log.lock().unwrap().push(model.name.clone());
        let (op, delay_ms) = match model.name.split_once('@') {
            Some((op, ms)) => (op.to_string(), ms.parse::<u64>().unwrap_or(0)),
            None => (model.name.clone(), 0),
        };
        async move {
            let jitter = inputs
                .first()
                .and_then(|(_, t)| t.to_f32().ok())
                .and_then(|v| v.first().copied())
                .map(|v| (v.abs() as u64) % 7)
                .unwrap_or(0);
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
            }
            compute(&op, &inputs)
        }
        .boxed()
    }
}

/// One sub-model call captured by [`GatedInvoker`], answered by the test.
pub struct Call {
    pub model: String,
    pub inputs: NamedTensors,
    reply: oneshot::Sender<Result<NamedTensors>>,
}

impl Call {
    pub fn input(&self, name: &str) -> Vec<f32> {
        input(&self.inputs, name).unwrap().to_f32().unwrap()
    }

    pub fn reply(self, outputs: NamedTensors) {
        let _ = self.reply.send(Ok(outputs));
    }

    /// Answer with `y = x + 1` (or `y = l + r` for joins).
    pub fn pass(self) {
        let out = compute(
            if self.inputs.len() == 2 { "sum" } else { "inc" },
            &self.inputs,
        )
        .unwrap();
        self.reply(out);
    }

    pub fn fail(self, msg: &str) {
        let _ = self.reply.send(Err(anyhow!(msg.to_string())));
    }
}

/// Hands every call to the test through a channel and waits for its answer.
pub struct GatedInvoker {
    tx: mpsc::UnboundedSender<Call>,
}

pub fn gated() -> (Arc<GatedInvoker>, mpsc::UnboundedReceiver<Call>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(GatedInvoker { tx }), rx)
}

impl ModelInvoker for GatedInvoker {
    fn invoke(&self, model: &ModelId, inputs: NamedTensors) -> InvokeFuture {
        let (reply, rx) = oneshot::channel();
        let sent = self.tx.send(Call {
            model: model.name.clone(),
            inputs,
            reply,
        });
        async move {
            if sent.is_err() {
                bail!("test harness went away");
            }
            rx.await.map_err(|_| anyhow!("test dropped the call"))?
        }
        .boxed()
    }
}

pub async fn next_call(calls: &mut mpsc::UnboundedReceiver<Call>) -> Call {
    tokio::time::timeout(Duration::from_secs(5), calls.recv())
        .await
        .expect("timed out waiting for a dispatch")
        .expect("invoker dropped")
}

/// Asserts that nothing is dispatched for a short while.
pub async fn no_call(calls: &mut mpsc::UnboundedReceiver<Call>) {
    if let Ok(Some(call)) = tokio::time::timeout(Duration::from_millis(50), calls.recv()).await {
        panic!("unexpected dispatch of '{}'", call.model);
    }
}

pub async fn drained(scheduler: &EnsembleScheduler) {
    if tokio::time::timeout(Duration::from_secs(2), scheduler.drained())
        .await
        .is_err()
    {
        panic!("{} request(s) never drained", scheduler.in_flight());
    }
}
