mod cli;
mod registry;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use kernelport_ensemble::{EnsembleConfig, EnsembleModel, StatsAggregator, StepGraph};
use kernelport_runtime::ModelRepository;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Check { config, log } => {
            init_tracing(&log)?;
            check(&config)
        }
        Command::Run {
            config,
            requests,
            instances,
            log,
        } => {
            init_tracing(&log)?;
            run(&config, requests, instances.max(1)).await
        }
    }
}

fn init_tracing(log: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log).with_context(|| format!("invalid log filter '{log}'"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn check(path: &Path) -> Result<()> {
    let config = EnsembleConfig::from_path(path)?;
    let graph = StepGraph::build(&config)
        .with_context(|| format!("invalid ensemble in {}", path.display()))?;
    print!("{graph}");
    let order: Vec<&str> = graph
        .topological_order()
        .iter()
        .map(|id| graph.step(*id).name.as_str())
        .collect();
    println!("order: {}", order.join(" -> "));
    Ok(())
}

async fn run(path: &Path, requests: usize, instances: usize) -> Result<()> {
    let config = EnsembleConfig::from_path(path)?;
    let repo = Arc::new(ModelRepository::new());
    let stats = Arc::new(StatsAggregator::new());
    let model = EnsembleModel::create(1, &config, repo.clone(), stats.clone())
        .with_context(|| format!("invalid ensemble in {}", path.display()))?;
    registry::load_passthrough(&repo, model.graph(), instances)?;

    let inputs = registry::zero_inputs(model.graph());
    info!(ensemble = model.name(), requests, "sending requests");
    let t0 = Instant::now();
    let results =
        futures::future::join_all((0..requests).map(|_| model.infer(inputs.clone()))).await;
    let elapsed = t0.elapsed();

    let mut failed = 0;
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        if failed == 0 {
            warn!(error = %err, "request failed");
        }
        failed += 1;
    }

    // Failed requests may still be draining dispatched steps.
    model.scheduler().drained().await;

    let snapshot = stats.snapshot();
    print!("{model}");
    println!(
        "requests: {} ok, {} failed, {:?} wall",
        requests - failed,
        failed,
        elapsed
    );
    for (step, s) in &snapshot.steps {
        println!(
            "  {step}: ok={} failed={} suppressed={} mean={:?}",
            s.success,
            s.failure,
            s.suppressed,
            s.mean_latency().unwrap_or_default()
        );
    }
    Ok(())
}
