//! Ensemble execution for kernelport.
//!
//! An ensemble is a logical model whose execution is a graph of calls into
//! other models. Loading compiles the configuration into an immutable
//! [`StepGraph`]; each request then drives its own overlay of that graph:
//!
//! - [`TensorRegistry`]: one write-once slot per tensor, reference counted
//!   by the consumers that still need it
//! - [`ReadinessTracker`]: per-step count of missing inputs
//! - dispatcher: ready steps become asynchronous [`ModelInvoker`] calls whose
//!   completions drive the request forward
//! - [`ResponseAggregator`]: collects the declared outputs
//! - [`RequestContext`]: ties the above together behind one per-request lock
//!
//! The first failing step decides the outcome of a request. Anything that
//! depended on it is never dispatched, and calls already in flight are
//! drained before the request's state is freed.
//!
//! [`ModelInvoker`]: kernelport_core::ModelInvoker

pub mod aggregator;
pub mod config;
pub mod context;
mod dispatcher;
pub mod error;
pub mod graph;
pub mod model;
pub mod readiness;
pub mod registry;
pub mod scheduler;
pub mod stats;

pub use aggregator::{EnsembleResponse, ResponseAggregator};
pub use config::{EnsembleConfig, StepConfig, TensorDecl, LATEST_VERSION};
pub use context::{RequestContext, RequestPhase};
pub use error::{ConfigError, EnsembleError};
pub use graph::{StepDescriptor, StepGraph, StepId, TensorId};
pub use model::EnsembleModel;
pub use readiness::{ReadinessTracker, StepState};
pub use registry::TensorRegistry;
pub use scheduler::{EnsembleScheduler, PendingResponse};
pub use stats::{
    NoopStats, RequestReport, StatsAggregator, StatsSink, StatsSnapshot, StepOutcome, StepReport,
};
