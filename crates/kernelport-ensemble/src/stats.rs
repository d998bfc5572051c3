//! Per-request statistics.
//!
//! The engine hands one [`RequestReport`] to its [`StatsSink`] after a request
//! has fully drained. Recording is fire-and-forget and never affects the
//! outcome of the request.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    Failure,
    Suppressed,
}

#[derive(Clone, Debug)]
pub struct StepReport {
    pub step: String,
    pub model: String,
    /// Dispatch to completion; `None` for suppressed steps.
    pub latency: Option<Duration>,
    pub outcome: StepOutcome,
}

#[derive(Clone, Debug)]
pub struct RequestReport {
    pub request_id: u64,
    pub success: bool,
    pub duration: Duration,
    pub steps: Vec<StepReport>,
}

pub trait StatsSink: Send + Sync + 'static {
    fn record(&self, report: RequestReport);
}

pub struct NoopStats;

impl StatsSink for NoopStats {
    fn record(&self, _report: RequestReport) {}
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepStats {
    pub success: u64,
    pub failure: u64,
    pub suppressed: u64,
    pub total_latency: Duration,
}

impl StepStats {
    pub fn mean_latency(&self) -> Option<Duration> {
        let n = self.success + self.failure;
        (n > 0).then(|| {
            let nanos = self.total_latency.as_nanos() / u128::from(n);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct StatsSnapshot {
    pub requests_ok: u64,
    pub requests_failed: u64,
    pub total_duration: Duration,
    pub steps: BTreeMap<String, StepStats>,
}

/// In-memory totals for one ensemble model.
#[derive(Default)]
pub struct StatsAggregator {
    inner: Mutex<StatsSnapshot>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        match self.inner.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl StatsSink for StatsAggregator {
    fn record(&self, report: RequestReport) {
        let mut totals = match self.inner.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if report.success {
            totals.requests_ok += 1;
        } else {
            totals.requests_failed += 1;
        }
        totals.total_duration += report.duration;
        for step in report.steps {
            let entry = totals.steps.entry(step.step).or_default();
            match step.outcome {
                StepOutcome::Success => entry.success += 1,
                StepOutcome::Failure => entry.failure += 1,
                StepOutcome::Suppressed => entry.suppressed += 1,
            }
            if let Some(latency) = step.latency {
                entry.total_latency += latency;
            }
        }
    }
}
