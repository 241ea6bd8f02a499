/*!
This module contains the definitions and implementations of the metrics used by the engine
*/

use tracing::{Level, instrument};

use crate::{Context, Sandbox};

// Gauges, live handles
static METRIC_ACTIVE_SANDBOXES: &str = "active_sandboxes";
static METRIC_ACTIVE_CONTEXTS: &str = "active_contexts";

// Counters, total handles created during the lifetime of the process
static METRIC_TOTAL_SANDBOXES: &str = "sandboxes_total";
static METRIC_TOTAL_CONTEXTS: &str = "contexts_total";

// Counters, guest calls
pub(crate) static METRIC_RUNS: &str = "sandbox_runs_total";

// Counters, abnormal run terminations by cause
pub(crate) static METRIC_RUN_TERMINATIONS: &str = "run_terminations_total";
pub(crate) static METRIC_TERMINATION_CAUSE: &str = "cause";

pub(crate) trait SandboxMetricsTrait {
    const GAUGE: &'static str;
    const COUNTER: &'static str;
}

pub(crate) struct SandboxMetricsGuard<T: SandboxMetricsTrait>(std::marker::PhantomData<T>);

impl<T: SandboxMetricsTrait> SandboxMetricsGuard<T> {
    #[instrument(skip_all, level = Level::DEBUG)]
    pub(crate) fn new() -> Self {
        metrics::gauge!(T::GAUGE).increment(1);
        metrics::counter!(T::COUNTER).increment(1);
        Self(std::marker::PhantomData)
    }
}

impl<T: SandboxMetricsTrait> Drop for SandboxMetricsGuard<T> {
    #[instrument(skip_all, level = Level::DEBUG)]
    fn drop(&mut self) {
        metrics::gauge!(T::GAUGE).decrement(1);
    }
}

impl SandboxMetricsTrait for Sandbox {
    const GAUGE: &'static str = METRIC_ACTIVE_SANDBOXES;
    const COUNTER: &'static str = METRIC_TOTAL_SANDBOXES;
}

impl SandboxMetricsTrait for Context {
    const GAUGE: &'static str = METRIC_ACTIVE_CONTEXTS;
    const COUNTER: &'static str = METRIC_TOTAL_CONTEXTS;
}
