//! Checkpoint latency per detection flow.
//!
//! A flow is a map of checkpoint name to monotonic instant. Marking the second
//! checkpoint of a configured stage pair records the delta into the injected
//! [`QuantileEstimator`] and bumps a soft-SLO counter when the delta is over
//! the stage threshold. Breaches are warnings, never failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::quantiles::{QuantileEstimator, QuantileSummary};

/// Checkpoint names used by the pipeline.
pub mod checkpoints {
    /// Flow start: a poll cycle began or a push frame arrived.
    pub const DETECTED: &str = "detected";
    pub const FETCHED: &str = "fetched";
    pub const PARSED: &str = "parsed";
    pub const DEDUPED: &str = "deduped";
    /// Terminal: the event was handed downstream.
    pub const EMITTED: &str = "emitted";
}

/// A pair of checkpoints whose delta is tracked as `metric`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub from: String,
    pub to: String,
    pub metric: String,
    pub soft_threshold: Duration,
}

impl StageSpec {
    pub fn new(from: &str, to: &str, metric: &str, soft_threshold: Duration) -> Self {
        Self {
            from: from.to_owned(),
            to: to.to_owned(),
            metric: metric.to_owned(),
            soft_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub stages: Vec<StageSpec>,
    /// Marking this checkpoint completes and removes the flow.
    pub terminal_checkpoint: String,
    /// Flows older than this are dropped by [`LatencyTracker::sweep`].
    pub flow_ttl: Duration,
    /// Samples retained per metric.
    pub sample_capacity: usize,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        use checkpoints::*;
        Self {
            stages: vec![
                StageSpec::new(DETECTED, FETCHED, "fetch_ms", Duration::from_millis(1_500)),
                StageSpec::new(FETCHED, PARSED, "parse_ms", Duration::from_millis(100)),
                StageSpec::new(PARSED, DEDUPED, "dedup_ms", Duration::from_millis(250)),
                StageSpec::new(DEDUPED, EMITTED, "emit_ms", Duration::from_millis(100)),
                StageSpec::new(DETECTED, EMITTED, "end_to_end_ms", Duration::from_millis(2_000)),
            ],
            terminal_checkpoint: String::from(EMITTED),
            flow_ttl: Duration::from_secs(300),
            sample_capacity: crate::quantiles::DEFAULT_SAMPLE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone)]
struct LatencyFlow {
    started_at: Instant,
    marks: HashMap<String, Instant>,
}

impl LatencyFlow {
    fn new(started_at: Instant) -> Self {
        let mut marks = HashMap::new();
        marks.insert(String::from(checkpoints::DETECTED), started_at);
        Self { started_at, marks }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    flows: HashMap<String, LatencyFlow>,
    slo_breaches: BTreeMap<String, u64>,
}

/// Metrics view of the tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySnapshot {
    pub active_flows: usize,
    pub stages: BTreeMap<String, QuantileSummary>,
    pub slo_breaches: BTreeMap<String, u64>,
}

#[derive(Debug)]
pub struct LatencyTracker {
    config: LatencyConfig,
    estimator: Arc<QuantileEstimator>,
    state: Mutex<TrackerState>,
}

impl LatencyTracker {
    pub fn new(config: LatencyConfig, estimator: Arc<QuantileEstimator>) -> Self {
        Self {
            config,
            estimator,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn config(&self) -> &LatencyConfig {
        &self.config
    }

    pub fn estimator(&self) -> &Arc<QuantileEstimator> {
        &self.estimator
    }

    /// Start a flow at [`checkpoints::DETECTED`]. A second call for the same
    /// id is a no-op.
    pub fn begin(&self, flow_id: &str) {
        let now = Instant::now();
        let mut state = self.state.lock().expect("latency state lock is not poisoned");
        state
            .flows
            .entry(flow_id.to_owned())
            .or_insert_with(|| LatencyFlow::new(now));
    }

    /// Start `child` with a copy of `parent`'s marks, so per-event flows can
    /// share the timings of the poll cycle that found them. Falls back to a
    /// fresh flow when the parent is gone.
    pub fn fork(&self, parent: &str, child: &str) {
        let now = Instant::now();
        let mut state = self.state.lock().expect("latency state lock is not poisoned");
        let flow = state
            .flows
            .get(parent)
            .cloned()
            .unwrap_or_else(|| LatencyFlow::new(now));
        state.flows.entry(child.to_owned()).or_insert(flow);
    }

    pub fn mark(&self, flow_id: &str, checkpoint: &str) {
        self.mark_at(flow_id, checkpoint, Instant::now());
    }

    /// Record `checkpoint` at `at`. An unknown flow is created on the spot
    /// rather than losing the measurement. The first mark of a checkpoint wins.
    pub fn mark_at(&self, flow_id: &str, checkpoint: &str, at: Instant) {
        let mut samples = Vec::new();
        {
            let mut state = self.state.lock().expect("latency state lock is not poisoned");
            let state = &mut *state;
            let flow = state.flows.entry(flow_id.to_owned()).or_insert_with(|| {
                tracing::debug!(flow_id, checkpoint, "mark on unknown flow, creating it");
                LatencyFlow::new(at)
            });
            if flow.marks.contains_key(checkpoint) {
                return;
            }
            flow.marks.insert(checkpoint.to_owned(), at);

            for stage in self.config.stages.iter().filter(|stage| stage.to == checkpoint) {
                let Some(from) = flow.marks.get(&stage.from) else {
                    continue;
                };
                let delta = at.saturating_duration_since(*from);
                if delta > stage.soft_threshold {
                    *state.slo_breaches.entry(stage.metric.clone()).or_insert(0) += 1;
                    tracing::warn!(
                        flow_id,
                        metric = %stage.metric,
                        delta_ms = delta.as_millis() as u64,
                        threshold_ms = stage.soft_threshold.as_millis() as u64,
                        "latency soft threshold exceeded"
                    );
                }
                samples.push((stage.metric.as_str(), delta.as_secs_f64() * 1_000.0));
            }

            if checkpoint == self.config.terminal_checkpoint {
                state.flows.remove(flow_id);
            }
        }

        for (metric, value) in samples {
            self.estimator.record(metric, value);
        }
    }

    /// Drop a flow that will never reach the terminal checkpoint.
    pub fn finish(&self, flow_id: &str) -> bool {
        let mut state = self.state.lock().expect("latency state lock is not poisoned");
        state.flows.remove(flow_id).is_some()
    }

    /// Remove flows started more than `flow_ttl` before `now`. Returns how many
    /// were dropped.
    pub fn sweep(&self, now: Instant) -> usize {
        let ttl = self.config.flow_ttl;
        let mut state = self.state.lock().expect("latency state lock is not poisoned");
        let before = state.flows.len();
        state
            .flows
            .retain(|_, flow| now.saturating_duration_since(flow.started_at) <= ttl);
        let removed = before - state.flows.len();
        if removed > 0 {
            tracing::debug!(removed, "swept expired latency flows");
        }
        removed
    }

    pub fn active_flows(&self) -> usize {
        self.state
            .lock()
            .expect("latency state lock is not poisoned")
            .flows
            .len()
    }

    pub fn slo_breaches(&self, metric: &str) -> u64 {
        self.state
            .lock()
            .expect("latency state lock is not poisoned")
            .slo_breaches
            .get(metric)
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let (active_flows, slo_breaches) = {
            let state = self.state.lock().expect("latency state lock is not poisoned");
            (state.flows.len(), state.slo_breaches.clone())
        };
        LatencySnapshot {
            active_flows,
            stages: self.estimator.summaries(),
            slo_breaches,
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        let config = LatencyConfig::default();
        let estimator = Arc::new(QuantileEstimator::new(config.sample_capacity));
        Self::new(config, estimator)
    }
}
