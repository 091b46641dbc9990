//! Pluggable metrics for engine evaluations and reloads.
//!
//! The library never talks to a metrics backend directly. Hosts install a
//! [`MetricsSink`] once at startup and forward the events wherever they like;
//! until then events are dropped.
//!
//! ```ignore
//! use canopy_core::metrics::{set_sink, EvaluationStats, MetricsSink, ReloadStats};
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::sync::Arc;
//!
//! struct Counter(AtomicU64);
//!
//! impl MetricsSink for Counter {
//!     fn on_evaluation(&self, _stats: &EvaluationStats) {
//!         self.0.fetch_add(1, Ordering::Relaxed);
//!     }
//!     fn on_reload(&self, _stats: &ReloadStats) {}
//! }
//!
//! set_sink(Arc::new(Counter(AtomicU64::new(0))));
//! ```

use serde::Serialize;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};
use tracing::warn;

/// One `PolicyEngine::evaluate` call.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationStats {
    /// Wall-clock time for the whole call.
    pub duration: Duration,
    pub allowed: bool,
    /// Principal uid, e.g. `User::"alice"`.
    pub principal_id: String,
    /// Action uid, e.g. `Action::"view"`.
    pub action_id: String,
    /// Policies that raised an evaluation error.
    pub errored_policies: usize,
}

/// Per-phase timing for one evaluation, in milliseconds.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationPhases {
    /// Request validation against the schema.
    pub validation_ms: f64,
    /// Scope matching and clause evaluation over all policies.
    pub authorize_ms: f64,
    pub total_ms: f64,
}

impl EvaluationPhases {
    /// Time not covered by a measured phase.
    pub fn overhead_ms(&self) -> f64 {
        self.total_ms - (self.validation_ms + self.authorize_ms)
    }
}

/// A completed snapshot swap.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadStats {
    pub reload_time: SystemTime,
    /// Effective policies in the new snapshot, links included.
    pub policy_count: usize,
    pub entity_count: usize,
    pub has_schema: bool,
}

/// Receiver for engine events.
///
/// Called synchronously on the evaluating thread, so implementations must be
/// cheap and must not block.
pub trait MetricsSink: Send + Sync {
    fn on_evaluation(&self, stats: &EvaluationStats);

    fn on_reload(&self, stats: &ReloadStats);

    /// Phase breakdown for the same evaluation passed to `on_evaluation`.
    fn on_evaluation_phases(&self, _stats: &EvaluationStats, _phases: &EvaluationPhases) {}
}

static SINK: OnceLock<Arc<dyn MetricsSink>> = OnceLock::new();

/// Install the global sink. Only the first call wins; later calls are
/// ignored with a warning.
pub fn set_sink(sink: Arc<dyn MetricsSink>) {
    if SINK.set(sink).is_err() {
        warn!(
            event = "Metrics",
            "Metrics sink was already initialized, ignoring set_sink"
        );
    }
}

/// Whether a sink is installed. Callers skip building stats when it is not.
pub(crate) fn is_enabled() -> bool {
    SINK.get().is_some()
}

pub(crate) fn record_evaluation(stats: &EvaluationStats, phases: &EvaluationPhases) {
    if let Some(sink) = SINK.get() {
        sink.on_evaluation(stats);
        sink.on_evaluation_phases(stats, phases);
    }
}

pub(crate) fn record_reload(policy_count: usize, entity_count: usize, has_schema: bool) {
    if let Some(sink) = SINK.get() {
        sink.on_reload(&ReloadStats {
            reload_time: SystemTime::now(),
            policy_count,
            entity_count,
            has_schema,
        });
    }
}
