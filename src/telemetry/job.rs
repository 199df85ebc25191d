//! Job execution span helpers.

use opentelemetry::KeyValue;
use tracing::Span;

use super::metrics;
use crate::model::{Job, JobState};

/// Start a span covering one execution attempt.
///
/// The `job.state` field is declared empty and updated by
/// [`record_state_transition`].
pub fn start_job_span(job: &Job) -> Span {
    tracing::info_span!(
        "job.execute",
        "job.id" = %job.id,
        "job.attempt" = job.attempts,
        "job.worker" = job.claimed_by.as_deref().unwrap_or_default(),
        "job.state" = tracing::field::Empty,
    )
}

/// Record a committed state transition on `span` and in the transition counter.
pub fn record_state_transition(span: &Span, event: &'static str, from: JobState, to: JobState) {
    span.record("job.state", to.as_str());
    span.in_scope(|| {
        tracing::info!(event, from = from.as_str(), to = to.as_str(), "state_transition");
    });
    metrics::job_transitions().add(
        1,
        &[
            KeyValue::new("event", event),
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}
