//! Metric instrument factories for searchq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"searchq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("searchq")
}

/// Counter: jobs submitted.
/// Labels: `result` ("ok" | "enqueue_failed").
pub fn jobs_submitted() -> Counter<u64> {
    meter()
        .u64_counter("searchq.jobs.submitted")
        .with_description("Number of jobs submitted")
        .build()
}

/// Counter: job state transitions.
/// Labels: `event`, `from`, `to`.
pub fn job_transitions() -> Counter<u64> {
    meter()
        .u64_counter("searchq.jobs.transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: queue-level operations (create, send, read, archive).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("searchq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: what the dispatcher did with a delivery.
/// Labels: `outcome` ("started" | "released" | "exhausted" | "dropped").
pub fn dispatch_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("searchq.dispatch.outcomes")
        .with_description("Dispatcher decisions per delivery")
        .build()
}

/// Histogram: executor duration in milliseconds.
/// Labels: `outcome` ("succeeded" | "failed" | "timeout").
pub fn execution_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("searchq.execution.duration_ms")
        .with_description("Executor duration per attempt")
        .with_unit("ms")
        .build()
}

/// Counter: jobs touched by the recovery sweep.
/// Labels: `action` ("requeued" | "failed" | "resent").
pub fn recovered_jobs() -> Counter<u64> {
    meter()
        .u64_counter("searchq.recovery.jobs")
        .with_description("Jobs reset or re-enqueued by recovery")
        .build()
}

/// Counter: health status changes.
/// Labels: `status`, `component`.
pub fn health_changes() -> Counter<u64> {
    meter()
        .u64_counter("searchq.health.changes")
        .with_description("Backend health status changes")
        .build()
}
