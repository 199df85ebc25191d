//! # searchq
//!
//! Durable lifecycle engine for deferred search-scraping jobs.
//!
//! Jobs live in a versioned store (Postgres, or in memory for tests) and
//! are announced through an at-least-once broker (pgmq). Dispatchers claim
//! them with compare-and-update, a bounded worker pool runs the executor,
//! and a recovery sweep resets work orphaned by crashed instances.

pub mod broker;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod health;
pub mod model;
pub mod status;
pub mod store;
pub mod telemetry;
