//! Scenario-based tests for pipeline-engine

mod cancellation;
mod concurrency;
mod dependencies;
mod fail_fast;
mod release;
mod reporting;
