//! Shared test helpers for integration tests.

#[path = "helpers_fake_evaluator.rs"]
pub mod fake_evaluator;
