//! Shared test utilities for clientnotes integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated job runs against a scripted remote
//! - Builders for configurations and scripted client exports

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{first_week, wait_until, TestHarness};
