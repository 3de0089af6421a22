//! Shared test utilities for codeshift integration tests.
//!
//! This module provides:
//! - Scripted `Converter`/`Verifier` fakes with call recording
//! - `TestHarness` running a scheduler over an isolated database and output directory

pub mod fakes;
pub mod harness;

pub use fakes::*;
pub use harness::*;
