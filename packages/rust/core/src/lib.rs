//! Core pipeline orchestration for bookship.
//!
//! This crate ties trigger evaluation, provisioning, the documentation
//! build and publishing into a single run (see [`pipeline::run_pipeline`]).
//! Every external tool sits behind a trait so runs can be driven by fakes.

pub mod build;
pub mod context;
pub mod pipeline;
pub mod process;
pub mod provision;
pub mod publish;
pub mod retry;
pub mod trigger;

pub use context::ExecutionContext;
