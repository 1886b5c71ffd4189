//! Observability plumbing shared between binaries: tracing initialization,
//! a panic hook that logs through tracing, and the global prometheus metric
//! storage registry together with the endpoint that serves it.

pub mod metrics;
pub mod panic_hook;
pub mod tracing;
