//! Stream-factory job racing and orchestration

mod controller;
mod job;

pub use controller::{JobController, StreamOutcome};
pub use job::{Job, JobKind, JobOutcome};
