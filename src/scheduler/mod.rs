//! Periodic stale-task reclaimer.

mod builder;
mod job;

pub use builder::ReclaimerBuilder;
pub use job::{Reclaimer, SweepReport};
