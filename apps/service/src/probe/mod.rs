//! Probing engine - executes checks and schedules them per entry
//!
//! This module is responsible for:
//! - Executing ping/http/resource checks with hard timeouts
//! - Scheduling each target/check pair on its own interval
//! - Delivering normalized outcomes to the emitter

pub mod checker;
pub mod executor;
pub mod scheduler;
pub mod types;

pub use executor::{ExecuteProbe, ProbeExecutor};
pub use scheduler::Scheduler;
pub use types::{ProbeOutcome, ResolvedCheck};
