//! Build scheduling for Kiln.
//!
//! Turns schedule requests into committed builds, drives build status
//! through its lifecycle, and drains the task outbox.

pub mod batch;
pub mod buildid;
pub mod numbers;
pub mod retry;
pub mod schedule;
pub mod side_effects;
pub mod status;
pub mod worker;

/// Upper bound on concurrent store operations within one call.
pub const MAX_CONCURRENCY: usize = 64;

pub use buildid::IdAllocator;
pub use numbers::{build_address, generate_build_numbers};
pub use schedule::Scheduler;
pub use side_effects::{InvocationService, LocalInvocations};
pub use status::{StatusEngine, StatusOutcome, StatusUpdate};
pub use worker::{LoggingHandler, TaskHandler, Worker};
