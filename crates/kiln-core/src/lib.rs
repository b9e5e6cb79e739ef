//! Core domain types for the Kiln build scheduler.
//!
//! This crate contains:
//! - Build and builder identifiers
//! - The build entity and its status lifecycle
//! - Client requests and output field masks
//! - Builder configuration and service settings
//! - Downstream task payloads
//! - The clock capability

pub mod build;
pub mod builder;
pub mod clock;
pub mod error;
pub mod experiments;
pub mod id;
pub mod mask;
pub mod request;
pub mod status;
pub mod task;

pub use build::Build;
pub use error::{Error, Result};
pub use id::{BuildId, BuilderId};
pub use status::Status;
