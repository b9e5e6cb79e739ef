//! Configuration for Kiln.
//!
//! Builder and settings files are written in KDL. This crate also holds
//! request validation and the resolver that merges a builder's static
//! configuration with a schedule request.

pub mod builders;
pub mod error;
mod nodes;
pub mod resolve;
pub mod settings;
pub mod validate;

pub use builders::{load_builders, parse_builders};
pub use error::{ConfigError, ConfigResult};
pub use resolve::{ResolvedBuild, resolve};
pub use settings::{load_settings, parse_settings};
pub use validate::{normalize_legacy, validate_batch, validate_request};
