//! Image Mover Library
//!
//! Downloads a container image artifact from an authenticated URL, unwraps it
//! when it arrives inside a zip, and pushes the resulting docker-archive to a
//! registry under a trust policy.

pub mod archive;
pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod output;
pub mod pipeline;
pub mod registry;
pub mod request;
pub mod transfer;

pub use config::{AuthConfig, ConfigSource, EnvConfig, MapConfig, RunConfig};
pub use error::{MoverError, Result};
pub use output::ProgressReporter;
pub use pipeline::{MoveOutcome, Pipeline};
pub use request::MoveRequest;
pub use transfer::{CopyEngine, CopyOptions, TransferEngine};
