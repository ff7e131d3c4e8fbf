//! Registry module for Docker registry interactions
//!
//! Authentication, blob and manifest uploads against the Docker Registry HTTP
//! API v2, and the copy engine that pushes a docker-archive through them.

pub mod auth;
pub mod client;
pub mod docker_archive;
pub mod engine;
pub mod error;

pub use auth::{Auth, RegistryAuth};
pub use client::RegistryClient;
pub use docker_archive::DockerArchive;
pub use engine::RegistryCopyEngine;
pub use error::RegistryError;
