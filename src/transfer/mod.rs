//! Policy-gated copy of a local image archive to the destination registry

pub mod policy;
pub mod reference;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{AuthConfig, RegistryOptions, RunConfig};
use crate::error::{MoverError, Result};
use crate::output::ProgressReporter;
use crate::registry::RegistryError;

pub use policy::{PolicyContext, PolicyRejection, TrustPolicy};
pub use reference::{DockerReference, ImageReference};

/// Per-copy settings handed to a [`CopyEngine`].
#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub remove_signatures: bool,
    /// Key identity to sign the destination with; `None` leaves it unsigned.
    pub sign_by: Option<String>,
    pub source_auth: Option<AuthConfig>,
    pub destination_auth: Option<AuthConfig>,
    pub registry: RegistryOptions,
    pub report: ProgressReporter,
}

/// Copies an image between two references under a trust policy.
///
/// Returns the digest of the manifest written to `destination`.
#[async_trait]
pub trait CopyEngine: Send + Sync {
    async fn copy(
        &self,
        policy: &PolicyContext,
        destination: &ImageReference,
        source: &ImageReference,
        options: &CopyOptions,
    ) -> std::result::Result<String, RegistryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub destination: String,
    pub manifest_digest: String,
}

#[derive(Clone)]
pub struct TransferEngine {
    engine: Arc<dyn CopyEngine>,
}

impl std::fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEngine").finish_non_exhaustive()
    }
}

impl TransferEngine {
    pub fn new(engine: Arc<dyn CopyEngine>) -> Self {
        Self { engine }
    }

    /// Push the docker-archive at `archive` to `docker://{TARGET_REPO}:{tag}`.
    ///
    /// The policy is loaded before credentials are read, so a broken policy
    /// is reported even when the destination is not configured.
    pub async fn transfer(
        &self,
        archive: &Path,
        tag: &str,
        config: &RunConfig,
        report: &ProgressReporter,
    ) -> Result<TransferOutcome> {
        let policy = TrustPolicy::load(config.policy_path.as_deref())?;
        let policy = PolicyContext::new(Arc::new(policy));

        let credentials = config.transfer_credentials()?;
        let destination = ImageReference::parse(&format!("docker://{}:{}", credentials.repository, tag))?;
        let source = ImageReference::docker_archive(archive)?;

        let options = CopyOptions {
            remove_signatures: false,
            sign_by: None,
            source_auth: None,
            destination_auth: Some(credentials.auth),
            registry: config.registry.clone(),
            report: report.clone(),
        };

        info!(source = %source, destination = %destination, "starting image copy");
        let manifest_digest = self
            .engine
            .copy(&policy, &destination, &source, &options)
            .await
            .map_err(|source_err| {
                warn!(destination = %destination, error = %source_err, "image copy failed");
                MoverError::TransferFailed {
                    destination: destination.to_string(),
                    source: source_err,
                }
            })?;

        report.success(&format!("Pushed {} ({})", destination, manifest_digest));
        Ok(TransferOutcome {
            destination: destination.to_string(),
            manifest_digest,
        })
    }
}
