//! Default copy engine: docker-archive on disk to a v2 registry

use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RegistryOptions;
use crate::registry::auth::Auth;
use crate::registry::client::RegistryClient;
use crate::registry::docker_archive::{Blob, DockerArchive, MEDIA_TYPE_MANIFEST, sha256_digest};
use crate::registry::error::{RegistryError, Result};
use crate::transfer::policy::PolicyContext;
use crate::transfer::reference::{DockerReference, ImageReference};
use crate::transfer::{CopyEngine, CopyOptions};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    media_type: &'static str,
    size: u64,
    digest: String,
}

impl From<&Blob> for Descriptor {
    fn from(blob: &Blob) -> Self {
        Self {
            media_type: blob.media_type,
            size: blob.size,
            digest: blob.digest.clone(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestV2 {
    schema_version: u32,
    media_type: &'static str,
    config: Descriptor,
    layers: Vec<Descriptor>,
}

/// Pushes a single-image docker-archive with schema 2 manifests.
#[derive(Debug, Default, Clone)]
pub struct RegistryCopyEngine;

impl RegistryCopyEngine {
    pub fn new() -> Self {
        Self
    }

    fn http_client(options: &RegistryOptions) -> Result<Client> {
        let mut builder = Client::builder().user_agent(concat!("image-mover/", env!("CARGO_PKG_VERSION")));
        if options.skip_tls {
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(builder.build()?)
    }

    fn base_url(destination: &DockerReference, options: &RegistryOptions) -> String {
        let scheme = if options.is_insecure(destination.registry()) {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, destination.api_host())
    }
}

async fn blocking<T, F>(task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| RegistryError::Io(std::io::Error::other(e)))?
}

async fn push_blob(client: &RegistryClient, blob: &Blob, kind: &str, options: &CopyOptions) -> Result<()> {
    let report = &options.report;
    let short = blob.digest.trim_start_matches("sha256:");
    let short = &short[..short.len().min(12)];

    if client.blob_exists(&blob.digest).await? {
        report.step(&format!("Copying {} {} skipped: already exists", kind, short));
        return Ok(());
    }

    let started = Instant::now();
    client.upload_blob(blob).await?;
    report.step(&format!(
        "Copying {} {} done ({} in {})",
        kind,
        short,
        report.format_size(blob.size),
        report.format_duration(started.elapsed())
    ));
    Ok(())
}

#[async_trait]
impl CopyEngine for RegistryCopyEngine {
    async fn copy(
        &self,
        policy: &PolicyContext,
        destination: &ImageReference,
        source: &ImageReference,
        options: &CopyOptions,
    ) -> Result<String> {
        if options.sign_by.is_some() {
            return Err(RegistryError::Unsupported("signing images".to_string()));
        }
        let ImageReference::Docker(target) = destination else {
            return Err(RegistryError::Unsupported(format!(
                "destination transport {}",
                destination.transport()
            )));
        };
        let ImageReference::DockerArchive { path } = source else {
            return Err(RegistryError::Unsupported(format!(
                "source transport {}",
                source.transport()
            )));
        };

        policy.is_image_allowed(source)?;
        if options.source_auth.is_some() {
            warn!(source = %source, "ignoring source credentials for a local archive");
        }

        let report = &options.report;
        report.section(&format!("Copying {} to {}", source, destination));
        report.info("Getting image source signatures");

        // Staged next to the archive so the blobs share the run's scratch space.
        let staging_root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let staging = tempfile::Builder::new()
            .prefix("blobs-")
            .tempdir_in(&staging_root)?;
        let staged = {
            let path = path.clone();
            let dir = staging.path().to_path_buf();
            blocking(move || DockerArchive::open(&path)?.stage_blobs(&dir)).await?
        };
        let layer_count = staged.layers.len();

        let client = Self::http_client(&options.registry)?;
        let base_url = Self::base_url(target, &options.registry);
        debug!(%base_url, repository = target.repository(), "connecting to registry");

        let auth = Auth::new(&client, &base_url)
            .login(target.repository(), options.destination_auth.as_ref())
            .await?;
        let registry = RegistryClient::new(client, base_url, target.repository().to_string(), auth);

        let mut layers = Vec::with_capacity(layer_count);
        for blob in &staged.layers {
            push_blob(&registry, blob, "blob", options).await?;
            layers.push(Descriptor::from(blob));
        }
        push_blob(&registry, &staged.config, "config", options).await?;
        let config = &staged.config;

        let manifest = ManifestV2 {
            schema_version: 2,
            media_type: MEDIA_TYPE_MANIFEST,
            config: Descriptor::from(config),
            layers,
        };
        let manifest = serde_json::to_vec(&manifest)?;
        let digest = sha256_digest(&manifest);

        report.info("Writing manifest to image destination");
        registry
            .put_manifest(target.tag(), &manifest, MEDIA_TYPE_MANIFEST)
            .await?;
        // A docker-archive carries no signatures, so there is nothing to copy
        // or strip either way.
        if !options.remove_signatures {
            report.info("Storing signatures");
        }

        info!(destination = %destination, %digest, layers = layer_count, "image copied");
        Ok(digest)
    }
}
