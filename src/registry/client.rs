// RegistryClient talks to one repository of a Docker Registry HTTP API v2
// endpoint: blob existence checks, monolithic blob uploads and manifest puts.

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Body, Client, StatusCode};
use tracing::debug;
use url::Url;

use crate::registry::auth::RegistryAuth;
use crate::registry::docker_archive::Blob;
use crate::registry::error::{HttpErrorHandler, RegistryError, Result};

#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: Client,
    base_url: String,
    repository: String,
    auth: RegistryAuth,
}

impl RegistryClient {
    pub fn new(client: Client, base_url: String, repository: String, auth: RegistryAuth) -> Self {
        Self {
            client,
            base_url,
            repository,
            auth,
        }
    }

    pub async fn blob_exists(&self, digest: &str) -> Result<bool> {
        let url = format!("{}/v2/{}/blobs/{}", self.base_url, self.repository, digest);
        let response = self.auth.apply(self.client.head(&url)).send().await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(HttpErrorHandler::handle_registry_error(status, "", "blob check")),
        }
    }

    /// Start an upload session and complete it with a single PUT streamed
    /// from the staged file.
    pub async fn upload_blob(&self, blob: &Blob) -> Result<()> {
        let location = self.start_blob_upload().await?;

        let mut url = location;
        url.query_pairs_mut().append_pair("digest", &blob.digest);
        debug!(digest = %blob.digest, size = blob.size, "uploading blob");

        let file = tokio::fs::File::open(&blob.path).await?;
        let request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, blob.size)
            .body(Body::from(file));
        let response = self.auth.apply(request).send().await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(HttpErrorHandler::handle_upload_error(status, &text, "blob upload"))
        }
    }

    async fn start_blob_upload(&self) -> Result<Url> {
        let url = format!("{}/v2/{}/blobs/uploads/", self.base_url, self.repository);
        let response = self.auth.apply(self.client.post(&url)).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_upload_error(status, &text, "upload start"));
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RegistryError::Upload("No Location header in upload response".to_string()))?;

        // Location may be relative to the registry root.
        Ok(Url::parse(&self.base_url)?.join(location)?)
    }

    pub async fn put_manifest(&self, tag: &str, manifest: &[u8], media_type: &str) -> Result<()> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, self.repository, tag);
        let request = self
            .client
            .put(&url)
            .header(CONTENT_TYPE, media_type)
            .body(manifest.to_vec());
        let response = self.auth.apply(request).send().await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(HttpErrorHandler::handle_upload_error(status, &text, "manifest upload"))
        }
    }
}
