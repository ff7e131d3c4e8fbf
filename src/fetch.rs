//! Authenticated download of the source artifact

use futures_util::Stream;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::config::{SOURCE_TOKEN_VAR, SourceConfig};
use crate::error::{MoverError, Result};
use crate::request::MoveRequest;

/// Where the artifact bytes came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactOrigin {
    Network { url: String },
}

/// An open download. The caller drains the body.
#[derive(Debug)]
pub struct FetchedArtifact {
    pub origin: ArtifactOrigin,
    pub content_length: Option<u64>,
    response: reqwest::Response,
}

impl FetchedArtifact {
    pub fn into_stream(self) -> impl Stream<Item = reqwest::Result<impl AsRef<[u8]>>> + Send {
        self.response.bytes_stream()
    }
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

impl Fetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// GET the request's source URL, attaching the bearer token when set.
    pub async fn fetch(
        &self,
        request: &MoveRequest,
        source: &SourceConfig,
        timeout: Option<Duration>,
    ) -> Result<FetchedArtifact> {
        let url = request.source_url();
        let display_url = redact_url(url);

        if source.require_token && source.token.is_none() {
            return Err(MoverError::MissingCredential {
                variable: SOURCE_TOKEN_VAR,
            });
        }

        let mut builder = self.client.get(url);
        if let Some(token) = &source.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        debug!(url = %display_url, authenticated = source.token.is_some(), "downloading artifact");

        let response = builder
            .send()
            .await
            .map_err(|e| MoverError::DownloadFailed {
                url: display_url.clone(),
                source: e.without_url(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(MoverError::DownloadRejected {
                url: display_url,
                status,
            });
        }

        let content_length = response.content_length();
        info!(url = %display_url, ?content_length, "download started");

        Ok(FetchedArtifact {
            origin: ArtifactOrigin::Network { url: display_url },
            content_length,
            response,
        })
    }
}

/// Strip userinfo, query and fragment so a URL is safe to log.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            let _ = url.set_username("");
            let _ = url.set_password(None);
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use httpmock::prelude::*;

    fn with_token(token: &str) -> SourceConfig {
        SourceConfig {
            token: Some(token.to_string()),
            require_token: true,
        }
    }

    async fn drain(artifact: FetchedArtifact) -> Vec<u8> {
        let mut stream = std::pin::pin!(artifact.into_stream());
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(chunk.unwrap().as_ref());
        }
        body
    }

    #[tokio::test]
    async fn attaches_bearer_token() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/artifact.zip")
                .header("Authorization", "Bearer s3cret");
            then.status(200).body("payload");
        });

        let request = MoveRequest::new(server.url("/artifact.zip"), "v1").unwrap();
        let artifact = Fetcher::default()
            .fetch(&request, &with_token("s3cret"), None)
            .await
            .unwrap();

        assert_eq!(drain(artifact).await, b"payload");
        mock.assert();
    }

    #[tokio::test]
    async fn missing_required_token_fails_before_request() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET);
            then.status(200);
        });

        let request = MoveRequest::new(server.url("/a"), "v1").unwrap();
        let source = SourceConfig {
            token: None,
            require_token: true,
        };
        let err = Fetcher::default()
            .fetch(&request, &source, None)
            .await
            .unwrap_err();

        assert!(matches!(err, MoverError::MissingCredential { .. }));
        mock.assert_calls(0);
    }

    #[tokio::test]
    async fn optional_token_may_be_absent() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/public.tar");
            then.status(200).body("tar");
        });

        let request = MoveRequest::new(server.url("/public.tar"), "v1").unwrap();
        let artifact = Fetcher::default()
            .fetch(&request, &SourceConfig::default(), None)
            .await
            .unwrap();
        assert_eq!(drain(artifact).await, b"tar");
    }

    #[tokio::test]
    async fn not_found_is_distinct_from_transport_failure() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/missing");
            then.status(404);
        });

        let request = MoveRequest::new(server.url("/missing?sig=abc"), "v1").unwrap();
        let err = Fetcher::default()
            .fetch(&request, &with_token("t"), None)
            .await
            .unwrap_err();

        match err {
            MoverError::DownloadRejected { url, status } => {
                assert_eq!(status.as_u16(), 404);
                assert!(!url.contains("sig=abc"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn connection_failure_is_download_failed() {
        let request = MoveRequest::new("http://127.0.0.1:1/artifact", "v1").unwrap();
        let err = Fetcher::default()
            .fetch(&request, &with_token("t0ken"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, MoverError::DownloadFailed { .. }));
        assert!(!err.to_string().contains("t0ken"));
    }

    #[test]
    fn redacts_userinfo_and_query() {
        assert_eq!(
            redact_url("https://user:pw@example.com/a.zip?token=x#frag"),
            "https://example.com/a.zip"
        );
        assert_eq!(redact_url("not a url"), "not a url");
    }
}
