//! Authentication module for Docker registry access

use std::collections::HashMap;
use std::fmt;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::AuthConfig;
use crate::registry::error::{HttpErrorHandler, RegistryError, Result};

/// Credentials attached to every registry request.
#[derive(Clone)]
pub enum RegistryAuth {
    Anonymous,
    Basic(AuthConfig),
    Bearer(String),
}

impl RegistryAuth {
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            RegistryAuth::Anonymous => request,
            RegistryAuth::Basic(auth) => request.basic_auth(&auth.username, Some(&auth.password)),
            RegistryAuth::Bearer(token) => request.bearer_auth(token),
        }
    }
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryAuth::Anonymous => write!(f, "Anonymous"),
            RegistryAuth::Basic(auth) => f.debug_tuple("Basic").field(auth).finish(),
            RegistryAuth::Bearer(_) => write!(f, "Bearer(<redacted>)"),
        }
    }
}

/// A parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic {
        realm: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

impl AuthChallenge {
    /// Parse `Bearer realm="...",service="...",scope="..."` or `Basic realm="..."`.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        let params = parse_params(params);

        match scheme.to_ascii_lowercase().as_str() {
            "bearer" => Some(AuthChallenge::Bearer {
                realm: params.get("realm")?.clone(),
                service: params.get("service").cloned(),
                scope: params.get("scope").cloned(),
            }),
            "basic" => Some(AuthChallenge::Basic {
                realm: params.get("realm").cloned(),
            }),
            _ => None,
        }
    }
}

/// Split comma separated `key=value` pairs, honoring quoted values.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    other => value.push(other),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }

        params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    params
}

#[derive(Debug)]
pub struct Auth<'a> {
    client: &'a Client,
    base_url: &'a str,
}

impl<'a> Auth<'a> {
    pub fn new(client: &'a Client, base_url: &'a str) -> Self {
        Self { client, base_url }
    }

    /// Ping `/v2/` and obtain whatever the registry asks for to push to
    /// `repository`.
    pub async fn login(&self, repository: &str, credentials: Option<&AuthConfig>) -> Result<RegistryAuth> {
        let url = format!("{}/v2/", self.base_url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        debug!(%status, "registry version check");

        if status.is_success() {
            return Ok(match credentials {
                Some(auth) => RegistryAuth::Basic(auth.clone()),
                None => RegistryAuth::Anonymous,
            });
        }

        if status != StatusCode::UNAUTHORIZED {
            let text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_registry_error(status, &text, "version check"));
        }

        let challenge = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(AuthChallenge::parse)
            .ok_or_else(|| {
                RegistryError::Auth("registry requires authentication but sent no usable challenge".to_string())
            })?;

        match challenge {
            AuthChallenge::Basic { .. } => {
                let auth = credentials.ok_or_else(|| {
                    RegistryError::Auth("registry requires basic authentication but no credentials were given".to_string())
                })?;
                info!("using basic authentication");
                Ok(RegistryAuth::Basic(auth.clone()))
            }
            AuthChallenge::Bearer { realm, service, .. } => {
                let scope = format!("repository:{}:pull,push", repository);
                let token = self
                    .get_token(&realm, service.as_deref(), &scope, credentials)
                    .await?;
                info!(%scope, "obtained bearer token");
                Ok(RegistryAuth::Bearer(token))
            }
        }
    }

    async fn get_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: &str,
        credentials: Option<&AuthConfig>,
    ) -> Result<String> {
        let mut query = vec![("scope", scope)];
        if let Some(service) = service {
            query.push(("service", service));
        }

        let mut request = self.client.get(realm).query(&query);
        if let Some(auth) = credentials {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_auth_error(status, &text));
        }

        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RegistryError::Auth("token response contained no token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn creds() -> AuthConfig {
        AuthConfig::new("robot".to_string(), "hunter2".to_string())
    }

    #[test]
    fn parses_bearer_challenge_with_commas_in_scope() {
        let challenge = AuthChallenge::parse(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:org/app:pull,push""#,
        )
        .unwrap();
        assert_eq!(
            challenge,
            AuthChallenge::Bearer {
                realm: "https://auth.example.com/token".to_string(),
                service: Some("registry.example.com".to_string()),
                scope: Some("repository:org/app:pull,push".to_string()),
            }
        );
    }

    #[test]
    fn parses_basic_challenge() {
        assert_eq!(
            AuthChallenge::parse(r#"Basic realm="Registry Realm""#),
            Some(AuthChallenge::Basic {
                realm: Some("Registry Realm".to_string())
            })
        );
    }

    #[test]
    fn bearer_without_realm_is_unusable() {
        assert_eq!(AuthChallenge::parse(r#"Bearer service="x""#), None);
        assert_eq!(AuthChallenge::parse("Negotiate"), None);
    }

    #[test]
    fn debug_redacts_credentials() {
        let rendered = format!(
            "{:?} {:?}",
            RegistryAuth::Basic(creds()),
            RegistryAuth::Bearer("tok".to_string())
        );
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("tok)"));
    }

    #[tokio::test]
    async fn exchanges_credentials_for_bearer_token() {
        let server = MockServer::start_async().await;
        let realm = server.url("/token");
        server.mock(|when, then| {
            when.method(GET).path("/v2/");
            then.status(401).header(
                "WWW-Authenticate",
                format!(r#"Bearer realm="{}",service="test-registry""#, realm),
            );
        });
        let token = server.mock(|when, then| {
            when.method(GET)
                .path("/token")
                .query_param("service", "test-registry")
                .query_param("scope", "repository:org/app:pull,push")
                .header_exists("Authorization");
            then.status(200).json_body(serde_json::json!({"token": "abc"}));
        });

        let client = Client::new();
        let base = server.base_url();
        let auth = Auth::new(&client, &base)
            .login("org/app", Some(&creds()))
            .await
            .unwrap();

        assert!(matches!(auth, RegistryAuth::Bearer(ref t) if t == "abc"));
        token.assert();
    }

    #[tokio::test]
    async fn open_registry_needs_no_token() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/v2/");
            then.status(200);
        });

        let client = Client::new();
        let base = server.base_url();
        let auth = Auth::new(&client, &base).login("org/app", None).await.unwrap();
        assert!(matches!(auth, RegistryAuth::Anonymous));
    }

    #[tokio::test]
    async fn rejected_token_request_is_an_auth_error() {
        let server = MockServer::start_async().await;
        let realm = server.url("/token");
        server.mock(|when, then| {
            when.method(GET).path("/v2/");
            then.status(401)
                .header("WWW-Authenticate", format!(r#"Bearer realm="{}""#, realm));
        });
        server.mock(|when, then| {
            when.method(GET).path("/token");
            then.status(401);
        });

        let client = Client::new();
        let base = server.base_url();
        let err = Auth::new(&client, &base)
            .login("org/app", Some(&creds()))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Auth(_)));
    }
}
