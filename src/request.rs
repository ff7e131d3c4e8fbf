//! Invocation payload parsing and validation

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{MoverError, Result};

/// A validated request to move one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRequest {
    source_url: String,
    destination_tag: String,
}

#[derive(Debug, Deserialize)]
struct InvocationBody {
    #[serde(default, alias = "Url")]
    url: Option<String>,
    #[serde(default, alias = "Tag")]
    tag: Option<String>,
}

/// Require a JSON object; serde would otherwise map a `[url, tag]` array onto
/// the struct fields.
fn parse_object(data: &[u8], field: &'static str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_slice(data).map_err(|e| MoverError::InvalidRequest {
        field,
        reason: format!("is not valid JSON: {}", e),
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(MoverError::InvalidRequest {
            field,
            reason: "must be a JSON object".to_string(),
        }),
    }
}

impl MoveRequest {
    pub fn new(source_url: impl Into<String>, destination_tag: impl Into<String>) -> Result<Self> {
        let source_url = source_url.into();
        let destination_tag = destination_tag.into();

        if source_url.trim().is_empty() {
            return Err(MoverError::InvalidRequest {
                field: "url",
                reason: "is missing".to_string(),
            });
        }
        if destination_tag.trim().is_empty() {
            return Err(MoverError::InvalidRequest {
                field: "tag",
                reason: "is missing".to_string(),
            });
        }

        Ok(Self {
            source_url,
            destination_tag,
        })
    }

    /// Parse a raw invocation payload.
    ///
    /// Accepts either `{"body": "<json>"}` or the bare `{"url": .., "tag": ..}`
    /// object.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let mut payload = parse_object(payload, "payload")?;

        // Cloud-function style envelope whose `body` is itself a JSON document.
        let fields = match payload.remove("body") {
            Some(Value::String(body)) => parse_object(body.as_bytes(), "body")?,
            Some(_) => {
                return Err(MoverError::InvalidRequest {
                    field: "body",
                    reason: "must be a string".to_string(),
                });
            }
            None => payload,
        };

        let body: InvocationBody =
            serde_json::from_value(Value::Object(fields)).map_err(|e| MoverError::InvalidRequest {
                field: "payload",
                reason: e.to_string(),
            })?;

        Self::new(body.url.unwrap_or_default(), body.tag.unwrap_or_default())
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn destination_tag(&self) -> &str {
        &self.destination_tag
    }
}
