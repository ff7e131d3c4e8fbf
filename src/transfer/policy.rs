//! Trust policy in the containers `policy.json` format
//!
//! Only the requirement types that can be decided without signature
//! verification accept or reject on their own; signature requirements always
//! reject because a docker-archive carries no signatures.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{MoverError, Result};
use crate::transfer::reference::ImageReference;

const KNOWN_TRANSPORTS: &[&str] = &[
    "atomic",
    "containers-storage",
    "dir",
    "docker",
    "docker-archive",
    "docker-daemon",
    "oci",
    "oci-archive",
    "ostree",
    "sif",
    "tarball",
];

const GPG_KEY_TYPES: &[&str] = &[
    "GPGKeys",
    "signedByGPGKeys",
    "X509Certificates",
    "signedByX509CAs",
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum PolicyRequirement {
    #[serde(rename = "insecureAcceptAnything")]
    InsecureAcceptAnything,
    #[serde(rename = "reject")]
    Reject,
    #[serde(rename = "signedBy", rename_all = "camelCase")]
    SignedBy {
        key_type: String,
        #[serde(default)]
        key_path: Option<String>,
        #[serde(default)]
        key_paths: Option<Vec<String>>,
        #[serde(default)]
        key_data: Option<String>,
        #[serde(default)]
        signed_identity: Option<serde_json::Value>,
    },
    #[serde(rename = "sigstoreSigned", rename_all = "camelCase")]
    SigstoreSigned {
        #[serde(default)]
        key_path: Option<String>,
        #[serde(default)]
        key_paths: Option<Vec<String>>,
        #[serde(default)]
        key_data: Option<String>,
        #[serde(default)]
        key_datas: Option<Vec<String>>,
        #[serde(default)]
        fulcio: Option<serde_json::Value>,
        #[serde(default)]
        signed_identity: Option<serde_json::Value>,
    },
}

impl PolicyRequirement {
    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            PolicyRequirement::InsecureAcceptAnything | PolicyRequirement::Reject => Ok(()),
            PolicyRequirement::SignedBy {
                key_type,
                key_path,
                key_paths,
                key_data,
                ..
            } => {
                if !GPG_KEY_TYPES.contains(&key_type.as_str()) {
                    return Err(format!("unknown signedBy keyType {:?}", key_type));
                }
                let sources = [key_path.is_some(), key_paths.is_some(), key_data.is_some()];
                if sources.iter().filter(|s| **s).count() != 1 {
                    return Err(
                        "signedBy needs exactly one of keyPath, keyPaths or keyData".to_string()
                    );
                }
                Ok(())
            }
            PolicyRequirement::SigstoreSigned {
                key_path,
                key_paths,
                key_data,
                key_datas,
                fulcio,
                ..
            } => {
                let sources = [
                    key_path.is_some(),
                    key_paths.is_some(),
                    key_data.is_some(),
                    key_datas.is_some(),
                    fulcio.is_some(),
                ];
                if sources.iter().filter(|s| **s).count() != 1 {
                    return Err(
                        "sigstoreSigned needs exactly one key source or fulcio".to_string()
                    );
                }
                Ok(())
            }
        }
    }

    fn evaluate(&self, image: &ImageReference) -> std::result::Result<(), PolicyRejection> {
        match self {
            PolicyRequirement::InsecureAcceptAnything => Ok(()),
            PolicyRequirement::Reject => Err(PolicyRejection::new(
                image,
                "running image is rejected by policy",
            )),
            PolicyRequirement::SignedBy { .. } | PolicyRequirement::SigstoreSigned { .. } => {
                Err(PolicyRejection::new(
                    image,
                    "a signature was required, but no signature exists",
                ))
            }
        }
    }
}

type PolicyTransportScopes = HashMap<String, Vec<PolicyRequirement>>;

/// A parsed and validated trust policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrustPolicy {
    default: Vec<PolicyRequirement>,
    #[serde(default)]
    transports: HashMap<String, PolicyTransportScopes>,
}

impl TrustPolicy {
    /// Accepts every image; used when no policy file is configured.
    pub fn permissive() -> Self {
        Self {
            default: vec![PolicyRequirement::InsecureAcceptAnything],
            transports: HashMap::new(),
        }
    }

    /// Load from `path`, or fall back to [`TrustPolicy::permissive`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                debug!("no trust policy configured, using permissive default");
                Ok(Self::permissive())
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| load_error(Some(path), e.to_string()))?;
        let policy = Self::from_slice(&data).map_err(|reason| load_error(Some(path), reason))?;
        info!(path = %path.display(), "loaded trust policy");
        Ok(policy)
    }

    pub fn from_slice(data: &[u8]) -> std::result::Result<Self, String> {
        let policy: TrustPolicy = serde_json::from_slice(data).map_err(|e| e.to_string())?;
        policy.validate()?;
        Ok(policy)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        validate_requirements("default", &self.default)?;
        for (transport, scopes) in &self.transports {
            if !KNOWN_TRANSPORTS.contains(&transport.as_str()) {
                return Err(format!("unknown transport {:?}", transport));
            }
            for (scope, requirements) in scopes {
                validate_requirements(&format!("{}:{:?}", transport, scope), requirements)?;
            }
        }
        Ok(())
    }

    /// Requirements governing `image`, falling back from the most specific
    /// scope to the transport default and then the global default.
    pub fn requirements_for(&self, image: &ImageReference) -> &[PolicyRequirement] {
        if let Some(scopes) = self.transports.get(image.transport()) {
            for scope in image.policy_scopes() {
                if let Some(requirements) = scopes.get(&scope) {
                    return requirements;
                }
            }
            if let Some(requirements) = scopes.get("") {
                return requirements;
            }
        }
        &self.default
    }
}

fn validate_requirements(
    scope: &str,
    requirements: &[PolicyRequirement],
) -> std::result::Result<(), String> {
    if requirements.is_empty() {
        return Err(format!("{} has an empty requirement list", scope));
    }
    for requirement in requirements {
        requirement
            .validate()
            .map_err(|reason| format!("{}: {}", scope, reason))?;
    }
    Ok(())
}

fn load_error(path: Option<&Path>, reason: String) -> MoverError {
    MoverError::PolicyLoadError {
        path: path.map(PathBuf::from),
        reason,
    }
}

/// The policy refused an image.
#[derive(Debug, Clone, Error)]
#[error("{image} rejected by trust policy: {reason}")]
pub struct PolicyRejection {
    pub image: String,
    pub reason: &'static str,
}

impl PolicyRejection {
    fn new(image: &ImageReference, reason: &'static str) -> Self {
        Self {
            image: image.to_string(),
            reason,
        }
    }
}

/// A shareable handle for evaluating a policy.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    policy: Arc<TrustPolicy>,
}

impl PolicyContext {
    pub fn new(policy: Arc<TrustPolicy>) -> Self {
        Self { policy }
    }

    /// Every requirement in scope must accept the image.
    pub fn is_image_allowed(&self, image: &ImageReference) -> std::result::Result<(), PolicyRejection> {
        for requirement in self.policy.requirements_for(image) {
            requirement.evaluate(image)?;
        }
        Ok(())
    }
}
