//! Transport-qualified image references
//!
//! Two transports are understood: `docker://host/repo:tag` for registries and
//! `docker-archive:/path/to/image.tar` for local archives.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{MoverError, Result};

pub const DOCKER_TRANSPORT: &str = "docker";
pub const DOCKER_ARCHIVE_TRANSPORT: &str = "docker-archive";

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_REGISTRY_API_HOST: &str = "registry-1.docker.io";
const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReference {
    Docker(DockerReference),
    DockerArchive { path: PathBuf },
}

/// A normalized `registry/repository:tag` name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerReference {
    registry: String,
    repository: String,
    tag: String,
}

fn invalid(reference: &str, reason: impl Into<String>) -> MoverError {
    MoverError::InvalidReference {
        reference: reference.to_string(),
        reason: reason.into(),
    }
}

impl ImageReference {
    /// Parse `<transport>:<transport-specific reference>`.
    pub fn parse(input: &str) -> Result<Self> {
        let Some((transport, rest)) = input.split_once(':') else {
            return Err(invalid(input, "missing transport name"));
        };

        match transport {
            DOCKER_TRANSPORT => {
                let name = rest
                    .strip_prefix("//")
                    .ok_or_else(|| invalid(input, "docker references must start with docker://"))?;
                DockerReference::parse(name)
                    .map(ImageReference::Docker)
                    .map_err(|reason| invalid(input, reason))
            }
            DOCKER_ARCHIVE_TRANSPORT => {
                if rest.is_empty() {
                    return Err(invalid(input, "docker-archive reference has no path"));
                }
                Ok(ImageReference::DockerArchive {
                    path: PathBuf::from(rest),
                })
            }
            other => Err(invalid(input, format!("unknown transport {:?}", other))),
        }
    }

    pub fn docker_archive(path: &Path) -> Result<Self> {
        let text = path
            .to_str()
            .ok_or_else(|| invalid(&path.to_string_lossy(), "path is not valid UTF-8"))?;
        Self::parse(&format!("{}:{}", DOCKER_ARCHIVE_TRANSPORT, text))
    }

    pub fn transport(&self) -> &'static str {
        match self {
            ImageReference::Docker(_) => DOCKER_TRANSPORT,
            ImageReference::DockerArchive { .. } => DOCKER_ARCHIVE_TRANSPORT,
        }
    }

    /// Trust-policy scopes for this reference, most specific first.
    pub fn policy_scopes(&self) -> Vec<String> {
        match self {
            ImageReference::Docker(docker) => docker.policy_scopes(),
            ImageReference::DockerArchive { path } => {
                let absolute = if path.is_absolute() {
                    path.clone()
                } else {
                    std::env::current_dir()
                        .map(|cwd| cwd.join(path))
                        .unwrap_or_else(|_| path.clone())
                };
                absolute
                    .ancestors()
                    .map(|p| p.to_string_lossy().into_owned())
                    .filter(|p| !p.is_empty())
                    .collect()
            }
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageReference::Docker(docker) => write!(f, "{}://{}", DOCKER_TRANSPORT, docker),
            ImageReference::DockerArchive { path } => {
                write!(f, "{}:{}", DOCKER_ARCHIVE_TRANSPORT, path.display())
            }
        }
    }
}

impl DockerReference {
    /// Parse a docker-style name, applying Docker Hub defaults.
    pub fn parse(name: &str) -> std::result::Result<Self, String> {
        if name.is_empty() {
            return Err("empty image name".to_string());
        }
        if name.contains('@') {
            return Err("digest references are not supported".to_string());
        }

        let (remainder, tag) = match name.rfind(':') {
            Some(pos) if !name[pos + 1..].contains('/') => (&name[..pos], &name[pos + 1..]),
            _ => (name, DEFAULT_TAG),
        };

        let (registry, repository) = match remainder.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => (first.to_string(), rest.to_string()),
            Some(_) => (DEFAULT_REGISTRY.to_string(), remainder.to_string()),
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{}", remainder)),
        };

        validate_registry(&registry)?;
        validate_repository(&repository)?;
        validate_tag(tag)?;

        Ok(Self {
            registry,
            repository,
            tag: tag.to_string(),
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Host serving the v2 API; Docker Hub's API lives on a different name.
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DEFAULT_REGISTRY_API_HOST
        } else {
            &self.registry
        }
    }

    fn policy_scopes(&self) -> Vec<String> {
        let name = format!("{}/{}", self.registry, self.repository);
        let mut scopes = vec![format!("{}:{}", name, self.tag)];
        let mut current = name.as_str();
        scopes.push(current.to_string());
        while let Some(pos) = current.rfind('/') {
            current = &current[..pos];
            scopes.push(current.to_string());
        }
        scopes
    }
}

impl fmt::Display for DockerReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

fn is_registry_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn validate_registry(registry: &str) -> std::result::Result<(), String> {
    let valid = !registry.is_empty()
        && registry
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'));
    if valid {
        Ok(())
    } else {
        Err(format!("invalid registry host {:?}", registry))
    }
}

fn validate_repository(repository: &str) -> std::result::Result<(), String> {
    if repository.chars().any(|c| c.is_ascii_uppercase()) {
        return Err("repository name must be lowercase".to_string());
    }
    for component in repository.split('/') {
        let valid = !component.is_empty()
            && component
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
            && component.starts_with(|c: char| c.is_ascii_alphanumeric())
            && component.ends_with(|c: char| c.is_ascii_alphanumeric());
        if !valid {
            return Err(format!("invalid repository component {:?}", component));
        }
    }
    Ok(())
}

fn validate_tag(tag: &str) -> std::result::Result<(), String> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && tag.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(format!("invalid tag {:?}", tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docker(input: &str) -> DockerReference {
        match ImageReference::parse(input).unwrap() {
            ImageReference::Docker(reference) => reference,
            other => panic!("expected docker reference, got {other}"),
        }
    }

    #[test]
    fn parses_registry_repository_and_tag() {
        let reference = docker("docker://quay.io/cilium/cilium-dev:trolo");
        assert_eq!(reference.registry(), "quay.io");
        assert_eq!(reference.repository(), "cilium/cilium-dev");
        assert_eq!(reference.tag(), "trolo");
        assert_eq!(reference.api_host(), "quay.io");
    }

    #[test]
    fn registry_with_port_is_not_mistaken_for_a_tag() {
        let reference = docker("docker://localhost:5000/team/app");
        assert_eq!(reference.registry(), "localhost:5000");
        assert_eq!(reference.repository(), "team/app");
        assert_eq!(reference.tag(), "latest");
    }

    #[test]
    fn docker_hub_defaults() {
        let reference = docker("docker://busybox:1.36");
        assert_eq!(reference.registry(), "docker.io");
        assert_eq!(reference.repository(), "library/busybox");
        assert_eq!(reference.api_host(), "registry-1.docker.io");

        let reference = docker("docker://someone/tool:v2");
        assert_eq!(reference.repository(), "someone/tool");
    }

    #[test]
    fn rejects_malformed_references() {
        for input in [
            "quay.io/app:tag",
            "docker:quay.io/app:tag",
            "docker://",
            "docker://quay.io/App:tag",
            "docker://quay.io/app:bad tag",
            "docker://quay.io/app:tag:extra",
            "docker://quay.io/app@sha256:abc",
            "oci:/tmp/layout",
            "docker-archive:",
        ] {
            let err = ImageReference::parse(input).unwrap_err();
            assert!(
                matches!(err, MoverError::InvalidReference { .. }),
                "{input} should be invalid"
            );
        }
    }

    #[test]
    fn archive_reference_round_trips_to_string() {
        let reference = ImageReference::docker_archive(Path::new("/scratch/run/artifact")).unwrap();
        assert_eq!(reference.transport(), DOCKER_ARCHIVE_TRANSPORT);
        assert_eq!(reference.to_string(), "docker-archive:/scratch/run/artifact");
    }

    #[test]
    fn docker_scopes_go_from_specific_to_general() {
        let reference = ImageReference::parse("docker://quay.io/org/team/app:v1").unwrap();
        assert_eq!(
            reference.policy_scopes(),
            vec![
                "quay.io/org/team/app:v1",
                "quay.io/org/team/app",
                "quay.io/org/team",
                "quay.io/org",
                "quay.io",
            ]
        );
    }

    #[test]
    fn archive_scopes_are_path_ancestors() {
        let reference = ImageReference::parse("docker-archive:/scratch/run/image.tar").unwrap();
        assert_eq!(
            reference.policy_scopes(),
            vec!["/scratch/run/image.tar", "/scratch/run", "/scratch", "/"]
        );
    }
}
