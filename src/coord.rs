//! Image coordinates: `(source, repository, reference)`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::{Error, Result};

/// A known registry, or a custom host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    DockerHub,
    Quay,
    Ghcr,
    Custom(String),
}

impl Serialize for Source {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Source::parse(&s))
    }
}

impl Source {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "dockerhub" | "docker.io" | "docker-hub" => Source::DockerHub,
            "quay" | "quay.io" => Source::Quay,
            "ghcr" | "ghcr.io" => Source::Ghcr,
            _ => Source::Custom(s.to_string()),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::DockerHub => write!(f, "dockerhub"),
            Source::Quay => write!(f, "quay"),
            Source::Ghcr => write!(f, "ghcr"),
            Source::Custom(h) => write!(f, "{h}"),
        }
    }
}

/// `(os, architecture, variant)` selector matched against a manifest list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Default for Platform {
    fn default() -> Self {
        Platform {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            variant: None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}/{}/{}", self.os, self.architecture, v),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

/// `(source, repository, reference)`, where `reference` is a tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCoordinate {
    pub source: Source,
    pub repository: String,
    pub reference: String,
}

impl ImageCoordinate {
    /// Build a coordinate, normalising a bare Docker Hub name (`nginx`) to
    /// `library/nginx` the way `docker pull` does.
    pub fn new(source: Source, repository: &str, reference: &str) -> Result<Self> {
        if repository.trim().is_empty() {
            return Err(Error::InvalidArgument("repository name cannot be empty".into()));
        }
        if reference.trim().is_empty() {
            return Err(Error::InvalidArgument("reference cannot be empty".into()));
        }

        let repository = if source == Source::DockerHub && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository.to_string()
        };

        Ok(Self {
            source,
            repository,
            reference: reference.to_string(),
        })
    }

    pub fn is_digest_reference(&self) -> bool {
        self.reference.starts_with("sha256:")
    }
}

impl fmt::Display for ImageCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.source, self.repository, self.reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_bare_dockerhub_name() {
        let coord = ImageCoordinate::new(Source::DockerHub, "nginx", "latest").unwrap();
        assert_eq!(coord.repository, "library/nginx");
    }

    #[test]
    fn leaves_namespaced_repository_alone() {
        let coord = ImageCoordinate::new(Source::DockerHub, "library/nginx", "latest").unwrap();
        assert_eq!(coord.repository, "library/nginx");
    }

    #[test]
    fn rejects_empty_repository() {
        assert!(ImageCoordinate::new(Source::DockerHub, "", "latest").is_err());
    }

    #[test]
    fn source_parse_recognises_aliases() {
        assert_eq!(Source::parse("docker.io"), Source::DockerHub);
        assert_eq!(Source::parse("GHCR"), Source::Ghcr);
        assert_eq!(Source::parse("myregistry.example.com"), Source::Custom("myregistry.example.com".into()));
    }
}
