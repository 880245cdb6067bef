//! Manifest, manifest-list and OCI index parsing, and platform selection.

use serde::Deserialize;

use crate::coord::Platform;
use crate::error::{Error, Result};

pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// The `Accept` header sent on every manifest GET, listing every shape we
/// know how to parse so the registry can pick whichever it has on hand.
pub fn accept_header() -> String {
    [
        MEDIA_TYPE_DOCKER_MANIFEST,
        MEDIA_TYPE_DOCKER_MANIFEST_LIST,
        MEDIA_TYPE_OCI_MANIFEST,
        MEDIA_TYPE_OCI_INDEX,
    ]
    .join(", ")
}

fn is_list_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST || media_type == MEDIA_TYPE_OCI_INDEX
}

#[derive(Debug, Deserialize)]
struct PlatformDescriptor {
    os: String,
    architecture: String,
    variant: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ManifestListEntry {
    digest: String,
    platform: Option<PlatformDescriptor>,
}

#[derive(Debug, Deserialize)]
struct ManifestListDocument {
    manifests: Vec<ManifestListEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ManifestLayer {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
pub struct ManifestConfigDescriptor {
    pub digest: String,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
pub struct ConcreteManifest {
    pub config: ManifestConfigDescriptor,
    pub layers: Vec<ManifestLayer>,
}

/// A manifest GET response body, parsed just enough to dispatch on shape.
pub enum ManifestDocument {
    List(Vec<(String, Option<Platform>)>),
    Concrete(ConcreteManifest),
}

pub fn parse_manifest_body(body: &[u8], media_type: &str) -> Result<ManifestDocument> {
    if is_list_media_type(media_type) {
        let doc: ManifestListDocument = serde_json::from_slice(body)
            .map_err(|e| Error::ProtocolViolation(format!("unparsable manifest list: {e}")))?;
        let entries = doc
            .manifests
            .into_iter()
            .map(|m| {
                let platform = m.platform.map(|p| Platform {
                    os: p.os,
                    architecture: p.architecture,
                    variant: p.variant,
                });
                (m.digest, platform)
            })
            .collect();
        Ok(ManifestDocument::List(entries))
    } else if media_type == MEDIA_TYPE_DOCKER_MANIFEST || media_type == MEDIA_TYPE_OCI_MANIFEST {
        let doc: ConcreteManifest = serde_json::from_slice(body)
            .map_err(|e| Error::ProtocolViolation(format!("unparsable manifest: {e}")))?;
        Ok(ManifestDocument::Concrete(doc))
    } else {
        Err(Error::ProtocolViolation(format!(
            "unexpected manifest content-type: {media_type}"
        )))
    }
}

/// Select the manifest-list entry matching `platform`.
///
/// Tie-break order: exact `(os, architecture, variant)` match, then same
/// `architecture` with any `os` and no/matching `variant`, then the first
/// entry in document order. Only an empty list is `NotFound`; a non-empty
/// list always resolves to something, the first entry at worst.
pub fn select_platform(entries: &[(String, Option<Platform>)], wanted: &Platform) -> Result<String> {
    if entries.is_empty() {
        return Err(Error::NotFound("manifest list has no entries".into()));
    }

    if let Some((digest, _)) = entries.iter().find(|(_, p)| p.as_ref() == Some(wanted)) {
        return Ok(digest.clone());
    }

    if let Some((digest, _)) = entries.iter().find(|(_, p)| {
        p.as_ref().is_some_and(|p| {
            p.architecture == wanted.architecture
                && (p.variant.is_none() || p.variant == wanted.variant)
        })
    }) {
        return Ok(digest.clone());
    }

    Ok(entries[0].0.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(digest: &str, os: &str, arch: &str, variant: Option<&str>) -> (String, Option<Platform>) {
        (
            digest.to_string(),
            Some(Platform {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: variant.map(str::to_string),
            }),
        )
    }

    #[test]
    fn exact_match_wins() {
        let entries = vec![
            entry("sha256:a", "linux", "arm64", None),
            entry("sha256:b", "linux", "amd64", None),
        ];
        let wanted = Platform { os: "linux".into(), architecture: "amd64".into(), variant: None };
        assert_eq!(select_platform(&entries, &wanted).unwrap(), "sha256:b");
    }

    #[test]
    fn falls_back_to_architecture_match() {
        let entries = vec![entry("sha256:a", "windows", "amd64", None)];
        let wanted = Platform { os: "linux".into(), architecture: "amd64".into(), variant: None };
        assert_eq!(select_platform(&entries, &wanted).unwrap(), "sha256:a");
    }

    #[test]
    fn empty_list_is_not_found() {
        let wanted = Platform::default();
        let err = select_platform(&[], &wanted).unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[test]
    fn no_matching_platform_falls_back_to_the_first_entry() {
        let entries = vec![
            entry("sha256:a", "linux", "arm64", Some("v7")),
            entry("sha256:b", "linux", "riscv64", None),
        ];
        let wanted = Platform { os: "linux".into(), architecture: "s390x".into(), variant: None };
        assert_eq!(select_platform(&entries, &wanted).unwrap(), "sha256:a");
    }
}
