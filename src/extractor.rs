use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    digest::Digest,
    error::{Error, Result},
};

pub const MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

const SCHEMA1_TYPES: [&str; 2] = [
    "application/vnd.docker.distribution.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v1+prettyjws",
];

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    schema_version: Option<u64>,
    media_type: Option<String>,
    artifact_type: Option<String>,
    config: Option<Descriptor>,
    layers: Option<Vec<Descriptor>>,
    manifests: Option<Vec<Descriptor>>,
    subject: Option<Descriptor>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct ManifestInfo {
    pub media_type: String,
    pub artifact_type: Option<String>,
    pub annotations: BTreeMap<String, String>,
    pub manifests: Vec<Descriptor>,
    pub blobs: Vec<Descriptor>,
    pub subject: Option<Descriptor>,
}

impl ManifestInfo {
    pub fn is_index(&self) -> bool {
        self.media_type == OCI_INDEX || self.media_type == DOCKER_MANIFEST_LIST
    }
}

fn is_image(media_type: &str) -> bool {
    media_type == OCI_MANIFEST || media_type == DOCKER_MANIFEST
}

fn is_index(media_type: &str) -> bool {
    media_type == OCI_INDEX || media_type == DOCKER_MANIFEST_LIST
}

/// Strips parameters such as `; charset=utf-8` from a content type.
fn essence(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
}

/// Parses a pushed manifest and works out what it references. The media
/// type comes from the document, falling back to the request content type,
/// falling back to the document's shape.
pub fn parse_manifest(content_type: Option<&str>, input: &[u8]) -> Result<ManifestInfo> {
    if input.len() > MAX_MANIFEST_SIZE {
        return Err(Error::ManifestInvalid(format!(
            "manifest exceeds {MAX_MANIFEST_SIZE} bytes"
        )));
    }

    let content_type = content_type.map(essence).filter(|ct| !ct.is_empty());

    if let Some(ct) = content_type {
        if SCHEMA1_TYPES.contains(&ct) {
            return Err(Error::Unsupported(format!("{ct} manifests")));
        }
    }

    let raw: RawManifest = serde_json::from_slice(input)
        .map_err(|err| Error::ManifestInvalid(err.to_string()))?;

    match raw.schema_version {
        Some(2) => {}
        Some(1) => return Err(Error::Unsupported("schema 1 manifests".into())),
        Some(other) => {
            return Err(Error::ManifestInvalid(format!(
                "unknown schemaVersion {other}"
            )));
        }
        None => return Err(Error::ManifestInvalid("missing schemaVersion".into())),
    }

    let media_type = match (raw.media_type.as_deref(), content_type) {
        (Some(document), Some(ct)) if document != ct => {
            return Err(Error::ManifestInvalid(format!(
                "mediaType {document} does not match Content-Type {ct}"
            )));
        }
        (Some(document), _) => document.to_string(),
        (None, Some(ct)) if is_image(ct) || is_index(ct) => ct.to_string(),
        (None, _) if raw.manifests.is_some() => OCI_INDEX.to_string(),
        (None, _) if raw.config.is_some() => OCI_MANIFEST.to_string(),
        (None, _) => {
            return Err(Error::ManifestInvalid(
                "unable to determine manifest media type".into(),
            ));
        }
    };

    if is_image(&media_type) {
        let (Some(config), Some(layers)) = (raw.config, raw.layers) else {
            return Err(Error::ManifestInvalid(
                "image manifests need config and layers".into(),
            ));
        };

        let artifact_type = raw
            .artifact_type
            .or_else(|| Some(config.media_type.clone()));

        let mut blobs = vec![config];
        blobs.extend(layers);

        return Ok(ManifestInfo {
            media_type,
            artifact_type,
            annotations: raw.annotations,
            manifests: vec![],
            blobs,
            subject: raw.subject,
        });
    }

    if is_index(&media_type) {
        let Some(manifests) = raw.manifests else {
            return Err(Error::ManifestInvalid("indexes need manifests".into()));
        };

        return Ok(ManifestInfo {
            media_type,
            artifact_type: raw.artifact_type,
            annotations: raw.annotations,
            manifests,
            blobs: vec![],
            subject: raw.subject,
        });
    }

    Err(Error::Unsupported(format!("{media_type} manifests")))
}
