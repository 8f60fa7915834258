//! Image manifests, routed by `schemaVersion`
use std::fmt;

use bytes::Bytes;
use serde::Deserialize;

use crate::errors::{RegistryClientError, Result};

/// Docker schema 1 manifest, unsigned
pub const DOCKER_MANIFEST_V1_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v1+json";
/// Docker schema 1 manifest, JWS signed
pub const DOCKER_MANIFEST_V1_SIGNED_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
/// Docker schema 2 image manifest
pub const DOCKER_MANIFEST_V2_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
/// Docker schema 2 manifest list
pub const DOCKER_MANIFEST_LIST_V2_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image manifest
pub const OCI_IMAGE_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index
pub const OCI_IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Which manifest formats a `get_manifest_with` call is willing to receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestOptions {
    /// Highest schema version to accept, `1` or `2`
    pub max_schema_version: u8,
    /// Whether manifest lists and OCI indexes may be returned
    pub accept_manifest_lists: bool,
}

impl Default for ManifestOptions {
    fn default() -> Self {
        ManifestOptions {
            max_schema_version: 2,
            accept_manifest_lists: false,
        }
    }
}

impl ManifestOptions {
    /// Media types to advertise in `Accept`, most preferred first
    pub fn accepted_media_types(&self) -> Vec<&'static str> {
        let mut types = Vec::new();
        if self.max_schema_version >= 2 {
            types.push(DOCKER_MANIFEST_V2_MEDIA_TYPE);
            types.push(OCI_IMAGE_MEDIA_TYPE);
            if self.accept_manifest_lists {
                types.push(DOCKER_MANIFEST_LIST_V2_MEDIA_TYPE);
                types.push(OCI_IMAGE_INDEX_MEDIA_TYPE);
            }
        }
        types.push(DOCKER_MANIFEST_V1_SIGNED_MEDIA_TYPE);
        types.push(DOCKER_MANIFEST_V1_MEDIA_TYPE);
        types
    }

    pub(crate) fn accept_header(&self) -> String {
        self.accepted_media_types().join(", ")
    }
}

/// Structure of a manifest, derived from its schema version and media type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    /// Schema 1, with `fsLayers`, `history` and usually `signatures`
    V1,
    /// Docker schema 2 image manifest
    V2Image,
    /// Docker schema 2 manifest list
    V2List,
    /// OCI image manifest
    OciImage,
    /// OCI image index
    OciIndex,
}

impl ManifestKind {
    /// Whether the manifest points at other manifests rather than layers
    pub fn is_list(&self) -> bool {
        matches!(self, ManifestKind::V2List | ManifestKind::OciIndex)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Versioned {
    schema_version: i64,
    #[serde(default)]
    media_type: Option<String>,
}

/// A manifest as returned by the registry.
///
/// The body is kept both as the exact bytes received, which are what a
/// digest covers, and as decoded JSON. Beyond routing by `schemaVersion`
/// the content is not interpreted; the accessors read well-known fields.
#[derive(Debug, Clone)]
pub struct Manifest {
    kind: ManifestKind,
    schema_version: u8,
    media_type: Option<String>,
    value: serde_json::Value,
    raw: Bytes,
}

impl Manifest {
    /// Decode a manifest body. `content_type` is the response's
    /// `Content-Type`, used when the body does not declare a `mediaType`.
    pub fn from_bytes(raw: impl Into<Bytes>, content_type: Option<&str>) -> Result<Self> {
        let raw = raw.into();
        let value: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| RegistryClientError::ManifestParsing(e.to_string()))?;
        let versioned = Versioned::deserialize(&value)
            .map_err(|e| RegistryClientError::ManifestParsing(e.to_string()))?;

        let content_type = content_type
            .and_then(|ct| ct.split(';').next())
            .map(str::trim)
            .filter(|ct| !ct.is_empty());
        let media_type = versioned
            .media_type
            .or_else(|| content_type.map(str::to_string));

        let (schema_version, kind) = match versioned.schema_version {
            1 => (1, ManifestKind::V1),
            2 => {
                let kind = match media_type.as_deref() {
                    Some(DOCKER_MANIFEST_V2_MEDIA_TYPE) => ManifestKind::V2Image,
                    Some(DOCKER_MANIFEST_LIST_V2_MEDIA_TYPE) => ManifestKind::V2List,
                    Some(OCI_IMAGE_MEDIA_TYPE) => ManifestKind::OciImage,
                    Some(OCI_IMAGE_INDEX_MEDIA_TYPE) => ManifestKind::OciIndex,
                    _ if value.get("manifests").is_some() => ManifestKind::OciIndex,
                    _ => ManifestKind::OciImage,
                };
                (2, kind)
            }
            other => return Err(RegistryClientError::UnsupportedSchemaVersion(other)),
        };

        Ok(Manifest {
            kind,
            schema_version,
            media_type,
            value,
            raw,
        })
    }

    /// `1` or `2`
    pub fn schema_version(&self) -> u8 {
        self.schema_version
    }

    /// Declared media type, from the body or the response
    pub fn media_type(&self) -> Option<&str> {
        self.media_type.as_deref()
    }

    /// Structure of the manifest
    pub fn kind(&self) -> ManifestKind {
        self.kind
    }

    /// Repository name recorded in a schema 1 manifest
    pub fn name(&self) -> Option<&str> {
        self.value.get("name").and_then(|v| v.as_str())
    }

    /// Tag recorded in a schema 1 manifest
    pub fn tag(&self) -> Option<&str> {
        self.value.get("tag").and_then(|v| v.as_str())
    }

    /// Digests of the layer blobs, in the order the manifest lists them.
    /// Empty for manifest lists.
    pub fn layer_digests(&self) -> Vec<&str> {
        let (array, field) = match self.kind {
            ManifestKind::V1 => ("fsLayers", "blobSum"),
            ManifestKind::V2Image | ManifestKind::OciImage => ("layers", "digest"),
            ManifestKind::V2List | ManifestKind::OciIndex => return Vec::new(),
        };
        self.digests_of(array, field)
    }

    /// Digest of the image config blob
    pub fn config_digest(&self) -> Option<&str> {
        self.value
            .get("config")
            .and_then(|c| c.get("digest"))
            .and_then(|d| d.as_str())
    }

    /// Digests of the manifests a list or index points at
    pub fn manifest_digests(&self) -> Vec<&str> {
        if !self.kind.is_list() {
            return Vec::new();
        }
        self.digests_of("manifests", "digest")
    }

    fn digests_of(&self, array: &str, field: &str) -> Vec<&str> {
        self.value
            .get(array)
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e.get(field).and_then(|d| d.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Decoded JSON body
    pub fn as_json(&self) -> &serde_json::Value {
        &self.value
    }

    /// Exact bytes received
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Take the decoded JSON body
    pub fn into_json(self) -> serde_json::Value {
        self.value
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.raw))
    }
}
