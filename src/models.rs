//! Wire models for manifests, indexes and descriptors.
//!
//! Refs:
//!
//! * <https://github.com/opencontainers/image-spec/blob/main/manifest.md>
//! * <https://github.com/opencontainers/image-spec/blob/main/image-index.md>

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::mediatype::MediaType;

/// `schemaVersion` for OCI and Docker v2 manifests.
pub const SCHEMA_VERSION: i32 = 2;

/// Annotation naming the tag of an entry in a layout index.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Annotation carrying the file name of an artifact layer.
pub const ANNOTATION_TITLE: &str = "org.opencontainers.image.title";

/// Digest of the two-byte `{}` empty config blob.
pub const EMPTY_CONFIG_DIGEST: &str =
    "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a";

/// Arbitrary key/value metadata. Ordered so serialized JSON is stable.
pub type Annotations = BTreeMap<String, String>;

/// A typed pointer to a blob.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,

    pub digest: Digest,

    pub size: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    /// Base64 of the blob itself, embedded for tiny blobs like the
    /// empty config.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Descriptor {
        Descriptor {
            media_type: media_type.into(),
            digest,
            size,
            urls: None,
            annotations: None,
            artifact_type: None,
            platform: None,
            data: None,
        }
    }

    /// Descriptor of the empty `{}` config.
    ///
    /// <https://github.com/opencontainers/image-spec/blob/main/manifest.md#guidance-for-an-empty-descriptor>
    pub fn empty_config() -> Descriptor {
        let mut descriptor = Descriptor::new(
            MediaType::OciEmptyConfig.as_str(),
            EMPTY_CONFIG_DIGEST.parse().expect("well-formed digest"),
            2,
        );
        descriptor.data = Some("e30=".to_owned());
        descriptor
    }

    pub fn with_annotation(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Descriptor {
        self.annotations
            .get_or_insert_with(Annotations::new)
            .insert(key.into(), value.into());
        self
    }

    /// Tag recorded under the `org.opencontainers.image.ref.name`
    /// annotation, if any.
    pub fn ref_name(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_REF_NAME))
            .map(String::as_str)
    }
}

/// Platform selector inside an index entry.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,

    pub os: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// An image or artifact manifest.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

impl Manifest {
    /// Manifest with the empty config and no layers.
    pub fn empty() -> Manifest {
        Manifest {
            schema_version: SCHEMA_VERSION,
            media_type: Some(MediaType::OciManifestV1.as_str().to_owned()),
            artifact_type: None,
            config: Descriptor::empty_config(),
            layers: Vec::new(),
            subject: None,
            annotations: None,
        }
    }

    pub fn with_layers(mut self, layers: Vec<Descriptor>) -> Manifest {
        self.layers = layers;
        self
    }

    /// Declared media type, falling back to the OCI manifest type.
    pub fn media_type(&self) -> &str {
        self.media_type
            .as_deref()
            .unwrap_or(MediaType::OciManifestV1.as_str())
    }
}

/// A manifest-of-manifests.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub schema_version: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    pub manifests: Vec<Descriptor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

impl Index {
    pub fn from_manifests(manifests: Vec<Descriptor>) -> Index {
        Index {
            schema_version: SCHEMA_VERSION,
            media_type: Some(MediaType::OciImageIndex.as_str().to_owned()),
            manifests,
            annotations: None,
        }
    }

    pub fn media_type(&self) -> &str {
        self.media_type
            .as_deref()
            .unwrap_or(MediaType::OciImageIndex.as_str())
    }
}

/// Either kind of document a manifest endpoint can return,
/// discriminated by `Content-Type` first and the embedded
/// `mediaType` second.
#[derive(Clone, PartialEq, Debug)]
pub enum ManifestVariant {
    Manifest(Manifest),
    Index(Index),
}

impl ManifestVariant {
    pub(crate) fn from_bytes(
        content_type: Option<MediaType>,
        bytes: &[u8],
    ) -> serde_json::Result<ManifestVariant> {
        let by_wire_type = content_type.map(|t| t.is_index());

        let is_index = match by_wire_type {
            Some(is_index) => is_index,
            None => embedded_media_type(bytes)
                .map(|t| t.is_index())
                .unwrap_or(false),
        };

        if is_index {
            Ok(ManifestVariant::Index(serde_json::from_slice(bytes)?))
        } else {
            Ok(ManifestVariant::Manifest(serde_json::from_slice(bytes)?))
        }
    }

    pub fn media_type(&self) -> &str {
        match self {
            ManifestVariant::Manifest(m) => m.media_type(),
            ManifestVariant::Index(i) => i.media_type(),
        }
    }
}

fn embedded_media_type(bytes: &[u8]) -> Option<MediaType> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Probe {
        media_type: Option<String>,
    }

    let probe: Probe = serde_json::from_slice(bytes).ok()?;
    probe.media_type?.parse().ok()
}

/// The tag-list document returned by `/v2/<name>/tags/list`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tags {
    pub name: String,

    pub tags: Vec<String>,
}
