use std::{fmt, str::FromStr};

/// Generate the `MediaType` enum, its `FromStr` and `Display`
/// implementations, and the associated constant `ALL` with all
/// the valid values.
macro_rules! media_types {
    ($($variant:ident = $mediatype:expr,)*) => {
        /// Known media types.
        #[non_exhaustive]
        #[derive(Copy, Clone, PartialEq, Eq, Debug)]
        pub enum MediaType {
            $(
                #[doc = concat!("Variant for `", $mediatype, "`.")]
                $variant,
            )*
        }

        impl MediaType {
            /// List with all known media types.
            pub(crate) const ALL: &[&str] = &[ $($mediatype),* ];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(MediaType::$variant => $mediatype,)*
                }
            }
        }

        impl FromStr for MediaType {
            type Err = InvalidMediaType;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($mediatype => Ok(MediaType::$variant),)*
                    _ => Err(InvalidMediaType),
                }
            }
        }

        impl fmt::Display for MediaType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    }
}

media_types!(
    DockerManifestList = "application/vnd.docker.distribution.manifest.list.v2+json",
    DockerManifestV2 = "application/vnd.docker.distribution.manifest.v2+json",
    OciConfig = "application/vnd.oci.image.config.v1+json",
    OciEmptyConfig = "application/vnd.oci.empty.v1+json",
    OciImageIndex = "application/vnd.oci.image.index.v1+json",
    OciLayerTar = "application/vnd.oci.image.layer.v1.tar",
    OciManifestV1 = "application/vnd.oci.image.manifest.v1+json",
);

impl MediaType {
    /// Media types accepted when requesting a manifest.
    pub(crate) const MANIFESTS: &[MediaType] = &[
        MediaType::OciManifestV1,
        MediaType::DockerManifestV2,
        MediaType::OciImageIndex,
        MediaType::DockerManifestList,
    ];

    /// `Accept` header value listing every manifest and index media type.
    pub(crate) fn manifest_accept() -> String {
        let all: Vec<&str> = Self::MANIFESTS.iter().map(|m| m.as_str()).collect();
        all.join(", ")
    }

    /// Whether this media type names a manifest-of-manifests.
    pub fn is_index(&self) -> bool {
        matches!(self, MediaType::OciImageIndex | MediaType::DockerManifestList)
    }

    /// Whether this media type names a single-image manifest.
    pub fn is_manifest(&self) -> bool {
        matches!(self, MediaType::OciManifestV1 | MediaType::DockerManifestV2)
    }
}

pub struct InvalidMediaType;

struct MediaTypeVisitor;

impl serde::de::Visitor<'_> for MediaTypeVisitor {
    type Value = MediaType;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("Media type for OCI/Docker objects.")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        MediaType::from_str(v).map_err(|_| E::custom(format!("Unknown type: {v}")))
    }
}

impl<'de> serde::Deserialize<'de> for MediaType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(MediaTypeVisitor)
    }
}

impl serde::Serialize for MediaType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}
