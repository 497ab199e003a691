//! Push and pull arbitrary files as OCI artifacts.

use std::fs::File;
use std::path::{Path, PathBuf};

use super::Registry;
use crate::digest::{Algorithm, Digest};
use crate::errors::{Error, Result};
use crate::mediatype::MediaType;
use crate::models::{
    Annotations, Descriptor, Manifest, ManifestVariant, ANNOTATION_TITLE, SCHEMA_VERSION,
};
use crate::reference::Reference;

/// What to publish as an artifact: local files plus optional
/// artifact type, annotations and config.
#[derive(Default)]
pub struct ArtifactPush {
    files: Vec<PathBuf>,
    artifact_type: Option<String>,
    annotations: Annotations,
    config: Option<(String, Vec<u8>)>,
}

impl ArtifactPush {
    pub fn new() -> ArtifactPush {
        ArtifactPush::default()
    }

    /// Add a file; it becomes one layer, named by an
    /// `org.opencontainers.image.title` annotation.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    pub fn artifact_type(mut self, artifact_type: impl Into<String>) -> Self {
        self.artifact_type = Some(artifact_type.into());
        self
    }

    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Use this config blob instead of the empty `{}` config.
    pub fn config(mut self, media_type: impl Into<String>, data: Vec<u8>) -> Self {
        self.config = Some((media_type.into(), data));
        self
    }
}

impl Registry {
    /// Push files as an artifact manifest under `reference`.
    ///
    /// Layers and the config are uploaded before the manifest, so the
    /// registry never sees a manifest with dangling references. The
    /// manifest goes under the reference's tag, or under its own
    /// digest when the reference has neither tag nor digest.
    pub fn push_artifact(
        &self,
        reference: &Reference,
        artifact: ArtifactPush,
    ) -> Result<(Manifest, Descriptor)> {
        let mut layers = Vec::with_capacity(artifact.files.len());

        for path in &artifact.files {
            let pushed = self.push_blob_file(reference, path)?;

            let mut layer =
                Descriptor::new(MediaType::OciLayerTar.as_str(), pushed.digest, pushed.size);

            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                layer = layer.with_annotation(ANNOTATION_TITLE, name);
            }

            layers.push(layer);
        }

        let config = match artifact.config {
            Some((media_type, data)) => self.push_config(reference, media_type, &data)?,
            None => {
                self.push_blob(reference, b"{}")?;
                Descriptor::empty_config()
            }
        };

        let manifest = Manifest {
            schema_version: SCHEMA_VERSION,
            media_type: Some(MediaType::OciManifestV1.as_str().to_owned()),
            artifact_type: artifact.artifact_type,
            config,
            layers,
            subject: None,
            annotations: (!artifact.annotations.is_empty()).then_some(artifact.annotations),
        };

        let bytes = serde_json::to_vec(&manifest)?;

        let target = if reference.tag.is_none() && reference.digest.is_none() {
            reference.with_digest(Digest::of_bytes(Algorithm::Sha256, &bytes))
        } else {
            reference.clone()
        };

        let descriptor = self.push_manifest_bytes(&target, manifest.media_type(), &bytes)?;

        Ok((manifest, descriptor))
    }

    /// Download an artifact's layers into `dir`. File names come from
    /// the layers' title annotations, falling back to the digest hex.
    ///
    /// Returns the written paths, in layer order.
    pub fn pull_artifact(&self, reference: &Reference, dir: &Path) -> Result<Vec<PathBuf>> {
        let (variant, descriptor) = self.get_manifest(reference)?;

        let manifest = match variant {
            ManifestVariant::Manifest(manifest) => manifest,
            ManifestVariant::Index(_) => {
                return Err(Error::manifest_header(&format!(
                    "Unsupported content type: {}",
                    descriptor.media_type,
                )));
            }
        };

        let mut paths = Vec::with_capacity(manifest.layers.len());

        for layer in &manifest.layers {
            let name = layer
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_TITLE))
                .map(String::as_str)
                .unwrap_or_else(|| layer.digest.hex());

            let path = dir.join(name);
            let mut file = File::create(&path)?;

            self.get_blob_to(reference, &layer.digest, &mut file)?;

            paths.push(path);
        }

        Ok(paths)
    }
}
