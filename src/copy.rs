//! Transfer manifest graphs between a registry and a local layout.

use std::io::BufReader;

use crate::digest::Digest;
use crate::errors::{Error, Result};
use crate::layout::OciLayout;
use crate::mediatype::MediaType;
use crate::models::{Descriptor, ManifestVariant};
use crate::reference::Reference;
use crate::registry::Registry;

/// Mirror the manifest graph at `reference` into a layout.
///
/// Every descriptor reachable from the reference ends up as a blob
/// under `blobs/`, and the top-level manifest or index is recorded in
/// `index.json` under the reference's tag. Blobs already present are
/// not downloaded again, so re-running a copy settles into HEAD-only
/// traffic.
///
/// The walk is fail-fast: the first error aborts it, leaving behind
/// only complete blobs.
pub fn copy(registry: &Registry, reference: &Reference, layout: &OciLayout) -> Result<Descriptor> {
    registry.cancel.check()?;

    let (media_type, digest, _size) = registry.head_manifest(reference)?;

    let descriptor = copy_node(registry, reference, media_type, &digest, layout)?;

    layout.add_manifest_to_index(&descriptor, reference.tag.as_deref())?;

    Ok(descriptor)
}

/// Materialize one manifest or index, then its children.
fn copy_node(
    registry: &Registry,
    reference: &Reference,
    media_type: MediaType,
    digest: &Digest,
    layout: &OciLayout,
) -> Result<Descriptor> {
    registry.cancel.check()?;

    let node = reference.with_digest(digest.clone());

    // A manifest blob that is already local spares the GET; the graph
    // below it is walked either way.
    let (bytes, media_type) = if layout.has_blob(digest) {
        (layout.get_blob_bytes(digest)?, media_type)
    } else {
        let (bytes, wire_type, _header_digest) = registry.get_manifest_bytes(&node)?;

        // Keyed by the digest the parent declared; the store verifies
        // the content against it.
        layout.put_blob_bytes(digest, &bytes)?;

        (bytes, wire_type.unwrap_or(media_type))
    };

    match ManifestVariant::from_bytes(Some(media_type), &bytes)? {
        ManifestVariant::Index(index) => {
            for child in &index.manifests {
                let child_type = manifest_media_type(&child.media_type)?;
                copy_node(registry, reference, child_type, &child.digest, layout)?;
            }
        }

        ManifestVariant::Manifest(manifest) => {
            copy_blob(registry, &node, &manifest.config, layout)?;

            for layer in &manifest.layers {
                copy_blob(registry, &node, layer, layout)?;
            }
        }
    }

    Ok(Descriptor::new(
        media_type.as_str(),
        digest.clone(),
        bytes.len() as u64,
    ))
}

/// Bring one leaf blob into the layout, HEAD first, then streaming
/// the GET body straight into the store.
fn copy_blob(
    registry: &Registry,
    reference: &Reference,
    descriptor: &Descriptor,
    layout: &OciLayout,
) -> Result<()> {
    registry.cancel.check()?;

    if layout.has_blob(&descriptor.digest) {
        return Ok(());
    }

    registry.head_blob(reference, &descriptor.digest)?;

    let reader = registry.blob_reader(reference, &descriptor.digest)?;
    layout.put_blob(&descriptor.digest, reader)?;

    Ok(())
}

/// Push the manifest graph a layout holds for `reference` to a
/// registry.
///
/// Children go strictly before their parents: a manifest is only PUT
/// once its config, layers, and (for an index) child manifests are on
/// the registry, so the registry never sees a dangling reference.
pub fn push(layout: &OciLayout, reference: &Reference, registry: &Registry) -> Result<Descriptor> {
    registry.cancel.check()?;

    let root = layout.resolve(reference.tag.as_deref(), reference.digest.as_ref())?;

    push_node(registry, reference, reference, &root, layout)
}

/// Upload one manifest's children, then the manifest itself under
/// `target` (the tagged reference for the root, digests below it).
fn push_node(
    registry: &Registry,
    repository: &Reference,
    target: &Reference,
    descriptor: &Descriptor,
    layout: &OciLayout,
) -> Result<Descriptor> {
    registry.cancel.check()?;

    let media_type = manifest_media_type(&descriptor.media_type)?;
    let bytes = layout.get_blob_bytes(&descriptor.digest)?;

    match ManifestVariant::from_bytes(Some(media_type), &bytes)? {
        ManifestVariant::Index(index) => {
            for child in &index.manifests {
                let child_target = repository.with_digest(child.digest.clone());
                push_node(registry, repository, &child_target, child, layout)?;
            }
        }

        ManifestVariant::Manifest(manifest) => {
            push_blob_from_layout(registry, repository, &manifest.config, layout)?;

            for layer in &manifest.layers {
                push_blob_from_layout(registry, repository, layer, layout)?;
            }
        }
    }

    registry.push_manifest_bytes(target, media_type.as_str(), &bytes)
}

fn push_blob_from_layout(
    registry: &Registry,
    reference: &Reference,
    descriptor: &Descriptor,
    layout: &OciLayout,
) -> Result<()> {
    registry.cancel.check()?;

    if registry.has_blob(reference, &descriptor.digest)? {
        return Ok(());
    }

    let file = layout.get_blob(&descriptor.digest)?;
    let size = file.metadata()?.len();

    let pushed = registry.push_blob_stream_as(
        reference,
        BufReader::new(file),
        size,
        descriptor.digest.algorithm(),
    )?;

    if pushed.digest != descriptor.digest {
        return Err(Error::DigestMismatch {
            expected: descriptor.digest.to_string(),
            computed: pushed.digest.to_string(),
        });
    }

    Ok(())
}

fn manifest_media_type(media_type: &str) -> Result<MediaType> {
    media_type
        .parse::<MediaType>()
        .ok()
        .filter(|t| t.is_manifest() || t.is_index())
        .ok_or_else(|| Error::manifest_header(&format!("Unsupported content type: {media_type}")))
}
