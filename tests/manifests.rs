//! Manifest polymorphism, artifact pull, and referrers.

mod common;

use std::fs;

use common::registry::start_registry;
use common::{client, reference};
use oci_mirror::{
    Algorithm, ArtifactPush, Descriptor, Digest, Index, Manifest, ManifestVariant, MediaType,
};

#[test]
fn manifest_and_index_are_discriminated_by_content_type() {
    let registry = start_registry();
    let client = client();
    let reference = reference(&registry.host(), "poly");

    let config = client.push_blob(&reference, b"{}").unwrap();

    let manifest = Manifest::empty().with_layers(vec![Descriptor::new(
        MediaType::OciLayerTar.as_str(),
        config.digest,
        2,
    )]);
    let manifest_descriptor = client.push_manifest(&reference, &manifest).unwrap();

    let (variant, descriptor) = client.get_manifest(&reference).unwrap();
    assert!(matches!(variant, ManifestVariant::Manifest(_)));
    assert_eq!(descriptor.digest, manifest_descriptor.digest);

    // Now point the same tag at an index.
    let index = Index::from_manifests(vec![manifest_descriptor]);
    client.push_index(&reference, &index).unwrap();

    let (variant, descriptor) = client.get_manifest(&reference).unwrap();
    assert_eq!(
        descriptor.media_type,
        MediaType::OciImageIndex.as_str(),
    );
    match variant {
        ManifestVariant::Index(index) => assert_eq!(index.manifests.len(), 1),
        ManifestVariant::Manifest(_) => panic!("expected an index"),
    }
}

#[test]
fn artifact_pull_restores_files_by_title() {
    let registry = start_registry();
    let client = client();
    let reference = reference(&registry.host(), "files");

    let source = tempfile::tempdir().unwrap();
    let readme = source.path().join("README.md");
    fs::write(&readme, "hello artifact").unwrap();

    client
        .push_artifact(
            &reference,
            ArtifactPush::new()
                .file(&readme)
                .artifact_type("application/vnd.test.artifact")
                .annotation("org.example.kind", "docs"),
        )
        .expect("push artifact");

    let target = tempfile::tempdir().unwrap();
    let paths = client
        .pull_artifact(&reference, target.path())
        .expect("pull artifact");

    assert_eq!(paths, [target.path().join("README.md")]);
    assert_eq!(fs::read_to_string(&paths[0]).unwrap(), "hello artifact");
}

#[test]
fn referrers_fall_back_to_the_tag_schema() {
    let registry = start_registry();
    let client = client();
    let reference = reference(&registry.host(), "refer");

    let subject = Digest::of_bytes(Algorithm::Sha256, b"subject-manifest");

    let referrer = Descriptor::new(
        MediaType::OciManifestV1.as_str(),
        Digest::of_bytes(Algorithm::Sha256, b"attached"),
        8,
    );
    let index = Index::from_manifests(vec![referrer]);

    registry.put_manifest(
        "library/refer",
        &format!("sha256-{}", subject.hex()),
        MediaType::OciImageIndex.as_str(),
        &serde_json::to_vec(&index).unwrap(),
    );

    let found = client.referrers(&reference, &subject).unwrap();
    assert_eq!(found.manifests.len(), 1);

    // No referrers anywhere: an empty index, not an error.
    let missing = Digest::of_bytes(Algorithm::Sha256, b"nothing-points-here");
    let found = client.referrers(&reference, &missing).unwrap();
    assert!(found.manifests.is_empty());
}
