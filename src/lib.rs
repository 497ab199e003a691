//! Client for the OCI Distribution Specification.
//!
//! Pushes and pulls content-addressed blobs, manifests and artifacts
//! against remote registries, and mirrors manifest graphs into the
//! OCI Image Layout directory format on local disk.
//!
//! The client is blocking and reentrant: one [`Registry`] value can be
//! shared across the caller's threads, and no operation spawns
//! background threads of its own.

pub mod auth;

mod copy;
mod digest;
mod errors;
mod events;
mod layout;
mod mediatype;
mod models;
mod reference;
mod registry;
mod transport;

pub use copy::{copy, push};
pub use digest::{Algorithm, Digest, DigestError};
pub use errors::{Error, Result};
pub use events::{CancelToken, EventHandler, NoEventHandler};
pub use layout::OciLayout;
pub use mediatype::MediaType;
pub use models::{
    Annotations, Descriptor, Index, Manifest, ManifestVariant, Platform, Tags,
    ANNOTATION_REF_NAME, ANNOTATION_TITLE, EMPTY_CONFIG_DIGEST, SCHEMA_VERSION,
};
pub use reference::{ParseError, Reference, DEFAULT_REGISTRY, DEFAULT_TAG};
pub use registry::{ArtifactPush, Registry, RegistryBuilder, TagIterator};
