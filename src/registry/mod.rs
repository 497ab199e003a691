//! Client for the OCI distribution protocol.
//!
//! All endpoints are rooted at `https://<host>/v2/`. See
//! <https://github.com/opencontainers/distribution-spec/blob/main/spec.md>.

mod artifact;
mod tags;
mod upload;

pub use artifact::ArtifactPush;
pub use tags::TagIterator;

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{Authenticator, ChainProvider, CredentialProvider};
use crate::digest::{Algorithm, Digest};
use crate::errors::{Error, Result};
use crate::events::{CancelToken, EventHandler, NoEventHandler};
use crate::mediatype::MediaType;
use crate::models::{Descriptor, Index, Manifest, ManifestVariant};
use crate::reference::{Reference, DEFAULT_REGISTRY};
use crate::transport::{Transport, TransportRequest, DEFAULT_RETRIES};

pub(crate) const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

const OCTET_STREAM: &str = "application/octet-stream";

/// Copy buffer for blob downloads.
const BUFFER_SIZE: usize = 8 * 1024;

#[derive(Copy, Clone, PartialEq, Debug)]
pub(crate) enum Operation {
    Pull,
    Push,
}

/// A client for one or more OCI registries.
///
/// The value is immutable after construction and can be shared across
/// threads; per-request state lives on the stack, and the only shared
/// mutable state is the token cache behind a mutex.
pub struct Registry {
    pub(crate) transport: Transport,
    auth: Authenticator,
    insecure: bool,
    context_path: Option<String>,
    default_registry: Option<String>,
    pub(crate) events: Arc<dyn EventHandler>,
    pub(crate) cancel: CancelToken,
}

/// Configuration for a [`Registry`], applied once at build time.
pub struct RegistryBuilder {
    provider: Option<Box<dyn CredentialProvider>>,
    insecure: bool,
    context_path: Option<String>,
    default_registry: Option<String>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    retries: u32,
    events: Arc<dyn EventHandler>,
    cancel: CancelToken,
}

impl RegistryBuilder {
    /// Credential source for all hosts. Defaults to the docker config
    /// files named by the environment.
    pub fn auth_provider(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.provider = Some(Box::new(provider));
        self
    }

    /// Talk plain `http` and skip TLS verification. Off by default;
    /// both effects are tied to this single explicit switch.
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Path prefix inserted before `/v2/`, for registries served
    /// under a subpath.
    pub fn context_path(mut self, path: impl Into<String>) -> Self {
        self.context_path = Some(path.into());
        self
    }

    /// Host used instead of Docker Hub for references that do not
    /// name a registry.
    pub fn registry(mut self, host: impl Into<String>) -> Self {
        self.default_registry = Some(host.into());
        self
    }

    /// Connect timeout per request. Defaults to 30 seconds.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Overall read deadline per request. No limit by default, so
    /// large blobs can take as long as they need.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Attempt budget for transient transport failures.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn event_handler(mut self, handler: impl EventHandler) -> Self {
        self.events = Arc::new(handler);
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn build(self) -> Result<Registry> {
        let provider = self
            .provider
            .unwrap_or_else(|| Box::new(ChainProvider::from_env()));

        let transport = Transport::new(
            self.insecure,
            self.connect_timeout,
            self.read_timeout,
            self.retries,
            self.cancel.clone(),
            self.events.clone(),
        )?;

        Ok(Registry {
            transport,
            auth: Authenticator::new(provider, self.events.clone()),
            insecure: self.insecure,
            context_path: self.context_path,
            default_registry: self.default_registry,
            events: self.events,
            cancel: self.cancel,
        })
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            provider: None,
            insecure: false,
            context_path: None,
            default_registry: None,
            connect_timeout: None,
            read_timeout: None,
            retries: DEFAULT_RETRIES,
            events: Arc::new(NoEventHandler),
            cancel: CancelToken::new(),
        }
    }

    fn scheme(&self) -> &'static str {
        if self.insecure {
            "http"
        } else {
            "https"
        }
    }

    fn host_for<'r>(&'r self, reference: &'r Reference) -> &'r str {
        match &self.default_registry {
            Some(host) if reference.registry == DEFAULT_REGISTRY => host,
            _ => &reference.registry,
        }
    }

    fn v2_url(&self, host: &str, path: &str) -> String {
        match &self.context_path {
            Some(prefix) => format!(
                "{}://{}/{}/v2/{}",
                self.scheme(),
                host,
                prefix.trim_matches('/'),
                path,
            ),
            None => format!("{}://{}/v2/{}", self.scheme(), host, path),
        }
    }

    fn blob_url(&self, reference: &Reference, digest: &Digest) -> String {
        let host = self.host_for(reference);
        self.v2_url(host, &format!("{}/blobs/{}", reference.repository, digest))
    }

    fn manifest_url(&self, reference: &Reference) -> String {
        let host = self.host_for(reference);
        self.v2_url(
            host,
            &format!("{}/manifests/{}", reference.repository, reference.identifier()),
        )
    }

    /// Send a request with credentials, answering one authentication
    /// challenge if the registry issues one.
    pub(crate) fn execute(
        &self,
        reference: &Reference,
        operation: Operation,
        mut request: TransportRequest,
    ) -> Result<ureq::Response> {
        let host = self.host_for(reference);
        let scope = scope_for(&reference.repository, operation);

        request.authorization = self.auth.authorization(host, &scope);

        let response = self.transport.send(&request)?;
        if response.status() != 401 {
            return Ok(response);
        }

        // The cached token, if any, no longer works.
        self.auth.invalidate(host, &scope);

        let unauthorized = || Error::Unauthorized {
            host: host.to_owned(),
        };

        let Some(challenge) = response.header("WWW-Authenticate").map(str::to_owned) else {
            return Err(unauthorized());
        };

        let Some(authorization) = self
            .auth
            .negotiate(&self.transport, host, &scope, &challenge)?
        else {
            return Err(unauthorized());
        };

        request.authorization = Some(authorization);

        let response = self.transport.send(&request)?;
        if response.status() == 401 {
            self.auth.invalidate(host, &scope);
            return Err(unauthorized());
        }

        Ok(response)
    }

    /// `GET /v2/`: check the API is reachable and warm authentication.
    pub fn ping(&self, host: &str) -> Result<()> {
        let reference = Reference::for_registry(host);
        let url = self.v2_url(host, "");

        let response = self.execute(&reference, Operation::Pull, TransportRequest::new("GET", url))?;

        match response.status() {
            200 => Ok(()),
            _ => Err(unexpected_status(response)),
        }
    }

    /// `HEAD` a blob. Returns its descriptor, or [`Error::NotFound`].
    pub fn head_blob(&self, reference: &Reference, digest: &Digest) -> Result<Descriptor> {
        let url = self.blob_url(reference, digest);

        let response =
            self.execute(reference, Operation::Pull, TransportRequest::new("HEAD", url))?;

        match response.status() {
            200 => {
                if let Some(header) = response.header(DOCKER_CONTENT_DIGEST) {
                    if header != digest.to_string() {
                        return Err(Error::DigestMismatch {
                            expected: digest.to_string(),
                            computed: header.to_owned(),
                        });
                    }
                }

                let size = response
                    .header("Content-Length")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);

                Ok(Descriptor::new(OCTET_STREAM, digest.clone(), size))
            }
            404 => Err(Error::NotFound(format!("{reference}@{digest}"))),
            _ => Err(unexpected_status(response)),
        }
    }

    pub fn has_blob(&self, reference: &Reference, digest: &Digest) -> Result<bool> {
        match self.head_blob(reference, digest) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Download a blob into memory. Prefer [`Registry::get_blob_to`]
    /// for large content.
    pub fn get_blob(&self, reference: &Reference, digest: &Digest) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.get_blob_to(reference, digest, &mut data)?;
        Ok(data)
    }

    /// Stream a blob into `output`, verifying its digest. The write
    /// only counts as successful once the computed digest matches.
    pub fn get_blob_to(
        &self,
        reference: &Reference,
        digest: &Digest,
        output: &mut dyn Write,
    ) -> Result<u64> {
        let reader = self.blob_reader(reference, digest)?;
        self.verify_copy(digest, reader, output)
    }

    /// Open the response body for a blob without verifying it; the
    /// caller owns digest verification (the layout store does its own
    /// while writing).
    pub(crate) fn blob_reader(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> Result<impl Read + Send> {
        let url = self.blob_url(reference, digest);

        let response =
            self.execute(reference, Operation::Pull, TransportRequest::new("GET", url))?;

        match response.status() {
            200 => Ok(response.into_reader()),
            404 => Err(Error::NotFound(format!("{reference}@{digest}"))),
            _ => Err(unexpected_status(response)),
        }
    }

    fn verify_copy(
        &self,
        digest: &Digest,
        mut reader: impl Read,
        output: &mut dyn Write,
    ) -> Result<u64> {
        let mut hasher = digest.algorithm().hasher();
        let mut buffer = [0u8; BUFFER_SIZE];
        let mut total = 0u64;

        loop {
            self.cancel.check()?;

            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }

            hasher.update(&buffer[..n]);
            output.write_all(&buffer[..n])?;
            total += n as u64;
            self.events.download_progress(n);
        }

        let computed = hasher.finish();
        if computed != *digest {
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                computed: computed.to_string(),
            });
        }

        Ok(total)
    }

    /// `HEAD` a manifest and validate the headers the copier needs.
    ///
    /// Returns the manifest's media type, digest, and size.
    pub fn head_manifest(&self, reference: &Reference) -> Result<(MediaType, Digest, u64)> {
        let request = TransportRequest::new("HEAD", self.manifest_url(reference))
            .header("Accept", MediaType::manifest_accept());

        let response = self.execute(reference, Operation::Pull, request)?;

        if response.status() == 404 {
            return Err(Error::NotFound(reference.to_string()));
        }

        if !(200..300).contains(&response.status()) {
            return Err(unexpected_status(response));
        }

        let Some(content_type) = response.header("Content-Type").map(normalize_content_type)
        else {
            return Err(Error::manifest_header("Content type not found in headers"));
        };

        let Some(digest) = response.header(DOCKER_CONTENT_DIGEST) else {
            return Err(Error::manifest_header("Manifest digest not found in headers"));
        };

        let media_type = content_type
            .parse::<MediaType>()
            .ok()
            .filter(|t| t.is_manifest() || t.is_index())
            .ok_or_else(|| {
                Error::manifest_header(&format!("Unsupported content type: {content_type}"))
            })?;

        let digest: Digest = digest.parse::<Digest>()?;

        let size = response
            .header("Content-Length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok((media_type, digest, size))
    }

    /// Fetch a manifest or index, discriminated by `Content-Type`
    /// first and the embedded `mediaType` second.
    pub fn get_manifest(&self, reference: &Reference) -> Result<(ManifestVariant, Descriptor)> {
        let (bytes, media_type, digest) = self.get_manifest_bytes(reference)?;

        let variant = ManifestVariant::from_bytes(media_type, &bytes)?;

        let content_type = media_type
            .map(|t| t.as_str().to_owned())
            .unwrap_or_else(|| variant.media_type().to_owned());

        let descriptor = Descriptor::new(content_type, digest, bytes.len() as u64);

        Ok((variant, descriptor))
    }

    /// Fetch raw manifest bytes plus the wire media type and digest.
    /// The digest comes from `Docker-Content-Digest` when present,
    /// and is computed from the bytes otherwise.
    pub(crate) fn get_manifest_bytes(
        &self,
        reference: &Reference,
    ) -> Result<(Vec<u8>, Option<MediaType>, Digest)> {
        let request = TransportRequest::new("GET", self.manifest_url(reference))
            .header("Accept", MediaType::manifest_accept());

        let response = self.execute(reference, Operation::Pull, request)?;

        match response.status() {
            200 => {}
            404 => return Err(Error::NotFound(reference.to_string())),
            _ => return Err(unexpected_status(response)),
        }

        let media_type = response
            .header("Content-Type")
            .map(normalize_content_type)
            .and_then(|t| t.parse().ok());

        let header_digest = match response.header(DOCKER_CONTENT_DIGEST) {
            Some(value) => Some(value.parse::<Digest>()?),
            None => None,
        };

        let mut bytes = Vec::new();
        response.into_reader().read_to_end(&mut bytes)?;

        let digest = match header_digest {
            Some(digest) => digest,
            None => Digest::of_bytes(
                reference
                    .digest
                    .as_ref()
                    .map(|d| d.algorithm())
                    .unwrap_or(Algorithm::Sha256),
                &bytes,
            ),
        };

        Ok((bytes, media_type, digest))
    }

    /// `PUT` a manifest under the reference's tag or digest.
    pub fn push_manifest(&self, reference: &Reference, manifest: &Manifest) -> Result<Descriptor> {
        let bytes = serde_json::to_vec(manifest)?;
        self.push_manifest_bytes(reference, manifest.media_type(), &bytes)
    }

    /// `PUT` an index under the reference's tag or digest.
    pub fn push_index(&self, reference: &Reference, index: &Index) -> Result<Descriptor> {
        let bytes = serde_json::to_vec(index)?;
        self.push_manifest_bytes(reference, index.media_type(), &bytes)
    }

    /// `PUT` raw manifest bytes. The `Docker-Content-Digest` response
    /// header, when present, is authoritative for the pushed bytes.
    pub fn push_manifest_bytes(
        &self,
        reference: &Reference,
        media_type: &str,
        bytes: &[u8],
    ) -> Result<Descriptor> {
        let request = TransportRequest::new("PUT", self.manifest_url(reference))
            .header("Content-Type", media_type.to_owned())
            .body(bytes);

        let response = self.execute(reference, Operation::Push, request)?;

        if !(200..300).contains(&response.status()) {
            return Err(unexpected_status(response));
        }

        let digest = match response.header(DOCKER_CONTENT_DIGEST) {
            Some(value) => value.parse()?,
            None => Digest::of_bytes(Algorithm::Sha256, bytes),
        };

        Ok(Descriptor::new(media_type, digest, bytes.len() as u64))
    }

    /// `DELETE` the manifest a reference points to.
    pub fn delete_manifest(&self, reference: &Reference) -> Result<()> {
        let request = TransportRequest::new("DELETE", self.manifest_url(reference));
        self.delete(reference, request)
    }

    /// `DELETE` a blob.
    pub fn delete_blob(&self, reference: &Reference, digest: &Digest) -> Result<()> {
        let request = TransportRequest::new("DELETE", self.blob_url(reference, digest));
        self.delete(reference, request)
    }

    fn delete(&self, reference: &Reference, request: TransportRequest) -> Result<()> {
        let response = self.execute(reference, Operation::Push, request)?;

        match response.status() {
            200 | 202 => Ok(()),
            404 => Err(Error::NotFound(reference.to_string())),
            405 => Err(Error::DeleteNotSupported),
            _ => Err(unexpected_status(response)),
        }
    }

    /// Manifests whose `subject` points at `subject`.
    ///
    /// Registries without the referrers endpoint are queried through
    /// the fallback tag schema; a miss there is an empty index.
    pub fn referrers(&self, reference: &Reference, subject: &Digest) -> Result<Index> {
        let host = self.host_for(reference);
        let url = self.v2_url(
            host,
            &format!("{}/referrers/{}", reference.repository, subject),
        );

        let response =
            self.execute(reference, Operation::Pull, TransportRequest::new("GET", url))?;

        match response.status() {
            200 => Ok(serde_json::from_reader(response.into_reader())?),
            404 => self.referrers_by_tag(reference, subject),
            _ => Err(unexpected_status(response)),
        }
    }

    fn referrers_by_tag(&self, reference: &Reference, subject: &Digest) -> Result<Index> {
        let tag = format!("{}-{}", subject.algorithm(), subject.hex());

        match self.get_manifest(&reference.with_tag(tag)) {
            Ok((ManifestVariant::Index(index), _)) => Ok(index),
            Ok((ManifestVariant::Manifest(_), _)) | Err(Error::NotFound(_)) => {
                Ok(Index::from_manifests(Vec::new()))
            }
            Err(e) => Err(e),
        }
    }
}

pub(crate) fn scope_for(repository: &str, operation: Operation) -> String {
    if repository.is_empty() {
        return String::new();
    }

    match operation {
        Operation::Pull => format!("repository:{repository}:pull"),
        Operation::Push => format!("repository:{repository}:pull,push"),
    }
}

/// Map a response the operation did not expect to an error, keeping
/// the status code visible to callers.
pub(crate) fn unexpected_status(response: ureq::Response) -> Error {
    match response.status() {
        404 => Error::NotFound(response.get_url().to_owned()),
        status => Error::Status {
            status,
            url: response.get_url().to_owned(),
        },
    }
}

/// `Content-Type` without parameters like `; charset=utf-8`.
fn normalize_content_type(value: &str) -> String {
    value.split(';').next().unwrap_or(value).trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes() {
        assert_eq!(scope_for("library/x", Operation::Pull), "repository:library/x:pull");
        assert_eq!(
            scope_for("library/x", Operation::Push),
            "repository:library/x:pull,push",
        );
        assert_eq!(scope_for("", Operation::Pull), "");
    }

    #[test]
    fn content_type_parameters_are_dropped() {
        assert_eq!(
            normalize_content_type("application/vnd.oci.image.index.v1+json; charset=utf-8"),
            "application/vnd.oci.image.index.v1+json",
        );
    }

    #[test]
    fn urls() {
        let registry = Registry::builder().insecure(true).build().unwrap();
        let reference = Reference::parse("localhost:5000/library/x:latest").unwrap();

        assert_eq!(
            registry.manifest_url(&reference),
            "http://localhost:5000/v2/library/x/manifests/latest",
        );

        let digest = Digest::of_bytes(Algorithm::Sha256, b"{}");
        assert_eq!(
            registry.blob_url(&reference, &digest),
            format!("http://localhost:5000/v2/library/x/blobs/{digest}"),
        );
    }

    #[test]
    fn context_path_prefixes_v2() {
        let registry = Registry::builder()
            .insecure(true)
            .context_path("/mirror/")
            .build()
            .unwrap();

        assert_eq!(
            registry.v2_url("localhost:5000", ""),
            "http://localhost:5000/mirror/v2/",
        );
    }
}
