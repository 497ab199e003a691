//! Blob upload sessions: monolithic, chunked, and cross-repo mounts.
//!
//! Ref: <https://github.com/opencontainers/distribution-spec/blob/main/spec.md#push>

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use url::Url;

use super::{unexpected_status, Operation, Registry, OCTET_STREAM};
use crate::digest::{Algorithm, Digest};
use crate::errors::{Error, Result};
use crate::models::Descriptor;
use crate::reference::Reference;
use crate::transport::TransportRequest;

/// Upper bound for one `PATCH` body. Bounds memory per in-flight
/// chunk; a blob is never buffered whole.
const PUSH_CHUNK_SIZE: usize = 4 * 1024 * 1024;

impl Registry {
    /// Upload a blob, skipping the transfer when the registry already
    /// has its digest.
    pub fn push_blob(&self, reference: &Reference, data: &[u8]) -> Result<Descriptor> {
        let digest = Digest::of_bytes(Algorithm::Sha256, data);

        if self.has_blob(reference, &digest)? {
            return Ok(Descriptor::new(OCTET_STREAM, digest, data.len() as u64));
        }

        let session = self.start_upload(reference)?;
        self.finalize_upload(reference, &session, &digest, data)?;

        self.events.upload_progress(data.len());

        Ok(Descriptor::new(OCTET_STREAM, digest, data.len() as u64))
    }

    /// Upload a config blob and describe it under its media type.
    pub fn push_config(
        &self,
        reference: &Reference,
        media_type: impl Into<String>,
        data: &[u8],
    ) -> Result<Descriptor> {
        let pushed = self.push_blob(reference, data)?;
        Ok(Descriptor::new(media_type, pushed.digest, pushed.size))
    }

    /// Upload a file, skipping the transfer when the registry already
    /// has its digest.
    pub fn push_blob_file(&self, reference: &Reference, path: &Path) -> Result<Descriptor> {
        let digest = Digest::of_file(Algorithm::Sha256, path)?;
        let size = std::fs::metadata(path)?.len();

        if self.has_blob(reference, &digest)? {
            return Ok(Descriptor::new(OCTET_STREAM, digest, size));
        }

        let file = File::open(path)?;

        let descriptor = self.push_blob_stream(reference, BufReader::new(file), size)?;

        if descriptor.digest != digest {
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                computed: descriptor.digest.to_string(),
            });
        }

        Ok(descriptor)
    }

    /// Upload a stream in chunks, computing its digest on the way.
    ///
    /// The digest is not known before the last byte, so there is no
    /// existence check; use [`Registry::push_blob_file`] or
    /// [`Registry::push_blob`] when the content can be digested first.
    pub fn push_blob_stream(
        &self,
        reference: &Reference,
        reader: impl Read,
        size: u64,
    ) -> Result<Descriptor> {
        self.push_blob_stream_as(reference, reader, size, Algorithm::Sha256)
    }

    /// Like [`Registry::push_blob_stream`], addressing the blob under
    /// a caller-chosen algorithm.
    pub fn push_blob_stream_as(
        &self,
        reference: &Reference,
        mut reader: impl Read,
        size: u64,
        algorithm: Algorithm,
    ) -> Result<Descriptor> {
        let session = self.start_upload(reference)?;

        let mut location = session;
        let mut hasher = algorithm.hasher();
        let mut buffer = vec![0u8; PUSH_CHUNK_SIZE.min(size.max(1) as usize)];
        let mut offset: u64 = 0;

        loop {
            self.cancel.check()?;

            let n = read_full(&mut reader, &mut buffer)?;
            if n == 0 {
                break;
            }

            hasher.update(&buffer[..n]);
            location = self.patch_chunk(reference, &location, offset, &buffer[..n])?;
            offset += n as u64;
            self.events.upload_progress(n);
        }

        if offset != size {
            return Err(Error::Transport(format!(
                "upload stream ended after {offset} bytes, expected {size}",
            )));
        }

        let digest = hasher.finish();
        self.finalize_upload(reference, &location, &digest, &[])?;

        Ok(Descriptor::new(OCTET_STREAM, digest, size))
    }

    /// Ask the registry to mount `digest` from another repository on
    /// the same host. Returns `false` when the registry answers with
    /// an upload session instead; the caller falls back to a regular
    /// push and the session is left for the server to collect.
    pub fn mount_blob(&self, reference: &Reference, digest: &Digest, from: &str) -> Result<bool> {
        let host = self.host_for(reference);
        let url = self.v2_url(host, &format!("{}/blobs/uploads/", reference.repository));

        let mut url = Url::parse(&url).map_err(|e| Error::Transport(format!("{url}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("mount", &digest.to_string())
            .append_pair("from", from);

        let request = TransportRequest::new("POST", url.into());
        let response = self.execute(reference, Operation::Push, request)?;

        match response.status() {
            201 => Ok(true),
            202 => Ok(false),
            _ => Err(unexpected_status(response)),
        }
    }

    /// `POST` a new upload session and resolve its `Location`.
    ///
    /// A path-relative `Location` resolves against the URL the POST
    /// ended up at, which is the redirected URL when the registry
    /// redirected the POST.
    fn start_upload(&self, reference: &Reference) -> Result<String> {
        let host = self.host_for(reference);
        let url = self.v2_url(host, &format!("{}/blobs/uploads/", reference.repository));

        let response = self.execute(reference, Operation::Push, TransportRequest::new("POST", url))?;

        if response.status() != 202 {
            return Err(unexpected_status(response));
        }

        self.resolve_location(&response)
            .ok_or_else(|| Error::Transport("upload accepted without a Location".to_owned()))?
    }

    /// `PATCH` one chunk; the response names the URL for the next step.
    fn patch_chunk(
        &self,
        reference: &Reference,
        location: &str,
        offset: u64,
        chunk: &[u8],
    ) -> Result<String> {
        let mut location = location.to_owned();
        let mut start = offset;
        let mut pending = chunk;

        loop {
            let end = start + pending.len() as u64 - 1;

            let request = TransportRequest::new("PATCH", location.clone())
                .header("Content-Type", OCTET_STREAM)
                .header("Content-Range", format!("{start}-{end}"))
                .body(pending);

            let response = self.execute(reference, Operation::Push, request)?;

            match response.status() {
                202 => {
                    return Ok(self
                        .resolve_location(&response)
                        .transpose()?
                        .unwrap_or(location));
                }

                // The server disagrees about the offset: its `Range`
                // header says how much it has, resume from there.
                416 => {
                    let received = response
                        .header("Range")
                        .and_then(|range| range.rsplit_once('-'))
                        .and_then(|(_, last)| last.parse::<u64>().ok());

                    let Some(received) = received else {
                        return Err(unexpected_status(response));
                    };

                    let next = received + 1;

                    if next <= start || next > end + 1 {
                        // Nothing left to replay from this chunk.
                        return Err(Error::Status {
                            status: 416,
                            url: location,
                        });
                    }

                    if next == end + 1 {
                        // The whole chunk made it after all.
                        return Ok(location);
                    }

                    pending = &pending[(next - start) as usize..];
                    start = next;
                }

                _ => return Err(unexpected_status(response)),
            }
        }
    }

    /// `PUT <location>?digest=…` to seal the upload.
    fn finalize_upload(
        &self,
        reference: &Reference,
        location: &str,
        digest: &Digest,
        body: &[u8],
    ) -> Result<()> {
        // Keep any query the session URL already carries.
        let mut url =
            Url::parse(location).map_err(|e| Error::Transport(format!("{location}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("digest", &digest.to_string());

        let request = TransportRequest::new("PUT", url.into())
            .header("Content-Type", OCTET_STREAM)
            .body(body);

        let response = self.execute(reference, Operation::Push, request)?;

        match response.status() {
            200 | 201 => Ok(()),
            _ => Err(unexpected_status(response)),
        }
    }

    /// Absolute form of a response's `Location` header, resolved
    /// against the URL the request ended up at.
    fn resolve_location(&self, response: &ureq::Response) -> Option<Result<String>> {
        let location = response.header("Location")?;

        let resolved = Url::parse(response.get_url())
            .and_then(|base| base.join(location))
            .map(String::from)
            .map_err(|e| Error::Transport(format!("{location}: {e}")));

        Some(resolved)
    }
}

fn read_full(reader: &mut impl Read, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;

    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..])? {
            0 => break,
            n => filled += n,
        }
    }

    Ok(filled)
}
