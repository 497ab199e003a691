//! Content-addressed store in the OCI Image Layout format.
//!
//! Ref: <https://github.com/opencontainers/image-spec/blob/main/image-layout.md>
//!
//! Every file lands through a temp-file-plus-rename in its final
//! directory, so readers never observe partial writes; `index.json`
//! read-modify-write cycles are serialized through a lock file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::digest::Digest;
use crate::errors::{Error, Result};
use crate::events::CancelToken;
use crate::models::{Descriptor, Index, ANNOTATION_REF_NAME};

const LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const INDEX_LOCK_FILE: &str = "index.json.lock";

const LAYOUT_VERSION: &str = "1.0.0";

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_POLL: Duration = Duration::from_millis(10);

/// Write buffer for blob streaming.
const BUFFER_SIZE: usize = 8 * 1024;

#[derive(Serialize, Deserialize, Debug)]
struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// An OCI Image Layout directory.
pub struct OciLayout {
    root: PathBuf,
    cancel: CancelToken,
}

impl OciLayout {
    /// Open `root` as a layout, creating `oci-layout` and an empty
    /// `index.json` when they are missing. The directory itself must
    /// already exist.
    ///
    /// An existing layout is accepted only at version 1.0.0.
    pub fn open(root: impl Into<PathBuf>) -> Result<OciLayout> {
        let root = root.into();

        if !root.is_dir() {
            return Err(Error::NotFound(root.display().to_string()));
        }

        let layout = OciLayout {
            root,
            cancel: CancelToken::new(),
        };

        match fs::read(layout.root.join(LAYOUT_FILE)) {
            Ok(bytes) => {
                let marker: LayoutMarker = serde_json::from_slice(&bytes)?;
                if marker.image_layout_version != LAYOUT_VERSION {
                    return Err(Error::IncompatibleLayout(marker.image_layout_version));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let marker = LayoutMarker {
                    image_layout_version: LAYOUT_VERSION.to_owned(),
                };
                layout.atomic_replace(LAYOUT_FILE, &serde_json::to_vec(&marker)?)?;
            }
            Err(e) => return Err(e.into()),
        }

        if !layout.root.join(INDEX_FILE).is_file() {
            let empty = Index::from_manifests(Vec::new());
            layout.atomic_replace(INDEX_FILE, &serde_json::to_vec(&empty)?)?;
        }

        Ok(layout)
    }

    /// Honor this token in blob writes.
    pub fn cancel_token(mut self, token: CancelToken) -> OciLayout {
        self.cancel = token;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `blobs/<algorithm>/<hex>` under the layout root.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    pub fn has_blob(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Stream a blob into the store, verifying the digest on the way.
    ///
    /// An already-present blob is not rewritten, but the stream is
    /// still drained so network sources are consumed either way.
    /// Returns the number of bytes in the blob.
    pub fn put_blob(&self, digest: &Digest, mut reader: impl Read) -> Result<u64> {
        let dir = self.root.join("blobs").join(digest.algorithm().as_str());
        let path = dir.join(digest.hex());

        if path.is_file() {
            return Ok(io::copy(&mut reader, &mut io::sink())?);
        }

        create_dirs(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        let mut hasher = digest.algorithm().hasher();
        let mut buffer = [0u8; BUFFER_SIZE];
        let mut size = 0u64;

        loop {
            self.cancel.check()?;

            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }

            hasher.update(&buffer[..n]);
            tmp.write_all(&buffer[..n])?;
            size += n as u64;
        }

        let computed = hasher.finish();
        if computed != *digest {
            // Dropping the temp file removes it.
            return Err(Error::DigestMismatch {
                expected: digest.to_string(),
                computed: computed.to_string(),
            });
        }

        persist(tmp, &path)?;

        Ok(size)
    }

    pub fn put_blob_bytes(&self, digest: &Digest, data: &[u8]) -> Result<u64> {
        self.put_blob(digest, data)
    }

    /// Open a blob for reading.
    pub fn get_blob(&self, digest: &Digest) -> Result<File> {
        let path = self.blob_path(digest);

        File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(digest.to_string()),
            _ => e.into(),
        })
    }

    pub fn get_blob_bytes(&self, digest: &Digest) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.get_blob(digest)?.read_to_end(&mut data)?;
        Ok(data)
    }

    /// The current `index.json`.
    pub fn read_index(&self) -> Result<Index> {
        Ok(serde_json::from_slice(&fs::read(
            self.root.join(INDEX_FILE),
        )?)?)
    }

    /// Record a top-level manifest in `index.json`.
    ///
    /// With a `ref_name`, any entry already carrying that tag is
    /// replaced, so a tag points at exactly one descriptor. Without
    /// one, the descriptor is appended untagged, deduplicated by
    /// digest.
    pub fn add_manifest_to_index(
        &self,
        descriptor: &Descriptor,
        ref_name: Option<&str>,
    ) -> Result<()> {
        let _lock = IndexLock::acquire(&self.root)?;

        let mut index = self.read_index()?;

        match ref_name {
            Some(tag) => {
                index.manifests.retain(|d| d.ref_name() != Some(tag));
                index
                    .manifests
                    .push(descriptor.clone().with_annotation(ANNOTATION_REF_NAME, tag));
            }
            None => {
                if !index.manifests.iter().any(|d| d.digest == descriptor.digest) {
                    index.manifests.push(descriptor.clone());
                }
            }
        }

        self.atomic_replace(INDEX_FILE, &serde_json::to_vec(&index)?)
    }

    /// Find the descriptor a reference names: by digest when it has
    /// one, by the `ref.name` tag annotation otherwise.
    pub fn resolve(&self, tag: Option<&str>, digest: Option<&Digest>) -> Result<Descriptor> {
        let index = self.read_index()?;

        let found = index.manifests.iter().find(|d| match (digest, tag) {
            (Some(digest), _) => d.digest == *digest,
            (None, Some(tag)) => d.ref_name() == Some(tag),
            (None, None) => false,
        });

        found.cloned().ok_or_else(|| {
            let wanted = digest
                .map(|d| d.to_string())
                .or_else(|| tag.map(str::to_owned))
                .unwrap_or_else(|| "<unaddressed>".to_owned());
            Error::NotFound(wanted)
        })
    }

    /// Write a file under the root through a temp file in the same
    /// directory.
    fn atomic_replace(&self, name: &str, data: &[u8]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(data)?;
        persist(tmp, &self.root.join(name))
    }
}

/// Rename a finished temp file into place. A rename refused because
/// the target exists (as on Windows) retries after removing it; for
/// `index.json` this runs inside the lock's critical section, and for
/// blobs any existing file has the same content by construction.
fn persist(tmp: NamedTempFile, path: &Path) -> Result<()> {
    match tmp.persist(path) {
        Ok(file) => {
            drop(file);
            set_file_mode(path)?;
            Ok(())
        }
        Err(persist_error) => {
            if path.is_file() {
                let _ = fs::remove_file(path);
                persist_error.file.persist(path).map_err(|e| e.error)?;
                set_file_mode(path)?;
                Ok(())
            } else {
                Err(persist_error.error.into())
            }
        }
    }
}

fn create_dirs(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o755))?;
    }

    Ok(())
}

#[cfg(unix)]
fn set_file_mode(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Lock file guarding `index.json` read-modify-write windows, also
/// across processes. Released on drop.
struct IndexLock {
    path: PathBuf,
}

impl IndexLock {
    fn acquire(root: &Path) -> Result<IndexLock> {
        let path = root.join(INDEX_LOCK_FILE);
        let deadline = Instant::now() + LOCK_TIMEOUT;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(IndexLock { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(Error::Io(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("timed out waiting for {}", path.display()),
                        )));
                    }
                    thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
