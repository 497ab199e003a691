//! Content digests over bytes, files and streams.
//!
//! Digests use the `algorithm:hex` form from the OCI image spec:
//! <https://github.com/opencontainers/image-spec/blob/main/descriptor.md#digests>

use std::fmt;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::str::FromStr;

use sha2::{Digest as _, Sha256, Sha512};

/// Read buffer for streaming digests.
const BUFFER_SIZE: usize = 8 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum DigestError {
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// Digest algorithms this crate can compute and verify.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Debug)]
pub enum Algorithm {
    #[default]
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Length of the hex form of a digest under this algorithm.
    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    pub(crate) fn hasher(&self) -> Hasher {
        match self {
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Incremental hash over one of the supported algorithms.
pub(crate) enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    pub fn finish(self) -> Digest {
        let (algorithm, bytes) = match self {
            Hasher::Sha256(h) => (Algorithm::Sha256, h.finalize().to_vec()),
            Hasher::Sha512(h) => (Algorithm::Sha512, h.finalize().to_vec()),
        };

        let mut hex = String::with_capacity(bytes.len() * 2);
        for byte in &bytes {
            let _ = write!(&mut hex, "{:02x}", byte);
        }

        Digest { algorithm, hex }
    }
}

/// A validated content digest.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The hex portion, without the `algorithm:` prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Digest of an in-memory byte sequence.
    pub fn of_bytes(algorithm: Algorithm, data: impl AsRef<[u8]>) -> Digest {
        let mut hasher = algorithm.hasher();
        hasher.update(data.as_ref());
        hasher.finish()
    }

    /// Digest of a stream, read in buffered chunks.
    pub fn of_reader(algorithm: Algorithm, mut reader: impl Read) -> std::io::Result<Digest> {
        let mut hasher = algorithm.hasher();
        let mut buffer = [0u8; BUFFER_SIZE];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                return Ok(hasher.finish());
            }
            hasher.update(&buffer[..n]);
        }
    }

    /// Digest of a file's contents.
    pub fn of_file(algorithm: Algorithm, path: impl AsRef<Path>) -> std::io::Result<Digest> {
        Self::of_reader(algorithm, BufReader::new(File::open(path)?))
    }
}

impl FromStr for Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((algorithm, hex)) = s.split_once(':') else {
            return Err(DigestError::InvalidDigest(s.to_owned()));
        };

        if !valid_algorithm_syntax(algorithm) || hex.is_empty() || !hex.bytes().all(valid_encoded)
        {
            return Err(DigestError::InvalidDigest(s.to_owned()));
        }

        let algorithm = match algorithm {
            "sha256" => Algorithm::Sha256,
            "sha512" => Algorithm::Sha512,
            other => return Err(DigestError::UnsupportedAlgorithm(other.to_owned())),
        };

        // Hex is case-sensitive: mixed or upper case is rejected, not
        // normalized.
        if hex.len() != algorithm.hex_len()
            || !hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(DigestError::InvalidDigest(s.to_owned()));
        }

        Ok(Digest {
            algorithm,
            hex: hex.to_owned(),
        })
    }
}

/// `algorithm ::= [a-z0-9]+ ([+._-] [a-z0-9]+)*`
fn valid_algorithm_syntax(s: &str) -> bool {
    let mut last_was_separator = true;

    for b in s.bytes() {
        match b {
            b'a'..=b'z' | b'0'..=b'9' => last_was_separator = false,
            b'+' | b'.' | b'_' | b'-' if !last_was_separator => last_was_separator = true,
            _ => return false,
        }
    }

    !last_was_separator
}

fn valid_encoded(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'=' || b == b'_' || b == b'-'
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl serde::Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
