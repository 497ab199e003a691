mod parser;

use std::fmt;
use std::str::FromStr;

use crate::digest::{Digest, DigestError};

/// Hostname used when a reference does not name a registry.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Tag used when a reference has neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("missing repository")]
    MissingRepository,

    #[error("invalid repository: {0}")]
    InvalidRepository(String),

    #[error("invalid tag: {0}")]
    InvalidTag(String),

    #[error(transparent)]
    InvalidDigest(#[from] DigestError),
}

/// A reference to a repository, and optionally to one manifest in it
/// by tag or digest.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Reference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl Reference {
    /// Parse a `[host[:port]/]repo[:tag][@digest]` string.
    pub fn parse(reference: &str) -> Result<Reference, ParseError> {
        parser::parse(reference)
    }

    /// Host-only reference, used for the `/v2/` ping.
    pub fn for_registry(host: impl Into<String>) -> Reference {
        Reference {
            registry: host.into(),
            repository: String::new(),
            tag: None,
            digest: None,
        }
    }

    pub fn with_digest(&self, digest: Digest) -> Reference {
        Reference {
            digest: Some(digest),
            ..self.clone()
        }
    }

    pub fn with_tag(&self, tag: impl Into<String>) -> Reference {
        Reference {
            tag: Some(tag.into()),
            digest: None,
            ..self.clone()
        }
    }

    /// The path segment used to address this reference's manifest.
    /// The digest wins when both a tag and a digest are present.
    pub fn identifier(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_owned(),
        }
    }
}

impl FromStr for Reference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::parse(s)
    }
}

impl TryFrom<&str> for Reference {
    type Error = ParseError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Reference::parse(s)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.repository.is_empty() {
            return f.write_str(&self.registry);
        }

        write!(f, "{}/{}", self.registry, self.repository)?;

        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }

        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }

        Ok(())
    }
}
