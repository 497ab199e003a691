//! Parse a reference to a repository in an OCI registry.
//!
//! It tries to be close to what `docker pull` does, but it does not try
//! to be bug-for-bug compatible.

use super::*;

type Result<T> = std::result::Result<T, ParseError>;

pub(super) fn parse(reference: &str) -> Result<Reference> {
    // Extract the digest after the last `@`.
    let (base, digest) = match reference.rsplit_once('@') {
        None => (reference, None),
        Some((base, d)) => (base, Some(d.parse::<Digest>()?)),
    };

    // Extract the tag after the last `:`.
    //
    // If the value after `:` contains a `/`, it is a port number and
    // not a tag.
    let (base, tag) = match base.rsplit_once(':') {
        Some((base, tag)) if !tag.contains('/') => (base, Some(tag)),
        _ => (base, None),
    };

    // The part before the first `/` is a registry host only if it can
    // be one: it contains a `.`, a `:`, or is `localhost`. Anything
    // else is a repository in the default registry.
    let (registry, repository) = match base.split_once('/') {
        Some((host, repository)) if host.contains(['.', ':']) || host == "localhost" => {
            (host, repository)
        }
        _ => (DEFAULT_REGISTRY, base),
    };

    if repository.is_empty() {
        return Err(ParseError::MissingRepository);
    }

    if !repository.split('/').all(valid_repository_segment) {
        return Err(ParseError::InvalidRepository(repository.to_owned()));
    }

    if let Some(tag) = tag {
        if !valid_tag(tag) {
            return Err(ParseError::InvalidTag(tag.to_owned()));
        }
    }

    // Default to `latest` only when nothing addresses a manifest.
    let tag = match (tag, &digest) {
        (Some(tag), _) => Some(tag.to_owned()),
        (None, Some(_)) => None,
        (None, None) => Some(DEFAULT_TAG.to_owned()),
    };

    Ok(Reference {
        registry: registry.to_owned(),
        repository: repository.to_owned(),
        tag,
        digest,
    })
}

/// `segment ::= [a-z0-9]+ ([._-] [a-z0-9]+)*`
fn valid_repository_segment(segment: &str) -> bool {
    let mut last_was_separator = true;

    for b in segment.bytes() {
        match b {
            b'a'..=b'z' | b'0'..=b'9' => last_was_separator = false,
            b'.' | b'_' | b'-' if !last_was_separator => last_was_separator = true,
            _ => return false,
        }
    }

    !last_was_separator
}

/// `tag ::= [A-Za-z0-9_] [A-Za-z0-9._-]{0,127}`
fn valid_tag(tag: &str) -> bool {
    let mut bytes = tag.bytes();

    let Some(first) = bytes.next() else {
        return false;
    };

    if !(first.is_ascii_alphanumeric() || first == b'_') {
        return false;
    }

    tag.len() <= 128
        && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}
