//! Credentials from docker-style `config.json` files.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;

use super::{Credential, CredentialProvider};
use crate::errors::Error;

/// `{"auths": {"host": {"auth": "base64(user:pass)", "identitytoken": …}}}`.
/// Unknown keys are ignored.
#[derive(Deserialize, Debug)]
struct ConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Deserialize, Clone, Debug)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,

    #[serde(default)]
    identitytoken: Option<String>,
}

/// Credential store over one or more docker config files, read once
/// at construction. Lookups are by exact host; there is no wildcard
/// matching.
#[derive(Debug, Default)]
pub struct FileStore {
    auths: HashMap<String, AuthEntry>,
}

impl FileStore {
    /// Load the given config files. Entries from earlier paths win.
    pub fn new(paths: impl IntoIterator<Item = impl AsRef<Path>>) -> Result<FileStore, Error> {
        let mut auths = HashMap::new();

        for path in paths {
            let config: ConfigFile = serde_json::from_slice(&fs::read(path.as_ref())?)?;

            for (host, entry) in config.auths {
                auths.entry(host).or_insert(entry);
            }
        }

        Ok(FileStore { auths })
    }

    /// Store over the config files named by the environment:
    /// `$DOCKER_CONFIG/config.json`, then `$HOME/.docker/config.json`.
    /// Missing files are skipped.
    pub fn from_env() -> Result<FileStore, Error> {
        let mut candidates = Vec::new();

        if let Some(dir) = env::var_os("DOCKER_CONFIG") {
            candidates.push(PathBuf::from(dir).join("config.json"));
        }

        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(".docker").join("config.json"));
        }

        FileStore::new(candidates.into_iter().filter(|p| p.is_file()))
    }
}

impl CredentialProvider for FileStore {
    fn resolve(&self, host: &str) -> Credential {
        let Some(entry) = self.auths.get(host) else {
            return Credential::Anonymous;
        };

        if let Some(token) = &entry.identitytoken {
            return Credential::Token(token.clone());
        }

        // `auth` is base64 of `user:password`.
        entry
            .auth
            .as_deref()
            .and_then(|encoded| BASE64.decode(encoded).ok())
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .and_then(|pair| {
                pair.split_once(':')
                    .map(|(user, pass)| Credential::UsernamePassword(user.into(), pass.into()))
            })
            .unwrap_or(Credential::Anonymous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn store_from(json: &str) -> FileStore {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        FileStore::new([file.path()]).unwrap()
    }

    #[test]
    fn exact_host_lookup() {
        let store = store_from(
            r#"{"auths": {"localhost:5000": {"auth": "bXl1c2VyOm15cGFzcw=="}}}"#,
        );

        assert_eq!(
            store.resolve("localhost:5000"),
            Credential::UsernamePassword("myuser".into(), "mypass".into()),
        );

        // No wildcard matching.
        assert_eq!(store.resolve("localhost"), Credential::Anonymous);
        assert_eq!(store.resolve("other.example"), Credential::Anonymous);
    }

    #[test]
    fn identity_token_wins_over_auth() {
        let store = store_from(
            r#"{"auths": {"ghcr.io": {"auth": "dTpw", "identitytoken": "tok-123"}}}"#,
        );

        assert_eq!(store.resolve("ghcr.io"), Credential::Token("tok-123".into()));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let store = store_from(
            r#"{"credsStore": "desktop", "auths": {"a.example": {"auth": "dTpw", "email": "x@y"}}}"#,
        );

        assert_eq!(
            store.resolve("a.example"),
            Credential::UsernamePassword("u".into(), "p".into()),
        );
    }

    #[test]
    fn malformed_auth_is_anonymous() {
        let store = store_from(r#"{"auths": {"b.example": {"auth": "!!not-base64!!"}}}"#);
        assert_eq!(store.resolve("b.example"), Credential::Anonymous);
    }

    #[test]
    fn first_path_wins() {
        let mut first = tempfile::NamedTempFile::new().unwrap();
        first
            .write_all(br#"{"auths": {"reg.example": {"auth": "YTpi"}}}"#)
            .unwrap();

        let mut second = tempfile::NamedTempFile::new().unwrap();
        second
            .write_all(br#"{"auths": {"reg.example": {"auth": "Yzpk"}}}"#)
            .unwrap();

        let store = FileStore::new([first.path(), second.path()]).unwrap();

        assert_eq!(
            store.resolve("reg.example"),
            Credential::UsernamePassword("a".into(), "b".into()),
        );
    }
}
