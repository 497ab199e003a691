//! Credential resolution and the registry token dance.
//!
//! See <https://distribution.github.io/distribution/spec/auth/token/>
//! for the Bearer challenge flow.

mod file_store;

pub use file_store::FileStore;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::errors::Error;
use crate::events::EventHandler;
use crate::transport::{Transport, TransportRequest};

/// A resolved credential for one registry host.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Credential {
    UsernamePassword(String, String),
    /// A bearer or identity token, sent as-is.
    Token(String),
    Anonymous,
}

impl Credential {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credential::Anonymous)
    }

    /// `Authorization` header value for this credential, if any.
    fn header(&self) -> Option<String> {
        match self {
            Credential::UsernamePassword(user, pass) => {
                Some(format!("Basic {}", BASE64.encode(format!("{user}:{pass}"))))
            }
            Credential::Token(token) => Some(format!("Bearer {token}")),
            Credential::Anonymous => None,
        }
    }
}

/// Source of credentials for registry hosts.
pub trait CredentialProvider: Send + Sync {
    fn resolve(&self, host: &str) -> Credential;
}

/// Provider returning the same credential for every host.
pub struct StaticProvider(Credential);

impl StaticProvider {
    pub fn username_password(user: impl Into<String>, pass: impl Into<String>) -> StaticProvider {
        StaticProvider(Credential::UsernamePassword(user.into(), pass.into()))
    }

    pub fn token(token: impl Into<String>) -> StaticProvider {
        StaticProvider(Credential::Token(token.into()))
    }

    pub fn anonymous() -> StaticProvider {
        StaticProvider(Credential::Anonymous)
    }
}

impl CredentialProvider for StaticProvider {
    fn resolve(&self, _host: &str) -> Credential {
        self.0.clone()
    }
}

/// Providers tried in order; the first non-anonymous answer wins.
pub struct ChainProvider(Vec<Box<dyn CredentialProvider>>);

impl ChainProvider {
    pub fn new(providers: Vec<Box<dyn CredentialProvider>>) -> ChainProvider {
        ChainProvider(providers)
    }

    /// Chain over the docker-style config files found in the
    /// environment, or anonymous when there are none.
    pub fn from_env() -> ChainProvider {
        let mut providers: Vec<Box<dyn CredentialProvider>> = Vec::new();
        if let Ok(store) = FileStore::from_env() {
            providers.push(Box::new(store));
        }
        ChainProvider(providers)
    }
}

impl CredentialProvider for ChainProvider {
    fn resolve(&self, host: &str) -> Credential {
        self.0
            .iter()
            .map(|p| p.resolve(host))
            .find(|c| !c.is_anonymous())
            .unwrap_or(Credential::Anonymous)
    }
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, PartialEq)]
pub(crate) enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

/// Parse a challenge header. Parameter values may be quoted or bare.
///
/// Returns `None` for schemes this client cannot answer.
pub(crate) fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();

    if header.len() >= 5 && header[..5].eq_ignore_ascii_case("basic") {
        return Some(Challenge::Basic);
    }

    let params = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))?;

    let mut realm = None;
    let mut service = None;
    let mut scope = None;

    // Quoted values may contain commas (`scope="…:pull,push"`), so
    // walk the parameter list instead of splitting on commas.
    let mut tail = params.trim_start();

    while !tail.is_empty() {
        let Some((key, rest)) = tail.split_once('=') else {
            break;
        };

        let (value, remainder) = match rest.strip_prefix('"') {
            Some(quoted) => match quoted.split_once('"') {
                Some((value, after)) => (value, after),
                None => break,
            },
            None => match rest.split_once(',') {
                Some((value, after)) => (value.trim(), after),
                None => (rest.trim(), ""),
            },
        };

        match key.trim() {
            "realm" => realm = Some(value.to_owned()),
            "service" => service = Some(value.to_owned()),
            "scope" => scope = Some(value.to_owned()),
            _ => {}
        }

        let remainder = remainder.trim_start();
        tail = remainder.strip_prefix(',').unwrap_or(remainder).trim_start();
    }

    Some(Challenge::Bearer {
        realm: realm?,
        service,
        scope,
    })
}

type TokenKey = (String, String, String);

/// Per-client negotiator: resolves credentials, answers challenges,
/// and caches bearer tokens for the lifetime of the client value.
pub(crate) struct Authenticator {
    provider: Box<dyn CredentialProvider>,
    tokens: Mutex<HashMap<TokenKey, String>>,
    events: Arc<dyn EventHandler>,
}

impl Authenticator {
    pub fn new(provider: Box<dyn CredentialProvider>, events: Arc<dyn EventHandler>) -> Self {
        Authenticator {
            provider,
            tokens: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Header for a first attempt: a cached token when one exists for
    /// this host and scope, else whatever the credential provides.
    pub fn authorization(&self, host: &str, scope: &str) -> Option<String> {
        if let Some(token) = self.cached(host, scope) {
            return Some(format!("Bearer {token}"));
        }

        self.provider.resolve(host).header()
    }

    fn cached(&self, host: &str, scope: &str) -> Option<String> {
        let tokens = self.tokens.lock().unwrap();
        tokens
            .iter()
            .find(|((h, _, s), _)| h == host && s == scope)
            .map(|(_, token)| token.clone())
    }

    pub fn invalidate(&self, host: &str, scope: &str) {
        let mut tokens = self.tokens.lock().unwrap();
        tokens.retain(|(h, _, s), _| !(h == host && s == scope));
    }

    /// Answer a 401 challenge. Returns the header to retry with, or
    /// `None` when the credentials cannot satisfy the challenge.
    pub fn negotiate(
        &self,
        transport: &Transport,
        host: &str,
        scope: &str,
        challenge_header: &str,
    ) -> Result<Option<String>, Error> {
        let Some(challenge) = parse_challenge(challenge_header) else {
            return Ok(None);
        };

        let credential = self.provider.resolve(host);

        match challenge {
            Challenge::Basic => Ok(credential.header()),

            Challenge::Bearer {
                realm,
                service,
                scope: challenge_scope,
            } => {
                let scope = challenge_scope.as_deref().unwrap_or(scope);

                let token =
                    self.fetch_token(transport, &credential, &realm, service.as_deref(), scope)?;

                let Some(token) = token else {
                    return Ok(None);
                };

                let key = (
                    host.to_owned(),
                    service.unwrap_or_default(),
                    scope.to_owned(),
                );
                self.tokens.lock().unwrap().insert(key, token.clone());

                Ok(Some(format!("Bearer {token}")))
            }
        }
    }

    /// `GET realm?service=…&scope=…` with Basic credentials.
    ///
    /// The response must include either `token` or `access_token`.
    fn fetch_token(
        &self,
        transport: &Transport,
        credential: &Credential,
        realm: &str,
        service: Option<&str>,
        scope: &str,
    ) -> Result<Option<String>, Error> {
        let mut url = url::Url::parse(realm).map_err(|e| Error::Transport(format!("{realm}: {e}")))?;

        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = service {
                query.append_pair("service", service);
            }
            if !scope.is_empty() {
                query.append_pair("scope", scope);
            }
        }

        self.events.registry_auth(url.as_str());

        let mut request = TransportRequest::new("GET", url.into());
        request.authorization = credential.header();

        let response = transport.send(&request)?;
        if response.status() != 200 {
            return Ok(None);
        }

        #[derive(serde::Deserialize, Debug)]
        struct Tokens {
            token: Option<String>,
            access_token: Option<String>,
        }

        let tokens: Tokens = serde_json::from_reader(response.into_reader())?;

        Ok(tokens.token.or(tokens.access_token))
    }
}
