//! Thin wrapper over the HTTP agent.
//!
//! Redirects are handled here instead of in `ureq` so that credentials
//! are stripped on cross-origin hops, and so the final URL of a
//! redirected request stays visible to upload-session handling.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use url::Url;

use crate::errors::Error;
use crate::events::{CancelToken, EventHandler};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirect hops for a single request.
const MAX_REDIRECTS: usize = 10;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Retry budget for transient failures, including the first attempt.
pub(crate) const DEFAULT_RETRIES: u32 = 5;

pub(crate) enum Body<'a> {
    Empty,
    Bytes(&'a [u8]),
}

pub(crate) struct TransportRequest<'a> {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub authorization: Option<String>,
    pub body: Body<'a>,
}

impl<'a> TransportRequest<'a> {
    pub fn new(method: &'static str, url: String) -> TransportRequest<'a> {
        TransportRequest {
            method,
            url,
            headers: Vec::new(),
            authorization: None,
            body: Body::Empty,
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn body(mut self, data: &'a [u8]) -> Self {
        self.body = Body::Bytes(data);
        self
    }
}

pub(crate) struct Transport {
    agent: ureq::Agent,
    retries: u32,
    cancel: CancelToken,
    events: Arc<dyn EventHandler>,
}

impl Transport {
    pub fn new(
        insecure: bool,
        connect_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
        retries: u32,
        cancel: CancelToken,
        events: Arc<dyn EventHandler>,
    ) -> Result<Transport, Error> {
        let mut builder = ureq::AgentBuilder::new()
            .redirects(0)
            .timeout_connect(connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT));

        if let Some(timeout) = read_timeout {
            builder = builder.timeout_read(timeout);
        }

        if insecure {
            let connector = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| Error::Transport(e.to_string()))?;
            builder = builder.tls_connector(Arc::new(connector));
        }

        Ok(Transport {
            agent: builder.build(),
            retries: retries.max(1),
            cancel,
            events,
        })
    }

    /// Send a request, following redirects and retrying transient
    /// failures. Non-success statuses are returned to the caller,
    /// which knows which ones are expected for its operation.
    pub fn send(&self, request: &TransportRequest) -> Result<ureq::Response, Error> {
        let origin =
            Url::parse(&request.url).map_err(|e| Error::Transport(format!("{}: {e}", request.url)))?;

        let mut attempt = 0;

        loop {
            self.cancel.check()?;
            attempt += 1;

            let failure = match self.send_once(&origin, request) {
                Ok(response) if retriable_status(response.status()) && attempt < self.retries => {
                    Ok(response)
                }
                Ok(response) => return Ok(response),
                Err(SendError::Connection(message)) if attempt < self.retries => Err(message),
                Err(SendError::Connection(message)) => return Err(Error::Transport(message)),
                Err(SendError::Fatal(error)) => return Err(error),
            };

            let retry_after = failure
                .as_ref()
                .ok()
                .and_then(|r| r.header("Retry-After"))
                .and_then(|v| v.parse().ok());

            thread::sleep(retry_delay(attempt, retry_after));
        }
    }

    fn send_once(
        &self,
        origin: &Url,
        request: &TransportRequest,
    ) -> Result<ureq::Response, SendError> {
        let mut url = origin.clone();
        let mut method = request.method;
        let mut send_body = !matches!(request.body, Body::Empty);

        for _ in 0..=MAX_REDIRECTS {
            let same_origin = same_origin(origin, &url);
            let mut call = self
                .agent
                .request(method, url.as_str())
                .set("User-Agent", USER_AGENT);

            for (name, value) in &request.headers {
                // Cookies, like credentials, never cross origins.
                if !same_origin && name.eq_ignore_ascii_case("cookie") {
                    continue;
                }
                call = call.set(name, value);
            }

            if let Some(authorization) = &request.authorization {
                if same_origin {
                    call = call.set("Authorization", authorization);
                }
            }

            self.events.registry_request(method, url.as_str());

            let result = match (&request.body, send_body) {
                (Body::Bytes(data), true) => call.send_bytes(data),
                _ => call.call(),
            };

            let response = match result {
                Ok(response) => response,
                Err(ureq::Error::Status(_, response)) => response,
                Err(ureq::Error::Transport(t)) => {
                    return Err(SendError::Connection(t.to_string()));
                }
            };

            if !matches!(response.status(), 301 | 302 | 303 | 307 | 308) {
                return Ok(response);
            }

            let Some(location) = response.header("Location") else {
                return Ok(response);
            };

            url = url
                .join(location)
                .map_err(|e| SendError::Fatal(Error::Transport(format!("{location}: {e}"))))?;

            // A 303 repeats as a bodyless GET; the other hops preserve
            // the method (RFC 7231).
            if response.status() == 303 {
                method = "GET";
                send_body = false;
            }
        }

        Err(SendError::Fatal(Error::Transport(format!(
            "more than {MAX_REDIRECTS} redirects from {origin}"
        ))))
    }
}

enum SendError {
    /// Network-level failure, possibly transient.
    Connection(String),
    Fatal(Error),
}

/// Transient statuses worth retrying: 408, 429, and 5xx except 501.
fn retriable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (status >= 500 && status != 501)
}

fn retry_delay(attempt: u32, retry_after: Option<u64>) -> Duration {
    if let Some(seconds) = retry_after {
        return Duration::from_secs(seconds);
    }

    let jitter = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()) % 100)
        .unwrap_or(0);

    BACKOFF_BASE * 2u32.pow(attempt.saturating_sub(1)) + Duration::from_millis(jitter)
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme() && a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_statuses() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(retriable_status(status), "{status}");
        }

        for status in [200, 201, 202, 401, 404, 405, 416, 501] {
            assert!(!retriable_status(status), "{status}");
        }
    }

    #[test]
    fn backoff_grows_and_honors_retry_after() {
        assert!(retry_delay(1, None) >= Duration::from_millis(200));
        assert!(retry_delay(3, None) >= Duration::from_millis(800));
        assert_eq!(retry_delay(1, Some(7)), Duration::from_secs(7));
    }

    #[test]
    fn origin_comparison() {
        let base = Url::parse("https://registry.example:5000/v2/").unwrap();

        assert!(same_origin(
            &base,
            &Url::parse("https://registry.example:5000/other").unwrap(),
        ));

        for other in [
            "https://registry.example/other",
            "http://registry.example:5000/other",
            "https://cdn.example:5000/other",
        ] {
            assert!(!same_origin(&base, &Url::parse(other).unwrap()), "{other}");
        }
    }
}
