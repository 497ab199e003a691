//! In-process registry for tests.
//!
//! Implements enough of the distribution protocol to exercise pulls,
//! pushes, uploads, tag listing and authentication, with hooks to
//! inject canned responses for failure scenarios.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sha2::{Digest as _, Sha256};
use tiny_http::{Header, Request, Response, Server};

/// Start a registry server on a random port.
pub fn start_registry() -> TestRegistry {
    let server = Server::http("127.0.0.1:0").expect("start registry server");
    let port = server.server_addr().to_ip().unwrap().port();

    let state = Arc::new(Mutex::new(State::default()));

    let registry = TestRegistry {
        port,
        state: state.clone(),
    };

    std::thread::spawn(move || {
        let timeout = Duration::from_secs(60);
        while let Ok(Some(request)) = server.recv_timeout(timeout) {
            handle(port, &state, request);
        }
    });

    registry
}

/// A canned response injected for one exact `METHOD path` pair.
#[derive(Clone, Default)]
pub struct Canned {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Serve this many times, then fall through to normal handling.
    /// `None` serves forever.
    pub remaining: Option<u32>,
}

#[derive(Default)]
struct State {
    blobs: HashMap<String, Vec<u8>>,
    /// `<repo>:<tag-or-digest>` → (content type, body, digest).
    manifests: HashMap<String, (String, Vec<u8>, String)>,
    tags: HashMap<String, Vec<String>>,
    uploads: HashMap<String, Vec<u8>>,
    next_upload: u64,

    /// `METHOD path` → canned response.
    canned: HashMap<String, Canned>,
    /// Expected `Authorization` header for everything under `/v2/`.
    required_authorization: Option<String>,
    /// Bearer token served by `/token` and then required.
    bearer: Option<BearerAuth>,
    /// Prefix for upload session locations (path-relative).
    upload_location_prefix: String,
    /// Answer the first PATCH with 416 after keeping only half of it.
    drop_first_patch_tail: bool,
    /// Respond 405 to DELETE requests.
    delete_not_supported: bool,
    /// Fail any request carrying an `Authorization` header; for
    /// asserting credentials are stripped on cross-origin redirects.
    forbid_authorization: bool,

    log: Vec<String>,
}

#[derive(Clone)]
pub struct BearerAuth {
    pub token: String,
    pub service: String,
}

pub struct TestRegistry {
    port: u16,
    state: Arc<Mutex<State>>,
}

impl TestRegistry {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn canned(&self, method: &str, path: &str, canned: Canned) {
        self.state()
            .canned
            .insert(format!("{method} {path}"), canned);
    }

    pub fn require_authorization(&self, header: &str) {
        self.state().required_authorization = Some(header.to_owned());
    }

    pub fn require_bearer(&self, auth: BearerAuth) {
        self.state().bearer = Some(auth);
    }

    pub fn set_tags(&self, repository: &str, tags: &[&str]) {
        self.state()
            .tags
            .insert(repository.to_owned(), tags.iter().map(|t| t.to_string()).collect());
    }

    pub fn put_blob(&self, data: &[u8]) -> String {
        let digest = sha256(data);
        self.state().blobs.insert(digest.clone(), data.to_vec());
        digest
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.state().blobs.contains_key(digest)
    }

    pub fn put_manifest(&self, repository: &str, reference: &str, content_type: &str, body: &[u8]) {
        let digest = sha256(body);
        let mut state = self.state();
        let value = (content_type.to_owned(), body.to_vec(), digest.clone());
        state
            .manifests
            .insert(format!("{repository}:{reference}"), value.clone());
        state.manifests.insert(format!("{repository}:{digest}"), value);
    }

    pub fn has_manifest(&self, repository: &str, reference: &str) -> bool {
        self.state()
            .manifests
            .contains_key(&format!("{repository}:{reference}"))
    }

    pub fn set_upload_location_prefix(&self, prefix: &str) {
        self.state().upload_location_prefix = prefix.to_owned();
    }

    pub fn drop_first_patch_tail(&self) {
        self.state().drop_first_patch_tail = true;
    }

    pub fn disable_delete(&self) {
        self.state().delete_not_supported = true;
    }

    pub fn forbid_authorization(&self) {
        self.state().forbid_authorization = true;
    }

    /// Requests handled so far, as `METHOD path` lines, clearing the
    /// log.
    pub fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut self.state().log)
    }
}

fn sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);

    let mut hex = String::with_capacity(64);
    for byte in hasher.finalize() {
        hex.push_str(&format!("{byte:02x}"));
    }

    format!("sha256:{hex}")
}

fn handle(port: u16, state: &Arc<Mutex<State>>, mut request: Request) {
    let method = request.method().to_string();

    let base = url::Url::parse("http://0").unwrap();
    let parsed = url::Url::options()
        .base_url(Some(&base))
        .parse(request.url())
        .unwrap();

    let path = parsed.path().to_owned();
    let query: HashMap<String, String> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut body = Vec::new();
    request.as_reader().read_to_end(&mut body).unwrap();

    let authorization = header_value(&request, "Authorization");
    let content_type = header_value(&request, "Content-Type");

    let reply = {
        let mut state = state.lock().unwrap();
        state.log.push(format!("{method} {path}"));
        respond(
            port,
            &mut state,
            &method,
            &path,
            &query,
            &body,
            authorization,
            content_type,
        )
    };

    let mut response = Response::from_data(reply.body).with_status_code(reply.status);
    for (name, value) in reply.headers {
        response.add_header(Header::from_bytes(name.as_bytes(), value.as_bytes()).unwrap());
    }

    let _ = request.respond(response);
}

fn header_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.as_str().as_str().eq_ignore_ascii_case(name))
        .map(|h| h.value.to_string())
}

struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Reply {
    fn status(status: u16) -> Reply {
        Reply {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn header(mut self, name: &str, value: impl Into<String>) -> Reply {
        self.headers.push((name.to_owned(), value.into()));
        self
    }

    fn body(mut self, body: impl Into<Vec<u8>>) -> Reply {
        self.body = body.into();
        self
    }

    fn json(value: &impl serde::Serialize) -> Reply {
        Reply::status(200)
            .header("Content-Type", "application/json")
            .body(serde_json::to_vec(value).unwrap())
    }
}

#[allow(clippy::too_many_arguments)]
fn respond(
    port: u16,
    state: &mut State,
    method: &str,
    path: &str,
    query: &HashMap<String, String>,
    body: &[u8],
    authorization: Option<String>,
    content_type: Option<String>,
) -> Reply {
    if state.forbid_authorization && authorization.is_some() {
        return Reply::status(400).body("unexpected Authorization header");
    }

    // Injected responses win over everything.
    if let Some(canned) = state.canned.get_mut(&format!("{method} {path}")) {
        let serve = match &mut canned.remaining {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        };

        if serve {
            return Reply {
                status: canned.status,
                headers: canned.headers.clone(),
                body: canned.body.clone(),
            };
        }
    }

    // Token endpoint for the Bearer flow.
    if let Some(bearer) = &state.bearer {
        if path == "/token" {
            let token = bearer.token.clone();
            return Reply::json(&serde_json::json!({ "token": token }));
        }

        let expected = format!("Bearer {}", bearer.token);
        if authorization.as_deref() != Some(&expected) {
            let challenge = format!(
                r#"Bearer realm="http://127.0.0.1:{port}/token",service="{}""#,
                bearer.service,
            );
            return Reply::status(401).header("WWW-Authenticate", challenge);
        }
    }

    if let Some(expected) = &state.required_authorization {
        if authorization.as_deref() != Some(expected.as_str()) {
            return Reply::status(401).header("WWW-Authenticate", r#"Basic realm="registry""#);
        }
    }

    if path == "/v2/" {
        return Reply::status(200);
    }

    let Some(rest) = path.strip_prefix("/v2/") else {
        return upload_endpoints(state, method, path, query, body)
            .unwrap_or_else(|| Reply::status(404));
    };

    // Tags.
    if let Some(repository) = rest.strip_suffix("/tags/list") {
        return tags_list(state, repository, query);
    }

    // Upload initiation. Checked before plain blob paths, which it
    // would otherwise match.
    if let Some(repository) = rest.strip_suffix("/blobs/uploads/") {
        if method != "POST" {
            return Reply::status(405);
        }

        // Cross-repo mount: succeed only when the blob exists.
        if let Some(mount) = query.get("mount") {
            if state.blobs.contains_key(mount) {
                return Reply::status(201)
                    .header("Location", format!("/v2/{repository}/blobs/{mount}"));
            }
        }

        let id = state.next_upload;
        state.next_upload += 1;
        state.uploads.insert(id.to_string(), Vec::new());

        let prefix = if state.upload_location_prefix.is_empty() {
            format!("/v2/{repository}/blobs/uploads")
        } else {
            state.upload_location_prefix.clone()
        };

        // Path-relative on purpose: clients must resolve it against
        // the URL this POST landed on.
        return Reply::status(202).header("Location", format!("{prefix}/{id}"));
    }

    // Session PATCH/PUT under the default location prefix.
    if rest.contains("/blobs/uploads/") {
        if let Some(reply) = upload_endpoints(state, method, path, query, body) {
            return reply;
        }
    }

    // Blobs.
    if let Some((_repository, digest)) = rest.rsplit_once("/blobs/") {
        if method == "DELETE" {
            return delete_reply(state, state.blobs.contains_key(digest));
        }

        return match state.blobs.get(digest) {
            Some(data) => {
                let reply = Reply::status(200)
                    .header("Content-Type", "application/octet-stream")
                    .header("Docker-Content-Digest", digest);
                match method {
                    "HEAD" => reply,
                    _ => reply.body(data.clone()),
                }
            }
            None => Reply::status(404),
        };
    }

    // Manifests.
    if let Some((repository, reference)) = rest.rsplit_once("/manifests/") {
        let key = format!("{repository}:{reference}");

        if method == "PUT" {
            let content_type = content_type
                .unwrap_or_else(|| "application/vnd.oci.image.manifest.v1+json".to_owned());
            let digest = sha256(body);

            let value = (content_type, body.to_vec(), digest.clone());
            state.manifests.insert(key, value.clone());
            state
                .manifests
                .insert(format!("{repository}:{digest}"), value);

            return Reply::status(201).header("Docker-Content-Digest", digest);
        }

        if method == "DELETE" {
            let known = state.manifests.contains_key(&key);
            return delete_reply(state, known);
        }

        return match state.manifests.get(&key) {
            Some((content_type, data, digest)) => {
                let reply = Reply::status(200)
                    .header("Content-Type", content_type.clone())
                    .header("Docker-Content-Digest", digest.clone());
                match method {
                    "HEAD" => reply,
                    _ => reply.body(data.clone()),
                }
            }
            None => Reply::status(404),
        };
    }

    // Referrers: not implemented here; tests exercising the fallback
    // store an index under the tag schema instead.
    if rest.contains("/referrers/") {
        return Reply::status(404);
    }

    upload_endpoints(state, method, path, query, body).unwrap_or_else(|| Reply::status(404))
}

fn tags_list(state: &State, repository: &str, query: &HashMap<String, String>) -> Reply {
    let Some(all) = state.tags.get(repository) else {
        return Reply::status(404);
    };

    let start = match query.get("last") {
        Some(last) => all.iter().position(|t| t == last).map_or(0, |i| i + 1),
        None => 0,
    };

    let page_size = query
        .get("n")
        .and_then(|n| n.parse::<usize>().ok())
        .unwrap_or(all.len());

    let page: Vec<&String> = all.iter().skip(start).take(page_size).collect();

    let mut reply = Reply::json(&serde_json::json!({
        "name": repository,
        "tags": page,
    }));

    if start + page.len() < all.len() {
        if let Some(last) = page.last() {
            reply = reply.header(
                "Link",
                format!(r#"</v2/{repository}/tags/list?n={page_size}&last={last}>; rel="next""#),
            );
        }
    }

    reply
}

fn delete_reply(state: &State, known: bool) -> Reply {
    if state.delete_not_supported {
        Reply::status(405)
    } else if known {
        Reply::status(202)
    } else {
        Reply::status(404)
    }
}

/// PATCH/PUT against upload session URLs, wherever the location
/// prefix put them.
fn upload_endpoints(
    state: &mut State,
    method: &str,
    path: &str,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Option<Reply> {
    let id = path.rsplit_once('/')?.1.to_owned();

    if !state.uploads.contains_key(&id) {
        return None;
    }

    match method {
        "PATCH" => {
            let mut chunk = body.to_vec();
            let mut status = 202;

            if state.drop_first_patch_tail && chunk.len() > 1 {
                state.drop_first_patch_tail = false;
                chunk.truncate(chunk.len() / 2);
                status = 416;
            }

            let session = state.uploads.get_mut(&id)?;
            session.extend_from_slice(&chunk);
            let received = session.len();

            let reply = Reply::status(status).header("Location", path.to_owned());

            Some(match status {
                416 => reply.header("Range", format!("0-{}", received - 1)),
                _ => reply,
            })
        }

        "PUT" => {
            let expected = query.get("digest")?.clone();

            let mut data = state.uploads.remove(&id)?;
            data.extend_from_slice(body);

            if sha256(&data) != expected {
                return Some(Reply::status(400));
            }

            state.blobs.insert(expected.clone(), data);

            Some(Reply::status(201).header("Docker-Content-Digest", expected))
        }

        _ => None,
    }
}
