// HTTP client for the Proxmox VE API.
//
// Wraps `reqwest::Client` with `/api2/json` URL construction, the
// `{ data, errors }` envelope, and ticket/CSRF session state. Endpoint
// groups (cluster, storage, vm, tasks) are implemented as inherent
// methods in separate modules to keep this one focused on transport
// mechanics.

use std::sync::RwLock;

use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

/// A flat parameter map as submitted to the API.
///
/// Values may be strings, numbers, or booleans; they are form-encoded
/// on the wire. Device slots are folded into this map as flat strings
/// (`scsi0`, `mp1`, `net0`, ...) by the device codec.
pub type Params = serde_json::Map<String, Value>;

/// Client for a single Proxmox VE endpoint.
///
/// Holds the authentication ticket and CSRF prevention token captured at
/// login. The ticket rides on every request as the `PVEAuthCookie`
/// cookie; the CSRF token is added to every mutating request.
pub struct Client {
    http: reqwest::Client,
    base_url: Url,
    ticket: RwLock<Option<String>>,
    csrf_token: RwLock<Option<String>>,
}

impl Client {
    /// Create a new client from a `TransportConfig`.
    ///
    /// `base_url` is the node or cluster endpoint root, typically
    /// `https://host:8006`. No request is made until [`login`](Self::login)
    /// or an API call.
    pub fn new(base_url: Url, transport: &TransportConfig) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self::with_client(http, base_url))
    }

    /// Create a client with a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self {
            http,
            base_url,
            ticket: RwLock::new(None),
            csrf_token: RwLock::new(None),
        }
    }

    /// The API base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The underlying HTTP client (for auth flows that need direct access).
    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    // ── Session state ────────────────────────────────────────────────

    /// Store the ticket and CSRF token captured from a login response.
    pub(crate) fn set_session(&self, ticket: String, csrf_token: String) {
        debug!("storing authentication ticket");
        *self.ticket.write().expect("ticket lock poisoned") = Some(ticket);
        *self.csrf_token.write().expect("CSRF lock poisoned") = Some(csrf_token);
    }

    /// Apply the session ticket (and, for mutating requests, the CSRF
    /// prevention token) to a request builder.
    fn apply_session(&self, builder: reqwest::RequestBuilder, mutating: bool) -> reqwest::RequestBuilder {
        let ticket = self.ticket.read().expect("ticket lock poisoned");
        let mut builder = match ticket.as_deref() {
            Some(t) => builder.header("Cookie", format!("PVEAuthCookie={t}")),
            None => builder,
        };
        if mutating {
            let csrf = self.csrf_token.read().expect("CSRF lock poisoned");
            if let Some(token) = csrf.as_deref() {
                builder = builder.header("CSRFPreventionToken", token);
            }
        }
        builder
    }

    // ── URL construction ─────────────────────────────────────────────

    /// Build a full URL for an API path: `{base}/api2/json{path}`.
    ///
    /// `path` starts with `/` and may carry a query string
    /// (e.g. `/cluster/resources?type=vm`).
    pub(crate) fn api_url(&self, path: &str) -> Result<Url, Error> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let full = format!("{base}/api2/json{path}");
        Url::parse(&full).map_err(Error::InvalidUrl)
    }

    // ── Request helpers ──────────────────────────────────────────────

    /// Send a GET request and parse the response envelope.
    pub(crate) async fn get_json(&self, path: &str) -> Result<Value, Error> {
        let url = self.api_url(path)?;
        debug!("GET {}", url);

        let builder = self.apply_session(self.http.get(url), false);
        let resp = builder.send().await.map_err(Error::Transport)?;

        self.parse_envelope(resp).await
    }

    /// Send a POST request with a form-encoded body and parse the envelope.
    pub(crate) async fn post_form(
        &self,
        path: &str,
        params: Option<&Params>,
    ) -> Result<Value, Error> {
        let url = self.api_url(path)?;
        debug!("POST {}", url);

        let mut builder = self.apply_session(self.http.post(url), true);
        if let Some(params) = params {
            builder = builder.form(&to_form(params));
        }
        let resp = builder.send().await.map_err(Error::Transport)?;

        self.parse_envelope(resp).await
    }

    /// Send a PUT request with a form-encoded body and parse the envelope.
    pub(crate) async fn put_form(
        &self,
        path: &str,
        params: Option<&Params>,
    ) -> Result<Value, Error> {
        let url = self.api_url(path)?;
        debug!("PUT {}", url);

        let mut builder = self.apply_session(self.http.put(url), true);
        if let Some(params) = params {
            builder = builder.form(&to_form(params));
        }
        let resp = builder.send().await.map_err(Error::Transport)?;

        self.parse_envelope(resp).await
    }

    /// Send a DELETE request and parse the envelope.
    pub(crate) async fn delete_json(&self, path: &str) -> Result<Value, Error> {
        let url = self.api_url(path)?;
        debug!("DELETE {}", url);

        let builder = self.apply_session(self.http.delete(url), true);
        let resp = builder.send().await.map_err(Error::Transport)?;

        self.parse_envelope(resp).await
    }

    /// Parse the `{ data, errors }` envelope.
    ///
    /// The envelope is returned whole: callers that only need the payload
    /// take `data`, while the task-wait machinery inspects `errors` and
    /// `data` itself. Non-success HTTP statuses are mapped to errors here,
    /// with any `errors` field from the body folded into the message.
    async fn parse_envelope(&self, resp: reqwest::Response) -> Result<Value, Error> {
        let status = resp.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication {
                message: "ticket expired or invalid credentials".into(),
            });
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("errors").map(ToString::to_string))
                .unwrap_or_else(|| preview(&body).to_owned());
            return Err(Error::Api {
                message: format!("HTTP {status}: {detail}"),
            });
        }

        let body = resp.text().await.map_err(Error::Transport)?;

        serde_json::from_str(&body).map_err(|e| {
            let preview = preview(&body);
            Error::Deserialization {
                message: format!("{e} (body preview: {preview:?})"),
                body,
            }
        })
    }
}

/// A short prefix of a response body for error messages, cut on a char
/// boundary so multi-byte text never panics the slice.
fn preview(body: &str) -> &str {
    const PREVIEW_LIMIT: usize = 200;
    let mut end = body.len().min(PREVIEW_LIMIT);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// Flatten a parameter map into form fields.
///
/// Strings pass through as-is, numbers and booleans are rendered in their
/// canonical text form, and null entries are dropped.
fn to_form(params: &Params) -> Vec<(&str, String)> {
    params
        .iter()
        .filter_map(|(k, v)| {
            let rendered = match v {
                Value::Null => return None,
                Value::String(s) => s.clone(),
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                other => other.to_string(),
            };
            Some((k.as_str(), rendered))
        })
        .collect()
}
