use thiserror::Error;

/// Top-level error type for the `pve-api` crate.
///
/// Covers every failure mode across the client: authentication, transport,
/// API envelope errors, entity resolution, the device-string codec, and the
/// async task lifecycle.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Ticket login failed (wrong credentials, realm unavailable, etc.)
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── API ─────────────────────────────────────────────────────────
    /// Error reported by the API itself: a non-success HTTP status or an
    /// `errors` field in the response envelope (submission rejection).
    #[error("API error: {message}")]
    Api { message: String },

    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    // ── Resolution ──────────────────────────────────────────────────
    /// An entity (VM, container, node, storage) could not be resolved.
    #[error("{what} not found")]
    NotFound { what: String },

    /// The remote configuration stayed locked (e.g. mid-clone) through
    /// every fetch attempt.
    #[error("{what} is locked, could not obtain config")]
    Locked { what: String },

    // ── Device codec ────────────────────────────────────────────────
    /// A device slot is missing a property the flat encoding requires,
    /// or a flat string cannot be decoded.
    #[error("Invalid device configuration: {message}")]
    InvalidDevice { message: String },

    // ── Task lifecycle ──────────────────────────────────────────────
    /// A task identifier did not match the `UPID:<node>:<rest>` shape.
    #[error("Invalid task identifier: {upid}")]
    InvalidUpid { upid: String },

    /// A task finished with a non-success exit status. The status string
    /// is carried verbatim as reported by the node.
    #[error("Task failed: {status}")]
    TaskFailed { status: String },

    /// The polling deadline elapsed before the task reported an exit
    /// status. Carries the UPID for operator diagnosis.
    #[error("Timed out waiting for task {upid}")]
    TaskTimeout { upid: String },

    // ── Compensation ────────────────────────────────────────────────
    /// Entity creation failed and at least one compensating volume
    /// deletion failed too. Neither failure masks the other.
    #[error("{creation} (volume rollback also failed: {cleanup})")]
    Rollback {
        creation: Box<Error>,
        cleanup: Box<Error>,
    },
}

impl Error {
    /// Returns `true` if this error looks like a truncated read: the node
    /// answered but the body was cut short. During task polling this is
    /// transient -- the backend may still be writing its status record.
    pub fn is_truncated_read(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_body() || e.is_decode(),
            // serde_json reports a body cut mid-value as an EOF parse error.
            Self::Deserialization { message, .. } => message.contains("EOF"),
            _ => false,
        }
    }

    /// Returns `true` if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Transport(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            Self::NotFound { .. } => true,
            _ => false,
        }
    }

    /// The original creation failure, unwrapped from a rollback wrapper
    /// if compensation failed too.
    pub fn creation_failure(&self) -> &Error {
        match self {
            Self::Rollback { creation, .. } => creation,
            other => other,
        }
    }
}
