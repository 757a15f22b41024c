//! Error types and status-code mapping.

use http::StatusCode;
use thiserror::Error;

use crate::chunk::ChunkError;
use crate::packet::PacketId;

// ── Status codes ────────────────────────────────────────────────────

/// Successful call.
pub const OK: i64 = 200;
/// Malformed or out-of-protocol stream operation.
pub const BAD_REQUEST: i64 = 400;
/// Session required but absent, or forbidden verb on `/api`.
pub const FORBIDDEN: i64 = 403;
/// Unknown method or hook.
pub const NOT_FOUND: i64 = 404;
/// Handler reported an advisory timeout.
pub const REQUEST_TIMEOUT: i64 = 408;
/// Handler failure or malformed packet.
pub const INTERNAL_ERROR: i64 = 500;
/// Admission gate rejected the call.
pub const SERVICE_UNAVAILABLE: i64 = 503;

/// Clamp a code to a valid HTTP status, falling back to 500.
pub fn clamp_status(code: i64) -> u16 {
    u16::try_from(code)
        .ok()
        .filter(|status| (100..=599).contains(status))
        .unwrap_or(500)
}

/// Canonical reason phrase for a status, e.g. `"Not Found"`.
pub fn reason_phrase(status: u16) -> &'static str {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown error")
}

/// How an error response is rendered by a transport.
#[derive(Clone, Debug, Default)]
pub struct ErrorOptions {
    /// Id of the packet being answered.
    pub id: Option<PacketId>,
    /// Underlying error message, exposed only for passthrough or sub-500 errors.
    pub message: Option<String>,
    /// Outer HTTP status when it differs from the protocol code.
    pub http_code: Option<u16>,
    /// Reported to the peer but not escalated as a server fault.
    pub pass: bool,
}

impl ErrorOptions {
    /// Options answering the packet `id`.
    pub fn with_id(id: PacketId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    /// Passthrough options carrying `message`.
    pub fn passthrough(id: Option<PacketId>, message: impl Into<String>) -> Self {
        Self {
            id,
            message: Some(message.into()),
            http_code: None,
            pass: true,
        }
    }
}

/// Resolved error response: protocol code, outer status and visible message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Code placed in the packet's `error.code`.
    pub code: i64,
    /// HTTP status for one-shot transports.
    pub status: u16,
    /// Message placed in the packet's `error.message`.
    pub message: String,
}

impl ErrorResponse {
    /// Resolve `code` and `options` into what the peer sees.
    pub fn resolve(code: i64, options: &ErrorOptions) -> Self {
        let status = clamp_status(options.http_code.map_or(code, i64::from));
        let expose = options.pass || status < 500;
        let message = match &options.message {
            Some(message) if expose => message.clone(),
            _ => reason_phrase(status).to_owned(),
        };
        Self {
            code,
            status,
            message,
        }
    }
}

// ── Handler-side errors ─────────────────────────────────────────────

/// An error-shaped result produced by a handler that otherwise completed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ApplicationError {
    /// Code placed in the packet; 500 when absent.
    pub code: Option<i64>,
    /// Outer HTTP status; 200 when absent.
    pub http_code: Option<i64>,
    /// Human-readable message.
    pub message: String,
}

impl ApplicationError {
    /// Application error with a code and the default 200 outer status.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            http_code: None,
            message: message.into(),
        }
    }

    /// Override the outer HTTP status.
    #[must_use]
    pub fn with_http_code(mut self, http_code: i64) -> Self {
        self.http_code = Some(http_code);
        self
    }
}

/// Failure of a method or hook handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Failure without a status code.
    #[error("{0}")]
    Failed(String),

    /// Failure carrying an explicit numeric code.
    #[error("{message}")]
    Status {
        /// Requested code; clamped to a valid status.
        code: i64,
        /// Human-readable message.
        message: String,
    },

    /// The handler gave up after its advisory deadline.
    #[error("{0}")]
    Timeout(String),

    /// The handler returned an application-level error object.
    #[error(transparent)]
    Application(#[from] ApplicationError),
}

impl HandlerError {
    /// Failure with an explicit code.
    pub fn status(code: i64, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    /// Protocol code for the error packet.
    pub fn code(&self) -> i64 {
        match self {
            Self::Failed(_) => INTERNAL_ERROR,
            Self::Timeout(_) => REQUEST_TIMEOUT,
            Self::Status { code, .. } => i64::from(clamp_status(*code)),
            Self::Application(err) => err.code.unwrap_or(INTERNAL_ERROR),
        }
    }

    /// Error rendering options answering `id`.
    pub fn to_options(&self, id: PacketId) -> ErrorOptions {
        let http_code = match self {
            Self::Application(err) => Some(clamp_status(err.http_code.unwrap_or(OK))),
            _ => None,
        };
        ErrorOptions {
            id: Some(id),
            message: Some(self.to_string()),
            http_code,
            pass: false,
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

/// Rejection by a procedure's admission gate.
#[derive(Debug, Error)]
#[error("admission rejected: {0}")]
pub struct AdmissionError(pub String);

// ── Engine-side errors ──────────────────────────────────────────────

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The one-shot HTTP transport already replied.
    #[error("response already sent")]
    Finished,
    /// The connection is gone.
    #[error("connection closed")]
    Closed,
    /// Operation needs a bidirectional transport.
    #[error("can't {0} over http transport")]
    Unsupported(&'static str),
    /// Packet could not be serialized.
    #[error("packet serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Stream usage and state errors.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Stream name missing or empty.
    #[error("stream name is not provided")]
    MissingName,
    /// Stream size missing or zero.
    #[error("stream size is not provided")]
    MissingSize,
    /// Init packet with an invalid name or size.
    #[error("stream packet structure error")]
    InvalidPacket,
    /// Unknown stream id.
    #[error("stream {0} is not initialized")]
    NotInitialized(String),
    /// Duplicate stream id.
    #[error("stream {0} is already initialized")]
    AlreadyInitialized(String),
    /// The id refers to a stream of the wrong direction.
    #[error("stream {0} is not readable")]
    NotReadable(String),
    /// Data beyond the declared size.
    #[error("stream {id} overflow: {attempted} bytes exceeds declared size {declared}")]
    SizeExceeded {
        /// Stream id.
        id: String,
        /// Declared total size.
        declared: u64,
        /// Total size the write would reach.
        attempted: u64,
    },
    /// The stream was already closed.
    #[error("stream {0} is finished")]
    Finished(String),
    /// The stream was aborted by its sender.
    #[error("stream {0} was terminated")]
    Terminated(String),
}

/// Umbrella error for protocol operations that touch several layers.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Stream failure.
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// Chunk framing failure.
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_keeps_valid_statuses() {
        assert_eq!(clamp_status(200), 200);
        assert_eq!(clamp_status(404), 404);
        assert_eq!(clamp_status(599), 599);
    }

    #[test]
    fn clamp_replaces_out_of_range() {
        assert_eq!(clamp_status(600), 500);
        assert_eq!(clamp_status(99), 500);
        assert_eq!(clamp_status(-1), 500);
        assert_eq!(clamp_status(70_000), 500);
    }

    #[test]
    fn handler_failure_codes() {
        assert_eq!(HandlerError::Failed("boom".into()).code(), 500);
        assert_eq!(HandlerError::Timeout("slow".into()).code(), 408);
        assert_eq!(HandlerError::status(418, "teapot").code(), 418);
        assert_eq!(HandlerError::status(1000, "weird").code(), 500);
    }

    #[test]
    fn application_error_defaults_to_200_status() {
        let err = HandlerError::from(ApplicationError::new(42, "nope"));
        assert_eq!(err.code(), 42);
        let options = err.to_options(PacketId::from("x"));
        assert_eq!(options.http_code, Some(200));
        assert_eq!(options.message.as_deref(), Some("nope"));
    }

    #[test]
    fn application_error_keeps_explicit_status() {
        let err = HandlerError::from(ApplicationError::new(42, "nope").with_http_code(409));
        assert_eq!(err.to_options(PacketId::from("x")).http_code, Some(409));
    }

    #[test]
    fn application_error_without_code_is_500() {
        let err = HandlerError::from(ApplicationError {
            code: None,
            http_code: None,
            message: "x".into(),
        });
        assert_eq!(err.code(), 500);
    }

    #[test]
    fn server_errors_hide_message() {
        let options = ErrorOptions {
            message: Some("database password is hunter2".into()),
            ..ErrorOptions::default()
        };
        let resolved = ErrorResponse::resolve(500, &options);
        assert_eq!(resolved.status, 500);
        assert_eq!(resolved.message, "Internal Server Error");
    }

    #[test]
    fn passthrough_errors_expose_message() {
        let options = ErrorOptions::passthrough(None, "Packet structure error");
        let resolved = ErrorResponse::resolve(500, &options);
        assert_eq!(resolved.message, "Packet structure error");
    }

    #[test]
    fn client_errors_expose_message() {
        let options = ErrorOptions {
            message: Some("bad input".into()),
            ..ErrorOptions::default()
        };
        assert_eq!(ErrorResponse::resolve(400, &options).message, "bad input");
    }

    #[test]
    fn missing_message_uses_reason_phrase() {
        let resolved = ErrorResponse::resolve(404, &ErrorOptions::default());
        assert_eq!(resolved.message, "Not Found");
        let resolved = ErrorResponse::resolve(503, &ErrorOptions::default());
        assert_eq!(resolved.message, "Service Unavailable");
    }

    #[test]
    fn http_code_overrides_status_not_code() {
        let options = ErrorOptions {
            http_code: Some(200),
            message: Some("app".into()),
            ..ErrorOptions::default()
        };
        let resolved = ErrorResponse::resolve(42, &options);
        assert_eq!(resolved.code, 42);
        assert_eq!(resolved.status, 200);
        assert_eq!(resolved.message, "app");
    }

    #[test]
    fn stream_error_messages() {
        assert_eq!(
            StreamError::NotInitialized("s1".into()).to_string(),
            "stream s1 is not initialized"
        );
        assert_eq!(
            TransportError::Unsupported("send streams").to_string(),
            "can't send streams over http transport"
        );
    }
}
