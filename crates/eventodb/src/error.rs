use serde_json::{json, Value};
use thiserror::Error;

/// Type alias for `Result<T, eventodb::Error>`.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error taxonomy shared by every layer.
///
/// Each variant maps to a stable string code carried in the RPC error
/// envelope; clients pattern-match on the code, so codes never change.
/// Storage drivers classify their native failures into these variants at the
/// driver boundary, and anything unclassified surfaces as [`Error::Backend`]
/// with the underlying message preserved in `details`.
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("wrong expected version {expected} for stream {stream} (stream version: {actual:?})")]
    StreamVersionConflict {
        stream: String,
        expected: i64,
        actual: Option<i64>,
    },

    #[error("message id already exists: {id}")]
    DuplicateId { id: String },

    #[error("namespace not found: {namespace}")]
    NamespaceNotFound { namespace: String },

    #[error("namespace already exists: {namespace}")]
    NamespaceExists { namespace: String },

    #[error("namespace {namespace} is not empty")]
    NamespaceNotEmpty { namespace: String },

    #[error("authentication required")]
    AuthRequired,

    #[error("invalid token")]
    AuthInvalidToken,

    #[error("token is not authorized for this operation")]
    AuthUnauthorized,

    #[error("{message}")]
    InvalidRequest { message: String },

    #[error("global position {global_position} already exists")]
    PositionExists {
        global_position: i64,
        line: Option<u64>,
    },

    #[error("backend error: {message}")]
    Backend { message: String },

    #[error("request exceeded its deadline")]
    Timeout,
}

impl Error {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Error::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn backend(message: impl ToString) -> Self {
        Error::Backend {
            message: message.to_string(),
        }
    }

    /// Stable wire code for the RPC error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::StreamVersionConflict { .. } => "STREAM_VERSION_CONFLICT",
            Error::DuplicateId { .. } => "DUPLICATE_ID",
            Error::NamespaceNotFound { .. } => "NAMESPACE_NOT_FOUND",
            Error::NamespaceExists { .. } => "NAMESPACE_EXISTS",
            Error::NamespaceNotEmpty { .. } => "NAMESPACE_NOT_EMPTY",
            Error::AuthRequired => "AUTH_REQUIRED",
            Error::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Error::AuthUnauthorized => "AUTH_UNAUTHORIZED",
            Error::InvalidRequest { .. } => "INVALID_REQUEST",
            Error::PositionExists { .. } => "POSITION_EXISTS",
            Error::Backend { .. } => "BACKEND_ERROR",
            Error::Timeout => "TIMEOUT",
        }
    }

    /// Structured detail payload for the RPC error envelope.
    pub fn details(&self) -> Value {
        match self {
            Error::StreamVersionConflict {
                stream,
                expected,
                actual,
            } => json!({ "stream": stream, "expected": expected, "actual": actual }),
            Error::DuplicateId { id } => json!({ "id": id }),
            Error::NamespaceNotFound { namespace }
            | Error::NamespaceExists { namespace }
            | Error::NamespaceNotEmpty { namespace } => json!({ "namespace": namespace }),
            Error::PositionExists {
                global_position,
                line,
            } => match line {
                Some(line) => json!({ "globalPosition": global_position, "line": line }),
                None => json!({ "globalPosition": global_position }),
            },
            Error::Backend { message } => json!({ "message": message }),
            _ => Value::Null,
        }
    }

    /// Renders the RPC error envelope body.
    pub fn to_envelope(&self) -> Value {
        json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "details": self.details(),
            }
        })
    }
}
