//! Request-level error taxonomy.
//!
//! Every failure that can happen while serving one request is a [`ServeError`].
//! The connection turns it into a status response and a log outcome; none of
//! these ever take the process down. Startup failures are plain
//! `anyhow::Error`s in `main`.

use crate::http::response::{Response, StatusCode};

/// Which resource budget a request ran over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// The client did not deliver the header section or body in time.
    InputTimeout,
    /// The header section exceeded the size or line cap.
    HeaderTooLarge,
    /// Declared `Content-Length` exceeded `--max-content-length`.
    BodyTooLarge,
    /// A CGI child (or the whole process in inherited mode) ran out of CPU.
    Cpu,
    /// Producing the response took longer than `--timeout`.
    WallClock,
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("malformed request: {0}")]
    MalformedRequest(&'static str),

    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("not found")]
    NotFound,

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("range not satisfiable (resource is {size} bytes)")]
    RangeNotSatisfiable { size: u64 },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("execution failure: {0}")]
    ExecutionFailure(String),

    #[error("resource budget exceeded: {0:?}")]
    ResourceExceeded(Budget),
}

impl ServeError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServeError::MalformedRequest(_) => StatusCode::BadRequest,
            ServeError::UnknownHost(_) => StatusCode::BadRequest,
            ServeError::NotFound => StatusCode::NotFound,
            ServeError::Forbidden(_) => StatusCode::Forbidden,
            ServeError::MethodNotAllowed => StatusCode::MethodNotAllowed,
            ServeError::NotImplemented(_) => StatusCode::NotImplemented,
            ServeError::RangeNotSatisfiable { .. } => StatusCode::RangeNotSatisfiable,
            ServeError::BackendUnavailable(_) => StatusCode::ServiceUnavailable,
            ServeError::ExecutionFailure(_) => StatusCode::InternalServerError,
            ServeError::ResourceExceeded(budget) => match budget {
                Budget::InputTimeout => StatusCode::RequestTimeout,
                Budget::HeaderTooLarge => StatusCode::HeaderFieldsTooLarge,
                Budget::BodyTooLarge => StatusCode::PayloadTooLarge,
                Budget::Cpu => StatusCode::InternalServerError,
                Budget::WallClock => StatusCode::GatewayTimeout,
            },
        }
    }

    /// The error page sent to the client.
    pub fn to_response(&self) -> Response {
        let mut response = Response::error(self.status());
        if let ServeError::RangeNotSatisfiable { size } = self {
            response.set_header("Content-Range", format!("bytes */{size}"));
        }
        response
    }

    /// Short outcome tag recorded in the access log.
    pub fn kind(&self) -> &'static str {
        match self {
            ServeError::MalformedRequest(_) => "MalformedRequest",
            ServeError::UnknownHost(_) => "UnknownHost",
            ServeError::NotFound => "NotFound",
            ServeError::Forbidden(_) => "Forbidden",
            ServeError::MethodNotAllowed => "MethodNotAllowed",
            ServeError::NotImplemented(_) => "NotImplemented",
            ServeError::RangeNotSatisfiable { .. } => "RangeNotSatisfiable",
            ServeError::BackendUnavailable(_) => "BackendUnavailable",
            ServeError::ExecutionFailure(_) => "ExecutionFailure",
            ServeError::ResourceExceeded(_) => "ResourceExceeded",
        }
    }
}

impl From<std::io::Error> for ServeError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ServeError::NotFound,
            std::io::ErrorKind::PermissionDenied => ServeError::Forbidden("permission denied"),
            _ => ServeError::ExecutionFailure(err.to_string()),
        }
    }
}
