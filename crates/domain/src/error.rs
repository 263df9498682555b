/// Shared error type used across all Agent Orchestration Core crates.
///
/// Variants map onto the external API boundary's error kinds; handlers at
/// the HTTP/WS edge translate these into status codes (see the gateway's
/// `api::error` module).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Coarse error kind, for building HTTP status codes and error bodies
    /// at the API boundary without matching on every variant.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Unauthorized(_) | Error::Auth(_) => ErrorKind::Unauthorized,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::PayloadTooLarge(_) => ErrorKind::PayloadTooLarge,
            Error::Unavailable(_) | Error::Timeout(_) | Error::Provider { .. } => {
                ErrorKind::Unavailable
            }
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Invariant(_) => ErrorKind::Invariant,
            Error::Storage(_) | Error::Io(_) => ErrorKind::Storage,
            Error::Http(_) | Error::Json(_) | Error::Config(_) | Error::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// HTTP status code for this error, used by the gateway's REST/WS/SSE
    /// boundary (C10) to map a failed repository or executor call onto a
    /// response without re-deriving the kind->status table at every call
    /// site. Returned as a raw `u16` so this crate doesn't need to depend
    /// on `axum`/`http`; the gateway converts it to `StatusCode`.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidArgument => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::Conflict => 409,
            ErrorKind::PayloadTooLarge => 413,
            ErrorKind::Unavailable => 503,
            ErrorKind::Cancelled => 499,
            ErrorKind::Invariant => 500,
            ErrorKind::Storage => 500,
            ErrorKind::Internal => 500,
        }
    }
}

/// Coarse classification of [`Error`] used to pick an HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    Unauthorized,
    Forbidden,
    Conflict,
    PayloadTooLarge,
    Unavailable,
    Cancelled,
    Invariant,
    Storage,
    Internal,
}

pub type Result<T> = std::result::Result<T, Error>;
