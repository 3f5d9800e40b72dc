//! Error types for the load balancer controller
//!
//! Every fallible step wraps the error it returns with the name of the
//! operation that produced it (see [`ResultExt::op`]), so a failure surfaced to
//! the control loop reads as a trail such as
//! `load_balancers::ensure: lb_ops::attach_to_network: cloud API error (locked): ...`.

use std::fmt;

use thiserror::Error;

/// Error codes returned by the Hetzner Cloud API that the controller reacts to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    Conflict,
    Locked,
    UniquenessError,
    RateLimitExceeded,
    Other(String),
}

impl ErrorCode {
    pub fn parse(code: &str) -> Self {
        match code {
            "not_found" => ErrorCode::NotFound,
            "conflict" => ErrorCode::Conflict,
            "locked" => ErrorCode::Locked,
            "uniqueness_error" => ErrorCode::UniquenessError,
            "rate_limit_exceeded" => ErrorCode::RateLimitExceeded,
            other => ErrorCode::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::Locked => "locked",
            ErrorCode::UniquenessError => "uniqueness_error",
            ErrorCode::RateLimitExceeded => "rate_limit_exceeded",
            ErrorCode::Other(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// An annotation on the Service could not be parsed
    #[error("annotation {key}: {reason}")]
    Annotation { key: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// More than one backend object matched a lookup that must be unique
    #[error("non-unique result: {0}")]
    NonUniqueResult(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("cloud API error ({code}): {message}")]
    CloudApi { code: ErrorCode, message: String },

    #[error("action {id} failed ({code}): {message}")]
    ActionFailed {
        id: i64,
        code: String,
        message: String,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("{op}: {source}")]
    Operation {
        op: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("Finalizer error: {0}")]
    FinalizerError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Wrap `source` with the name of the operation that produced it
    pub fn op(op: &'static str, source: Error) -> Self {
        Error::Operation {
            op,
            source: Box::new(source),
        }
    }

    pub fn annotation(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Annotation {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// The innermost error, skipping operation wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for a missing resource, either reported by the controller or by the cloud API
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::NotFound(_) => true,
            Error::CloudApi { code, .. } => *code == ErrorCode::NotFound,
            _ => false,
        }
    }

    /// True if the innermost error is a cloud API error carrying one of `codes`
    pub fn has_code(&self, codes: &[ErrorCode]) -> bool {
        match self.root() {
            Error::CloudApi { code, .. } => codes.contains(code),
            _ => false,
        }
    }

    /// Errors worth retrying soon; configuration problems recur until the Service changes
    pub fn is_retriable(&self) -> bool {
        match self.root() {
            Error::KubeError(_) | Error::HttpError(_) | Error::Timeout(_) => true,
            Error::ActionFailed { .. } => true,
            Error::CloudApi { code, .. } => matches!(
                code,
                ErrorCode::Conflict | ErrorCode::Locked | ErrorCode::RateLimitExceeded
            ),
            _ => false,
        }
    }

    /// Short category label used for metrics
    pub fn kind(&self) -> &'static str {
        match self.root() {
            Error::KubeError(_) => "kube",
            Error::HttpError(_) => "http",
            Error::SerializationError(_) => "serialization",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::Annotation { .. } => "annotation",
            Error::NotFound(_) => "not_found",
            Error::NonUniqueResult(_) => "non_unique",
            Error::AlreadyExists(_) => "already_exists",
            Error::CloudApi { .. } => "cloud_api",
            Error::ActionFailed { .. } => "action",
            Error::Timeout(_) => "timeout",
            Error::FinalizerError(_) => "finalizer",
            Error::Operation { .. } => "unknown",
        }
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(e: kube::runtime::finalizer::Error<Error>) -> Self {
        match e {
            kube::runtime::finalizer::Error::ApplyFailed(e)
            | kube::runtime::finalizer::Error::CleanupFailed(e) => e,
            other => Error::FinalizerError(other.to_string()),
        }
    }
}

/// Attach an operation name to the error of a `Result`
pub trait ResultExt<T> {
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|e| Error::op(op, e.into()))
    }
}
