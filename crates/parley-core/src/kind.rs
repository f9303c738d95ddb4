use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed error taxonomy reported in `ChatOutcome::err_type`.
///
/// Serialized with the variant name, e.g. `"BackendNotFound"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    BackendNotFound,
    AuthRejected,
    RateLimited,
    NetworkFailure,
    ContentFiltered,
    AttachmentUnsupported,
    /// The picked file could not be read.
    AttachmentUnreadable,
    Busy,
    Canceled,
    /// Backend rejection that fits no other entry.
    BackendError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BackendNotFound => "BackendNotFound",
            ErrorKind::AuthRejected => "AuthRejected",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::NetworkFailure => "NetworkFailure",
            ErrorKind::ContentFiltered => "ContentFiltered",
            ErrorKind::AttachmentUnsupported => "AttachmentUnsupported",
            ErrorKind::AttachmentUnreadable => "AttachmentUnreadable",
            ErrorKind::Busy => "Busy",
            ErrorKind::Canceled => "Canceled",
            ErrorKind::BackendError => "BackendError",
        }
    }

    /// Transient kinds the caller may retry with the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::NetworkFailure)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
