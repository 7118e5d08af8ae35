//! Status codes (§3) and the typed error that carries them through a call.

use std::fmt;

/// Fixed status enum, wire-encoded as a small integer (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
    UnknownContentType = 17,
}

impl StatusCode {
    /// Decode from the wire integer; unrecognized values map to `Unknown`,
    /// matching the reader's tolerance for forward-compatible peers.
    pub fn from_wire(v: u8) -> Self {
        match v {
            0 => Self::Ok,
            1 => Self::Cancelled,
            2 => Self::Unknown,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            17 => Self::UnknownContentType,
            _ => Self::Unknown,
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// §6 HTTP status mapping. Total function.
    pub fn to_http(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Cancelled => 499,
            Self::InvalidArgument | Self::OutOfRange => 400,
            Self::Unauthenticated => 401,
            Self::PermissionDenied => 403,
            Self::NotFound => 404,
            Self::AlreadyExists | Self::Aborted => 409,
            Self::FailedPrecondition => 412,
            Self::UnknownContentType => 415,
            Self::ResourceExhausted => 429,
            Self::Unknown | Self::Internal | Self::DataLoss => 500,
            Self::Unimplemented => 501,
            Self::Unavailable => 503,
            Self::DeadlineExceeded => 504,
        }
    }

    /// Severity used by the logging layer (§7): INTERNAL is critical, the
    /// rest are plain error-level.
    pub fn is_critical(self) -> bool {
        matches!(self, Self::Internal)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::UnknownContentType => "UNKNOWN_CONTENT_TYPE",
        };
        f.write_str(name)
    }
}

/// A status-bearing error that crosses a call boundary (§7).
///
/// Every error that escapes the core implements [`std::error::Error`] and
/// carries a [`StatusCode`]; non-status errors encountered at the boundary
/// are wrapped as `Unknown` by the call sites that produce them (transport
/// failures, JSON decode failures, etc.) rather than by this type itself.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{status}: {message}")]
pub struct TempoError {
    pub status: StatusCode,
    pub message: String,
}

impl TempoError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "OK")
    }

    pub fn is_ok(&self) -> bool {
        self.status == StatusCode::Ok
    }

    /// The substitute text the server sends when `transmit_internal_errors`
    /// is off (§7): never leak internal error text by default.
    pub fn sanitized(&self, transmit_internal_errors: bool) -> TempoError {
        if self.status == StatusCode::Internal && !transmit_internal_errors {
            TempoError::new(StatusCode::Internal, "internal error")
        } else {
            self.clone()
        }
    }
}

impl From<std::io::Error> for TempoError {
    fn from(e: std::io::Error) -> Self {
        TempoError::new(StatusCode::Unknown, e.to_string())
    }
}

impl From<serde_json::Error> for TempoError {
    fn from(e: serde_json::Error) -> Self {
        TempoError::new(StatusCode::InvalidArgument, e.to_string())
    }
}

/// Network-connect failures map to `UNAVAILABLE`; everything else from the
/// transport (build errors, decode errors, a server that hung up mid-body)
/// is `UNKNOWN` (§7).
impl From<reqwest::Error> for TempoError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            TempoError::new(StatusCode::Unavailable, e.to_string())
        } else {
            TempoError::new(StatusCode::Unknown, e.to_string())
        }
    }
}

pub type TempoResult<T> = Result<T, TempoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_mapping_is_total() {
        for raw in 0u8..=17 {
            let code = StatusCode::from_wire(raw);
            assert!(code.to_http() >= 200);
        }
    }

    #[test]
    fn wire_roundtrip() {
        for raw in 0u8..=17 {
            let code = StatusCode::from_wire(raw);
            assert_eq!(code.to_wire(), raw);
        }
    }

    #[test]
    fn unknown_wire_value_falls_back() {
        assert_eq!(StatusCode::from_wire(255), StatusCode::Unknown);
    }

    #[test]
    fn internal_is_the_only_critical_status() {
        assert!(StatusCode::Internal.is_critical());
        assert!(!StatusCode::Unavailable.is_critical());
    }

    #[test]
    fn sanitized_hides_internal_message_by_default() {
        let err = TempoError::new(StatusCode::Internal, "disk on fire");
        let sanitized = err.sanitized(false);
        assert_eq!(sanitized.message, "internal error");
        let transmitted = err.sanitized(true);
        assert_eq!(transmitted.message, "disk on fire");
    }
}
