//! Status values delivered to completion handlers and futures.
//!
//! Asynchronous failures never surface as `Err` from the public API. They are
//! carried as a [`Status`] whose [`ErrorCode`] is looked up in a static table.

use flexsync_protocol::ProtocolErrorCode;
use std::fmt;
use std::sync::Arc;

/// Broad classification of an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Success.
    Ok,
    /// Failure detected at run time.
    Runtime,
    /// Misuse of the API.
    Logic,
    /// Failure reported by or about the sync server.
    Sync,
    /// Subscription processing.
    Subscription,
}

/// Error codes carried by [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No error.
    Ok,
    /// Unspecified run-time failure.
    RuntimeError,
    /// The operation was canceled before it completed.
    OperationAborted,
    /// A promise was dropped without being fulfilled.
    BrokenPromise,
    /// Unspecified API misuse.
    LogicError,
    /// A server URL could not be parsed.
    BadServerUrl,
    /// The server closed the connection.
    ConnectionClosed,
    /// The connection could not be established.
    ConnectFailed,
    /// The connection was not established in time.
    ConnectTimeout,
    /// The server reported a protocol violation.
    ProtocolViolation,
    /// The access token has expired.
    TokenExpired,
    /// The server rejected the credentials.
    BadAuthentication,
    /// The server refused access.
    PermissionDenied,
    /// A changeset could not be integrated.
    BadChangeset,
    /// The client and server histories diverged.
    DivergingHistories,
    /// The server rejected a write.
    WriteNotAllowed,
    /// The server reported a session error.
    SessionError,
    /// A subscription set entered the error state.
    SubscriptionFailed,
    /// The server rejected a query.
    BadQuery,
}

struct ErrorCodeInfo {
    code: ErrorCode,
    value: i32,
    name: &'static str,
    category: ErrorCategory,
}

const fn info(code: ErrorCode, value: i32, name: &'static str, category: ErrorCategory) -> ErrorCodeInfo {
    ErrorCodeInfo {
        code,
        value,
        name,
        category,
    }
}

static ERROR_CODES: &[ErrorCodeInfo] = &[
    info(ErrorCode::Ok, 0, "OK", ErrorCategory::Ok),
    info(ErrorCode::RuntimeError, 1000, "RuntimeError", ErrorCategory::Runtime),
    info(ErrorCode::OperationAborted, 1027, "OperationAborted", ErrorCategory::Runtime),
    info(ErrorCode::BrokenPromise, 1031, "BrokenPromise", ErrorCategory::Runtime),
    info(ErrorCode::LogicError, 2000, "LogicError", ErrorCategory::Logic),
    info(ErrorCode::BadServerUrl, 2010, "BadServerUrl", ErrorCategory::Logic),
    info(ErrorCode::ConnectionClosed, 3000, "ConnectionClosed", ErrorCategory::Sync),
    info(ErrorCode::ConnectFailed, 3001, "ConnectFailed", ErrorCategory::Sync),
    info(ErrorCode::ConnectTimeout, 3002, "ConnectTimeout", ErrorCategory::Sync),
    info(ErrorCode::ProtocolViolation, 3003, "ProtocolViolation", ErrorCategory::Sync),
    info(ErrorCode::TokenExpired, 3010, "TokenExpired", ErrorCategory::Sync),
    info(ErrorCode::BadAuthentication, 3011, "BadAuthentication", ErrorCategory::Sync),
    info(ErrorCode::PermissionDenied, 3012, "PermissionDenied", ErrorCategory::Sync),
    info(ErrorCode::BadChangeset, 3020, "BadChangeset", ErrorCategory::Sync),
    info(ErrorCode::DivergingHistories, 3021, "DivergingHistories", ErrorCategory::Sync),
    info(ErrorCode::WriteNotAllowed, 3022, "WriteNotAllowed", ErrorCategory::Sync),
    info(ErrorCode::SessionError, 3030, "SessionError", ErrorCategory::Sync),
    info(ErrorCode::SubscriptionFailed, 4000, "SubscriptionFailed", ErrorCategory::Subscription),
    info(ErrorCode::BadQuery, 4001, "BadQuery", ErrorCategory::Subscription),
];

impl ErrorCode {
    fn info(self) -> &'static ErrorCodeInfo {
        // The table has one row per variant.
        ERROR_CODES
            .iter()
            .find(|i| i.code == self)
            .unwrap_or(&ERROR_CODES[1])
    }

    /// Numeric value.
    pub fn value(self) -> i32 {
        self.info().value
    }

    /// Stable name.
    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Category.
    pub fn category(self) -> ErrorCategory {
        self.info().category
    }

    /// Looks a code up by numeric value.
    pub fn from_value(value: i32) -> Option<Self> {
        ERROR_CODES.iter().find(|i| i.value == value).map(|i| i.code)
    }

    /// Looks a code up by name.
    pub fn from_name(name: &str) -> Option<Self> {
        ERROR_CODES.iter().find(|i| i.name == name).map(|i| i.code)
    }

    /// Every known code, in table order.
    pub fn all() -> impl Iterator<Item = ErrorCode> {
        ERROR_CODES.iter().map(|i| i.code)
    }
}

impl From<ProtocolErrorCode> for ErrorCode {
    fn from(code: ProtocolErrorCode) -> Self {
        use ProtocolErrorCode as P;
        match code {
            P::ConnectionClosed | P::SessionClosed => ErrorCode::ConnectionClosed,
            P::UnknownMessage
            | P::BadSyntax
            | P::LimitsExceeded
            | P::WrongProtocolVersion
            | P::BadSessionIdent
            | P::ReuseOfSessionIdent
            | P::BoundInOtherSession
            | P::BadMessageOrder
            | P::BadClientFileIdent
            | P::BadServerVersion
            | P::BadClientVersion => ErrorCode::ProtocolViolation,
            P::TokenExpired => ErrorCode::TokenExpired,
            P::BadAuthentication => ErrorCode::BadAuthentication,
            P::PermissionDenied | P::IllegalRealmPath | P::NoSuchRealm => {
                ErrorCode::PermissionDenied
            }
            P::BadChangeset => ErrorCode::BadChangeset,
            P::DivergingHistories | P::ClientFileExpired => ErrorCode::DivergingHistories,
            P::WriteNotAllowed => ErrorCode::WriteNotAllowed,
            P::BadQuery => ErrorCode::BadQuery,
            P::OtherError => ErrorCode::RuntimeError,
            P::OtherSessionError => ErrorCode::SessionError,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An error code plus a reason, or success.
///
/// Cheap to clone; the reason is shared.
#[derive(Clone, PartialEq, Eq)]
pub struct Status {
    code: ErrorCode,
    reason: Option<Arc<str>>,
}

impl Status {
    /// The success status.
    pub fn ok() -> Self {
        Self {
            code: ErrorCode::Ok,
            reason: None,
        }
    }

    /// Creates a status.
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        let reason: String = reason.into();
        Self {
            code,
            reason: Some(Arc::from(reason)),
        }
    }

    /// Status for a wait canceled by session termination.
    pub fn aborted() -> Self {
        Self::new(ErrorCode::OperationAborted, "Sync session was terminated")
    }

    /// Returns true for success.
    pub fn is_ok(&self) -> bool {
        self.code == ErrorCode::Ok
    }

    /// The error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The reason, empty for success.
    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or("")
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::ok()
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status({self})")
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason().is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.reason())
        }
    }
}

impl std::error::Error for Status {}

/// A value or the status explaining why there is none.
pub type StatusWith<T> = Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn table_is_consistent() {
        let mut values = HashSet::new();
        let mut names = HashSet::new();
        for code in ErrorCode::all() {
            assert!(values.insert(code.value()), "duplicate value for {code}");
            assert!(names.insert(code.name()), "duplicate name for {code}");
            assert_eq!(ErrorCode::from_value(code.value()), Some(code));
            assert_eq!(ErrorCode::from_name(code.name()), Some(code));
        }
        assert_eq!(ErrorCode::from_value(-7), None);
    }

    #[test]
    fn status_display() {
        assert!(Status::ok().is_ok());
        assert_eq!(Status::ok().to_string(), "OK");
        let status = Status::new(ErrorCode::TokenExpired, "renew it");
        assert!(!status.is_ok());
        assert_eq!(status.to_string(), "TokenExpired: renew it");
        assert_eq!(Status::aborted().code(), ErrorCode::OperationAborted);
    }

    #[test]
    fn protocol_codes_map_to_sync_category() {
        for code in [
            ProtocolErrorCode::TokenExpired,
            ProtocolErrorCode::BadChangeset,
            ProtocolErrorCode::BadMessageOrder,
        ] {
            assert_eq!(ErrorCode::from(code).category(), ErrorCategory::Sync);
        }
        assert_eq!(
            ErrorCode::from(ProtocolErrorCode::BadQuery).category(),
            ErrorCategory::Subscription
        );
    }
}
