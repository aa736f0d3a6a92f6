//! Server status codes and the retry classification the engine assigns them.

/// Status codes carried by a server response, modeled after the wire
/// protocol's own status enum. Only the subset the retry engine and session
/// state machine need to distinguish is represented explicitly; anything
/// else collapses into `Unrecognized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    Aborted,
    Overloaded,
    Unavailable,
    BadSession,
    SessionBusy,
    SchemeError,
    Timeout,
    Cancelled,
    Unauthorized,
    BadRequest,
    InternalError,
    Unrecognized(u32),
}

/// How the retry engine should react to an observed status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient, no session impact: retry without backoff once, backoff
    /// thereafter.
    RetryableFast,
    /// Client-transient: always backoff before retrying.
    RetryableSlow,
    /// The session itself is no longer usable; the pool must discard it and
    /// the retry engine does not retry on the same session.
    SessionBroken,
    /// Not retried; propagated to the caller.
    Fatal,
}

impl StatusCode {
    /// Maps the numeric code carried on the wire (the `Status.code` field of
    /// every RPC response) onto the enum. The numbering is this driver's own
    /// minimal wire surface (see `crates/driver/proto/ydb.proto`), not a
    /// reproduction of the real server's status space.
    pub fn from_wire_code(code: u32) -> Self {
        match code {
            0 => StatusCode::Success,
            1 => StatusCode::Aborted,
            2 => StatusCode::Overloaded,
            3 => StatusCode::Unavailable,
            4 => StatusCode::BadSession,
            5 => StatusCode::SessionBusy,
            6 => StatusCode::SchemeError,
            7 => StatusCode::Timeout,
            8 => StatusCode::Cancelled,
            9 => StatusCode::Unauthorized,
            10 => StatusCode::BadRequest,
            11 => StatusCode::InternalError,
            other => StatusCode::Unrecognized(other),
        }
    }

    pub fn classify(self) -> RetryClass {
        match self {
            StatusCode::Aborted | StatusCode::Overloaded | StatusCode::SessionBusy => {
                RetryClass::RetryableFast
            }
            StatusCode::Unavailable | StatusCode::Timeout | StatusCode::Cancelled => {
                RetryClass::RetryableSlow
            }
            StatusCode::BadSession => RetryClass::SessionBroken,
            StatusCode::Success
            | StatusCode::SchemeError
            | StatusCode::Unauthorized
            | StatusCode::BadRequest
            | StatusCode::InternalError
            | StatusCode::Unrecognized(_) => RetryClass::Fatal,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, StatusCode::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_spec_table() {
        assert_eq!(StatusCode::Aborted.classify(), RetryClass::RetryableFast);
        assert_eq!(StatusCode::Overloaded.classify(), RetryClass::RetryableFast);
        assert_eq!(
            StatusCode::Unavailable.classify(),
            RetryClass::RetryableSlow
        );
        assert_eq!(StatusCode::Timeout.classify(), RetryClass::RetryableSlow);
        assert_eq!(StatusCode::BadSession.classify(), RetryClass::SessionBroken);
        assert_eq!(StatusCode::SchemeError.classify(), RetryClass::Fatal);
    }

    #[test]
    fn wire_code_roundtrips_known_codes() {
        assert_eq!(StatusCode::from_wire_code(0), StatusCode::Success);
        assert_eq!(StatusCode::from_wire_code(4), StatusCode::BadSession);
        assert_eq!(StatusCode::from_wire_code(99), StatusCode::Unrecognized(99));
    }
}
