// Onion failure taxonomy
//
// Guard-level failures come back before any onion response exists; the rest
// are read from the decrypted destination reply. Errors are `Clone` so the
// batcher can hand the same failure to every member of a batch.

use thiserror::Error;

use crate::snode::Snode;

/// HTTP-ish status attached to an onion failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorStatus {
    pub code: u16,
    pub message: Option<String>,
    pub body: Option<Vec<u8>>,
}

impl ErrorStatus {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            message: None,
            body: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Body as UTF-8, if any
    pub fn body_text(&self) -> Option<String> {
        self.body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

impl std::fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{} ({})", self.code, message),
            None => write!(f, "{}", self.code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    Retry,
    Fail,
}

#[derive(Debug, Clone, Error)]
pub enum OnionError {
    /// No HTTP response from the guard at all
    #[error("Guard {guard} unreachable: {reason}")]
    GuardConnectionFailed { guard: Snode, reason: String },

    /// Guard answered with an error that names no other node
    #[error("Guard {guard} returned {status}")]
    GuardProtocolError { guard: Snode, status: ErrorStatus },

    #[error("Node {failed_public_key} unreachable (reported by {reporting_node})")]
    IntermediateNodeFailed {
        reporting_node: Snode,
        failed_public_key: String,
        status: ErrorStatus,
    },

    #[error("Destination unreachable: {status}")]
    DestinationUnreachable { status: ErrorStatus },

    #[error("Destination returned {status}")]
    DestinationError { status: ErrorStatus },

    #[error("Clock out of sync: {status}")]
    ClockOutOfSync { status: ErrorStatus },

    #[error("Invalid onion response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Onion request failed: {reason}")]
    Unknown { reason: String },
}

impl OnionError {
    pub fn status(&self) -> Option<&ErrorStatus> {
        match self {
            OnionError::GuardProtocolError { status, .. }
            | OnionError::IntermediateNodeFailed { status, .. }
            | OnionError::DestinationUnreachable { status }
            | OnionError::DestinationError { status }
            | OnionError::ClockOutOfSync { status } => Some(status),
            OnionError::GuardConnectionFailed { .. }
            | OnionError::InvalidResponse { .. }
            | OnionError::Unknown { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status().map(|s| s.code)
    }

    /// Decision used when nothing upstream attached one
    pub fn default_decision(&self) -> FailureDecision {
        match self {
            OnionError::GuardConnectionFailed { .. }
            | OnionError::IntermediateNodeFailed { .. }
            | OnionError::InvalidResponse { .. }
            | OnionError::Unknown { .. } => FailureDecision::Retry,
            _ => FailureDecision::Fail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snode::test_support::snode;

    #[test]
    fn test_status_accessors() {
        let err = OnionError::DestinationError {
            status: ErrorStatus::new(421).with_body(b"{}".to_vec()),
        };
        assert_eq!(err.status_code(), Some(421));
        assert_eq!(err.status().unwrap().body_text().as_deref(), Some("{}"));

        let err = OnionError::GuardConnectionFailed {
            guard: snode(1),
            reason: "refused".into(),
        };
        assert!(err.status().is_none());
    }

    #[test]
    fn test_default_decisions() {
        let retry = OnionError::Unknown { reason: "x".into() };
        assert_eq!(retry.default_decision(), FailureDecision::Retry);

        let fail = OnionError::ClockOutOfSync {
            status: ErrorStatus::new(425),
        };
        assert_eq!(fail.default_decision(), FailureDecision::Fail);

        let fail = OnionError::GuardProtocolError {
            guard: snode(1),
            status: ErrorStatus::new(500),
        };
        assert_eq!(fail.default_decision(), FailureDecision::Fail);
    }
}
