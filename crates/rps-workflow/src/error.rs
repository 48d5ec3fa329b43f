//! Fault taxonomy for device workflows
//!
//! Every step failure is a [`Fault`]. The recovery policy decides
//! from the variant whether to continue, re-send or give up.

use rps_wsman::{DigestChallenge, SoapFault};
use std::time::Duration;
use thiserror::Error;

/// Why a workflow step failed
#[derive(Debug, Clone, Error)]
pub enum Fault {
    /// HTTP 401, usually carrying a fresh digest challenge
    #[error("unauthorized")]
    Unauthorized { challenge: Option<DigestChallenge> },

    /// HTTP 400 without a SOAP fault
    #[error("bad request")]
    BadRequest,

    /// SOAP fault in the response body
    #[error("SOAP fault {}: {}", .fault.subcode, .fault.reason)]
    Soap { status: u16, fault: SoapFault },

    /// Any other non-success HTTP status
    #[error("unexpected HTTP status {0}")]
    Http(u16),

    /// Unparseable response or a missing field
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Nonzero `ReturnValue` from an AMT method
    #[error("{method} returned {value}")]
    ReturnValue { method: String, value: i64 },

    /// Digest realm reported by AMT does not look like one
    #[error("invalid digest realm: {0}")]
    InvalidDigestRealm(String),

    /// Provisioning certificate problem
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Secret store, broker or profile source failure
    #[error("{service} failed: {message}")]
    Collaborator { service: &'static str, message: String },

    /// Message could not be handed to the device
    #[error("transport error: {0}")]
    Transport(String),

    /// Device went away while a call was outstanding
    #[error("device disconnected")]
    Disconnected,

    /// No response within the call timeout
    #[error("no response from device after {0:?}")]
    Timeout(Duration),

    /// A call was issued while another was still outstanding
    #[error("call already pending for {0}")]
    AlreadyPending(String),

    /// Unauthorized responses exceeded the configured maximum
    #[error("too many unauthorized responses ({0})")]
    AuthRetriesExhausted(u32),

    /// No guard matched in a state
    #[error("no transition out of state {0}")]
    NoGuardMatched(String),

    /// A nested workflow failed
    #[error("{workflow} failed: {source}")]
    Child {
        workflow: &'static str,
        source: Box<Fault>,
    },

    /// Named failure with a human-readable message
    #[error("{0}")]
    Failed(String),
}

impl Fault {
    pub fn failed(message: impl Into<String>) -> Self {
        Fault::Failed(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Fault::Malformed(message.into())
    }

    pub fn collaborator(service: &'static str, err: impl std::fmt::Display) -> Self {
        Fault::Collaborator {
            service,
            message: err.to_string(),
        }
    }

    /// The addressed resource does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Fault::Soap { fault, .. } => fault.is_not_found(),
            Fault::Http(404) => true,
            _ => false,
        }
    }

    /// HTTP 400, with or without a SOAP body
    pub fn is_bad_request(&self) -> bool {
        matches!(self, Fault::BadRequest | Fault::Http(400) | Fault::Soap { status: 400, .. })
    }

    /// Faults about the session itself rather than the step's content.
    /// These are never swallowed by a tolerant step.
    pub fn is_session_fault(&self) -> bool {
        matches!(
            self,
            Fault::Unauthorized { .. }
                | Fault::Disconnected
                | Fault::Timeout(_)
                | Fault::Transport(_)
                | Fault::AlreadyPending(_)
                | Fault::AuthRetriesExhausted(_)
        )
    }
}

/// Result type for workflow steps
pub type Result<T> = std::result::Result<T, Fault>;

#[cfg(test)]
mod tests {
    use super::*;

    fn soap(status: u16, subcode: &str) -> Fault {
        Fault::Soap {
            status,
            fault: SoapFault {
                code: "a:Sender".to_string(),
                subcode: subcode.to_string(),
                reason: "reason".to_string(),
            },
        }
    }

    #[test]
    fn test_error_display() {
        let err = Fault::ReturnValue {
            method: "AddMpServer".to_string(),
            value: 1,
        };
        assert_eq!(err.to_string(), "AddMpServer returned 1");

        let err = Fault::Child {
            workflow: "cira",
            source: Box::new(Fault::failed("boom")),
        };
        assert_eq!(err.to_string(), "cira failed: boom");

        assert_eq!(Fault::Timeout(Duration::from_secs(60)).to_string(), "no response from device after 60s");
    }

    #[test]
    fn test_classification() {
        assert!(soap(400, "b:DestinationUnreachable").is_not_found());
        assert!(Fault::Http(404).is_not_found());
        assert!(!soap(500, "b:InternalError").is_not_found());

        assert!(Fault::BadRequest.is_bad_request());
        assert!(soap(400, "b:InvalidParameter").is_bad_request());
        assert!(!Fault::Http(500).is_bad_request());

        assert!(Fault::Disconnected.is_session_fault());
        assert!(Fault::Unauthorized { challenge: None }.is_session_fault());
        assert!(!Fault::BadRequest.is_session_fault());
    }
}
