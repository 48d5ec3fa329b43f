//! Shared fault classification for every workflow step
//!
//! Given a step's fault and the state's error policy, [`recover`]
//! decides whether to resume elsewhere, re-send the same step, or give
//! up. It does no I/O beyond updating the session's auth material.

use crate::device::DeviceSession;
use crate::error::Fault;
use tracing::{debug, warn};

/// Faults a state declares as an ordinary outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// The resource does not exist
    NotFound,
    /// HTTP 400
    BadRequest,
}

impl Expected {
    fn matches(self, fault: &Fault) -> bool {
        match self {
            Expected::NotFound => fault.is_not_found(),
            Expected::BadRequest => fault.is_bad_request(),
        }
    }
}

/// Error policy of a state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnError {
    /// Retry auth challenges, fail on anything else
    #[default]
    Recover,
    /// Continue at `resume` when the fault is the expected one
    Expect {
        expected: Expected,
        resume: &'static str,
    },
    /// Continue at `resume` on any fault that is not about the session itself
    Tolerate { resume: &'static str },
}

/// What the engine does next
#[derive(Debug)]
pub enum Resolution {
    Resume(&'static str),
    Retry,
    Fail(Fault),
}

/// Remaining retries for the state being executed
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    pub max_unauthorized: u32,
    pub malformed_left: u32,
}

/// Classify a step fault.
///
/// Checked in order: expected faults, auth challenges (bounded by the
/// session's unauthorized counter), malformed responses (bounded by the
/// state's budget), tolerated faults, then failure.
pub fn recover(
    fault: Fault,
    policy: OnError,
    session: &mut DeviceSession,
    budget: &mut RetryBudget,
) -> Resolution {
    if let OnError::Expect { expected, resume } = policy {
        if expected.matches(&fault) {
            debug!(client_id = %session.client_id, ?expected, resume, "Expected fault");
            return Resolution::Resume(resume);
        }
    }

    if let Fault::Unauthorized { challenge } = fault {
        let count = session.record_unauthorized(challenge);
        if count > budget.max_unauthorized {
            warn!(client_id = %session.client_id, count, "Giving up after repeated unauthorized responses");
            return Resolution::Fail(Fault::AuthRetriesExhausted(count));
        }
        debug!(client_id = %session.client_id, count, "Retrying with fresh digest challenge");
        return Resolution::Retry;
    }

    if let Fault::Malformed(reason) = &fault {
        if budget.malformed_left > 0 {
            budget.malformed_left -= 1;
            warn!(client_id = %session.client_id, %reason, left = budget.malformed_left, "Re-sending after malformed response");
            return Resolution::Retry;
        }
    }

    if let OnError::Tolerate { resume } = policy {
        if !fault.is_session_fault() {
            debug!(client_id = %session.client_id, %fault, resume, "Tolerated fault");
            return Resolution::Resume(resume);
        }
    }

    Resolution::Fail(fault)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ActivationPayload;
    use rps_wsman::{DigestChallenge, SoapFault};

    fn session() -> DeviceSession {
        DeviceSession::new("dev-1", ActivationPayload::default())
    }

    fn budget() -> RetryBudget {
        RetryBudget {
            max_unauthorized: 3,
            malformed_left: 1,
        }
    }

    fn not_found() -> Fault {
        Fault::Soap {
            status: 400,
            fault: SoapFault {
                code: "a:Sender".to_string(),
                subcode: "a:DestinationUnreachable".to_string(),
                reason: String::new(),
            },
        }
    }

    fn challenge(nonce: &str) -> DigestChallenge {
        DigestChallenge {
            realm: "Digest:A3829B3827DE4D33D4449B366831FD01".to_string(),
            nonce: nonce.to_string(),
            qop: Some("auth".to_string()),
            opaque: None,
            stale: false,
        }
    }

    #[test]
    fn test_expected_fault_resumes() {
        let policy = OnError::Expect {
            expected: Expected::NotFound,
            resume: "NEXT",
        };
        let mut session = session();
        let resolution = recover(not_found(), policy, &mut session, &mut budget());
        assert!(matches!(resolution, Resolution::Resume("NEXT")));

        let resolution = recover(Fault::Http(500), policy, &mut session, &mut budget());
        assert!(matches!(resolution, Resolution::Fail(Fault::Http(500))));
    }

    #[test]
    fn test_unauthorized_is_bounded() {
        let mut session = session();
        let mut budget = budget();
        for expected in 1..=3 {
            let fault = Fault::Unauthorized {
                challenge: Some(challenge(&format!("n{expected}"))),
            };
            assert!(matches!(
                recover(fault, OnError::Recover, &mut session, &mut budget),
                Resolution::Retry
            ));
            assert_eq!(session.unauthorized_count(), expected);
        }
        assert_eq!(session.connection.challenge().unwrap().nonce, "n3");

        let resolution = recover(
            Fault::Unauthorized { challenge: None },
            OnError::Recover,
            &mut session,
            &mut budget,
        );
        assert!(matches!(resolution, Resolution::Fail(Fault::AuthRetriesExhausted(4))));
    }

    #[test]
    fn test_malformed_uses_budget() {
        let mut session = session();
        let mut budget = budget();
        let first = recover(Fault::malformed("x"), OnError::Recover, &mut session, &mut budget);
        assert!(matches!(first, Resolution::Retry));
        let second = recover(Fault::malformed("x"), OnError::Recover, &mut session, &mut budget);
        assert!(matches!(second, Resolution::Fail(Fault::Malformed(_))));
    }

    #[test]
    fn test_tolerate_never_swallows_session_faults() {
        let policy = OnError::Tolerate { resume: "NEXT" };
        let mut session = session();
        let resolution = recover(Fault::BadRequest, policy, &mut session, &mut budget());
        assert!(matches!(resolution, Resolution::Resume("NEXT")));

        let resolution = recover(Fault::Disconnected, policy, &mut session, &mut budget());
        assert!(matches!(resolution, Resolution::Fail(Fault::Disconnected)));

        // An auth challenge on a tolerant step is still a re-send
        let resolution = recover(Fault::Unauthorized { challenge: None }, policy, &mut session, &mut budget());
        assert!(matches!(resolution, Resolution::Retry));
    }
}
