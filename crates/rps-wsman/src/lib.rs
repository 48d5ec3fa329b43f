//! WS-Management plumbing for AMT
//!
//! This crate provides:
//! - [`WsmanCall`]: what to ask the device
//! - [`MessageBuilder`]: how the call is rendered and the reply parsed
//! - [`Envelope`]: navigation over parsed replies
//! - [`ConnectionParams`] / [`HttpResponse`]: digest-authenticated HTTP framing

pub mod call;
pub mod codec;
pub mod envelope;
pub mod error;
pub mod http;

pub use call::{Action, Selector, WsmanCall};
pub use codec::{JsonEnvelopeCodec, MessageBuilder};
pub use envelope::{as_bool, as_i64, as_u64, Envelope, SoapFault};
pub use error::{Result, WsmanError};
pub use http::{ConnectionParams, DigestChallenge, HttpResponse};
