//! Message builder seam
//!
//! The workflows only deal in [`WsmanCall`] and [`Envelope`]. A
//! [`MessageBuilder`] turns the first into a request body and a
//! response body back into the second.

use crate::call::WsmanCall;
use crate::envelope::Envelope;
use crate::error::{Result, WsmanError};
use serde_json::{json, Map, Value};

/// Renders WS-Management requests and parses responses
pub trait MessageBuilder: Send + Sync {
    /// Render a request body with the given message id
    fn build(&self, call: &WsmanCall, message_id: u64) -> Result<String>;

    /// Parse a response body
    fn parse(&self, body: &str) -> Result<Envelope>;

    /// Content type of rendered requests
    fn content_type(&self) -> &'static str {
        "application/soap+xml; charset=utf-8"
    }
}

/// Carries envelopes as JSON documents mirroring the SOAP structure
#[derive(Debug, Clone, Default)]
pub struct JsonEnvelopeCodec;

impl JsonEnvelopeCodec {
    pub fn new() -> Self {
        Self
    }

    /// Recover the call from a rendered request
    pub fn decode_request(&self, body: &str) -> Result<(WsmanCall, u64)> {
        let value: Value = serde_json::from_str(body)?;
        let header = &value["Envelope"]["Header"];
        let message_id = header["MessageID"]
            .as_u64()
            .ok_or_else(|| WsmanError::Decode("request has no MessageID".to_string()))?;
        let call = serde_json::from_value(header["Call"].clone())?;
        Ok((call, message_id))
    }
}

impl MessageBuilder for JsonEnvelopeCodec {
    fn build(&self, call: &WsmanCall, message_id: u64) -> Result<String> {
        let mut header = Map::new();
        header.insert("To".into(), json!("/wsman"));
        header.insert("ResourceURI".into(), json!(call.resource_uri()));
        header.insert("Action".into(), json!(call.action_uri()));
        header.insert("MessageID".into(), json!(message_id));
        if let Some(selector) = &call.selector {
            header.insert(
                "SelectorSet".into(),
                json!({ "Selector": { "Name": selector.name, "Value": selector.value } }),
            );
        }
        header.insert(
            "Call".into(),
            serde_json::to_value(call).map_err(|e| WsmanError::Encode(e.to_string()))?,
        );

        let envelope = json!({
            "Envelope": {
                "Header": header,
                "Body": call.body_element(),
            }
        });
        serde_json::to_string(&envelope).map_err(|e| WsmanError::Encode(e.to_string()))
    }

    fn parse(&self, body: &str) -> Result<Envelope> {
        let value: Value = serde_json::from_str(body.trim())?;
        if !value.is_object() {
            return Err(WsmanError::Decode("response is not an object".to_string()));
        }
        Ok(Envelope::new(value))
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Selector;

    #[test]
    fn test_build_then_decode_request() {
        let codec = JsonEnvelopeCodec::new();
        let call = WsmanCall::delete("AMT_TLSCredentialContext", Selector::new("Name", "ctx"));
        let body = codec.build(&call, 7).unwrap();

        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["Envelope"]["Header"]["MessageID"], 7);
        assert_eq!(value["Envelope"]["Header"]["SelectorSet"]["Selector"]["Value"], "ctx");

        let (decoded, id) = codec.decode_request(&body).unwrap();
        assert_eq!(decoded, call);
        assert_eq!(id, 7);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let codec = JsonEnvelopeCodec::new();
        assert!(matches!(codec.parse("<html>"), Err(WsmanError::Decode(_))));
        assert!(matches!(codec.parse("42"), Err(WsmanError::Decode(_))));
        assert!(codec.parse(r#"{"Envelope":{"Body":{}}}"#).is_ok());
    }
}
