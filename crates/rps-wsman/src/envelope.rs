//! Navigable view over a parsed WS-Management response
//!
//! Responses follow the `Envelope.Header.Action` /
//! `Envelope.Body.<Method>_OUTPUT.ReturnValue` shape.

use serde_json::Value;

/// SOAP fault subcode AMT uses for a missing instance
pub const DESTINATION_UNREACHABLE: &str = "DestinationUnreachable";

/// A SOAP fault carried in a response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapFault {
    pub code: String,
    pub subcode: String,
    pub reason: String,
}

impl SoapFault {
    /// The fault says the addressed resource does not exist
    pub fn is_not_found(&self) -> bool {
        self.subcode.ends_with(DESTINATION_UNREACHABLE)
    }
}

/// Parsed response envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope(Value);

impl Envelope {
    /// Wrap a JSON document. A document without an `Envelope` root is
    /// treated as the envelope itself.
    pub fn new(value: Value) -> Self {
        match value {
            Value::Object(mut map) if map.contains_key("Envelope") => {
                Envelope(map.remove("Envelope").unwrap_or(Value::Null))
            }
            other => Envelope(other),
        }
    }

    pub fn into_inner(self) -> Value {
        self.0
    }

    pub fn header(&self) -> &Value {
        &self.0["Header"]
    }

    /// `Header.Action`
    pub fn header_action(&self) -> Option<&str> {
        self.header()["Action"].as_str()
    }

    /// `Header.RelatesTo`
    pub fn relates_to(&self) -> Option<u64> {
        as_u64(&self.header()["RelatesTo"])
    }

    pub fn body(&self) -> &Value {
        &self.0["Body"]
    }

    /// Body element for a class or element name
    pub fn item(&self, name: &str) -> Option<&Value> {
        non_null(&self.body()[name])
    }

    /// `Body.<method>_OUTPUT`
    pub fn output(&self, method: &str) -> Option<&Value> {
        non_null(&self.body()[format!("{method}_OUTPUT")])
    }

    /// `Body.<method>_OUTPUT.ReturnValue`; AMT sends it as a number or a string
    pub fn return_value(&self, method: &str) -> Option<i64> {
        self.output(method).and_then(|out| as_i64(&out["ReturnValue"]))
    }

    /// `Body.EnumerateResponse.EnumerationContext`
    pub fn enumeration_context(&self) -> Option<&str> {
        self.body()["EnumerateResponse"]["EnumerationContext"].as_str()
    }

    /// Items of a pull response for a class, always as an owned list
    pub fn pull_items(&self, class: &str) -> Vec<Value> {
        match &self.body()["PullResponse"]["Items"][class] {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            single => vec![single.clone()],
        }
    }

    /// SOAP fault in the body, if any
    pub fn soap_fault(&self) -> Option<SoapFault> {
        let fault = non_null(&self.body()["Fault"])?;
        Some(SoapFault {
            code: fault["Code"]["Value"].as_str().unwrap_or_default().to_string(),
            subcode: fault["Code"]["Subcode"]["Value"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            reason: fault["Reason"]["Text"].as_str().unwrap_or_default().to_string(),
        })
    }
}

fn non_null(value: &Value) -> Option<&Value> {
    if value.is_null() {
        None
    } else {
        Some(value)
    }
}

/// Integer field that may arrive as a JSON number or numeric string
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Boolean field that may arrive as a JSON bool or `"true"`/`"false"`
pub fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
