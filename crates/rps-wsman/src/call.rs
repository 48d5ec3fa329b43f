//! WS-Management call description
//!
//! A [`WsmanCall`] names the CIM/AMT class, the WS-Transfer or
//! WS-Enumeration action, an optional selector and a JSON body.
//! Rendering it to wire bytes is the job of a [`crate::MessageBuilder`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

const AMT_SCHEMA: &str = "http://intel.com/wbem/wscim/1/amt-schema/1/";
const CIM_SCHEMA: &str = "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/";
const IPS_SCHEMA: &str = "http://intel.com/wbem/wscim/1/ips-schema/1/";

const TRANSFER: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/";
const ENUMERATION: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration/";

/// The operation a call performs on its class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Get,
    Put,
    Create,
    Delete,
    Enumerate,
    Pull { context: String },
    Invoke { method: String },
}

/// Instance selector, e.g. `InstanceID = Intel(r) AMT:IEEE 802.1x Settings wifi8021x`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub name: String,
    pub value: String,
}

impl Selector {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One WS-Management request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsmanCall {
    pub class: String,
    pub action: Action,
    pub selector: Option<Selector>,
    pub body: Value,
}

impl WsmanCall {
    fn new(class: &str, action: Action, body: Value) -> Self {
        Self {
            class: class.to_string(),
            action,
            selector: None,
            body,
        }
    }

    pub fn get(class: &str) -> Self {
        Self::new(class, Action::Get, Value::Null)
    }

    pub fn enumerate(class: &str) -> Self {
        Self::new(class, Action::Enumerate, Value::Null)
    }

    pub fn pull(class: &str, context: impl Into<String>) -> Self {
        Self::new(
            class,
            Action::Pull {
                context: context.into(),
            },
            Value::Null,
        )
    }

    pub fn put(class: &str, body: Value) -> Self {
        Self::new(class, Action::Put, body)
    }

    pub fn create(class: &str, body: Value) -> Self {
        Self::new(class, Action::Create, body)
    }

    pub fn delete(class: &str, selector: Selector) -> Self {
        Self::new(class, Action::Delete, Value::Null).with_selector(selector)
    }

    pub fn invoke(class: &str, method: &str, body: Value) -> Self {
        Self::new(
            class,
            Action::Invoke {
                method: method.to_string(),
            },
            body,
        )
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Resource URI for the class
    pub fn resource_uri(&self) -> String {
        let schema = if self.class.starts_with("AMT_") {
            AMT_SCHEMA
        } else if self.class.starts_with("IPS_") {
            IPS_SCHEMA
        } else {
            CIM_SCHEMA
        };
        format!("{schema}{}", self.class)
    }

    /// WS-Addressing action URI
    pub fn action_uri(&self) -> String {
        match &self.action {
            Action::Get => format!("{TRANSFER}Get"),
            Action::Put => format!("{TRANSFER}Put"),
            Action::Create => format!("{TRANSFER}Create"),
            Action::Delete => format!("{TRANSFER}Delete"),
            Action::Enumerate => format!("{ENUMERATION}Enumerate"),
            Action::Pull { .. } => format!("{ENUMERATION}Pull"),
            Action::Invoke { method } => format!("{}/{method}", self.resource_uri()),
        }
    }

    /// Body element as it appears inside the SOAP body
    pub fn body_element(&self) -> Value {
        match &self.action {
            Action::Get | Action::Delete => json!({}),
            Action::Enumerate => json!({ "Enumerate": {} }),
            Action::Pull { context } => json!({ "Pull": { "EnumerationContext": context } }),
            Action::Put | Action::Create => json!({ &self.class: self.body }),
            Action::Invoke { method } => json!({ format!("{method}_INPUT"): self.body }),
        }
    }
}

impl fmt::Display for WsmanCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            Action::Invoke { method } => write!(f, "{}.{}", self.class, method),
            Action::Pull { .. } => write!(f, "{}.Pull", self.class),
            other => write!(f, "{}.{:?}", self.class, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_uri() {
        assert_eq!(
            WsmanCall::get("AMT_GeneralSettings").resource_uri(),
            "http://intel.com/wbem/wscim/1/amt-schema/1/AMT_GeneralSettings"
        );
        assert_eq!(
            WsmanCall::get("CIM_WiFiPort").resource_uri(),
            "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_WiFiPort"
        );
        assert_eq!(
            WsmanCall::get("IPS_HostBasedSetupService").resource_uri(),
            "http://intel.com/wbem/wscim/1/ips-schema/1/IPS_HostBasedSetupService"
        );
    }

    #[test]
    fn test_invoke_action_and_body() {
        let call = WsmanCall::invoke(
            "IPS_HostBasedSetupService",
            "AddNextCertInChain",
            json!({ "NextCertificate": "MIIB", "IsLeaf": true, "IsRootCertificate": false }),
        );
        assert_eq!(
            call.action_uri(),
            "http://intel.com/wbem/wscim/1/ips-schema/1/IPS_HostBasedSetupService/AddNextCertInChain"
        );
        assert_eq!(call.body_element()["AddNextCertInChain_INPUT"]["IsLeaf"], true);
        assert_eq!(call.to_string(), "IPS_HostBasedSetupService.AddNextCertInChain");
    }

    #[test]
    fn test_pull_and_delete() {
        let call = WsmanCall::pull("CIM_WiFiEndpointSettings", "ctx-1");
        assert_eq!(call.body_element()["Pull"]["EnumerationContext"], "ctx-1");
        assert_eq!(call.to_string(), "CIM_WiFiEndpointSettings.Pull");

        let call = WsmanCall::delete(
            "CIM_WiFiEndpointSettings",
            Selector::new("InstanceID", "home"),
        );
        assert_eq!(call.selector.as_ref().unwrap().value, "home");
        assert_eq!(call.to_string(), "CIM_WiFiEndpointSettings.Delete");
    }
}
