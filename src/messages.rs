//! Envelope types for the EventBus bridge protocol
//!
//! Every frame on the wire carries one JSON envelope tagged by `type`.

use crate::error::{EventBusError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Message headers (string to string)
pub type Headers = BTreeMap<String, String>;

/// Envelope `type` discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Keepalive sent by the client
    Ping,
    /// Keepalive answer from the bridge
    Pong,
    /// Point-to-point message
    Send,
    /// Broadcast message
    Publish,
    /// Announce interest in an address
    Register,
    /// Withdraw interest in an address
    Unregister,
    /// Delivery from the bridge
    Message,
    /// Error from the bridge
    Err,
    /// Any type this client does not know
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Only ping and pong may omit the address
    pub fn requires_address(self) -> bool {
        !matches!(self, MessageType::Ping | MessageType::Pong)
    }
}

/// One decoded protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(rename = "replyAddress", default, skip_serializing_if = "Option::is_none")]
    pub reply_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,

    #[serde(rename = "failureCode", default, skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<i64>,

    #[serde(rename = "failureType", default, skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Envelope {
    /// Build an envelope of the given type.
    ///
    /// Fails with [`EventBusError::Configuration`] when a type other than
    /// ping/pong is built without a (non-empty) address.
    pub fn new(kind: MessageType, address: Option<String>) -> Result<Self> {
        let address = address.filter(|a| !a.is_empty());
        if kind.requires_address() && address.is_none() {
            return Err(EventBusError::Configuration(format!(
                "address of the {:?} message must be provided",
                kind
            )));
        }

        Ok(Self {
            kind,
            address,
            reply_address: None,
            headers: None,
            body: None,
            failure_code: None,
            failure_type: None,
            message: None,
        })
    }

    pub fn ping() -> Self {
        Self {
            kind: MessageType::Ping,
            address: None,
            reply_address: None,
            headers: None,
            body: None,
            failure_code: None,
            failure_type: None,
            message: None,
        }
    }

    pub fn send(
        address: &str,
        headers: Option<Headers>,
        body: Option<serde_json::Value>,
        reply_address: Option<String>,
    ) -> Result<Self> {
        let mut envelope = Self::new(MessageType::Send, Some(address.to_string()))?;
        envelope.headers = headers;
        envelope.body = body;
        envelope.reply_address = reply_address;
        Ok(envelope)
    }

    pub fn publish(
        address: &str,
        headers: Option<Headers>,
        body: Option<serde_json::Value>,
    ) -> Result<Self> {
        let mut envelope = Self::new(MessageType::Publish, Some(address.to_string()))?;
        envelope.headers = headers;
        envelope.body = body;
        Ok(envelope)
    }

    pub fn register(address: &str) -> Result<Self> {
        Self::new(MessageType::Register, Some(address.to_string()))
    }

    pub fn unregister(address: &str) -> Result<Self> {
        Self::new(MessageType::Unregister, Some(address.to_string()))
    }

    /// Failure answer to a request: a `send` carrying `failureCode` and `message`
    pub fn failure(address: &str, failure_code: i64, message: &str) -> Result<Self> {
        if message.is_empty() {
            return Err(EventBusError::Configuration(
                "failure message must be provided".to_string(),
            ));
        }
        let mut envelope = Self::new(MessageType::Send, Some(address.to_string()))?;
        envelope.failure_code = Some(failure_code);
        envelope.message = Some(message.to_string());
        Ok(envelope)
    }

    /// Address as a string slice, empty when absent
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or_default()
    }

    /// Body, or `Null` when absent
    pub fn body(&self) -> &serde_json::Value {
        static NULL: serde_json::Value = serde_json::Value::Null;
        self.body.as_ref().unwrap_or(&NULL)
    }
}
