//! Addressed messages.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::actions;
use crate::address::EndpointAddress;
use crate::fault::Fault;

/// Unique message identifier, used for reply correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "urn:uuid:{}", self.0)
    }
}

/// A non-addressing header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub must_understand: bool,
    /// Set once some processing stage has consumed the header.
    #[serde(skip)]
    pub understood: bool,
}

impl Header {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            must_understand: false,
            understood: false,
        }
    }

    pub fn must_understand(mut self) -> Self {
        self.must_understand = true;
        self
    }
}

/// Addressing headers plus free-form headers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeaders {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<EndpointAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<EndpointAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault_to: Option<EndpointAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relates_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<Header>,
}

impl MessageHeaders {
    /// Look up a header and mark it as understood.
    pub fn understand(&mut self, name: &str) -> Option<&Value> {
        let header = self.extra.iter_mut().find(|h| h.name == name)?;
        header.understood = true;
        Some(&header.value)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.extra.iter().find(|h| h.name == name).map(|h| &h.value)
    }

    /// Names of `must_understand` headers nothing has consumed.
    pub fn not_understood(&self) -> Vec<String> {
        self.extra
            .iter()
            .filter(|h| h.must_understand && !h.understood)
            .map(|h| h.name.clone())
            .collect()
    }
}

/// An addressed message: headers, a JSON body and, for fault replies, the fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub headers: MessageHeaders,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
}

impl Message {
    /// A new request with a fresh message id and an anonymous reply address.
    pub fn request(action: impl Into<String>, to: impl Into<EndpointAddress>, body: Value) -> Self {
        Self {
            headers: MessageHeaders {
                message_id: Some(MessageId::new()),
                action: Some(action.into()),
                to: Some(to.into()),
                reply_to: Some(EndpointAddress::anonymous()),
                ..Default::default()
            },
            body,
            fault: None,
        }
    }

    /// A one-way message: no reply address.
    pub fn one_way(action: impl Into<String>, to: impl Into<EndpointAddress>, body: Value) -> Self {
        let mut message = Self::request(action, to, body);
        message.headers.reply_to = None;
        message
    }

    /// An unaddressed reply; correlation is stamped by the dispatcher.
    pub fn reply(action: impl Into<String>, body: Value) -> Self {
        Self {
            headers: MessageHeaders {
                action: Some(action.into()),
                ..Default::default()
            },
            body,
            fault: None,
        }
    }

    pub fn from_fault(fault: Fault) -> Self {
        Self {
            headers: MessageHeaders {
                action: Some(fault.action.clone()),
                ..Default::default()
            },
            body: Value::Null,
            fault: Some(fault),
        }
    }

    /// Synthetic notification announcing a newly opened session.
    pub fn session_opened(to: Option<EndpointAddress>) -> Self {
        Self {
            headers: MessageHeaders {
                message_id: Some(MessageId::new()),
                action: Some(actions::SESSION_OPENED.into()),
                to,
                ..Default::default()
            },
            body: Value::Null,
            fault: None,
        }
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.extra.push(header);
        self
    }

    pub fn with_reply_to(mut self, address: impl Into<EndpointAddress>) -> Self {
        self.headers.reply_to = Some(address.into());
        self
    }

    pub fn with_fault_to(mut self, address: impl Into<EndpointAddress>) -> Self {
        self.headers.fault_to = Some(address.into());
        self
    }

    pub fn action(&self) -> &str {
        self.headers.action.as_deref().unwrap_or_default()
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.headers.message_id
    }

    pub fn relates_to(&self) -> Option<MessageId> {
        self.headers.relates_to
    }

    pub fn is_fault(&self) -> bool {
        self.fault.is_some()
    }
}
