//! Endpoint addresses.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Address meaning "reply on the back-channel of the request".
pub const ANONYMOUS_URI: &str = "urn:courier:addressing:anonymous";

/// Address meaning "do not send a reply".
pub const NONE_URI: &str = "urn:courier:addressing:none";

/// Destination or reply address of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointAddress(String);

impl EndpointAddress {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn anonymous() -> Self {
        Self(ANONYMOUS_URI.into())
    }

    pub fn none() -> Self {
        Self(NONE_URI.into())
    }

    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS_URI
    }

    pub fn is_none(&self) -> bool {
        self.0 == NONE_URI
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
