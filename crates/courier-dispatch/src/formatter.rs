//! Body formatting seam.
//!
//! Formatters turn request bodies into operation parameters and operation
//! outputs into reply messages. [`JsonFormatter`] maps a JSON array body to
//! positional parameters.

use courier_protocol::Message;
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct FormatterError(pub String);

pub trait MessageFormatter: Send + Sync {
    fn deserialize_request(&self, request: &Message) -> Result<Vec<Value>, FormatterError>;

    fn serialize_reply(
        &self,
        reply_action: &str,
        outputs: &[Value],
        result: Value,
    ) -> Result<Message, FormatterError>;
}

/// Positional JSON parameters.
///
/// A request body of `[a, b]` yields two parameters, `null` yields none and
/// any other value is a single parameter. Replies carry the result as the
/// body, or `{"result", "outputs"}` when the operation has out-parameters.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFormatter;

impl MessageFormatter for JsonFormatter {
    fn deserialize_request(&self, request: &Message) -> Result<Vec<Value>, FormatterError> {
        if request.is_fault() {
            return Err(FormatterError("a fault cannot be a request".into()));
        }
        Ok(match &request.body {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        })
    }

    fn serialize_reply(
        &self,
        reply_action: &str,
        outputs: &[Value],
        result: Value,
    ) -> Result<Message, FormatterError> {
        let body = if outputs.is_empty() {
            result
        } else {
            json!({ "result": result, "outputs": outputs })
        };
        Ok(Message::reply(reply_action, body))
    }
}
