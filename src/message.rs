//! Structured wire messages.
//!
//! Every client-originated request carries an `api` field naming the remote
//! operation and a `msgid` correlation field. Responses carry the same
//! `msgid`, a boolean `success` flag and, on failure, an error message under
//! either `error` or `err`. Messages without a `msgid` are server-push
//! commands named by their `command` field.

use serde::Serialize;
use serde_json::{json, Map, Value};

/// A request on its way out: the API command, its correlation id, and the
/// caller's parameters merged with the connection-wide defaults.
#[derive(Debug, Clone, Serialize)]
pub struct Outbound {
    /// The remote operation name (e.g. `room.register`).
    pub api: String,
    /// Correlation id, allocated by the coordinator.
    pub msgid: u64,
    /// Request parameters, flattened into the top-level wire object.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Outbound {
    /// Serialize to the wire shape: params plus `api` and `msgid`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        // A string-keyed object cannot fail to serialize.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A message arriving from the connection (or synthesized to look like one).
#[derive(Debug, Clone)]
pub struct Inbound {
    /// The wire command. Responses to prior requests are normalized to
    /// `response_received` regardless of origin channel.
    pub command: String,
    /// The full message object.
    pub data: Value,
}

impl Inbound {
    /// Build from a decoded JSON payload.
    ///
    /// A `msgid` marks the message as a response to a prior request; it is
    /// given the synthetic `response_received` command so correlation and
    /// dispatch treat socket and HTTP responses identically. Messages with
    /// neither `msgid` nor `command` are dropped by returning `None`.
    #[must_use]
    pub fn from_value(data: Value) -> Option<Self> {
        let command = if data.get("msgid").is_some() {
            "response_received".to_string()
        } else {
            data.get("command")?.as_str()?.to_string()
        };
        Some(Self { command, data })
    }

    /// Synthesize a bare command message (heartbeat, no_session,
    /// session_ended, reconnected).
    #[must_use]
    pub fn synthetic(command: &str) -> Self {
        Self {
            command: command.to_string(),
            data: json!({ "command": command }),
        }
    }

    /// Synthesize the failure injected when a request sees no response
    /// within the configured timeout.
    #[must_use]
    pub fn timeout(msgid: u64) -> Self {
        Self {
            command: "response_received".to_string(),
            data: json!({ "msgid": msgid, "success": false, "err": "request timed out" }),
        }
    }

    /// The correlation id, when this is a response.
    #[must_use]
    pub fn msgid(&self) -> Option<u64> {
        self.data.get("msgid").and_then(Value::as_u64)
    }

    /// Whether the response indicates success.
    #[must_use]
    pub fn success(&self) -> bool {
        self.data.get("success").and_then(Value::as_bool) == Some(true)
    }

    /// The server-reported error text, under either of its field names.
    #[must_use]
    pub fn error_text(&self) -> Option<&str> {
        self.data
            .get("error")
            .or_else(|| self.data.get("err"))
            .and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_merges_api_and_msgid() {
        let mut params = Map::new();
        params.insert("roomid".to_string(), json!("r1"));
        let out = Outbound {
            api: "room.register".to_string(),
            msgid: 7,
            params,
        };
        let value = out.to_value();
        assert_eq!(value["api"], "room.register");
        assert_eq!(value["msgid"], 7);
        assert_eq!(value["roomid"], "r1");
    }

    #[test]
    fn test_inbound_with_msgid_is_response() {
        let msg = Inbound::from_value(json!({"msgid": 3, "success": true})).unwrap();
        assert_eq!(msg.command, "response_received");
        assert_eq!(msg.msgid(), Some(3));
        assert!(msg.success());
    }

    #[test]
    fn test_inbound_push_command() {
        let msg = Inbound::from_value(json!({"command": "speak", "text": "hi"})).unwrap();
        assert_eq!(msg.command, "speak");
        assert_eq!(msg.msgid(), None);
    }

    #[test]
    fn test_inbound_without_command_or_msgid_is_dropped() {
        assert!(Inbound::from_value(json!({"noise": 1})).is_none());
    }

    #[test]
    fn test_error_text_under_either_field_name() {
        let a = Inbound::from_value(json!({"msgid": 1, "error": "bad"})).unwrap();
        let b = Inbound::from_value(json!({"msgid": 2, "err": "worse"})).unwrap();
        assert_eq!(a.error_text(), Some("bad"));
        assert_eq!(b.error_text(), Some("worse"));
    }

    #[test]
    fn test_timeout_synthesis_carries_msgid_and_failure() {
        let msg = Inbound::timeout(42);
        assert_eq!(msg.msgid(), Some(42));
        assert!(!msg.success());
        assert_eq!(msg.error_text(), Some("request timed out"));
    }
}
